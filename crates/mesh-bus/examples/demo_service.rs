//! Minimal service process: registry client + peer bus + pubsub bus.
//!
//! Serves `accounts/1` with one request endpoint, depends on `ledger/2`,
//! and installs one fan-out and one directed subscription against it.
//! Run a registry first (`meshd --listen 127.0.0.1:4500`), then this.

use std::sync::Arc;

use async_net::TcpListener;
use mesh_bus::{
    BusConfig, Directory, MemoryBroker, PeerBus, PubSubBus, RetryPolicy, ServiceClient,
    ServiceHost,
};
use mesh_registry::RegistryClient;
use mesh_runtime::{SharedSpawner, SmolSpawner};
use mesh_wire::{Packet, ServiceRef, Strategy, TransportKind};
use serde_json::json;
use uuid::Uuid;

fn main() -> mesh_bus::Result<()> {
    smol::block_on(async {
        let config = BusConfig::default();
        let spawner: SharedSpawner = Arc::new(SmolSpawner);
        let node_id = Uuid::new_v4().to_string();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let listen_addr = listener.local_addr()?;
        println!("accounts/1 instance {} on {}", node_id, listen_addr);

        let registry = RegistryClient::connect(config.registry_addr.as_str()).await?;
        let registry_driver = registry.clone();
        smol::spawn(async move {
            let _ = registry_driver.driver().await;
        })
        .detach();

        let host = ServiceHost::new("accounts", "1").with_api("balance", |req| async move {
            Packet::request(
                None,
                "accounts",
                "1",
                "",
                "balance_reply",
                json!({"entity": req.entity, "balance": 0}),
            )
        });

        let ledger = ServiceClient::new("ledger", "2")
            .with_subscription("entry_posted", |payload| async move {
                println!("entry_posted: {}", payload);
            })
            .with_xsubscription("entry_settled", Strategy::Leader, |payload| async move {
                println!("entry_settled: {}", payload);
            });

        let directory: Arc<dyn Directory> = Arc::new(registry.clone());
        let bus = PeerBus::with_config(
            host,
            vec![ledger.clone()],
            directory.clone(),
            spawner.clone(),
            RetryPolicy::default(),
            config.liveness(),
        );

        let serve_bus = bus.clone();
        smol::spawn(async move {
            let _ = serve_bus.serve(listener).await;
        })
        .detach();
        let events_bus = bus.clone();
        let events = registry.events();
        smol::spawn(async move { events_bus.run_events(events).await }).detach();

        let pubsub = PubSubBus::new(
            bus.host_id(),
            Arc::new(MemoryBroker::new()),
            directory,
            vec![ledger],
            spawner,
        );
        pubsub.connect().await?;

        registry
            .register(
                &listen_addr.ip().to_string(),
                listen_addr.port(),
                "accounts",
                "1",
                vec![ServiceRef::new("ledger", "2")],
                &node_id,
                TransportKind::Tcp,
            )
            .await?;
        pubsub
            .register_for_subscription(
                "accounts",
                "1",
                &listen_addr.ip().to_string(),
                listen_addr.port(),
                &node_id,
            )
            .await?;

        // Queued until the ledger link comes up, then delivered once.
        bus.send(Packet::request(
            None,
            "ledger",
            "2",
            "account-7",
            "post_entry",
            json!({"amount": 10}),
        ))
        .await?;

        let replies = bus.replies();
        while let Ok(reply) = replies.recv().await {
            println!("reply: {}", reply.type_name());
        }
        Ok(())
    })
}
