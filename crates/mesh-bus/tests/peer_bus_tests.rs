//! Peer bus behavior over real sockets

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_net::TcpListener;
use common::{StubDirectory, address_record, spawner};
use mesh_bus::{LivenessConfig, PeerBus, RetryPolicy, ServiceClient, ServiceHost};
use mesh_registry::RegistryEvent;
use mesh_runtime::{sleep, timeout};
use mesh_wire::{Body, Connection, Packet, VendorAddresses};
use serde_json::json;

/// Listener standing in for a dependency instance: answers pings, collects
/// requests and answers each with a reply envelope, drains everything else.
async fn dependency_listener() -> (SocketAddr, async_channel::Receiver<Packet>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = async_channel::unbounded();

    smol::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let conn = Connection::new(stream);
            let seen_tx = seen_tx.clone();
            smol::spawn(async move {
                let mut pongs = 0u64;
                loop {
                    match conn.recv().await {
                        Ok(packet) => match &packet.body {
                            Body::Ping { node_id } => {
                                pongs += 1;
                                let _ = conn.send(&Packet::pong(node_id.clone(), pongs)).await;
                            }
                            Body::Request { .. } => {
                                let reply = Packet::request(
                                    None,
                                    "accounts",
                                    "1",
                                    "",
                                    "post_entry_reply",
                                    json!({"ok": true}),
                                );
                                let _ = conn.send(&reply).await;
                                let _ = seen_tx.send(packet).await;
                            }
                            _ => {}
                        },
                        Err(_) => break,
                    }
                }
            })
            .detach();
        }
    })
    .detach();

    (addr, seen_rx)
}

#[test]
fn requests_queue_until_the_link_comes_up() {
    smol::block_on(async {
        let (addr, seen_rx) = dependency_listener().await;

        let directory = Arc::new(StubDirectory::default());
        directory
            .put_address("ledger", "2", address_record(addr, "node-b1"))
            .await;

        let bus = PeerBus::new(
            ServiceHost::new("accounts", "1"),
            vec![],
            directory,
            spawner(),
        );

        // Sent before any activation: must queue, not vanish.
        bus.send(Packet::request(
            None,
            "ledger",
            "2",
            "",
            "post_entry",
            json!({"amount": 1}),
        ))
        .await
        .unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.pending_request_count().await, 1);
        assert!(seen_rx.try_recv().is_err());

        // Activation lands; the link comes up and the backlog drains.
        let (events_tx, events_rx) = async_channel::unbounded();
        let event_bus = bus.clone();
        smol::spawn(async move { event_bus.run_events(events_rx).await }).detach();
        events_tx
            .send(RegistryEvent::Activated {
                vendors: vec![VendorAddresses {
                    name: "ledger".into(),
                    version: "2".into(),
                    addresses: vec![address_record(addr, "node-b1")],
                }],
            })
            .await
            .unwrap();

        let delivered = timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("request never arrived")
            .unwrap();
        assert_eq!(delivered.from.as_deref(), Some(bus.host_id()));
        assert_eq!(delivered.to.as_deref(), Some("node-b1"));
        assert_eq!(bus.pending_request_count().await, 0);
        assert!(bus.is_linked("node-b1").await);

        // The peer's reply envelope surfaces on the replies channel.
        let reply = timeout(Duration::from_secs(2), bus.replies().recv())
            .await
            .expect("no reply surfaced")
            .unwrap();
        match reply.body {
            Body::Request { endpoint, .. } => assert_eq!(endpoint, "post_entry_reply"),
            other => panic!("expected reply envelope, got {other:?}"),
        }

        // Exactly once.
        assert!(timeout(Duration::from_millis(300), seen_rx.recv()).await.is_none());
    });
}

#[test]
fn pings_are_answered_with_counted_pongs() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bus = PeerBus::new(
            ServiceHost::new("accounts", "1"),
            vec![],
            Arc::new(StubDirectory::default()),
            spawner(),
        );
        let serve_bus = bus.clone();
        smol::spawn(async move {
            let _ = serve_bus.serve(listener).await;
        })
        .detach();

        let conn = Connection::connect(addr).await.unwrap();
        for expected in 1..=2u64 {
            conn.send(&Packet::ping("node-probe")).await.unwrap();
            let pong = timeout(Duration::from_secs(2), conn.recv())
                .await
                .expect("no pong")
                .unwrap();
            assert_eq!(pong.from.as_deref(), Some(bus.host_id()));
            match pong.body {
                Body::Pong { node_id, count } => {
                    assert_eq!(node_id, "node-probe");
                    assert_eq!(count, expected);
                }
                other => panic!("expected pong, got {other:?}"),
            }
        }
    });
}

#[test]
fn publishes_invoke_handlers_and_get_acked() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (payload_tx, payload_rx) = async_channel::unbounded();
        let client = ServiceClient::new("ledger", "2").with_subscription("entry_posted", {
            move |payload| {
                let payload_tx = payload_tx.clone();
                async move {
                    let _ = payload_tx.send(payload).await;
                }
            }
        });

        let bus = PeerBus::new(
            ServiceHost::new("accounts", "1"),
            vec![client],
            Arc::new(StubDirectory::default()),
            spawner(),
        );
        let serve_bus = bus.clone();
        smol::spawn(async move {
            let _ = serve_bus.serve(listener).await;
        })
        .detach();

        let conn = Connection::connect(addr).await.unwrap();
        conn.send(&Packet::publish(
            "pub-7",
            "ledger",
            "2",
            "entry_posted",
            json!({"amount": 12}),
        ))
        .await
        .unwrap();

        let ack = timeout(Duration::from_secs(2), conn.recv())
            .await
            .expect("no ack")
            .unwrap();
        assert_eq!(ack.from.as_deref(), Some(bus.host_id()));
        match ack.body {
            Body::Ack { request_id } => assert_eq!(request_id, "pub-7"),
            other => panic!("expected ack, got {other:?}"),
        }

        let payload = timeout(Duration::from_secs(2), payload_rx.recv())
            .await
            .expect("handler never ran")
            .unwrap();
        assert_eq!(payload, json!({"amount": 12}));
    });
}

#[test]
fn requests_are_served_and_misroutes_dropped() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let host = ServiceHost::new("accounts", "1").with_api("balance", |req| async move {
            Packet::request(
                None,
                "caller",
                "1",
                "",
                "balance_reply",
                json!({"echo": req.payload, "entity": req.entity}),
            )
        });

        let bus = PeerBus::new(host, vec![], Arc::new(StubDirectory::default()), spawner());
        let serve_bus = bus.clone();
        smol::spawn(async move {
            let _ = serve_bus.serve(listener).await;
        })
        .detach();

        let conn = Connection::connect(addr).await.unwrap();

        // Wrong service: dropped without a reply.
        conn.send(&Packet::request(None, "other", "1", "", "balance", json!({})))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(300), conn.recv()).await.is_none());

        // Unknown endpoint: dropped without a reply.
        conn.send(&Packet::request(None, "accounts", "1", "", "missing", json!({})))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(300), conn.recv()).await.is_none());

        // Matching request: the handler's envelope comes back stamped.
        conn.send(&Packet::request(
            None,
            "accounts",
            "1",
            "user-9",
            "balance",
            json!({"currency": "EUR"}),
        ))
        .await
        .unwrap();
        let reply = timeout(Duration::from_secs(2), conn.recv())
            .await
            .expect("no reply")
            .unwrap();
        assert_eq!(reply.from.as_deref(), Some(bus.host_id()));
        match reply.body {
            Body::Request {
                endpoint, payload, ..
            } => {
                assert_eq!(endpoint, "balance_reply");
                assert_eq!(payload["entity"], "user-9");
                assert_eq!(payload["echo"]["currency"], "EUR");
            }
            other => panic!("expected reply envelope, got {other:?}"),
        }
    });
}

#[test]
fn silent_peers_are_reconnected_after_the_pong_timeout() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        // Accepts links but never answers pings.
        let counter = accepted.clone();
        smol::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let conn = Connection::new(stream);
                smol::spawn(async move { while conn.recv().await.is_ok() {} }).detach();
            }
        })
        .detach();

        let directory = Arc::new(StubDirectory::default());
        directory
            .put_address("ledger", "2", address_record(addr, "node-b1"))
            .await;

        let bus = PeerBus::with_config(
            ServiceHost::new("accounts", "1"),
            vec![],
            directory,
            spawner(),
            RetryPolicy {
                delays: vec![Duration::ZERO],
                overall: Duration::from_secs(1),
            },
            LivenessConfig {
                ping_interval: Duration::from_millis(50),
                pong_timeout: Duration::from_millis(150),
                ping_logs: false,
            },
        );

        let (events_tx, events_rx) = async_channel::unbounded();
        let event_bus = bus.clone();
        smol::spawn(async move { event_bus.run_events(events_rx).await }).detach();
        events_tx
            .send(RegistryEvent::Activated {
                vendors: vec![VendorAddresses {
                    name: "ledger".into(),
                    version: "2".into(),
                    addresses: vec![address_record(addr, "node-b1")],
                }],
            })
            .await
            .unwrap();

        // First link, then at least one reconnect after liveness gives up.
        sleep(Duration::from_millis(800)).await;
        assert!(accepted.load(Ordering::SeqCst) >= 2);
    });
}

#[test]
fn only_requests_have_a_send_path() {
    smol::block_on(async {
        let bus = PeerBus::new(
            ServiceHost::new("accounts", "1"),
            vec![],
            Arc::new(StubDirectory::default()),
            spawner(),
        );
        let result = bus.send(Packet::ping("node-x")).await;
        assert!(matches!(result, Err(mesh_bus::Error::UnsupportedSend("ping"))));
    });
}
