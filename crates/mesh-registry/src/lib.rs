//! Dependency-aware service registry
//!
//! Services register here with the `(name, version)` they serve and the list
//! of services they consume. The registry holds every instance in a pending
//! state until all of its declared dependencies have at least one live
//! instance, then pushes an activation packet carrying the dependency
//! addresses. When a service's last instance disappears, every consumer is
//! notified and re-marked pending so it reactivates when a replacement
//! registers.
//!
//! State is soft: nothing survives a restart, and clients are expected to
//! re-register in full on reconnect.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mesh_registry::RegistryServer;
//! use mesh_runtime::SharedSpawner;
//!
//! # async fn example(spawner: SharedSpawner) -> mesh_registry::Result<()> {
//! let server = RegistryServer::bind("127.0.0.1:4500", spawner.clone()).await?;
//! loop {
//!     let handler = server.accept().await?;
//!     // Caller chooses how to run the handler, e.g. smol::spawn.
//!     spawner.spawn(Box::pin(async move {
//!         let _ = handler.handle().await;
//!     }));
//! }
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod server;

pub use client::{RegistryClient, RegistryEvent};
pub use config::RegistryConfig;
pub use error::{Error, Result};
pub use models::ServiceInstance;
pub use repository::Repository;
pub use server::{ConnectionHandler, RegistryServer};
