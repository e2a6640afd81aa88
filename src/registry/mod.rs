//! Service registration lifecycle.
//!
//! A [`Registration`] advertises one service instance under a store lease and
//! keeps it alive from a heartbeat loop that renews every `ttl / 3`. Store
//! failures inside the loop are logged and counted, never fatal; the store's
//! own lease expiry is the backstop. [`Registration::deregister`] stops the
//! loop, which deletes the key on its way out.
//!
//! ```no_run
//! use std::sync::Arc;
//! use registrar::config::{NodeData, RegistrationConfig, StoreConfig};
//! use registrar::registry::Registration;
//! use registrar::store::MemoryStore;
//!
//! # async fn demo() -> registrar::error::Result<()> {
//! let mut config = RegistrationConfig::new("echo", "node-1", NodeData::new("10.0.0.5:50051"));
//! config.store = StoreConfig::with_endpoints(["memory://local"]);
//!
//! let registration = Arc::new(Registration::<MemoryStore>::connect(config).await?);
//! let heartbeat = Arc::clone(&registration).spawn();
//!
//! // ... serve traffic ...
//!
//! registration.deregister()?;
//! registration.wait_deregistered().await;
//! # drop(heartbeat);
//! # Ok(())
//! # }
//! ```

mod handle;
mod heartbeat;
mod stats;

pub use handle::{Registration, RegistrationState};
pub use stats::{HeartbeatStats, StatsSnapshot};
