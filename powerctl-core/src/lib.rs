//! Power-transition execution core for a cluster power-control service.
//!
//! A *transition* applies one power operation (on, off, graceful shutdown,
//! forceful reset, NMI, …) to a set of compute nodes. The engine expands
//! that into per-node tasks, routes each node to its managing BMC through a
//! locally synchronized topology cache, dispatches the Redfish action under
//! global and per-BMC concurrency caps with jittered retries, verifies the
//! resulting power state within a deadline, and records every state change
//! durably together with a transactional event outbox.
//!
//! The REST surface, auth, and the outbox relay live outside this crate;
//! they drive it through [`engine::TransitionEngine`] and
//! [`sync::MappingSynchronizer`].

pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod redfish;
pub mod resolver;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod sync;
pub mod topology;
pub mod types;
pub mod verify;
