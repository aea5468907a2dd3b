//! uplink-state: data model and status store for uplink probing.
//!
//! Holds the per-port health record (`ProbeInfo`) and the per network
//! instance status (`NetworkInstanceStatus`) that the probe engine mutates,
//! plus a [redb](https://docs.rs/redb)-backed `StatusStore` used as the
//! publish sink for status snapshots.
//!
//! # Architecture
//!
//! Status objects are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by network instance id. A publish is a plain upsert, so the last
//! write wins.
//!
//! The `StatusStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StatusStore;
pub use types::*;
