//! vmscale-state — durable store for vmscale.
//!
//! Backed by [redb](https://docs.rs/redb), holds the VM records the
//! autoscaler and the API operate on, plus the append-only scaling event
//! history.
//!
//! # Architecture
//!
//! VM records and events are JSON-serialized into redb `&[u8]` value
//! columns. A secondary table maps the control-plane address
//! (`{node}/{vmid}`) to the internal VM id, and scaling events are keyed by
//! `(vm_id, event_id)` so one VM's history is a single range scan.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared between the autoscaler task and request handlers. Writers
//! that read, call the control plane, then write back serialize per VM
//! through [`VmLocks`].

pub mod error;
pub mod locks;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use locks::VmLocks;
pub use store::StateStore;
pub use types::*;
