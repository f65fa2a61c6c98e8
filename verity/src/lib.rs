//! # Verity
//!
//! A peer-to-peer content-addressed object store built around a fixed-size
//! 1024-byte record, the **Cube**. This crate is the retrieval core: the
//! scheduler that discovers, requests, and subscribes to cubes on behalf of
//! local consumers, and the facade applications read through.
//!
//! ## Architecture
//!
//! Clean layering across three crates:
//!
//! - **`verity-core`**: keys, the cube model and codec, the contest
//!   resolver, waiters, shortenable timers
//! - **`verity-wire`**: sans-IO wire protocol — framing, messages, and the
//!   per-peer session state machine
//! - **`verity`**: the scheduler actor, the store, the facade, transports
//!   (this crate)
//!
//! ## Node roles
//!
//! A **full** node syncs and stores every valid cube it learns of; a
//! **light** node stores only what it requested or subscribed to and leans
//! on full peers for server-push subscriptions.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use verity::config::SchedulerOptions;
//! use verity::node::VerityNode;
//! use verity_core::cube::{CubeFields, CubeVariant};
//!
//! #[compio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let publisher = VerityNode::new(SchedulerOptions::default());
//!     let reader = VerityNode::new(SchedulerOptions::default().with_light_node(false));
//!     publisher.link_with(&reader);
//!
//!     let info = publisher.publish(
//!         CubeFields::new(CubeVariant::Frozen).with_payload(&b"cubus sum"[..]),
//!     )?;
//!     let fetched = reader.facade().get_cube_info(info.key).await;
//!     println!("fetched: {fetched:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - Every public call settles: with its value, or with the `None`
//!   sentinel on timeout or shutdown. Nothing hangs.
//! - Concurrent requests for one key share a single waiter and settle with
//!   the same value.
//! - Conflicting versions of a mutable cube resolve deterministically
//!   through the contest policy (counter, date, difficulty, hash).

#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)] // Single-threaded actor design
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod facade;
pub mod node;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod transport;

/// Development helpers (tests)
pub mod dev_tracing;

// Re-export core types
pub use bytes::Bytes;
pub use verity_core::contest::{contest, should_retain, Winner};
pub use verity_core::cube::{CubeFields, CubeInfo, CubeVariant, CUBE_SIZE};
pub use verity_core::error::{Result, VerityError};
pub use verity_core::key::{CubeKey, NotificationKey, KEY_LEN};
pub use verity_core::peer::{NodeType, PeerId};
pub use verity_wire::message::SubscriptionKind;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::SchedulerOptions;
    pub use crate::facade::{CubeStream, RetrievalFacade};
    pub use crate::node::VerityNode;
    pub use crate::scheduler::{NotificationMode, RequestOptions, RequestScheduler};
    pub use crate::store::{AddCubeOptions, CubeStore, MemoryCubeStore, StoreEvent};
    pub use crate::transport::ByteLink;
    pub use verity_core::cube::{CubeFields, CubeInfo, CubeVariant};
    pub use verity_core::key::{CubeKey, NotificationKey};
}
