//! # Verity Wire
//!
//! **Internal protocol implementation crate for Verity.**
//!
//! ⚠️ **This is an internal implementation detail. Use the `verity` crate for the public API.**
//!
//! Sans-IO implementation of the cube exchange protocol:
//!
//! - Length-prefixed binary framing with a 2-byte protocol version and a
//!   class tag per frame (`codec`)
//! - Typed wire messages: CubeRequest/Response, NotificationRequest,
//!   KeyRequest/Response, SubscribeCube, SubscriptionConfirmation (`message`)
//! - The per-peer session state machine that frames outbound operations and
//!   turns inbound bytes into events (`session`)
//!
//! No I/O happens in this crate; the `verity` crate pumps bytes between a
//! transport and `PeerSession::on_bytes`.

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]

pub mod codec;
pub mod message;
pub mod session;

pub use codec::{Frame, FrameDecoder, WireError, PROTOCOL_VERSION};
pub use message::{
    key_blob, Confirmation, KeyFilter, KeyRequestMode, Message, ResponseCode, SubscriptionKind,
    MAX_CUBES_PER_MESSAGE, MAX_KEYS_PER_MESSAGE,
};
pub use session::{PeerSession, SessionEvent};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::message::{KeyFilter, KeyRequestMode, Message, SubscriptionKind};
    pub use super::session::{PeerSession, SessionEvent};
    pub use bytes::Bytes;
}
