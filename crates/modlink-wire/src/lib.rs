//! modlink transport bus.
//!
//! Moves serialized messages between module processes over long-lived
//! sockets (TCP or Unix-domain) using length-prefixed frames.
//!
//! ## Architecture
//!
//! - **Endpoint**: parsed `<role>:<transport>://<address>` connection string
//! - **Bus**: client or server endpoint with a single reader task and
//!   per-message-type handler dispatch
//! - **Frame**: 4-byte big-endian length, flag byte, payload; multipart
//!   messages set the "more" flag on every frame but the last

pub mod bus;
pub mod endpoint;
pub mod error;
pub mod frame;

pub use bus::{Bus, HandlerId, MessageHandler, PeerId};
pub use endpoint::{Endpoint, Role, Transport};
pub use error::WireError;
pub use frame::{Frame, FrameAssembler};
