//! Lemon Common Types
//!
//! Shared types used by the lemon-server gateway and its clients.

pub mod capability;
pub mod events;

pub use capability::Capability;
pub use events::{
    format_frame, EventFrameParser, ProgressEvent, StreamEvent, StreamProtocolError,
};
