//! Beam protocol core: framing, control envelopes, chunking and delivery state.
//! Host-driven: no I/O; the host feeds decoded frames and local events and
//! performs the returned actions.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use crate::core::{Action, BeamCore, MessageError};
pub use identity::DeviceIdentity;
pub use protocol::{Envelope, DISCOVERY_MARKER, DISCOVERY_PORT, TRANSPORT_PORT};
pub use wire::{
    decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError, FrameKind,
    StreamHeader,
};

pub mod chunk;
pub mod core;
pub mod delivery;
pub mod integrity;
pub mod progress;
pub mod scheduler;
