//! Wire model shared by the relay server and its peers.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::FrameCodec;
pub use error::{CodecError, FrameError, ProtocolError};
pub use frame::{ClientId, Frame, FrameType, SYSTEM_ID, Status, new_frame_id};
