//! Scale wire protocol
//!
//! ASCII frames between STX (0x02) and ETX (0x03). Inside a frame,
//! characters `[0, 2)` carry the device address, `[2, 4)` the
//! sequence/command code and `[4, 5)` the frame type.

pub mod codec;
pub mod message;
pub mod state;

pub use self::codec::{FrameCodec, FrameDecoder};
pub use self::message::{extract_weight, Command, Frame, FrameKind};
pub use self::state::{ConnectionState, LinkSettings, LinkTimers, ReconnectPolicy, TimerEvent};

/// Start of frame
pub const STX: u8 = 0x02;

/// End of frame
pub const ETX: u8 = 0x03;

/// Puts the device into continuous weight output
pub const START_STREAMING: &[u8] = b"\x0200FFE10110000\x03\r\n";

/// Ends continuous weight output
pub const STOP_STREAMING: &[u8] = b"\x0200FFE10100000\x03\r\n";

/// Frame type of a weight report
pub const TYPE_WEIGHT: char = 'r';

/// Frame type of a status reply
pub const TYPE_STATUS: char = 'e';

/// Frames shorter than this are dropped
pub const MIN_FRAME_LEN: usize = 4;

/// Unframed buffers at or below this length are left to accumulate
pub const FALLBACK_MIN_BUFFER: usize = 4;

/// Shortest body accepted from an unframed buffer
pub const FALLBACK_MIN_FRAME: usize = 15;
