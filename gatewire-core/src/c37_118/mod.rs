//! IEEE C37.118 synchrophasor frames: message types and the wire codec.

pub mod parser;
pub mod types;

pub use parser::{calculate_crc, deserialize, frame_size, serialize, FrameError};
pub use types::{Analog, Command, Config, Frame, Freq, Message, Phasor, PmuConfig, PmuData};
