pub mod address;
pub mod command;
pub mod frame;
pub mod payload;
pub mod transport;

pub use address::MacAddress;
pub use command::*;
pub use frame::{CommandFrame, FrameError, ParsedFrame};
pub use payload::*;
pub use transport::*;
