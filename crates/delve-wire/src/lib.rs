mod frame;
mod message;

pub use frame::*;
pub use message::*;
