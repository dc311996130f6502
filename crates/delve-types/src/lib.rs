mod event;
mod progress;
mod provider;
mod session;

pub use event::*;
pub use progress::*;
pub use provider::*;
pub use session::*;
