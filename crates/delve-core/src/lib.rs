pub mod config;
pub mod error;
pub mod event_bus;
pub mod hooks;
pub mod ledger;
pub mod multiplexer;
pub mod orchestrator;
pub mod progress;
pub mod runs;
pub mod storage;
pub mod stream_registry;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39741;

pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use hooks::*;
pub use ledger::*;
pub use multiplexer::*;
pub use orchestrator::*;
pub use progress::*;
pub use runs::*;
pub use storage::*;
pub use stream_registry::*;
