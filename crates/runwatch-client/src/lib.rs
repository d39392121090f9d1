pub mod channel;
pub mod config;
pub mod console;
pub mod input;
pub mod logging;
pub mod session;

pub use channel::{ChannelError, ChannelEvent, ChannelState, CommandChannel};
pub use console::ConsoleProjector;
pub use session::{Session, SessionCommand, SessionConfig, SessionEnd};
