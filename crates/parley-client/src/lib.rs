pub mod command;
pub mod config;
pub mod filter;
pub mod session;

pub use command::Command;
pub use config::ClientConfig;
pub use filter::{ContentFilter, Verdict};
pub use session::{ClientSession, SessionEvent};
