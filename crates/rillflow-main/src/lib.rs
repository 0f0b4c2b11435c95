mod cli;
mod error;
mod shell;

pub use cli::{run, Cli};
pub use error::*;
pub use shell::ShellExecutor;
