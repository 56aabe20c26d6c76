//! Library half of the `vuload` binary: CLI parsing and the HTTP iteration.

pub mod cli;
pub mod http;

pub use cli::{execute, Cli, Commands, RunArgs};
pub use http::HttpIteration;
