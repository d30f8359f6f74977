//! CLI commands implementation

pub mod dead_letters;
pub mod init;
pub mod lecture;
pub mod worker;

pub use dead_letters::*;
pub use init::*;
pub use lecture::*;
pub use worker::*;
