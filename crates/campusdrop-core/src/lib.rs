// Library root: re-exports all modules so the CLI, integration tests and
// other consumers can reach the crate's public API.

pub mod clock;
pub mod config;
pub mod directory;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;
