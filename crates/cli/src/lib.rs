pub mod client;
pub mod format;
pub mod logging;

pub use client::DaemonClient;
