pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod iteration;
pub mod logging;
#[cfg(feature = "verbs")]
pub mod rdma_controller;
pub mod report;
pub mod runner;
pub mod session;
pub mod setup;
pub mod transport;

pub use config::Config;
pub use error::Error;
pub use session::Session;
pub use transport::{RawCounters, TransportResource};
