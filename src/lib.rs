pub mod algorithms;
pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{RecError, Result};
pub use models::*;

/// Installs the `tracing` subscriber used by the binaries; filtering follows
/// `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
