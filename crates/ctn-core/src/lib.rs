pub mod config;
pub mod error;

pub use config::{CryptoConfig, CtnConfig, LogConfig};
pub use error::{CtnError, CtnResult};
