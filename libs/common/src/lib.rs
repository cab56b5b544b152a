//! `PlcLink` basic library
//!
//! Provides basic functions shared by all services, including:
//! - logging initialization
//! - graceful shutdown signal handling
//! - service startup banner

pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::{LogConfig, LogInitError};
pub use service_bootstrap::ServiceInfo;
pub use shutdown::ShutdownSignal;
