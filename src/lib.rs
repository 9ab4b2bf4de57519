//! Local HTTP gateway that authenticates translation requests, admits at most
//! one at a time under a CPU budget, and runs each on an external worker
//! process with a fixed deadline.

pub mod api;
pub mod config;
pub mod errors;
pub mod logging;
pub mod provisioning;
pub mod scheduler;
pub mod server;
pub mod server_state;
pub mod telemetry;
pub mod worker;

pub use config::GatewayConfig;
pub use errors::GatewayError;
pub use server::{Gateway, GatewayHandle};
