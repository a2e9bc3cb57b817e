//! WebSocket gateway that receives a layered component archive, reconstructs
//! it in a private workspace and runs the unified scanning agent on it.

pub mod agent_cache;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod scan;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;
