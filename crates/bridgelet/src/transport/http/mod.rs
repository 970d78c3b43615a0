//! HTTP transport: the request gateway in front of the bridge.

pub mod routes;
pub mod server;

pub use routes::routes;
pub use server::{ServerConfig, serve};
