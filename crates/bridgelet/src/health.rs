//! Health surface exposed to the gateway.

use serde::Serialize;

/// Bridgelet version from Cargo.toml
pub const BRIDGELET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Liveness of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildStatus {
    Running,
    Stopped,
}

/// Snapshot of bridge health for transports to render.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub child: ChildStatus,
    /// Exit code of the most recently reaped child, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    pub version: &'static str,
}
