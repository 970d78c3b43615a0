//! bridgelet: request/response bridge for a line-oriented subprocess.
//!
//! A caller submits a textual command over HTTP; the bridge forwards it
//! to a long-lived child process over stdin, waits for one line on
//! stdout, and returns that line as the response.

pub mod bridge;
pub mod child;
mod health;
pub mod transport;

pub use bridge::{
    BridgeConfig, BridgeError, CommandBridge, CommandExecutor, ExecuteOutcome, TIMEOUT_SENTINEL,
};
pub use child::{ChildSpawner, ProgramSpawner, SpawnError, resolve_program};
pub use health::{BRIDGELET_VERSION, ChildStatus, HealthSnapshot};
pub use transport::{ServerConfig, serve};
