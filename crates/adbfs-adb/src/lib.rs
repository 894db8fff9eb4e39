//! Client for the adb host server.
//!
//! Speaks the host smart-socket protocol, the sync file-transfer
//! sub-protocol, and the shell service, and exposes a per-device API plus a
//! device-state event stream. The sync protocol has no readlink request, so
//! symlink targets are read with the device's `readlink` shell command by
//! the layer above.

/// Per-device operations: stat, list, read, write, shell.
pub mod device;
/// Error types and result alias.
pub mod error;
/// Host server endpoint, transport binding, device tracking.
pub mod host;
/// Shell command-line construction.
pub mod shell;
/// The sync sub-protocol: STAT/LIST/RECV/SEND framing.
pub mod sync;
/// Smart-socket request framing.
pub mod wire;

pub use device::{DeviceConnection, DirEntry};
pub use error::{AdbError, Result};
pub use host::{AdbServer, DeviceState, DeviceStateStream, ServerConfig, DEFAULT_ADB_PORT};
