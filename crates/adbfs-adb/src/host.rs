//! Connections to the adb host server.
//!
//! The server speaks one request per TCP connection for most services: the
//! client dials, issues `host:transport:<serial>` to bind the connection to
//! a device, then switches the same connection to a device service such as
//! `sync:` or `shell:`. `host:track-devices` keeps the connection open and
//! streams device-state snapshots instead.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{AdbError, Result};
use crate::wire::SmartSocket;

pub const DEFAULT_ADB_PORT: u16 = 5037;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_ADB_PORT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle on an adb host server. Cheap to clone; every operation dials its
/// own connection.
#[derive(Debug, Clone)]
pub struct AdbServer {
    config: ServerConfig,
}

impl AdbServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn dial(&self) -> Result<SmartSocket<TcpStream>> {
        let addr = self.addr();
        let mut last_err = None;
        for sock_addr in addr.as_str().to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(SmartSocket::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(AdbError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, addr)
        })))
    }

    /// Asks the server for its protocol version. Useful as a liveness probe
    /// before mounting.
    pub fn version(&self) -> Result<u32> {
        let mut socket = self.dial()?;
        socket.send_request("host:version")?;
        let payload = socket.read_hex_block()?;
        let text = String::from_utf8_lossy(&payload);
        u32::from_str_radix(text.trim(), 16).map_err(|_| AdbError::Protocol {
            detail: format!("bad version payload {:?}", text),
        })
    }

    /// Dials a connection and binds it to the device with `serial`.
    /// An empty serial binds to the sole connected device.
    pub(crate) fn connect_to_device(&self, serial: &str) -> Result<SmartSocket<TcpStream>> {
        let mut socket = self.dial()?;
        let request = if serial.is_empty() {
            "host:transport-any".to_string()
        } else {
            format!("host:transport:{serial}")
        };
        match socket.send_request(&request) {
            Ok(()) => Ok(socket),
            Err(AdbError::RequestFailed { message, .. }) if message.contains("not found") => {
                Err(AdbError::DeviceNotFound {
                    serial: serial.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Opens a `host:track-devices` stream.
    pub fn track_devices(&self) -> Result<DeviceStateStream> {
        let mut socket = self.dial()?;
        socket.send_request("host:track-devices")?;
        debug!(addr = %self.addr(), "device tracker connected");
        Ok(DeviceStateStream { socket })
    }
}

/// Connection state of a single device as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub serial: String,
    pub state: String,
}

impl DeviceState {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

/// Blocking stream of device-list snapshots from `host:track-devices`.
/// Each snapshot replaces the previous one; a serial absent from a snapshot
/// has disconnected.
pub struct DeviceStateStream {
    socket: SmartSocket<TcpStream>,
}

impl DeviceStateStream {
    /// Blocks until the server publishes the next device list.
    pub fn next_snapshot(&mut self) -> Result<Vec<DeviceState>> {
        let payload = self.socket.read_hex_block()?;
        Ok(parse_device_list(&String::from_utf8_lossy(&payload)))
    }
}

/// Parses a `host:track-devices` payload: one `serial\tstate` line per
/// device.
pub fn parse_device_list(payload: &str) -> Vec<DeviceState> {
    payload
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(DeviceState {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_local_server() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_ADB_PORT);
    }

    #[test]
    fn addr_joins_host_and_port() {
        let server = AdbServer::new(ServerConfig {
            port: 5038,
            ..Default::default()
        });
        assert_eq!(server.addr(), "127.0.0.1:5038");
    }

    #[test]
    fn parse_device_list_single_device() {
        let devices = parse_device_list("emulator-5554\tdevice\n");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert!(devices[0].is_online());
    }

    #[test]
    fn parse_device_list_multiple_states() {
        let devices = parse_device_list("abc123\tdevice\ndef456\toffline\n");
        assert_eq!(devices.len(), 2);
        assert!(devices[0].is_online());
        assert!(!devices[1].is_online());
    }

    #[test]
    fn parse_device_list_empty_payload() {
        assert!(parse_device_list("").is_empty());
    }

    #[test]
    fn parse_device_list_skips_malformed_lines() {
        let devices = parse_device_list("lonely-serial\nabc\tdevice\n");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "abc");
    }
}
