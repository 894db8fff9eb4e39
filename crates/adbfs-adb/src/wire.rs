//! Smart-socket framing for the adb host protocol.
//!
//! Every request is a 4-hex-digit length prefix followed by the request
//! text. The server answers with a 4-byte status word, `OKAY` or `FAIL`;
//! a `FAIL` carries a length-prefixed error message.

use std::io::{Read, Write};

use crate::error::{AdbError, Result};

const STATUS_OKAY: &[u8; 4] = b"OKAY";
const STATUS_FAIL: &[u8; 4] = b"FAIL";

/// Encodes a request as sent on the wire.
pub fn encode_request(request: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + request.len());
    out.extend_from_slice(format!("{:04x}", request.len()).as_bytes());
    out.extend_from_slice(request.as_bytes());
    out
}

/// A connection speaking the hex-length-prefixed host protocol.
///
/// Generic over the stream so the codec can be exercised against in-memory
/// buffers; production code uses `TcpStream`.
pub struct SmartSocket<S> {
    stream: S,
}

impl<S: Read + Write> SmartSocket<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Sends `request` and waits for the server's status word.
    ///
    /// A `FAIL` status is returned as `RequestFailed` carrying the server's
    /// message; callers reclassify messages they understand (for example
    /// "device ... not found").
    pub fn send_request(&mut self, request: &str) -> Result<()> {
        self.stream.write_all(&encode_request(request))?;
        self.stream.flush()?;
        self.read_status(request)
    }

    fn read_status(&mut self, request: &str) -> Result<()> {
        let mut status = [0u8; 4];
        self.stream.read_exact(&mut status)?;
        if &status == STATUS_OKAY {
            return Ok(());
        }
        if &status == STATUS_FAIL {
            let message = String::from_utf8_lossy(&self.read_hex_block()?).into_owned();
            return Err(AdbError::RequestFailed {
                request: request.to_string(),
                message,
            });
        }
        Err(AdbError::Protocol {
            detail: format!("unexpected status word {:?}", String::from_utf8_lossy(&status)),
        })
    }

    /// Reads one hex-length-prefixed payload block.
    pub fn read_hex_block(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len_str = std::str::from_utf8(&len_buf).map_err(|_| AdbError::Protocol {
            detail: "length prefix is not ASCII hex".to_string(),
        })?;
        let len = usize::from_str_radix(len_str, 16).map_err(|_| AdbError::Protocol {
            detail: format!("bad length prefix {:?}", len_str),
        })?;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Reads the stream to EOF. Used by services that answer with raw
    /// output, such as `shell:`.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.stream.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}
