//! The adb sync sub-protocol: STAT, LIST, RECV, SEND.
//!
//! After `sync:` is issued on a transport-bound connection, requests become
//! binary: a 4-byte request id followed by a little-endian u32 length and
//! the path. File content moves in DATA chunks of at most 64 KiB; a SEND is
//! acknowledged with OKAY or FAIL only after the final DONE.

use std::io::{self, Read, Write};

use crate::error::{AdbError, Result};
use crate::wire::SmartSocket;

pub const SYNC_DATA_MAX: usize = 64 * 1024;

const ID_STAT: &[u8; 4] = b"STAT";
const ID_LIST: &[u8; 4] = b"LIST";
const ID_RECV: &[u8; 4] = b"RECV";
const ID_SEND: &[u8; 4] = b"SEND";
const ID_DATA: &[u8; 4] = b"DATA";
const ID_DONE: &[u8; 4] = b"DONE";

/// A raw stat reply. All-zero fields mean the path does not exist; callers
/// turn that into a proper error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl RawStat {
    pub fn exists(&self) -> bool {
        !(self.mode == 0 && self.size == 0 && self.mtime == 0)
    }
}

/// One LIST directory entry as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDent {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

/// A transport-bound connection switched into sync mode.
pub struct SyncConnection<S> {
    socket: SmartSocket<S>,
}

impl<S: Read + Write> SyncConnection<S> {
    pub fn new(mut socket: SmartSocket<S>) -> Result<Self> {
        socket.send_request("sync:")?;
        Ok(Self { socket })
    }

    fn write_request(&mut self, id: &[u8; 4], arg: &str) -> Result<()> {
        let stream = self.socket.stream_mut();
        stream.write_all(id)?;
        stream.write_all(&(arg.len() as u32).to_le_bytes())?;
        stream.write_all(arg.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn read_id(&mut self) -> Result<[u8; 4]> {
        let mut id = [0u8; 4];
        self.socket.stream_mut().read_exact(&mut id)?;
        Ok(id)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.socket.stream_mut().read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.socket.stream_mut().read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_fail_message(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let message = self.read_exact(len)?;
        Ok(String::from_utf8_lossy(&message).into_owned())
    }

    pub fn stat(&mut self, path: &str) -> Result<RawStat> {
        self.write_request(ID_STAT, path)?;
        let id = self.read_id()?;
        if &id != ID_STAT {
            return Err(unexpected_id("STAT", &id));
        }
        Ok(RawStat {
            mode: self.read_u32()?,
            size: self.read_u32()?,
            mtime: self.read_u32()?,
        })
    }

    pub fn list(&mut self, path: &str) -> Result<Vec<RawDent>> {
        self.write_request(ID_LIST, path)?;
        let mut entries = Vec::new();
        loop {
            let id = self.read_id()?;
            match &id {
                b"DENT" => {
                    let mode = self.read_u32()?;
                    let size = self.read_u32()?;
                    let mtime = self.read_u32()?;
                    let name_len = self.read_u32()? as usize;
                    let name = self.read_exact(name_len)?;
                    entries.push(RawDent {
                        name: String::from_utf8_lossy(&name).into_owned(),
                        mode,
                        size,
                        mtime,
                    });
                }
                b"DONE" => {
                    // DONE in a listing is a full dent header with zeroed
                    // fields.
                    self.read_exact(16)?;
                    return Ok(entries);
                }
                b"FAIL" => {
                    let message = self.read_fail_message()?;
                    return Err(classify_sync_failure(path, message));
                }
                other => return Err(unexpected_id("LIST", other)),
            }
        }
    }

    /// Starts a RECV and returns a streaming reader over the DATA chunks.
    /// The first chunk header is consumed eagerly so that a missing file
    /// fails here rather than on the first read.
    pub fn into_reader(mut self, path: &str) -> Result<SyncReader<S>> {
        self.write_request(ID_RECV, path)?;
        let mut reader = SyncReader {
            conn: self,
            path: path.to_string(),
            chunk_remaining: 0,
            done: false,
        };
        reader.next_chunk()?;
        Ok(reader)
    }

    /// Starts a SEND for `path` with `mode` permission bits. Content is
    /// streamed through the returned writer; the device applies `mtime`
    /// when the writer is closed.
    pub fn into_writer(mut self, path: &str, mode: u32, mtime: u32) -> Result<SyncWriter<S>> {
        self.write_request(ID_SEND, &format!("{},{}", path, mode))?;
        Ok(SyncWriter {
            conn: self,
            path: path.to_string(),
            buf: Vec::with_capacity(SYNC_DATA_MAX),
            mtime,
        })
    }
}

fn unexpected_id(context: &str, id: &[u8; 4]) -> AdbError {
    AdbError::Protocol {
        detail: format!(
            "unexpected {} reply id {:?}",
            context,
            String::from_utf8_lossy(id)
        ),
    }
}

fn classify_sync_failure(path: &str, message: String) -> AdbError {
    if message.contains("No such file or directory") {
        AdbError::FileNoExist {
            path: path.to_string(),
        }
    } else {
        AdbError::TransferFailed { message }
    }
}

/// Streaming reader over RECV DATA chunks.
pub struct SyncReader<S> {
    conn: SyncConnection<S>,
    path: String,
    chunk_remaining: usize,
    done: bool,
}

impl<S> std::fmt::Debug for SyncReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReader")
            .field("path", &self.path)
            .field("chunk_remaining", &self.chunk_remaining)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<S: Read + Write> SyncReader<S> {
    fn next_chunk(&mut self) -> Result<()> {
        let id = self.conn.read_id()?;
        match &id {
            b"DATA" => {
                self.chunk_remaining = self.conn.read_u32()? as usize;
                Ok(())
            }
            b"DONE" => {
                // DONE in a transfer is just the 4-byte trailing field.
                self.conn.read_u32()?;
                self.done = true;
                Ok(())
            }
            b"FAIL" => {
                let message = self.conn.read_fail_message()?;
                Err(classify_sync_failure(&self.path, message))
            }
            other => Err(unexpected_id("RECV", other)),
        }
    }
}

impl<S: Read + Write> Read for SyncReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.done {
                return Ok(0);
            }
            if self.chunk_remaining == 0 {
                self.next_chunk().map_err(io::Error::other)?;
                continue;
            }
            let want = buf.len().min(self.chunk_remaining);
            let n = self.conn.socket.stream_mut().read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device closed mid-chunk",
                ));
            }
            self.chunk_remaining -= n;
            return Ok(n);
        }
    }
}

/// Streaming writer feeding a SEND. Content is buffered into DATA chunks;
/// `close` sends the trailing DONE and waits for the device's verdict, so a
/// write is not durable until `close` returns Ok.
pub struct SyncWriter<S> {
    conn: SyncConnection<S>,
    path: String,
    buf: Vec<u8>,
    mtime: u32,
}

impl<S: Read + Write> SyncWriter<S> {
    fn send_buffered(&mut self) -> Result<()> {
        for chunk in std::mem::take(&mut self.buf).chunks(SYNC_DATA_MAX) {
            let stream = self.conn.socket.stream_mut();
            stream.write_all(ID_DATA)?;
            stream.write_all(&(chunk.len() as u32).to_le_bytes())?;
            stream.write_all(chunk)?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.send_buffered()?;
        {
            let stream = self.conn.socket.stream_mut();
            stream.write_all(ID_DONE)?;
            stream.write_all(&self.mtime.to_le_bytes())?;
            stream.flush()?;
        }
        let id = self.conn.read_id()?;
        match &id {
            b"OKAY" => {
                self.conn.read_u32()?;
                Ok(())
            }
            b"FAIL" => {
                let message = self.conn.read_fail_message()?;
                Err(classify_sync_failure(&self.path, message))
            }
            other => Err(unexpected_id("SEND", other)),
        }
    }
}

impl<S: Read + Write> Write for SyncWriter<S> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= SYNC_DATA_MAX {
            self.send_buffered().map_err(io::Error::other)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered().map_err(io::Error::other)?;
        self.conn.socket.stream_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::tests::FakeStream;

    fn le(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn sync_ready(input: Vec<u8>) -> SyncConnection<FakeStream> {
        // Server accepts the sync: request, then serves `input`.
        let mut stream_input = b"OKAY".to_vec();
        stream_input.extend_from_slice(&input);
        SyncConnection::new(SmartSocket::new(FakeStream::new(stream_input))).unwrap()
    }

    #[test]
    fn stat_decodes_fields() {
        let mut reply = Vec::new();
        reply.extend_from_slice(b"STAT");
        reply.extend_from_slice(&le(0o100644));
        reply.extend_from_slice(&le(11));
        reply.extend_from_slice(&le(1_700_000_000));

        let mut conn = sync_ready(reply);
        let stat = conn.stat("/sdcard/file").unwrap();
        assert_eq!(stat.mode, 0o100644);
        assert_eq!(stat.size, 11);
        assert_eq!(stat.mtime, 1_700_000_000);
        assert!(stat.exists());
    }

    #[test]
    fn stat_all_zero_means_missing() {
        let stat = RawStat {
            mode: 0,
            size: 0,
            mtime: 0,
        };
        assert!(!stat.exists());
    }

    #[test]
    fn list_decodes_dents_until_done() {
        let mut reply = Vec::new();
        for (name, mode) in [("a.txt", 0o100644u32), ("dir", 0o040755u32)] {
            reply.extend_from_slice(b"DENT");
            reply.extend_from_slice(&le(mode));
            reply.extend_from_slice(&le(3));
            reply.extend_from_slice(&le(7));
            reply.extend_from_slice(&le(name.len() as u32));
            reply.extend_from_slice(name.as_bytes());
        }
        reply.extend_from_slice(b"DONE");
        reply.extend_from_slice(&[0u8; 16]);

        let mut conn = sync_ready(reply);
        let entries = conn.list("/sdcard").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[1].name, "dir");
        assert_eq!(entries[1].mode, 0o040755);
    }

    #[test]
    fn reader_streams_chunks_to_eof() {
        let mut reply = Vec::new();
        reply.extend_from_slice(b"DATA");
        reply.extend_from_slice(&le(5));
        reply.extend_from_slice(b"hello");
        reply.extend_from_slice(b"DATA");
        reply.extend_from_slice(&le(6));
        reply.extend_from_slice(b" world");
        reply.extend_from_slice(b"DONE");
        reply.extend_from_slice(&le(0));

        let conn = sync_ready(reply);
        let mut reader = conn.into_reader("/sdcard/file").unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn reader_surfaces_missing_file_at_open() {
        let message = b"open failed: No such file or directory";
        let mut reply = Vec::new();
        reply.extend_from_slice(b"FAIL");
        reply.extend_from_slice(&le(message.len() as u32));
        reply.extend_from_slice(message);

        let conn = sync_ready(reply);
        let err = conn.into_reader("/sdcard/missing").unwrap_err();
        assert!(err.is_file_no_exist(), "got {err}");
    }

    #[test]
    fn reader_empty_file_is_immediate_eof() {
        let mut reply = Vec::new();
        reply.extend_from_slice(b"DONE");
        reply.extend_from_slice(&le(0));

        let conn = sync_ready(reply);
        let mut reader = conn.into_reader("/sdcard/empty").unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn writer_framing_bytes() {
        let mut reply = Vec::new();
        reply.extend_from_slice(b"OKAY");
        reply.extend_from_slice(&le(0));

        let conn = sync_ready(reply);
        let mut writer = conn.into_writer("/sdcard/out", 0o644, 42).unwrap();
        writer.write_all(b"hi").unwrap();
        // Flush the buffered bytes, then close.
        writer.flush().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&crate::wire::encode_request("sync:"));
        expected.extend_from_slice(b"SEND");
        let arg = format!("/sdcard/out,{}", 0o644);
        expected.extend_from_slice(&le(arg.len() as u32));
        expected.extend_from_slice(arg.as_bytes());
        expected.extend_from_slice(b"DATA");
        expected.extend_from_slice(&le(2));
        expected.extend_from_slice(b"hi");

        assert_eq!(writer.conn.socket.stream_mut().output, expected);

        writer.close().unwrap();
    }

    #[test]
    fn writer_close_surfaces_device_failure() {
        let message = b"fchown failed: Operation not permitted";
        let mut reply = Vec::new();
        reply.extend_from_slice(b"FAIL");
        reply.extend_from_slice(&le(message.len() as u32));
        reply.extend_from_slice(message);

        let conn = sync_ready(reply);
        let writer = conn.into_writer("/sdcard/out", 0o644, 42).unwrap();
        let err = writer.close().unwrap_err();
        assert!(matches!(err, AdbError::TransferFailed { .. }));
    }
}
