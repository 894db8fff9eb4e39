//! Per-operation telemetry.
//!
//! Every filesystem operation builds a [`LogEntry`] up front and finalizes
//! it on the way out; finalization happens in `Drop` so early returns and
//! `?` propagation still produce a record. Result, error, status, and
//! cache-hit may each be recorded once; a second recording is a bug in the
//! caller and panics.

use std::time::Instant;

use tracing::{debug, error};

use crate::error::FsError;

pub struct LogEntry {
    name: String,
    path: String,
    args: String,
    start: Instant,
    result: Option<String>,
    error: Option<String>,
    status: Option<i32>,
    cache_hit: Option<bool>,
    quiet: bool,
    finished: bool,
}

impl LogEntry {
    /// Begins a dispatcher-level operation record.
    pub fn start_operation(name: &str, path: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            args: String::new(),
            start: Instant::now(),
            result: None,
            error: None,
            status: None,
            cache_hit: None,
            quiet: false,
            finished: false,
        }
    }

    /// Begins a handle-level operation record.
    pub fn start_file_operation(name: &str, path: impl Into<String>, args: impl Into<String>) -> Self {
        let mut entry = Self::start_operation(&format!("File {name}"), path);
        entry.args = args.into();
        entry
    }

    /// Suppresses the finish record. Used for operations the kernel issues
    /// in floods (GetAttr, Access); an error record is still emitted if an
    /// error was set.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn set_result(&mut self, result: impl Into<String>) {
        let result = result.into();
        if let Some(existing) = &self.result {
            panic!("result already set to {existing:?}, can't set to {result:?}");
        }
        self.result = Some(result);
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if let Some(existing) = &self.error {
            panic!("error already set to {existing:?}, can't set to {message:?}");
        }
        self.error = Some(message);
    }

    /// Records the errno the operation returns, and hands it back so call
    /// sites can record and return in one expression.
    pub fn record_status(&mut self, errno: i32) -> i32 {
        if let Some(existing) = self.status {
            panic!("status already set to {existing}, can't set to {errno}");
        }
        self.status = Some(errno);
        errno
    }

    /// Records that a cache answered (or failed to answer) the operation.
    pub fn cache_used(&mut self, hit: bool) {
        if self.cache_hit.is_some() {
            panic!("cache flag already set");
        }
        self.cache_hit = Some(hit);
    }

    /// Records an operation failure: the status always, an error record
    /// only for unexpected (EIO-class) failures. Returns the errno.
    pub fn fail(&mut self, err: &FsError) -> i32 {
        if err.logs_as_error() {
            self.set_error(err.to_string());
        }
        self.record_status(err.to_errno())
    }

    /// Emits the records for this operation. Also invoked by `Drop`, so
    /// calling it explicitly is only for making the flow obvious.
    pub fn finish(mut self) {
        self.emit();
    }

    fn emit(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let status = self.status.unwrap_or(0);
        if !self.quiet || self.error.is_some() {
            debug!(
                op = %self.name,
                path = %self.path,
                args = %self.args,
                duration_ms,
                status,
                result = self.result.as_deref().unwrap_or(""),
                cache_hit = ?self.cache_hit,
                "operation finished"
            );
        }
        if let Some(message) = &self.error {
            error!(op = %self.name, path = %self.path, error = %message, "operation failed");
        }
    }
}

impl Drop for LogEntry {
    fn drop(&mut self) {
        self.emit();
    }
}
