//! A device client that answers stats from cached directory listings.
//!
//! Statting every child while the kernel walks a directory is the dominant
//! cost of a traversal; caching the parent's listing collapses N stat
//! round-trips into the single list call. The cached listing is
//! authoritative for membership: a base name absent from it is reported as
//! nonexistent without asking the device.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use adbfs_adb::DirEntry;

use crate::device_client::{DeviceClient, DeviceClientFactory, DeviceWriter};
use crate::dir_cache::DirEntryCache;
use crate::error::{FsError, Result};
use crate::log_entry::LogEntry;
use crate::paths::{base_name, parent_dir};

pub struct CachingDeviceClient {
    inner: Box<dyn DeviceClient>,
    cache: Arc<DirEntryCache>,
}

impl CachingDeviceClient {
    pub fn new(inner: Box<dyn DeviceClient>, cache: Arc<DirEntryCache>) -> Self {
        Self { inner, cache }
    }
}

/// Wraps `factory` so every produced client shares `cache`.
pub fn caching_client_factory(
    cache: Arc<DirEntryCache>,
    factory: DeviceClientFactory,
) -> DeviceClientFactory {
    Arc::new(move || Box::new(CachingDeviceClient::new(factory(), Arc::clone(&cache))))
}

impl DeviceClient for CachingDeviceClient {
    fn open_read(&self, path: &str, log: &mut LogEntry) -> Result<Box<dyn Read + Send>> {
        self.inner.open_read(path, log)
    }

    fn open_write(
        &self,
        path: &str,
        perms: u32,
        mtime: SystemTime,
        log: &mut LogEntry,
    ) -> Result<Box<dyn DeviceWriter>> {
        let writer = self.inner.open_write(path, perms, mtime, log)?;
        // The device applies the contents and mtime on close, so the parent
        // listing stays valid until then.
        Ok(Box::new(InvalidatingWriter {
            inner: Some(writer),
            cache: Arc::clone(&self.cache),
            parent: parent_dir(path).to_string(),
        }))
    }

    fn stat(&self, path: &str, log: &mut LogEntry) -> Result<DirEntry> {
        let parent = parent_dir(path);
        let base = base_name(path);

        if parent == base {
            // The root itself; the root listing is never cached.
            return self.inner.stat(path, log);
        }

        match self.cache.get(parent) {
            Some(entries) => {
                log.cache_used(true);
                match entries.by_name.get(base) {
                    Some(entry) => Ok(entry.clone()),
                    // The cached listing is authoritative: absent means the
                    // file does not exist.
                    None => Err(FsError::NoEntry {
                        path: path.to_string(),
                    }),
                }
            }
            None => {
                log.cache_used(false);
                self.inner.stat(path, log)
            }
        }
    }

    fn list_dir_entries(&self, path: &str, log: &mut LogEntry) -> Result<Vec<DirEntry>> {
        let (entries, hit) = self
            .cache
            .get_or_load(path, |p| self.inner.list_dir_entries(p, log))?;
        log.cache_used(hit);
        Ok(entries.in_order.clone())
    }

    fn run_command(&self, cmd: &str, args: &[&str]) -> Result<String> {
        self.inner.run_command(cmd, args)
    }
}

struct InvalidatingWriter {
    inner: Option<Box<dyn DeviceWriter>>,
    cache: Arc<DirEntryCache>,
    parent: String,
}

impl Write for InvalidatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            Some(writer) => writer.write(buf),
            None => Err(std::io::Error::other("write after close")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl DeviceWriter for InvalidatingWriter {
    fn close(mut self: Box<Self>) -> Result<()> {
        let result = match self.inner.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        };
        // Invalidate even on failure; the device state is unknown.
        self.cache.invalidate(&self.parent);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir_cache::DEFAULT_CACHE_TTL;
    use crate::testing::FakeDevice;
    use std::time::Duration;

    fn log() -> LogEntry {
        LogEntry::start_operation("test", "/")
    }

    fn setup() -> (Arc<FakeDevice>, Arc<DirEntryCache>, CachingDeviceClient) {
        let device = FakeDevice::new();
        let cache = DirEntryCache::new(Duration::from_secs(30));
        let client = CachingDeviceClient::new(Box::new(device.client()), Arc::clone(&cache));
        (device, cache, client)
    }

    #[test]
    fn stat_of_root_bypasses_cache() {
        let (device, _cache, client) = setup();
        device.add_dir("/", 0o755);

        client.stat("/", &mut log()).unwrap();

        assert_eq!(device.stat_count(), 1);
    }

    #[test]
    fn listing_populates_cache_for_child_stats() {
        let (device, _cache, client) = setup();
        device.add_dir("/sdcard", 0o755);
        device.add_file("/sdcard/a.txt", b"aa", 0o644);
        device.add_file("/sdcard/b.txt", b"bb", 0o644);

        let listed = client.list_dir_entries("/sdcard", &mut log()).unwrap();
        assert_eq!(listed.len(), 2);

        let entry = client.stat("/sdcard/a.txt", &mut log()).unwrap();
        assert_eq!(entry.name, "a.txt");
        assert_eq!(entry.size, 2);
        assert_eq!(device.stat_count(), 0, "stat must be served from the listing");
    }

    #[test]
    fn cached_listing_is_authoritative_for_missing_names() {
        let (device, _cache, client) = setup();
        device.add_dir("/sdcard", 0o755);
        device.add_file("/sdcard/a.txt", b"aa", 0o644);

        client.list_dir_entries("/sdcard", &mut log()).unwrap();
        // Created behind the cache's back.
        device.add_file("/sdcard/new.txt", b"x", 0o644);

        let err = client.stat("/sdcard/new.txt", &mut log()).unwrap_err();
        assert!(matches!(err, FsError::NoEntry { .. }));
        assert_eq!(device.stat_count(), 0);
    }

    #[test]
    fn stat_misses_cache_and_delegates() {
        let (device, _cache, client) = setup();
        device.add_file("/sdcard/a.txt", b"aa", 0o644);

        let entry = client.stat("/sdcard/a.txt", &mut log()).unwrap();
        assert_eq!(entry.name, "a.txt");
        assert_eq!(device.stat_count(), 1);
    }

    #[test]
    fn second_list_within_ttl_hits_cache() {
        let (device, _cache, client) = setup();
        device.add_dir("/sdcard", 0o755);
        device.add_file("/sdcard/a.txt", b"aa", 0o644);

        client.list_dir_entries("/sdcard", &mut log()).unwrap();
        client.list_dir_entries("/sdcard", &mut log()).unwrap();

        assert_eq!(device.list_count(), 1);
    }

    #[test]
    fn closing_a_writer_invalidates_the_parent_listing() {
        let (device, _cache, client) = setup();
        device.add_dir("/sdcard", 0o755);
        device.add_file("/sdcard/a.txt", b"aa", 0o644);

        client.list_dir_entries("/sdcard", &mut log()).unwrap();

        let mut writer = client
            .open_write("/sdcard/a.txt", 0o644, SystemTime::now(), &mut log())
            .unwrap();
        writer.write_all(b"new contents").unwrap();
        writer.close().unwrap();

        // The next listing must go back to the device.
        client.list_dir_entries("/sdcard", &mut log()).unwrap();
        assert_eq!(device.list_count(), 2);
    }

    #[test]
    fn default_ttl_matches_configuration_default() {
        assert_eq!(DEFAULT_CACHE_TTL, Duration::from_millis(300));
    }
}
