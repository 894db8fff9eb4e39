//! End-to-end scenarios against the in-memory fake device.

use std::sync::Arc;
use std::time::Duration;

use adbfs_fuse::caching_client::caching_client_factory;
use adbfs_fuse::dir_cache::DirEntryCache;
use adbfs_fuse::flags::OpenFlags;
use adbfs_fuse::statfs::{parse_statfs, StatfsInfo};
use adbfs_fuse::testing::FakeDevice;
use adbfs_fuse::{AdbFilesystem, FilesystemConfig, FsError};

fn mount(device: &Arc<FakeDevice>, config: FilesystemConfig) -> AdbFilesystem {
    let cache = DirEntryCache::new(Duration::from_millis(300));
    let factory = caching_client_factory(Arc::clone(&cache), device.factory());
    AdbFilesystem::new(config, factory, cache).unwrap()
}

fn default_mount(device: &Arc<FakeDevice>) -> AdbFilesystem {
    mount(
        device,
        FilesystemConfig {
            mountpoint: "/mnt".to_string(),
            ..Default::default()
        },
    )
}

#[test]
fn read_an_existing_file() {
    let device = FakeDevice::new();
    device.add_file("/file", b"hello world", 0o444);
    let fs = default_mount(&device);

    let attr = fs.getattr("file").unwrap();
    assert_eq!(attr.size, 11);
    assert_eq!(attr.perm(), 0o444);

    let file = fs.open("file", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 1024];
    let n = file.read(&mut buf, 0).unwrap();

    assert_eq!(n, 11);
    assert_eq!(&buf[..n], b"hello world");
    // A short count is EOF; the next read returns nothing.
    assert_eq!(file.read(&mut buf, 11).unwrap(), 0);
    assert_eq!(device.open_read_count(), 1, "the whole file loads exactly once");

    file.release();
}

#[test]
fn write_then_flush_pushes_one_writeback() {
    let device = FakeDevice::new();
    let fs = default_mount(&device);

    let file = fs.create("file", OpenFlags::RDWR, 0o644).unwrap();
    file.write(b"hello world", 0).unwrap();
    file.write(b"goodbye", 6).unwrap();

    assert_eq!(file.buffer().size(), 13);
    assert!(device.writebacks().is_empty(), "nothing reaches the device before flush");

    file.flush().unwrap();

    let writebacks = device.writebacks();
    assert_eq!(writebacks.len(), 1, "a single writeback carries the final contents");
    assert_eq!(writebacks[0].1, b"hello goodbye");
    file.release();
}

#[test]
fn dirty_timeout_forces_a_flush_on_a_later_write() {
    let device = FakeDevice::new();
    device.add_file("/file", b"hello goodbye", 0o644);
    let fs = mount(
        &device,
        FilesystemConfig {
            mountpoint: "/mnt".to_string(),
            dirty_timeout: Duration::from_millis(40),
            ..Default::default()
        },
    );

    let file = fs.open("file", OpenFlags::RDWR).unwrap();
    file.write(b"world", 0).unwrap();
    file.write(b"world", 0).unwrap();
    assert!(
        device.writebacks().is_empty(),
        "writes within the timeout stay buffered"
    );

    // The dirty age is measured from the first write; once it exceeds the
    // timeout, the next write flushes inline.
    std::thread::sleep(Duration::from_millis(60));
    file.write(b"world", 0).unwrap();

    let writebacks = device.writebacks();
    assert_eq!(writebacks.len(), 1);
    assert_eq!(writebacks[0].1, b"world goodbye");
    file.release();
}

#[test]
fn absolute_symlink_targets_are_rewritten_under_the_mountpoint() {
    let device = FakeDevice::new();
    device.add_symlink("/link", "/target");
    let fs = default_mount(&device);

    assert_eq!(fs.readlink("link").unwrap(), "/mnt/target");
}

#[test]
fn relative_symlink_targets_pass_through() {
    let device = FakeDevice::new();
    device.add_symlink("/link", "relative");
    let fs = default_mount(&device);

    assert_eq!(fs.readlink("link").unwrap(), "relative");
}

#[test]
fn readlink_error_strings_map_to_errnos() {
    let device = FakeDevice::new();
    device.set_shell_output("readlink /foo", "readlink: Invalid argument\r\n");
    device.set_shell_output("readlink /bar", "readlink: Permission denied\r\n");
    device.set_shell_output("readlink /baz", "/bar\r\n");
    let fs = default_mount(&device);

    assert_eq!(fs.readlink("foo").unwrap_err().to_errno(), libc::EINVAL);
    assert_eq!(fs.readlink("bar").unwrap_err().to_errno(), libc::EACCES);
    assert_eq!(fs.readlink("baz").unwrap(), "/mnt/bar");
}

#[test]
fn statfs_parses_the_documented_sample() {
    let sample = "File: \"/sdcard/Pictures\"\n\
ID: 0        Namelen: 255     Type: UNKNOWN\n\
Block size: 4096\n\
Blocks: Total: 1269664    Free: 1209578    Available: 1205482\n\
Inodes: Total: 327680     Free: 326438\n";

    assert_eq!(
        parse_statfs(sample).unwrap(),
        StatfsInfo {
            namelen: 255,
            bsize: 4096,
            blocks: 1_269_664,
            bfree: 1_209_578,
            bavail: 1_205_482,
            files: 327_680,
            ffree: 326_438,
        }
    );

    assert_eq!(
        parse_statfs("Namelen: a").unwrap_err().to_string(),
        "invalid value for Namelen: a"
    );
}

#[test]
fn directory_traversal_stats_come_from_one_listing() {
    let device = FakeDevice::new();
    device.add_dir("/sdcard", 0o755);
    for i in 0..10 {
        device.add_file(&format!("/sdcard/file{i}.txt"), b"x", 0o644);
    }
    let fs = default_mount(&device);

    let entries = fs.open_dir("sdcard").unwrap();
    assert_eq!(entries.len(), 10);

    for entry in &entries {
        fs.getattr(&format!("sdcard/{}", entry.name)).unwrap();
    }

    assert_eq!(device.list_count(), 1);
    assert_eq!(device.stat_count(), 0, "per-child stats must be cache hits");
}

#[test]
fn stale_listing_hides_a_just_created_file_until_invalidation() {
    let device = FakeDevice::new();
    device.add_dir("/sdcard", 0o755);
    device.add_file("/sdcard/old.txt", b"", 0o644);
    let fs = default_mount(&device);

    fs.open_dir("sdcard").unwrap();
    device.add_file("/sdcard/new.txt", b"", 0o644);

    // Negative membership in the cached listing is authoritative.
    assert!(matches!(
        fs.getattr("sdcard/new.txt"),
        Err(FsError::NoEntry { .. })
    ));
}

#[test]
fn open_missing_path_without_create_is_enoent() {
    let device = FakeDevice::new();
    let fs = default_mount(&device);

    let err = fs.open("nope", OpenFlags::RDONLY).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[test]
fn read_only_mount_rejects_every_mutation_without_device_traffic() {
    let device = FakeDevice::new();
    device.add_file("/file", b"x", 0o644);
    let fs = mount(
        &device,
        FilesystemConfig {
            mountpoint: "/mnt".to_string(),
            read_only: true,
            ..Default::default()
        },
    );

    assert_eq!(fs.mkdir("d").unwrap_err().to_errno(), libc::EPERM);
    assert_eq!(fs.rename("file", "f2").unwrap_err().to_errno(), libc::EPERM);
    assert_eq!(fs.rmdir("d").unwrap_err().to_errno(), libc::EPERM);
    assert_eq!(fs.unlink("file").unwrap_err().to_errno(), libc::EPERM);
    assert_eq!(
        fs.access("file", libc::W_OK as u32).unwrap_err().to_errno(),
        libc::EPERM
    );

    assert!(device.commands().is_empty(), "no shell command may be issued");
}

#[test]
fn two_handles_on_one_path_share_contents() {
    let device = FakeDevice::new();
    device.add_file("/file", b"shared", 0o644);
    let fs = default_mount(&device);

    let writer = fs.open("file", OpenFlags::RDWR).unwrap();
    let reader = fs.open("file", OpenFlags::RDONLY).unwrap();

    writer.write(b"SHARED", 0).unwrap();

    let mut buf = [0u8; 16];
    let n = reader.read(&mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"SHARED");
    assert_eq!(device.open_read_count(), 1, "one buffer backs both handles");

    writer.release();
    reader.release();
}

#[test]
fn disconnected_device_surfaces_eio() {
    let device = FakeDevice::new();
    device.add_file("/file", b"x", 0o644);
    let fs = default_mount(&device);

    device.set_disconnected(true);

    let err = fs.getattr("file").unwrap_err();
    assert!(matches!(err, FsError::DeviceNotFound));
    assert_eq!(err.to_errno(), libc::EIO);
}

#[test]
fn create_then_getattr_before_any_write_still_flushes_the_file() {
    let device = FakeDevice::new();
    let fs = default_mount(&device);

    let file = fs.create("empty.txt", OpenFlags::RDWR, 0).unwrap();
    assert!(file.buffer().is_dirty());

    file.flush().unwrap();

    assert_eq!(device.file_contents("/empty.txt").unwrap(), b"");
    file.release();
}
