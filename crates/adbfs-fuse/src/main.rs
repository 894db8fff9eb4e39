//! The adbfs daemon: mounts one adb-connected device at a host directory.

use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use adbfs_adb::{AdbServer, DeviceConnection, ServerConfig, DEFAULT_ADB_PORT};
use anyhow::Context;
use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use adbfs_fuse::caching_client::caching_client_factory;
use adbfs_fuse::device_client::{AdbDeviceClient, DeviceClientFactory, DisconnectHook};
use adbfs_fuse::dir_cache::DirEntryCache;
use adbfs_fuse::{AdbFilesystem, AdbFuse, FilesystemConfig};

#[derive(Parser)]
#[command(name = "adbfs")]
#[command(about = "Mount an adb-connected Android device as a filesystem", long_about = None)]
struct Args {
    /// Serial number of the device to mount. Empty picks the only
    /// connected device.
    #[arg(short, long, default_value = "")]
    device: String,

    /// Directory to mount the device on.
    #[arg(short, long)]
    mountpoint: PathBuf,

    /// Device-side directory to present as the root of the mount.
    #[arg(long, default_value = "")]
    device_root: String,

    /// Port the adb server listens on.
    #[arg(long, default_value_t = DEFAULT_ADB_PORT)]
    port: u16,

    /// Size of the pool throttling short-lived adb connections.
    #[arg(long, default_value_t = 2)]
    pool_size: usize,

    /// Directory-listing cache TTL in milliseconds.
    #[arg(long, default_value_t = 300)]
    cache_ttl_ms: u64,

    /// Fail all mutating operations without contacting the device.
    #[arg(long)]
    read_only: bool,

    /// Seconds a file buffer may stay dirty before a write forces a flush.
    #[arg(long, default_value_t = 300)]
    dirty_timeout_secs: u64,

    /// Default log verbosity (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

enum MountEvent {
    DeviceGone,
    TrackerFailed(adbfs_adb::AdbError),
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(
                    args.log_level
                        .parse()
                        .context("invalid --log-level directive")?,
                )
                .from_env_lossy(),
        )
        .init();

    let mountpoint = std::fs::canonicalize(&args.mountpoint)
        .with_context(|| format!("mountpoint {} not accessible", args.mountpoint.display()))?;
    if !mountpoint.is_dir() {
        anyhow::bail!("mountpoint is not a directory: {}", mountpoint.display());
    }

    let server = AdbServer::new(ServerConfig {
        port: args.port,
        ..Default::default()
    });
    let version = server
        .version()
        .with_context(|| format!("adb server not reachable at {}", server.addr()))?;
    tracing::info!(addr = %server.addr(), version, "connected to adb server");

    let (events_tx, events_rx) = mpsc::channel::<MountEvent>();

    // Any client call that finds the device gone funnels into the same
    // teardown path as the tracker.
    let disconnect_hook: DisconnectHook = {
        let events_tx = events_tx.clone();
        Arc::new(move || {
            let _ = events_tx.send(MountEvent::DeviceGone);
        })
    };

    let cache = DirEntryCache::new(Duration::from_millis(args.cache_ttl_ms));
    cache.start_purge();

    let factory: DeviceClientFactory = {
        let server = server.clone();
        let serial = args.device.clone();
        let hook = disconnect_hook.clone();
        Arc::new(move || {
            Box::new(AdbDeviceClient::new(
                DeviceConnection::new(server.clone(), serial.clone()),
                Some(hook.clone()),
            ))
        })
    };
    let factory = caching_client_factory(Arc::clone(&cache), factory);

    let config = FilesystemConfig {
        device_serial: args.device.clone(),
        mountpoint: mountpoint.to_string_lossy().into_owned(),
        device_root: args.device_root.clone(),
        pool_size: args.pool_size,
        read_only: args.read_only,
        dirty_timeout: Duration::from_secs(args.dirty_timeout_secs),
    };
    let filesystem = AdbFilesystem::new(config, factory, cache).context("initializing filesystem")?;

    let mut options = vec![
        MountOption::FSName(format!("adbfs-{}", args.device)),
        MountOption::AutoUnmount,
        MountOption::NoDev,
        MountOption::NoSuid,
    ];
    if args.read_only {
        options.push(MountOption::RO);
    }

    let session = fuser::spawn_mount2(AdbFuse::new(filesystem), &mountpoint, &options)
        .with_context(|| format!("mounting at {}", mountpoint.display()))?;
    tracing::info!(
        device = %args.device,
        mountpoint = %mountpoint.display(),
        read_only = args.read_only,
        "mounted"
    );

    spawn_device_tracker(server, args.device.clone(), events_tx);

    // Block until the device disappears. The channel collapses reports
    // from every client and the tracker into one teardown; dropping the
    // session unmounts. Ctrl-C kills the process and auto_unmount cleans
    // the mountpoint up.
    match events_rx.recv() {
        Ok(MountEvent::DeviceGone) => {
            tracing::info!("device disconnected, unmounting");
        }
        Ok(MountEvent::TrackerFailed(err)) => {
            tracing::warn!(error = %err, "device tracker failed, unmounting");
        }
        Err(_) => {}
    }
    drop(session);
    tracing::info!("unmounted");

    Ok(())
}

/// Watches `host:track-devices` and reports when `serial` leaves the
/// device list (or goes offline).
fn spawn_device_tracker(server: AdbServer, serial: String, events_tx: mpsc::Sender<MountEvent>) {
    std::thread::Builder::new()
        .name("device-tracker".to_string())
        .spawn(move || {
            let mut stream = match server.track_devices() {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = events_tx.send(MountEvent::TrackerFailed(err));
                    return;
                }
            };
            loop {
                match stream.next_snapshot() {
                    Ok(devices) => {
                        let present = if serial.is_empty() {
                            devices.iter().any(|d| d.is_online())
                        } else {
                            devices
                                .iter()
                                .any(|d| d.serial == serial && d.is_online())
                        };
                        if !present {
                            let _ = events_tx.send(MountEvent::DeviceGone);
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = events_tx.send(MountEvent::TrackerFailed(err));
                        return;
                    }
                }
            }
        })
        .expect("spawning device tracker thread");
}
