use std::os::fd::AsRawFd;

use pluvio_bridge::config::DiskConfig;
use pluvio_bridge::disk::{BridgedFile, DiskBridge};
use pluvio_bridge::executor::{set_runtime, Runtime};
use pluvio_bridge::store;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const WORKERS: usize = 8;
const BLOCK: usize = 4096;

/// Writes and reads back a scratch file from several tasks, then pings the
/// store named by `PLUVIO_STORE_ADDR` (`host:port`) if it is set.
fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(true))
        .init();

    let runtime = Runtime::new(1024);
    set_runtime(runtime.clone());

    let rt = runtime.clone();
    let out = runtime.run(async move {
        let bridge = match DiskBridge::init(DiskConfig::from_env()) {
            Ok(bridge) => bridge,
            Err(err) => {
                tracing::error!("disk bridge failed to start: {}", err);
                return;
            }
        };

        let path = std::env::temp_dir().join(format!("pluvio-bridge-{}.dat", std::process::id()));
        let file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) => {
                tracing::error!("cannot open {}: {}", path.display(), err);
                bridge.shutdown().await;
                return;
            }
        };
        let fd = file.as_raw_fd();
        let file = std::rc::Rc::new(BridgedFile::new(file, bridge.clone()));

        let mut handles = Vec::new();
        for worker in 0..WORKERS {
            let file = file.clone();
            handles.push(rt.spawn_with_name(
                async move {
                    let offset = (worker * BLOCK) as u64;
                    file.write_all_at(vec![worker as u8; BLOCK], offset).await?;
                    let (n, buf) = file.read_at(vec![0; BLOCK], offset).await?;
                    Ok::<bool, std::io::Error>(n == BLOCK && buf.iter().all(|b| *b == worker as u8))
                },
                format!("worker-{}", worker),
            ));
        }
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(true)) => tracing::info!(worker, "block verified"),
                Ok(Ok(false)) => tracing::error!(worker, "block mismatch"),
                Ok(Err(err)) => tracing::error!(worker, "i/o failed: {}", err),
                Err(err) => tracing::error!(worker, "task failed: {}", err),
            }
        }
        if let Err(err) = bridge.fsync(fd).await {
            tracing::warn!("fsync failed: {}", err);
        }
        drop(file);
        bridge.shutdown().await;
        let _ = std::fs::remove_file(&path);

        if let Ok(addr) = std::env::var("PLUVIO_STORE_ADDR") {
            ping_store(&addr).await;
        }
    });

    if let Err(err) = out {
        tracing::error!("runtime: {}", err);
    }
}

async fn ping_store(addr: &str) {
    let Some((host, port)) = addr.rsplit_once(':') else {
        tracing::error!("PLUVIO_STORE_ADDR must be host:port, got {:?}", addr);
        return;
    };
    let Ok(port) = port.parse::<u16>() else {
        tracing::error!("bad port in PLUVIO_STORE_ADDR: {:?}", port);
        return;
    };

    let attachment = match store::connect(host, port).await {
        Ok(attachment) => attachment,
        Err(err) => {
            tracing::error!("store connect failed: {}", err);
            return;
        }
    };
    match attachment.command("PING").await {
        Ok(reply) => {
            tracing::info!(?reply, "store answered");
            attachment.release(reply);
        }
        Err(err) => tracing::error!("PING failed: {}", err),
    }
    store::free(attachment).await;
}
