//! Unix domain socket transport
//!
//! Each socket connection is pumped into a [`Link`] by two tasks: one reads
//! length-prefixed frames off the socket, the other writes queued frames.

use std::io;
use std::net::Shutdown;
use std::path::{Path, PathBuf};

use async_net::unix::{UnixListener, UnixStream};
use executor_core::{Executor, Task};
use futures_lite::io::{self as aio, AsyncReadExt};
use smol::channel::{self, Receiver, Sender};

use crate::config::BridgeConfig;
use crate::protocol::{ProtocolError, read_frame, write_frame};
use crate::transport::Link;

/// Connect to a host socket
pub async fn connect<E: Executor + Clone + 'static>(
    path: impl AsRef<Path>,
    config: &BridgeConfig,
    executor: &E,
) -> io::Result<Link> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).await?;
    tracing::debug!(path = %path.display(), "connected to bridge socket");
    Ok(attach(stream, config.max_frame_len(), executor).with_peer(path.display().to_string()))
}

/// Connect to the socket named by the configured environment variable
pub async fn connect_from_env<E: Executor + Clone + 'static>(
    config: &BridgeConfig,
    executor: &E,
) -> io::Result<Link> {
    let path = std::env::var_os(config.socket_env()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} environment variable not set", config.socket_env()),
        )
    })?;
    connect(PathBuf::from(path), config, executor).await
}

/// Listening socket on the host side
pub struct Listener {
    inner: UnixListener,
    socket_path: PathBuf,
    max_frame_len: usize,
}

impl Listener {
    /// Bind a socket at `socket_path`, replacing a stale one
    pub fn bind(socket_path: impl AsRef<Path>, config: &BridgeConfig) -> io::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let inner = UnixListener::bind(&socket_path)?;
        tracing::info!(path = %socket_path.display(), "bridge socket listening");

        Ok(Self {
            inner,
            socket_path,
            max_frame_len: config.max_frame_len(),
        })
    }

    /// Path the socket is bound to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for the next guest connection
    pub async fn accept<E: Executor + Clone + 'static>(&self, executor: &E) -> io::Result<Link> {
        let (stream, _addr) = self.inner.accept().await?;
        let peer = format!("{}#{}", self.socket_path.display(), next_connection_id());
        tracing::debug!(peer = %peer, "accepted bridge connection");
        Ok(attach(stream, self.max_frame_len, executor).with_peer(peer))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn next_connection_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Pump an already-connected stream into a [`Link`]
pub fn attach<E: Executor + Clone + 'static>(
    stream: UnixStream,
    max_frame_len: usize,
    executor: &E,
) -> Link {
    let (outbound_tx, outbound_rx) = channel::unbounded();
    let (inbound_tx, inbound_rx) = channel::unbounded();

    executor
        .spawn(read_pump(stream.clone(), inbound_tx, max_frame_len))
        .detach();
    executor.spawn(write_pump(stream, outbound_rx)).detach();

    Link::from_channels(outbound_tx, inbound_rx).with_max_frame_len(max_frame_len)
}

async fn read_pump(mut stream: UnixStream, inbound: Sender<Vec<u8>>, max_frame_len: usize) {
    loop {
        match read_frame(&mut stream, max_frame_len).await {
            Ok(Some(body)) => {
                if inbound.send(body).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("bridge socket closed by peer");
                break;
            }
            Err(ProtocolError::FrameTooLarge { len, max }) => {
                tracing::warn!(len, max, "skipping oversized frame");
                let skipped = aio::copy((&mut stream).take(len as u64), aio::sink()).await;
                if !matches!(skipped, Ok(n) if n == len as u64) {
                    tracing::debug!("bridge socket closed inside an oversized frame");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read frame");
                break;
            }
        }
    }
}

async fn write_pump(mut stream: UnixStream, outbound: Receiver<Vec<u8>>) {
    while let Ok(body) = outbound.recv().await {
        if let Err(e) = write_frame(&mut stream, &body).await {
            tracing::debug!(error = %e, "failed to write frame");
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Write);
}
