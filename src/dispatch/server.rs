//! Unix domain socket server for the host dispatcher
//!
//! Every accepted guest connection gets its own dispatch loop over the same
//! frozen handler table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use executor_core::{Executor, Task};
use futures_lite::future;
use smol::channel::{self, Receiver, Sender};

use crate::dispatch::{Dispatcher, HandlerTable, spawn_link};
use crate::error::SetupResult;
use crate::transport::unix::Listener;

/// Running socket server
///
/// Dropping the handle stops accepting connections, stops the receive loop
/// of every open connection and removes the socket file. Calls already being
/// handled still send their replies.
pub struct ServerHandle {
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
    shutdown: Sender<()>,
}

impl ServerHandle {
    /// Path guests connect to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting connections and stop every connection's receive loop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.close();
        tracing::debug!(path = %self.socket_path.display(), "bridge server stopping");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Dispatcher {
    /// Freeze the bindings and serve guests connecting to `socket_path`
    pub fn serve<E: Executor + Clone + 'static>(
        self,
        socket_path: impl AsRef<Path>,
        executor: E,
    ) -> SetupResult<ServerHandle> {
        self.ensure_ready()?;
        let listener = Listener::bind(socket_path, &self.config)?;
        let socket_path = listener.socket_path().to_path_buf();
        let table = Arc::new(self.table);
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);

        executor
            .spawn(accept_loop(
                listener,
                table,
                Arc::clone(&running),
                shutdown_rx,
                executor.clone(),
            ))
            .detach();

        Ok(ServerHandle {
            socket_path,
            running,
            shutdown: shutdown_tx,
        })
    }
}

async fn accept_loop<E: Executor + Clone + 'static>(
    listener: Listener,
    table: Arc<HandlerTable>,
    running: Arc<AtomicBool>,
    shutdown: Receiver<()>,
    executor: E,
) {
    while running.load(Ordering::SeqCst) {
        let accepted = future::or(async { Some(listener.accept(&executor).await) }, async {
            let _ = shutdown.recv().await;
            None
        })
        .await;

        match accepted {
            Some(Ok(link)) => {
                spawn_link(Arc::clone(&table), link, shutdown.clone(), executor.clone());
            }
            Some(Err(e)) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "failed to accept bridge connection");
                }
            }
            None => break,
        }
    }

    tracing::debug!(path = %listener.socket_path().display(), "bridge server stopped");
}
