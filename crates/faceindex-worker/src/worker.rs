use crate::dispatcher::{DispatchError, Dispatcher};
use crate::runtime::{ModelLoader, RuntimeConfig};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker thread exited")]
    ChannelClosed,
}

/// Messages sent from callers to the worker thread.
struct WorkerRequest {
    op: String,
    args: Value,
    reply: oneshot::Sender<Result<Value, DispatchError>>,
}

/// Clone-safe handle to a worker thread.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    /// Run one operation on the worker and wait for its result.
    ///
    /// Operations run one at a time in the order they were sent.
    pub async fn call(&self, op: &str, args: Value) -> Result<Value, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest {
                op: op.to_string(),
                args,
                reply: reply_tx,
            })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| WorkerError::ChannelClosed)??)
    }
}

/// Spawn a worker on a dedicated OS thread.
///
/// The thread owns its own runtime manager and cache. It exits once every
/// handle is dropped, disposing the runtime on the way out.
pub fn spawn_worker<L: ModelLoader + 'static>(
    loader: L,
    defaults: RuntimeConfig,
    queue_depth: usize,
) -> Result<WorkerHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("faceindex-worker".into())
        .spawn(move || {
            let mut dispatcher = Dispatcher::new(loader, defaults);
            tracing::info!("worker thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = dispatcher.handle(&req.op, req.args);
                let _ = req.reply.send(result);
            }
            dispatcher.shutdown();
            tracing::info!("worker thread exiting");
        })
        .map_err(WorkerError::Spawn)?;

    Ok(WorkerHandle { tx })
}
