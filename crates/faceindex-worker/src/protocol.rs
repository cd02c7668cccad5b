//! JSON-lines request/response protocol for the worker process.
//!
//! Each input line is `{"id": .., "op": "..", "args": {..}}`. Each output
//! line is `{"id": .., "ok": ..}` or `{"id": .., "error": ".."}`. Replies are
//! written in request order.

use crate::worker::WorkerHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub op: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Response {
    Ok { id: Value, ok: Value },
    Error { id: Value, error: String },
}

/// Answer one raw request line.
pub async fn respond(handle: &WorkerHandle, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Response::Error {
                id: Value::Null,
                error: format!("malformed request: {e}"),
            }
        }
    };
    match handle.call(&request.op, request.args).await {
        Ok(ok) => Response::Ok { id: request.id, ok },
        Err(e) => Response::Error {
            id: request.id,
            error: e.to_string(),
        },
    }
}

/// Serve requests from `reader` until end of input.
pub async fn serve<R, W>(handle: WorkerHandle, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&handle, &line).await;
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }
    tracing::info!("input closed");
    Ok(())
}
