//! JSON-RPC server over newline-delimited JSON.
//!
//! One request per line in, one response per line out. Requests are handled
//! concurrently so slow turns on one session do not hold up other sessions;
//! responses carry the request id and may arrive out of order. Requests that
//! name the same `session_id` run one after another in the order they were
//! read.

use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use deskmate_shared::rpc::{
    AnalyzeParams, RpcMethod, RpcRequest, RpcResponse, SearchParams, SessionParams,
};
use deskmate_shared::{ChatRequest, FeedbackRequest, PipelineError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

const RESPONSE_QUEUE: usize = 64;

/// Serve requests from stdin until EOF.
pub async fn serve_stdio(pipeline: Arc<Pipeline>) -> Result<()> {
    info!("deskmated v{} serving on stdio", deskmate_shared::VERSION);
    serve(pipeline, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve requests read from `reader`, writing responses to `writer`.
/// Returns after EOF once every in-flight request has been answered.
pub async fn serve<R, W>(pipeline: Arc<Pipeline>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<RpcResponse>(RESPONSE_QUEUE);

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = rx.recv().await {
            let response_json = serde_json::to_string(&response)? + "\n";
            writer
                .write_all(response_json.as_bytes())
                .await
                .context("Failed to write response")?;
            writer.flush().await.context("Failed to flush response")?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let mut lines = BufReader::new(reader).lines();
    let mut handlers = JoinSet::new();
    let mut queues = SessionQueues::default();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        while let Some(joined) = handlers.try_join_next() {
            log_join(joined);
        }
        queues.prune();
        if line.trim().is_empty() {
            continue;
        }

        let turn = queues.enqueue(session_key(&line));
        let pipeline = Arc::clone(&pipeline);
        let tx = tx.clone();
        handlers.spawn(async move {
            let _done = turn.wait().await;
            let response = handle_line(&pipeline, &line).await;
            if tx.send(response).await.is_err() {
                warn!("Response writer closed, dropping response");
            }
        });
    }

    while let Some(joined) = handlers.join_next().await {
        log_join(joined);
    }
    drop(tx);
    writer_task.await.context("Response writer panicked")??;
    debug!("input closed, server stopping");
    Ok(())
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Request handler failed: {}", e);
    }
}

/// The `session_id` a request line names, if any.
fn session_key(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value
        .get("params")?
        .get("session_id")?
        .as_str()
        .map(str::to_string)
}

/// Completion signals of the last request queued per session.
#[derive(Default)]
struct SessionQueues {
    last: HashMap<String, oneshot::Receiver<()>>,
}

impl SessionQueues {
    fn enqueue(&mut self, session: Option<String>) -> QueuedTurn {
        let Some(session) = session else {
            return QueuedTurn {
                previous: None,
                done: None,
            };
        };
        let (done, next) = oneshot::channel();
        let previous = self.last.insert(session, next);
        QueuedTurn {
            previous,
            done: Some(done),
        }
    }

    /// Forget sessions whose last request has finished.
    fn prune(&mut self) {
        self.last.retain(|_, rx| {
            matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty))
        });
    }
}

struct QueuedTurn {
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl QueuedTurn {
    /// Wait for the previous request on the same session. The returned
    /// guard releases the next one when dropped, panics included.
    async fn wait(self) -> Option<oneshot::Sender<()>> {
        if let Some(previous) = self.previous {
            // an error only means the previous handler is gone
            let _ = previous.await;
        }
        self.done
    }
}

/// Parse and handle one request line.
pub async fn handle_line(pipeline: &Pipeline, line: &str) -> RpcResponse {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!("Invalid request JSON: {}", e);
            return RpcResponse::error(String::new(), PARSE_ERROR, format!("Parse error: {}", e));
        }
    };
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    match serde_json::from_value::<RpcRequest>(value) {
        Ok(request) => handle_request(pipeline, request).await,
        Err(e) => RpcResponse::error(id, INVALID_REQUEST, format!("Invalid request: {}", e)),
    }
}

/// Dispatch a parsed request.
pub async fn handle_request(pipeline: &Pipeline, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    debug!("rpc {:?} id={}", request.method, id);

    match request.method {
        RpcMethod::Chat => match params::<ChatRequest>(&id, request.params) {
            Ok(chat) => reply(id, pipeline.handle(chat).await),
            Err(resp) => resp,
        },
        RpcMethod::Feedback => match params::<FeedbackRequest>(&id, request.params) {
            Ok(feedback) => reply(id, pipeline.record_feedback(feedback).await),
            Err(resp) => resp,
        },
        RpcMethod::Analyze => match params::<AnalyzeParams>(&id, request.params) {
            Ok(p) => reply(
                id,
                pipeline
                    .analyze(&p.problem_description, p.device_info.as_ref())
                    .await,
            ),
            Err(resp) => resp,
        },
        RpcMethod::Search => match params::<SearchParams>(&id, request.params) {
            Ok(p) => {
                let result = pipeline
                    .search(&p.query, p.limit, p.problem_category, p.device_type)
                    .await
                    .map(|results| serde_json::json!({ "results": results }));
                reply(id, result)
            }
            Err(resp) => resp,
        },
        RpcMethod::Session => match params::<SessionParams>(&id, request.params) {
            Ok(p) => reply(id, pipeline.session(&p.session_id).await),
            Err(resp) => resp,
        },
        RpcMethod::ClearSession => match params::<SessionParams>(&id, request.params) {
            Ok(p) => {
                let result = pipeline.clear_session(&p.session_id).await.map(|cleared| {
                    serde_json::json!({ "session_id": p.session_id, "cleared": cleared })
                });
                reply(id, result)
            }
            Err(resp) => resp,
        },
        RpcMethod::Status => reply(id, Ok::<_, PipelineError>(pipeline.status().await)),
    }
}

fn params<T: DeserializeOwned>(
    id: &str,
    params: Option<serde_json::Value>,
) -> Result<T, RpcResponse> {
    let Some(value) = params else {
        return Err(RpcResponse::error(
            id.to_string(),
            INVALID_PARAMS,
            "Missing params".to_string(),
        ));
    };
    serde_json::from_value(value).map_err(|e| {
        RpcResponse::error(id.to_string(), INVALID_PARAMS, format!("Invalid params: {}", e))
    })
}

fn reply<T: Serialize>(id: String, result: Result<T, PipelineError>) -> RpcResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => RpcResponse::success(id, value),
            Err(e) => {
                error!("Failed to serialize result: {}", e);
                RpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e))
            }
        },
        Err(e) => {
            if e.is_caller_facing() {
                debug!("request {} rejected: {}", id, e);
            } else {
                error!("request {} failed: {}", id, e);
            }
            RpcResponse::error(id, e.code(), e.to_string())
        }
    }
}
