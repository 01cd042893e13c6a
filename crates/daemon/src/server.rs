//! MCP server speaking newline-delimited JSON-RPC 2.0 over stdio.
//!
//! Every request line is handled on its own task so a slow tool call (a
//! session launch waits out the connect grace period) never holds up
//! polling on other sessions. Responses funnel through one writer task,
//! which keeps output lines whole.

use std::io;
use std::sync::Arc;

use serde_json::Value;
use sshmux_protocol::jsonrpc;
use sshmux_protocol::messages::{Implementation, InitializeResult};
use sshmux_protocol::{IncomingMessage, Response, ToolCallParams, ToolsListResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::router::{tool_descriptors, ToolRouter, SERVER_INSTRUCTIONS};
use crate::session::SessionManagerImpl;

/// Responses buffered between request tasks and the writer.
const RESPONSE_QUEUE: usize = 64;

/// Errors that end the serve loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Reading requests or writing responses failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stdio MCP server.
pub struct McpServer {
    router: Arc<ToolRouter<SessionManagerImpl>>,
    server_info: Implementation,
}

impl McpServer {
    pub fn new(router: Arc<ToolRouter<SessionManagerImpl>>) -> Self {
        Self {
            router,
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Serve requests from `reader` until EOF or until `shutdown` fires.
    ///
    /// At EOF, requests already in flight are allowed to finish and their
    /// responses are written. On shutdown they are abandoned.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(RESPONSE_QUEUE);
        let writer_task = tokio::spawn(write_responses(writer, rx));
        let mut in_flight = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();

        info!("MCP server listening on stdio");
        let read_result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, abandoning {} in-flight request(s)", in_flight.len());
                    in_flight.shutdown().await;
                    break Ok(());
                }
                // Reap finished tasks so the set does not grow unbounded.
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Request task failed");
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let router = Arc::clone(&self.router);
                            let server_info = self.server_info.clone();
                            let tx = tx.clone();
                            in_flight.spawn(async move {
                                if let Some(response) = handle_line(&router, &server_info, &line).await {
                                    send(&tx, &response).await;
                                }
                            });
                        }
                        Ok(None) => {
                            debug!("stdin closed, draining {} in-flight request(s)", in_flight.len());
                            while let Some(joined) = in_flight.join_next().await {
                                if let Err(e) = joined {
                                    warn!(error = %e, "Request task failed");
                                }
                            }
                            break Ok(());
                        }
                        Err(e) => break Err(ServerError::Io(e)),
                    }
                }
            }
        };

        drop(tx);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ServerError::Io(e)),
            Err(e) => warn!(error = %e, "Response writer task failed"),
        }
        info!("MCP server stopped");
        read_result
    }

    /// Handle one raw input line. Returns `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        handle_line(&self.router, &self.server_info, line).await
    }
}

async fn send(tx: &mpsc::Sender<String>, response: &Response) {
    match response.to_line() {
        Ok(line) => {
            if tx.send(line).await.is_err() {
                debug!("Response dropped, writer has stopped");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode response"),
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        trace!(bytes = line.len(), "Writing response");
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle_line(
    router: &ToolRouter<SessionManagerImpl>,
    server_info: &Implementation,
    line: &str,
) -> Option<Response> {
    let message: IncomingMessage = match serde_json::from_str(line.trim()) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Unparsable request line");
            return Some(jsonrpc::parse_error());
        }
    };

    let Some(method) = message.method.as_deref() else {
        // A response from the client or garbage; only answer if it has an id.
        return message.id.map(jsonrpc::invalid_request);
    };

    if message.is_notification() {
        trace!(method, "Notification received");
        return None;
    }
    let id = message.id.clone().unwrap_or(Value::Null);
    let params = message.params.unwrap_or(Value::Null);
    trace!(method, "Request received");

    let response = match method {
        "initialize" => {
            let result = InitializeResult::new(
                server_info.clone(),
                Some(SERVER_INSTRUCTIONS.to_string()),
            );
            to_response(id, &result)
        }
        "ping" => jsonrpc::success_response(id, Value::Object(Default::default())),
        "tools/list" => to_response(
            id,
            &ToolsListResult {
                tools: tool_descriptors(),
            },
        ),
        "tools/call" => match serde_json::from_value::<ToolCallParams>(params) {
            Ok(call) => match router.call(call).await {
                Ok(result) => to_response(id, &result),
                Err(e) => internal_error(id, e.to_string()),
            },
            Err(e) => jsonrpc::invalid_params(id, format!("invalid tools/call params: {e}")),
        },
        other => jsonrpc::method_not_found(id, other),
    };
    Some(response)
}

fn to_response<T: serde::Serialize>(id: Value, result: &T) -> Response {
    match serde_json::to_value(result) {
        Ok(value) => jsonrpc::success_response(id, value),
        Err(e) => internal_error(id, e.to_string()),
    }
}

fn internal_error(id: Value, message: String) -> Response {
    warn!(%message, "Internal error while handling request");
    jsonrpc::internal_error(id, message)
}
