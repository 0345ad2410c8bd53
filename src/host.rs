//! Tool Host: answers discovery and tool-call requests over a byte stream.

use futures_util::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::codes;
use crate::handler::{HostContext, ToolHandler};
use crate::protocol::{
    self, methods, Request, Response, JSONRPC_VERSION, PROTOCOL_VERSION, SERVER_NAME, SOLVE_TOOL,
};

pub struct ToolHost {
    context: Arc<HostContext>,
    handler: Arc<ToolHandler>,
}

impl ToolHost {
    pub fn new(context: Arc<HostContext>) -> Self {
        let handler = Arc::new(ToolHandler::new(context.clone()));
        ToolHost { context, handler }
    }

    /// Serves requests until the reader reaches end of stream. Tool calls run
    /// concurrently and are aborted once the client goes away.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = out_rx.recv().await {
                if let Err(e) = protocol::write_frame(&mut writer, &line).await {
                    tracing::warn!("Failed to write response: {}", e);
                    break;
                }
            }
        });

        let mut reader = BufReader::new(reader);
        let mut calls = JoinSet::new();

        while let Some(frame) = protocol::read_frame(&mut reader).await? {
            while let Some(Some(_)) = calls.join_next().now_or_never() {}
            match frame {
                Ok(line) => self.dispatch(&line, &out_tx, &mut calls).await,
                Err(e) => {
                    tracing::warn!("Undecodable frame: {}", e);
                    send(&out_tx, Response::failure(Value::Null, codes::PARSE_ERROR, format!("Parse error: {}", e)));
                }
            }
        }

        tracing::info!(in_flight = calls.len(), "Client closed the stream, shutting down");
        calls.shutdown().await;
        drop(out_tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn dispatch(&self, line: &str, out: &mpsc::UnboundedSender<String>, calls: &mut JoinSet<()>) {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Unparsable frame: {}", e);
                send(out, Response::failure(Value::Null, codes::PARSE_ERROR, format!("Parse error: {}", e)));
                return;
            }
        };

        let Some(id) = request.id.clone() else {
            match request.method.as_str() {
                methods::INITIALIZED => tracing::debug!("Client finished initialization"),
                other => tracing::debug!("Ignoring notification {}", other),
            }
            return;
        };

        if request.jsonrpc != JSONRPC_VERSION {
            send(out, Response::failure(id, codes::INVALID_REQUEST, "Unsupported jsonrpc version"));
            return;
        }

        tracing::debug!(method = %request.method, %id, "Dispatching request");
        match request.method.as_str() {
            methods::INITIALIZE => {
                // Inline, so later frames wait in the pipe until the backend is set up.
                self.context.initialize().await;
                send(out, Response::success(id, initialize_result(&request.params)));
            }
            methods::PING => send(out, Response::success(id, json!({}))),
            methods::TOOLS_LIST => send(out, Response::success(id, json!({ "tools": [&*SOLVE_TOOL] }))),
            methods::TOOLS_CALL => {
                let handler = self.handler.clone();
                let out = out.clone();
                let params = request.params;
                calls.spawn(async move {
                    let response = call_tool(&handler, id, params).await;
                    send(&out, response);
                });
            }
            other => send(
                out,
                Response::failure(id, codes::METHOD_NOT_FOUND, format!("Method not found: {}", other)),
            ),
        }
    }
}

fn initialize_result(params: &Value) -> Value {
    let version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
    })
}

async fn call_tool(handler: &ToolHandler, id: Value, params: Value) -> Response {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return Response::failure(id, codes::INVALID_PARAMS, "Missing tool name");
    };

    tracing::info!(tool = name, %id, "Tool call");
    let start = std::time::Instant::now();
    match handler.handle(name, params.get("arguments")).await {
        Ok(response) => {
            tracing::info!(%id, elapsed = ?start.elapsed(), "Tool call finished");
            Response::success(id, response.to_call_result())
        }
        Err(e) => {
            tracing::warn!(%id, "Tool call failed: {}", e);
            Response::failure(id, e.code(), e.to_string())
        }
    }
}

fn send(out: &mpsc::UnboundedSender<String>, response: Response) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(e) => tracing::error!("Failed to encode response: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::handler::test_support::ScriptedBackend;
    use crate::protocol::SOLVE_TOOL_NAME;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct Peer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        host: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl Peer {
        fn start(host: ToolHost) -> Self {
            let (client_io, host_io) = tokio::io::duplex(64 * 1024);
            let (host_r, host_w) = tokio::io::split(host_io);
            let host = tokio::spawn(async move { host.serve(host_r, host_w).await });
            let (reader, writer) = tokio::io::split(client_io);
            Peer {
                reader: BufReader::new(reader),
                writer,
                host,
            }
        }

        async fn send(&mut self, value: Value) {
            protocol::write_frame(&mut self.writer, &value.to_string()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = protocol::read_frame(&mut self.reader).await.unwrap().expect("frame").unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn ready_host(reply: &str) -> ToolHost {
        ToolHost::new(Arc::new(HostContext::ready(ScriptedBackend::replying(reply))))
    }

    #[tokio::test]
    async fn test_tools_list() {
        let mut peer = Peer::start(ready_host(""));
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})).await;
        let response = peer.recv().await;
        assert_eq!(response["id"], 1);
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], SOLVE_TOOL_NAME);
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["question"]));
    }

    #[tokio::test]
    async fn test_call_returns_parts() {
        let mut peer = Peer::start(ready_host("Sol.\n### C Code ###\nCC\n"));
        peer.send(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": {"name": SOLVE_TOOL_NAME, "arguments": {"question": "q"}}
        }))
        .await;
        let response = peer.recv().await;
        assert_eq!(response["id"], 7);
        let content = &response["result"]["content"];
        assert_eq!(content[0]["text"], "Sol.");
        assert_eq!(content[1]["text"], "CC");
        assert_eq!(content[2]["text"], "");
    }

    #[tokio::test]
    async fn test_call_before_initialize_is_unavailable() {
        let context = Arc::new(HostContext::new(BackendConfig::default()));
        let mut peer = Peer::start(ToolHost::new(context));
        peer.send(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": SOLVE_TOOL_NAME, "arguments": {"question": "q"}}
        }))
        .await;
        let response = peer.recv().await;
        assert_eq!(response["error"]["code"], codes::BACKEND_UNAVAILABLE);

        // The host keeps serving afterwards.
        peer.send(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})).await;
        assert_eq!(peer.recv().await["id"], 3);
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let context = Arc::new(HostContext::new(BackendConfig::default()));
        let mut peer = Peer::start(ToolHost::new(context.clone()));
        peer.send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2024-11-05", "capabilities": {}}
        }))
        .await;
        let response = peer.recv().await;
        assert_eq!(response["result"]["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert!(context.is_ready());
    }

    #[tokio::test]
    async fn test_bad_frames_get_error_envelopes() {
        let mut peer = Peer::start(ready_host(""));

        peer.writer.write_all(b"this is not json\n").await.unwrap();
        let response = peer.recv().await;
        assert_eq!(response["error"]["code"], codes::PARSE_ERROR);
        assert_eq!(response["id"], Value::Null);

        peer.send(json!({"jsonrpc": "2.0", "id": 4, "method": "resources/list"})).await;
        assert_eq!(peer.recv().await["error"]["code"], codes::METHOD_NOT_FOUND);

        peer.send(json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": {"name": SOLVE_TOOL_NAME, "arguments": {}}
        }))
        .await;
        let response = peer.recv().await;
        assert_eq!(response["error"]["code"], codes::INVALID_PARAMS);
        assert!(response["error"]["message"].as_str().unwrap().contains("question"));

        peer.send(json!({
            "jsonrpc": "2.0", "id": 6, "method": "tools/call",
            "params": {"name": "wolfram-alpha", "arguments": {"question": "q"}}
        }))
        .await;
        assert_eq!(peer.recv().await["error"]["code"], codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_undecodable_frame_keeps_host_alive() {
        let mut peer = Peer::start(ready_host(""));
        peer.writer.write_all(b"\xff\xfe garbage\n").await.unwrap();
        let response = peer.recv().await;
        assert_eq!(response["error"]["code"], codes::PARSE_ERROR);
        assert_eq!(response["id"], Value::Null);

        peer.send(json!({"jsonrpc": "2.0", "id": 11, "method": "ping"})).await;
        assert_eq!(peer.recv().await["id"], 11);
        assert!(!peer.host.is_finished());
    }

    #[tokio::test]
    async fn test_null_id_and_missing_version() {
        let mut peer = Peer::start(ready_host(""));

        peer.send(json!({"jsonrpc": "2.0", "id": null, "method": "ping"})).await;
        let response = peer.recv().await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["result"], json!({}));

        peer.send(json!({"id": 12, "method": "ping"})).await;
        let response = peer.recv().await;
        assert_eq!(response["id"], 12);
        assert_eq!(response["error"]["code"], codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let mut peer = Peer::start(ready_host(""));
        peer.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).await;
        peer.send(json!({"jsonrpc": "2.0", "id": 9, "method": "ping"})).await;
        assert_eq!(peer.recv().await["id"], 9);
    }

    #[tokio::test]
    async fn test_serve_ends_on_eof() {
        let peer = Peer::start(ready_host(""));
        let Peer { reader, writer, host } = peer;
        drop(writer);
        drop(reader);
        host.await.unwrap().unwrap();
    }
}
