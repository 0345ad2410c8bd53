//! Client Proxy: launches a Tool Host, performs the handshake and correlates
//! tool calls with their replies.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::HostCommand;
use crate::error::{codes, ClientError};
use crate::protocol::{
    self, methods, Incoming, Request, ToolDescriptor, ToolResponse, PROTOCOL_VERSION, SOLVE_TOOL_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

type Reply = Result<Value, ClientError>;

struct Shared {
    label: String,
    state: watch::Sender<ConnectionState>,
    /// `None` once the connection has failed or is closing.
    pending: StdMutex<Option<HashMap<u64, oneshot::Sender<Reply>>>>,
    next_id: AtomicU64,
    terminated: CancellationToken,
}

impl Shared {
    fn new(label: &str) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Shared {
            label: label.to_string(),
            state,
            pending: StdMutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
            terminated: CancellationToken::new(),
        })
    }

    fn pending(&self) -> MutexGuard<'_, Option<HashMap<u64, oneshot::Sender<Reply>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// States only move forward, except a live connection may drop back to
    /// `Disconnected` when it fails. A failed connection never comes back.
    fn transition(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        let label = &self.label;
        let terminated = self.terminated.is_cancelled();
        self.state.send_if_modified(|state| {
            let allowed = match (*state, next) {
                (Disconnected, Connecting) => !terminated,
                (Connecting, Connected) => true,
                (Connecting | Connected, Disconnected) => true,
                (from, Closing | Closed) => next > from,
                _ => false,
            };
            if allowed {
                tracing::debug!(host = %label, from = ?*state, to = ?next, "Connection state");
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn fail_pending(&self, reason: &str) {
        let drained = self.pending().take();
        for (_, tx) in drained.into_iter().flatten() {
            let _ = tx.send(Err(ClientError::TransportError(reason.to_string())));
        }
    }

    /// The stream or process is gone. Idempotent.
    fn terminate(&self, reason: &str) {
        self.fail_pending(reason);
        let current = *self.state.borrow();
        match current {
            ConnectionState::Closing => {
                self.transition(ConnectionState::Closed);
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::warn!(host = %self.label, "Connection lost: {}", reason);
                self.transition(ConnectionState::Disconnected);
            }
            _ => {}
        }
        self.terminated.cancel();
    }

    fn route(&self, line: &str) {
        match Incoming::parse(line) {
            Ok(Incoming::Response(response)) => {
                let Some(id) = response.id.as_u64() else {
                    tracing::warn!(host = %self.label, "Response without a usable id: {}", line);
                    return;
                };
                let Some(tx) = self.pending().as_mut().and_then(|p| p.remove(&id)) else {
                    tracing::debug!(host = %self.label, id, "Reply for unknown request");
                    return;
                };
                let reply = match (response.error, response.result) {
                    (Some(error), _) => Err(ClientError::RemoteError {
                        code: error.code,
                        message: error.message,
                    }),
                    (None, result) => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(reply);
            }
            Ok(Incoming::Request(request)) => {
                tracing::debug!(host = %self.label, method = %request.method, "Ignoring host-initiated message");
            }
            Err(_) => {
                // Some servers print diagnostics on stdout.
                tracing::debug!(host = %self.label, "Skipping non-JSON output: {}", line);
            }
        }
    }
}

struct ProcessHandle {
    exited: CancellationToken,
    kill: CancellationToken,
}

/// One live connection to a Tool Host.
pub struct Connection {
    shared: Arc<Shared>,
    outgoing: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    process: Option<ProcessHandle>,
    tools: Vec<ToolDescriptor>,
    server_info: Value,
    shutdown_grace: Duration,
}

impl Connection {
    /// Spawns the host process and performs the handshake over its stdio.
    pub async fn connect(command: &HostCommand) -> Result<Self, ClientError> {
        let label = command
            .program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| command.program.display().to_string());

        tracing::info!(host = %label, "Starting process: {} {:?}", command.program.display(), command.args);
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ClientError::ConnectionFailed(format!("Failed to start {}: {}", command.program.display(), e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::ConnectionFailed("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::ConnectionFailed("Failed to get stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::info!(host = %label, "stderr: {}", line.trim());
                    }
                }
            });
        }

        let shared = Shared::new(&label);
        let exited = CancellationToken::new();
        let kill = CancellationToken::new();
        {
            let shared = shared.clone();
            let exited = exited.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill.cancelled() => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                match status {
                    Ok(status) => tracing::info!(host = %shared.label, %status, "Tool host exited"),
                    Err(e) => tracing::warn!(host = %shared.label, "Failed to wait for tool host: {}", e),
                }
                exited.cancel();
                shared.terminate("Tool host exited");
            });
        }

        let process = ProcessHandle { exited, kill };
        Self::establish(shared, stdout, stdin, command.handshake_timeout, command.shutdown_grace, Some(process))
            .await
    }

    /// Performs the handshake over an already open byte stream.
    pub async fn from_streams<R, W>(
        reader: R,
        writer: W,
        label: &str,
        handshake_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Result<Self, ClientError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::establish(Shared::new(label), reader, writer, handshake_timeout, shutdown_grace, None).await
    }

    async fn establish<R, W>(
        shared: Arc<Shared>,
        reader: R,
        writer: W,
        handshake_timeout: Duration,
        shutdown_grace: Duration,
        process: Option<ProcessHandle>,
    ) -> Result<Self, ClientError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        shared.transition(ConnectionState::Connecting);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(shared.clone(), writer, out_rx));
        tokio::spawn(read_loop(shared.clone(), BufReader::new(reader)));

        let mut connection = Connection {
            shared,
            outgoing: StdMutex::new(Some(out_tx)),
            process,
            tools: Vec::new(),
            server_info: Value::Null,
            shutdown_grace,
        };

        let outcome = tokio::time::timeout(handshake_timeout, connection.handshake()).await;
        let failure = match outcome {
            Ok(Ok(())) => {
                if connection.shared.transition(ConnectionState::Connected) {
                    tracing::info!(host = %connection.shared.label, tools = connection.tools.len(), "Connected");
                    return Ok(connection);
                }
                "Connection closed during handshake".to_string()
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("Handshake timed out after {:?}", handshake_timeout),
        };

        connection.abort(&failure);
        Err(ClientError::ConnectionFailed(failure))
    }

    async fn handshake(&mut self) -> Result<(), ClientError> {
        let init = self.send_request(
            methods::INITIALIZE,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }
            }),
        )?;
        let init = await_reply(init).await?;
        self.server_info = init.get("serverInfo").cloned().unwrap_or(Value::Null);
        tracing::debug!(host = %self.shared.label, server = %self.server_info, "Initialize response");

        self.send_notification(methods::INITIALIZED)?;

        let listed = await_reply(self.send_request(methods::TOOLS_LIST, json!({}))?).await?;
        let tools = listed.get("tools").cloned().unwrap_or_else(|| json!([]));
        self.tools = serde_json::from_value(tools)
            .map_err(|e| ClientError::TransportError(format!("Malformed tool list: {}", e)))?;
        for tool in &self.tools {
            tracing::debug!(host = %self.shared.label, "Tool discovered: {}", tool.name);
        }
        if !self.tools.iter().any(|t| t.name == SOLVE_TOOL_NAME) {
            tracing::warn!(host = %self.shared.label, "Host does not offer {}", SOLVE_TOOL_NAME);
        }
        Ok(())
    }

    fn outgoing(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_request(&self, method: &str, params: Value) -> Result<oneshot::Receiver<Reply>, ClientError> {
        // Holding the outgoing lock keeps frames in the order ids are handed out.
        let outgoing = self.outgoing();
        let Some(out) = outgoing.as_ref() else {
            return Err(ClientError::NotConnected);
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| ClientError::TransportError(format!("Failed to encode request: {}", e)))?;

        let (tx, rx) = oneshot::channel();
        match self.shared.pending().as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
            }
            None => return Err(ClientError::NotConnected),
        }

        if out.send(line).is_err() {
            if let Some(pending) = self.shared.pending().as_mut() {
                pending.remove(&id);
            }
            return Err(ClientError::TransportError("Writer stopped".to_string()));
        }
        Ok(rx)
    }

    fn send_notification(&self, method: &str) -> Result<(), ClientError> {
        let outgoing = self.outgoing();
        let out = outgoing.as_ref().ok_or(ClientError::NotConnected)?;
        let line = serde_json::to_string(&Request::notification(method))
            .map_err(|e| ClientError::TransportError(e.to_string()))?;
        out.send(line)
            .map_err(|_| ClientError::TransportError("Writer stopped".to_string()))
    }

    /// Calls a tool on the host.
    ///
    /// The request is queued before this returns, so calls made in sequence
    /// reach the host in that sequence even if their futures are polled in a
    /// different order. There is no timeout: a host that never replies keeps
    /// the future pending until the connection ends.
    pub fn invoke_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> impl Future<Output = Result<ToolResponse, ClientError>> + Send + 'static {
        let sent = if self.state() == ConnectionState::Connected {
            self.send_request(methods::TOOLS_CALL, json!({ "name": name, "arguments": arguments }))
        } else {
            Err(ClientError::NotConnected)
        };

        async move {
            let value = await_reply(sent?).await?;
            ToolResponse::from_call_result(value).map_err(|message| ClientError::RemoteError {
                code: codes::INTERNAL_ERROR,
                message,
            })
        }
    }

    /// Gracefully shuts the connection down. Safe to call more than once.
    pub async fn close(&self) {
        if self.state() != ConnectionState::Closed {
            self.shared.transition(ConnectionState::Closing);
        }
        self.shared.fail_pending("Connection closed");
        // Dropping the sender ends the writer, which closes the host's stdin.
        self.outgoing().take();

        if let Some(process) = &self.process {
            if tokio::time::timeout(self.shutdown_grace, process.exited.cancelled()).await.is_err() {
                tracing::warn!(host = %self.shared.label, "Tool host did not exit in {:?}, killing it", self.shutdown_grace);
                process.kill.cancel();
                process.exited.cancelled().await;
            }
        }

        if tokio::time::timeout(self.shutdown_grace, self.shared.terminated.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(host = %self.shared.label, "Stream still open after close");
        }
        self.shared.terminate("Connection closed");
        self.shared.transition(ConnectionState::Closed);
    }

    fn abort(&self, reason: &str) {
        self.outgoing().take();
        if let Some(process) = &self.process {
            process.kill.cancel();
        }
        self.shared.terminate(reason);
    }

    /// Resolves once the stream has ended or the host process has exited.
    pub async fn wait_closed(&self) {
        self.shared.terminated.cancelled().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn server_info(&self) -> &Value {
        &self.server_info
    }
}

async fn await_reply(rx: oneshot::Receiver<Reply>) -> Reply {
    rx.await
        .map_err(|_| ClientError::TransportError("Connection dropped".to_string()))?
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        tracing::trace!(host = %shared.label, "-> {}", line);
        if let Err(e) = protocol::write_frame(&mut writer, &line).await {
            shared.terminate(&format!("Write failed: {}", e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: BufReader<R>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match protocol::read_frame(&mut reader).await {
            Ok(Some(Ok(line))) => {
                tracing::trace!(host = %shared.label, "<- {}", line);
                shared.route(&line);
            }
            Ok(Some(Err(e))) => {
                tracing::debug!(host = %shared.label, "Skipping undecodable output: {}", e);
            }
            Ok(None) => break "Tool host closed the stream".to_string(),
            Err(e) => break format!("Read failed: {}", e),
        }
    };
    shared.terminate(&reason);
}
