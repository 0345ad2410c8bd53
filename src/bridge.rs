//! Concurrency Bridge: runs the Client Proxy on a background thread with its
//! own runtime and moves requests and results across to the UI thread.
//!
//! The UI thread never touches the connection. It pushes commands onto a
//! queue and drains delivered events on its own schedule.

use serde_json::json;
use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::{Connection, ConnectionState};
use crate::config::HostCommand;
use crate::error::ClientError;
use crate::protocol::SOLVE_TOOL_NAME;
use crate::segmenter::Segments;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    NotStarted,
    Running,
    StoppedByRequest,
    StoppedByFailure,
}

pub type Ticket = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Connected { tools: Vec<String> },
    Solved { ticket: Ticket, result: Result<Segments, String> },
    Disconnected { reason: String },
}

enum Command {
    Solve { ticket: Ticket, question: String },
}

pub struct Bridge {
    state: Arc<StdMutex<BridgeState>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    events: std_mpsc::Receiver<BridgeEvent>,
    events_tx: Option<std_mpsc::Sender<BridgeEvent>>,
    connection_state: watch::Receiver<ConnectionState>,
    connection_state_tx: Option<watch::Sender<ConnectionState>>,
    stop: CancellationToken,
    next_ticket: Ticket,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        let (events_tx, events) = std_mpsc::channel();
        let (connection_state_tx, connection_state) = watch::channel(ConnectionState::Disconnected);
        Bridge {
            state: Arc::new(StdMutex::new(BridgeState::NotStarted)),
            commands: None,
            events,
            events_tx: Some(events_tx),
            connection_state,
            connection_state_tx: Some(connection_state_tx),
            stop: CancellationToken::new(),
            next_ticket: 1,
            thread: None,
        }
    }

    /// Launches the tool host described by `command` on the background thread.
    pub fn start(&mut self, command: HostCommand) -> std::io::Result<()> {
        self.start_with(move || async move { Connection::connect(&command).await })
    }

    /// Starts the background thread with a custom way of opening the connection.
    pub fn start_with<F, Fut>(&mut self, connector: F) -> std::io::Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Connection, ClientError>> + 'static,
    {
        if self.state() != BridgeState::NotStarted {
            tracing::warn!("Bridge already started or stopped");
            return Ok(());
        }
        let (Some(events), Some(connection_state)) = (self.events_tx.take(), self.connection_state_tx.take())
        else {
            tracing::warn!("Bridge already started");
            return Ok(());
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            commands: commands_rx,
            events,
            connection_state,
            state: self.state.clone(),
            stop: self.stop.clone(),
        };

        // The worker only records its outcome over Running.
        self.set_state(BridgeState::Running);
        let spawned = std::thread::Builder::new()
            .name("tool-bridge".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("Failed to create bridge runtime: {}", e);
                        worker.fail(format!("Failed to create runtime: {}", e));
                        return;
                    }
                };
                runtime.block_on(worker.run(connector));
                tracing::info!("Bridge runtime stopped");
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                tracing::error!("Failed to spawn bridge thread: {}", e);
                self.set_state(BridgeState::StoppedByFailure);
                return Err(e);
            }
        };

        self.commands = Some(commands_tx);
        self.thread = Some(thread);
        Ok(())
    }

    /// Queues a question for the tool host. Fails fast when the bridge has no
    /// live connection.
    pub fn submit(&mut self, question: impl Into<String>) -> Result<Ticket, ClientError> {
        if self.state() != BridgeState::Running || self.connection_state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let commands = self.commands.as_ref().ok_or(ClientError::NotConnected)?;

        let ticket = self.next_ticket;
        commands
            .send(Command::Solve {
                ticket,
                question: question.into(),
            })
            .map_err(|_| ClientError::NotConnected)?;
        self.next_ticket += 1;
        Ok(ticket)
    }

    /// Drains delivered events. Call from the UI thread.
    pub fn poll_events(&self) -> Vec<BridgeEvent> {
        let events: Vec<BridgeEvent> = self.events.try_iter().collect();
        if self.state() == BridgeState::StoppedByRequest {
            return Vec::new();
        }
        events
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.borrow()
    }

    /// Asks the background runtime to stop and detaches from its thread
    /// without joining it.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, BridgeState::NotStarted | BridgeState::Running) {
                tracing::info!("Stopping bridge");
                *state = BridgeState::StoppedByRequest;
            }
        }
        self.stop.cancel();
        self.commands.take();
        self.thread.take();
    }

    fn set_state(&self, next: BridgeState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    commands: mpsc::UnboundedReceiver<Command>,
    events: std_mpsc::Sender<BridgeEvent>,
    connection_state: watch::Sender<ConnectionState>,
    state: Arc<StdMutex<BridgeState>>,
    stop: CancellationToken,
}

impl Worker {
    /// Records the terminal state unless the UI already asked to stop.
    fn finish(&self, outcome: BridgeState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == BridgeState::Running {
            *state = outcome;
        }
    }

    fn fail(&self, reason: String) {
        self.connection_state.send_replace(ConnectionState::Disconnected);
        self.finish(BridgeState::StoppedByFailure);
        let _ = self.events.send(BridgeEvent::Disconnected { reason });
    }

    async fn run<F, Fut>(mut self, connector: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Connection, ClientError>>,
    {
        self.connection_state.send_replace(ConnectionState::Connecting);
        let connected = tokio::select! {
            result = connector() => result,
            _ = self.stop.cancelled() => {
                tracing::info!("Stopped before the connection was established");
                self.connection_state.send_replace(ConnectionState::Disconnected);
                return;
            }
        };

        let connection = match connected {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                tracing::error!("Failed to connect to tool host: {}", e);
                self.fail(e.to_string());
                return;
            }
        };

        let mut state_rx = connection.subscribe_state();
        let mut mirror_state = true;
        self.connection_state.send_replace(connection.state());
        let tools = connection.tools().iter().map(|t| t.name.clone()).collect();
        let _ = self.events.send(BridgeEvent::Connected { tools });

        let mut invocations = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break BridgeState::StoppedByRequest,
                _ = connection.wait_closed() => break BridgeState::StoppedByFailure,
                changed = state_rx.changed(), if mirror_state => match changed {
                    Ok(()) => {
                        let current = *state_rx.borrow();
                        self.connection_state.send_replace(current);
                    }
                    Err(_) => mirror_state = false,
                },
                Some(_) = invocations.join_next(), if !invocations.is_empty() => {}
                command = self.commands.recv() => match command {
                    Some(Command::Solve { ticket, question }) => {
                        tracing::info!(ticket, "Submitting question");
                        // Queued on the connection here, so submission order is kept.
                        let call = connection.invoke_tool(SOLVE_TOOL_NAME, json!({ "question": question }));
                        let events = self.events.clone();
                        let stop = self.stop.clone();
                        invocations.spawn(async move {
                            let result = call.await.map(|r| r.to_segments()).map_err(|e| e.to_string());
                            if stop.is_cancelled() {
                                tracing::debug!(ticket, "Dropping result after shutdown");
                                return;
                            }
                            if let Err(ref e) = result {
                                tracing::warn!(ticket, "Invocation failed: {}", e);
                            }
                            let _ = events.send(BridgeEvent::Solved { ticket, result });
                        });
                    }
                    None => break BridgeState::StoppedByRequest,
                },
            }
        };

        connection.close().await;
        while invocations.join_next().await.is_some() {}
        self.connection_state.send_replace(connection.state());

        if outcome == BridgeState::StoppedByFailure && !self.stop.is_cancelled() {
            let _ = self.events.send(BridgeEvent::Disconnected {
                reason: "Tool host connection closed".to_string(),
            });
        }
        self.finish(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::ScriptedBackend;
    use crate::handler::HostContext;
    use crate::host::ToolHost;
    use std::time::{Duration, Instant};
    use tokio::sync::{oneshot, Semaphore};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Connector serving an in-process host. Firing `kill` drops the host's
    /// end of the stream.
    type Connecting = std::pin::Pin<Box<dyn Future<Output = Result<Connection, ClientError>>>>;

    fn in_process(
        backend: Arc<ScriptedBackend>,
        kill: Option<oneshot::Receiver<()>>,
    ) -> impl FnOnce() -> Connecting + Send + 'static {
        move || -> Connecting {
            Box::pin(async move {
                let (client_io, host_io) = tokio::io::duplex(64 * 1024);
                let (host_r, host_w) = tokio::io::split(host_io);
                let host = ToolHost::new(Arc::new(HostContext::ready(backend)));
                tokio::spawn(async move {
                    match kill {
                        Some(kill) => {
                            tokio::select! {
                                _ = host.serve(host_r, host_w) => {}
                                _ = kill => {}
                            }
                        }
                        None => {
                            let _ = host.serve(host_r, host_w).await;
                        }
                    }
                });
                let (r, w) = tokio::io::split(client_io);
                Connection::from_streams(r, w, "in-process", TIMEOUT, TIMEOUT).await
            })
        }
    }

    fn collect_until(bridge: &Bridge, mut done: impl FnMut(&BridgeEvent) -> bool) -> Vec<BridgeEvent> {
        let deadline = Instant::now() + TIMEOUT;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            for event in bridge.poll_events() {
                let stop = done(&event);
                seen.push(event);
                if stop {
                    return seen;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for bridge events, saw {:?}", seen);
    }

    fn wait_for_state(bridge: &Bridge, expected: BridgeState) {
        let deadline = Instant::now() + TIMEOUT;
        while bridge.state() != expected {
            assert!(Instant::now() < deadline, "bridge stuck in {:?}", bridge.state());
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn started(backend: Arc<ScriptedBackend>) -> Bridge {
        let mut bridge = Bridge::new();
        bridge.start_with(in_process(backend, None)).unwrap();
        collect_until(&bridge, |e| matches!(e, BridgeEvent::Connected { .. }));
        bridge
    }

    #[test]
    fn test_submit_before_start_fails_fast() {
        let mut bridge = Bridge::new();
        assert_eq!(bridge.state(), BridgeState::NotStarted);
        assert_eq!(bridge.submit("q"), Err(ClientError::NotConnected));
        assert!(bridge.poll_events().is_empty());
    }

    #[test]
    fn test_round_trip() {
        let mut bridge = started(ScriptedBackend::replying(
            "Sol.\n### C Code ###\nCC\n### Manim Code ###\nMM\n",
        ));
        assert_eq!(bridge.state(), BridgeState::Running);
        assert_eq!(bridge.connection_state(), ConnectionState::Connected);

        let ticket = bridge.submit("How far does it fall?").unwrap();
        let events = collect_until(&bridge, |e| matches!(e, BridgeEvent::Solved { .. }));
        assert_eq!(
            events.last(),
            Some(&BridgeEvent::Solved {
                ticket,
                result: Ok(Segments {
                    solution: "Sol.".into(),
                    c_code: "CC".into(),
                    manim_code: "MM".into(),
                }),
            })
        );
    }

    #[test]
    fn test_each_submission_is_answered_once_in_order() {
        let gate = Arc::new(Semaphore::new(0));
        let backend = ScriptedBackend::gated("answer", gate.clone());
        let mut bridge = started(backend.clone());

        let a = bridge.submit("A").unwrap();
        let b = bridge.submit("B").unwrap();
        assert!(a < b);

        let deadline = Instant::now() + TIMEOUT;
        while backend.seen().len() < 2 {
            assert!(Instant::now() < deadline, "questions never reached the backend");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(backend.seen(), vec!["A".to_string(), "B".to_string()]);

        gate.add_permits(2);
        let mut answered = Vec::new();
        collect_until(&bridge, |e| {
            if let BridgeEvent::Solved { ticket, .. } = e {
                answered.push(*ticket);
            }
            answered.len() == 2
        });
        answered.sort();
        assert_eq!(answered, vec![a, b]);

        std::thread::sleep(Duration::from_millis(50));
        assert!(bridge
            .poll_events()
            .iter()
            .all(|e| !matches!(e, BridgeEvent::Solved { .. })));
    }

    #[test]
    fn test_connect_failure_stops_bridge() {
        let mut bridge = Bridge::new();
        bridge
            .start_with(|| async { Err::<Connection, _>(ClientError::ConnectionFailed("no such host".into())) })
            .unwrap();
        let events = collect_until(&bridge, |e| matches!(e, BridgeEvent::Disconnected { .. }));
        assert!(matches!(events.last(), Some(BridgeEvent::Disconnected { reason }) if reason.contains("no such host")));
        wait_for_state(&bridge, BridgeState::StoppedByFailure);
        assert_eq!(bridge.submit("q"), Err(ClientError::NotConnected));
    }

    #[test]
    fn test_fast_connect_failure_never_reads_running() {
        for _ in 0..50 {
            let mut bridge = Bridge::new();
            bridge
                .start_with(|| async { Err::<Connection, _>(ClientError::ConnectionFailed("refused".into())) })
                .unwrap();
            wait_for_state(&bridge, BridgeState::StoppedByFailure);
            std::thread::sleep(Duration::from_millis(5));
            assert_eq!(bridge.state(), BridgeState::StoppedByFailure);
        }
    }

    #[test]
    fn test_connection_loss_is_terminal() {
        let (kill_tx, kill_rx) = oneshot::channel();
        let mut bridge = Bridge::new();
        bridge
            .start_with(in_process(ScriptedBackend::replying("x"), Some(kill_rx)))
            .unwrap();
        collect_until(&bridge, |e| matches!(e, BridgeEvent::Connected { .. }));

        kill_tx.send(()).unwrap();
        // A submission racing the loss either fails fast or is dropped.
        let raced = bridge.submit("q");
        assert!(matches!(raced, Ok(_) | Err(ClientError::NotConnected)));

        let events = collect_until(&bridge, |e| matches!(e, BridgeEvent::Disconnected { .. }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, BridgeEvent::Solved { result: Ok(_), .. })));
        wait_for_state(&bridge, BridgeState::StoppedByFailure);
        assert_ne!(bridge.connection_state(), ConnectionState::Connected);
        assert_eq!(bridge.submit("again"), Err(ClientError::NotConnected));
    }

    #[test]
    fn test_no_delivery_after_shutdown() {
        let gate = Arc::new(Semaphore::new(0));
        let backend = ScriptedBackend::gated("late answer", gate.clone());
        let mut bridge = started(backend.clone());

        bridge.submit("in flight").unwrap();
        let deadline = Instant::now() + TIMEOUT;
        while backend.seen().is_empty() {
            assert!(Instant::now() < deadline, "question never reached the backend");
            std::thread::sleep(Duration::from_millis(10));
        }

        bridge.shutdown();
        assert_eq!(bridge.state(), BridgeState::StoppedByRequest);
        assert_eq!(bridge.submit("after"), Err(ClientError::NotConnected));

        gate.add_permits(1);
        std::thread::sleep(Duration::from_millis(100));
        assert!(bridge.poll_events().is_empty());
        assert_eq!(backend.seen(), vec!["in flight".to_string()]);

        // Idempotent.
        bridge.shutdown();
        assert_eq!(bridge.state(), BridgeState::StoppedByRequest);
    }
}
