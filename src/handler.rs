//! Tool Handler and the host context it runs against.

use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, RwLock};

use crate::backend::GenerationBackend;
use crate::config::BackendConfig;
use crate::error::HandlerError;
use crate::protocol::{ToolResponse, SOLVE_TOOL_NAME};
use crate::segmenter::{MarkerSegmenter, Segmenter};

enum Readiness {
    Pending,
    Ready(Arc<dyn GenerationBackend>),
    Failed(String),
}

/// Constructed once per host process; owns the backend and its readiness.
pub struct HostContext {
    config: BackendConfig,
    readiness: RwLock<Readiness>,
}

impl HostContext {
    pub fn new(config: BackendConfig) -> Self {
        HostContext {
            config,
            readiness: RwLock::new(Readiness::Pending),
        }
    }

    /// A context whose backend is already set up.
    pub fn ready(backend: Arc<dyn GenerationBackend>) -> Self {
        HostContext {
            config: BackendConfig::default(),
            readiness: RwLock::new(Readiness::Ready(backend)),
        }
    }

    /// Builds the backend. Runs once; later calls are no-ops.
    pub async fn initialize(&self) {
        if !matches!(*self.readiness.read().unwrap_or_else(|e| e.into_inner()), Readiness::Pending) {
            return;
        }

        let next = match self.config.build() {
            Ok(backend) => {
                tracing::info!(backend = %backend.describe(), "Generation backend ready");
                Readiness::Ready(backend)
            }
            Err(e) => {
                tracing::error!("Error initializing generation backend: {:#}", e);
                Readiness::Failed(format!("{:#}", e))
            }
        };
        *self.readiness.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.readiness.read().unwrap_or_else(|e| e.into_inner()), Readiness::Ready(_))
    }

    pub fn backend(&self) -> Result<Arc<dyn GenerationBackend>, HandlerError> {
        match &*self.readiness.read().unwrap_or_else(|e| e.into_inner()) {
            Readiness::Ready(backend) => Ok(backend.clone()),
            Readiness::Pending => Err(HandlerError::BackendUnavailable(
                "Generation backend is not initialized".to_string(),
            )),
            Readiness::Failed(reason) => Err(HandlerError::BackendUnavailable(format!(
                "Generation backend failed to initialize: {}",
                reason
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SolveArguments {
    question: String,
}

/// A validated `solve-physics-question` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveRequest {
    pub question: String,
}

impl SolveRequest {
    pub fn parse(name: &str, arguments: Option<&Value>) -> Result<Self, HandlerError> {
        if name != SOLVE_TOOL_NAME {
            return Err(HandlerError::InvalidArgument(format!("Unknown tool: {}", name)));
        }
        let arguments = match arguments {
            Some(Value::Object(map)) if map.contains_key("question") => Value::Object(map.clone()),
            Some(Value::Object(_)) | Some(Value::Null) | None => {
                return Err(HandlerError::InvalidArgument("Missing 'question' argument.".to_string()))
            }
            Some(_) => {
                return Err(HandlerError::InvalidArgument("Arguments must be an object.".to_string()))
            }
        };
        let args: SolveArguments = serde_json::from_value(arguments)
            .map_err(|e| HandlerError::InvalidArgument(format!("Invalid arguments: {}", e)))?;
        Ok(SolveRequest { question: args.question })
    }
}

pub struct ToolHandler {
    context: Arc<HostContext>,
    segmenter: Box<dyn Segmenter>,
}

impl ToolHandler {
    pub fn new(context: Arc<HostContext>) -> Self {
        Self::with_segmenter(context, Box::new(MarkerSegmenter))
    }

    pub fn with_segmenter(context: Arc<HostContext>, segmenter: Box<dyn Segmenter>) -> Self {
        ToolHandler { context, segmenter }
    }

    pub async fn handle(&self, name: &str, arguments: Option<&Value>) -> Result<ToolResponse, HandlerError> {
        let request = SolveRequest::parse(name, arguments)?;
        self.solve(&request).await
    }

    pub async fn solve(&self, request: &SolveRequest) -> Result<ToolResponse, HandlerError> {
        let backend = self.context.backend()?;
        let raw = backend
            .generate(&request.question)
            .await
            .map_err(|e| HandlerError::BackendUnavailable(format!("{:#}", e)))?;

        let segments = self.segmenter.segment(&raw);
        tracing::debug!(
            raw_len = raw.len(),
            solution_len = segments.solution.len(),
            c_code_len = segments.c_code.len(),
            manim_code_len = segments.manim_code.len(),
            "Segmented backend response"
        );
        Ok(ToolResponse::from_segments(segments))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Backend that answers from a fixed script and records every question.
    pub struct ScriptedBackend {
        reply: Result<String, String>,
        pub questions: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedBackend {
        pub fn replying(text: &str) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                reply: Ok(text.to_string()),
                questions: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        pub fn failing(message: &str) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                reply: Err(message.to_string()),
                questions: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        /// Each generation waits for one permit on `gate`.
        pub fn gated(text: &str, gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(ScriptedBackend {
                reply: Ok(text.to_string()),
                questions: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        pub fn seen(&self) -> Vec<String> {
            self.questions.lock().unwrap().clone()
        }
    }

    impl GenerationBackend for ScriptedBackend {
        fn generate<'a>(&'a self, question: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
            Box::pin(async move {
                self.questions.lock().unwrap().push(question.to_string());
                if let Some(gate) = &self.gate {
                    gate.acquire().await?.forget();
                }
                match &self.reply {
                    Ok(text) => Ok(text.clone()),
                    Err(message) => Err(anyhow::anyhow!("{}", message)),
                }
            })
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }
}
