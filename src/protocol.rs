//! Wire format shared by the Tool Host and the Client Proxy: newline
//! delimited JSON-RPC 2.0 over the host's stdin/stdout, using the MCP
//! method names.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::segmenter::Segments;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "physics-solver-vis";

pub const SOLVE_TOOL_NAME: &str = "solve-physics-question";

pub const PART_SOLUTION: &str = "solution";
pub const PART_C_CODE: &str = "c_code";
pub const PART_MANIM_CODE: &str = "manim_code";
pub const MIME_C: &str = "text/x-c";
pub const MIME_PYTHON: &str = "text/x-python";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    /// `None` only when the member is absent; an explicit `null` id is kept.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(json!(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params: Value::Null,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A frame read from the host, as seen by the client.
#[derive(Debug)]
pub enum Incoming {
    Response(Response),
    /// Notifications or requests initiated by the host.
    Request(Request),
}

impl Incoming {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("method").is_some() {
            Ok(Incoming::Request(serde_json::from_value(value)?))
        } else {
            Ok(Incoming::Response(serde_json::from_value(value)?))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

pub static SOLVE_TOOL: Lazy<ToolDescriptor> = Lazy::new(|| ToolDescriptor {
    name: SOLVE_TOOL_NAME.to_string(),
    description: Some(
        "Solves a physics problem and provides a C simulation and a Manim visualization.".to_string(),
    ),
    input_schema: json!({
        "type": "object",
        "properties": {
            "question": {
                "type": "string",
                "description": "The physics question to solve."
            }
        },
        "required": ["question"]
    }),
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ContentPart {
    pub fn text(name: &str, text: String, mime_type: Option<&str>) -> Self {
        ContentPart {
            kind: "text".to_string(),
            text,
            name: Some(name.to_string()),
            mime_type: mime_type.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallToolResult {
    content: Vec<ContentPart>,
    #[serde(rename = "isError", default)]
    is_error: bool,
}

/// Ordered, named parts returned by a tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolResponse {
    pub parts: Vec<ContentPart>,
}

impl ToolResponse {
    pub fn from_segments(segments: Segments) -> Self {
        ToolResponse {
            parts: vec![
                ContentPart::text(PART_SOLUTION, segments.solution, None),
                ContentPart::text(PART_C_CODE, segments.c_code, Some(MIME_C)),
                ContentPart::text(PART_MANIM_CODE, segments.manim_code, Some(MIME_PYTHON)),
            ],
        }
    }

    pub fn part(&self, name: &str) -> Option<&ContentPart> {
        self.parts.iter().find(|p| p.name.as_deref() == Some(name))
    }

    /// Missing parts read as empty strings.
    pub fn to_segments(&self) -> Segments {
        let text = |name: &str| self.part(name).map(|p| p.text.clone()).unwrap_or_default();
        Segments {
            solution: text(PART_SOLUTION),
            c_code: text(PART_C_CODE),
            manim_code: text(PART_MANIM_CODE),
        }
    }

    pub fn to_call_result(&self) -> Value {
        serde_json::to_value(CallToolResult {
            content: self.parts.clone(),
            is_error: false,
        })
        .unwrap_or_default()
    }

    /// Parses a `tools/call` result. A result flagged `isError` yields the
    /// concatenated text of its parts as the error.
    pub fn from_call_result(value: Value) -> Result<Self, String> {
        let result: CallToolResult =
            serde_json::from_value(value).map_err(|e| format!("Malformed tool result: {}", e))?;
        if result.is_error {
            let message: Vec<&str> = result.content.iter().map(|p| p.text.as_str()).collect();
            return Err(message.join("\n"));
        }
        Ok(ToolResponse { parts: result.content })
    }
}

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// A line that was read but is not valid UTF-8.
pub type Frame = Result<String, std::string::FromUtf8Error>;

/// Reads the next non-blank line. Returns `None` at end of stream. A line
/// that fails to decode is handed back as `Err` so the stream stays usable.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    return Ok(Some(Ok(trimmed.to_string())));
                }
            }
            Err(e) => return Ok(Some(Err(e))),
        }
    }
}
