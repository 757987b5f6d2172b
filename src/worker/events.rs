//! Normalized agent event stream.
//!
//! The agent CLI writes one JSON object per line, discriminated by `type`.
//! Only three kinds matter here; everything else, including lines that are
//! not JSON at all, is skipped.

use serde::Deserialize;

/// Name of the tool the orchestrator uses to delegate to a sub-role.
pub const DELEGATION_TOOL: &str = "Task";

/// One event from a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Session started; carries the handle used for `--resume`.
    Init { session_id: String },
    /// An assistant turn; only its tool invocations are kept.
    Assistant { tool_calls: Vec<ToolInvocation> },
    /// Final outcome of the run.
    Result {
        text: String,
        session_id: Option<String>,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ToolInvocation {
    /// Sub-role named by a delegation call, if this is one.
    pub fn delegation(&self) -> Option<&str> {
        if self.name != DELEGATION_TOOL {
            return None;
        }
        self.input
            .get("subagent_type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Short description attached to a delegation call.
    pub fn delegation_description(&self) -> &str {
        self.input
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: RawMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Parse one output line. Returns `None` for blank, malformed or
/// irrelevant lines.
pub fn parse_line(line: &str) -> Option<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawEvent = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::trace!("Skipping unparseable agent line: {e}");
            return None;
        }
    };

    match raw {
        RawEvent::System {
            subtype: Some(subtype),
            session_id: Some(session_id),
        } if subtype == "init" => Some(AgentEvent::Init { session_id }),
        RawEvent::System { .. } | RawEvent::Other => None,
        RawEvent::Assistant { message } => {
            let tool_calls = message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, input } => Some(ToolInvocation { name, input }),
                    ContentBlock::Other => None,
                })
                .collect();
            Some(AgentEvent::Assistant { tool_calls })
        }
        RawEvent::Result {
            result,
            session_id,
            is_error,
        } => Some(AgentEvent::Result {
            text: result.unwrap_or_default(),
            session_id,
            is_error,
        }),
    }
}
