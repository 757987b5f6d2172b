//! Inbound message parsing.
//!
//! Turns raw chat text into a [`Command`]. Slash commands may carry a
//! `@botname` suffix (`/status@dispatch_bot`), which is ignored.

/// A parsed chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start` or `/help`.
    Help,
    /// `/ctx [name]`: show or switch the active context.
    Ctx { name: Option<String> },
    /// `/contexts`: list available contexts.
    Contexts,
    /// `/newctx <name> [path]`.
    NewCtx {
        name: Option<String>,
        path: Option<String>,
    },
    /// `/rmctx <name>`.
    RmCtx { name: Option<String> },
    /// `/stop`: stop the active context's running task and backlog.
    Stop,
    /// `/clear`: forget conversation and session for the active context.
    Clear,
    /// `/q <prompt>`: queue without a progress indicator.
    Queue { prompt: String },
    /// `/task <prompt>`: queue with orchestration requested.
    Task { prompt: String },
    /// `/tasks`: recent tasks of this submitter.
    Tasks,
    /// `/status`.
    Status,
    /// `/history`: recent transcript of the active context.
    History,
    /// `/shell <command>`.
    Shell { command: String },
    /// Plain text, queued as a task.
    Prompt { content: String },
    /// A slash command nobody handles.
    Unknown { command: String },
    /// Whitespace only.
    Empty,
}

impl Command {
    /// Whether this command queues work.
    pub fn submits_task(&self) -> bool {
        matches!(
            self,
            Self::Prompt { .. } | Self::Queue { .. } | Self::Task { .. }
        )
    }
}

/// Parses chat text into [`Command`]s.
pub struct CommandParser;

impl CommandParser {
    pub fn parse(content: &str) -> Command {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Command::Empty;
        }
        let Some(body) = trimmed.strip_prefix('/') else {
            return Command::Prompt {
                content: trimmed.to_string(),
            };
        };

        let (head, rest) = match body.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (body, ""),
        };
        let name = head.split('@').next().unwrap_or(head).to_lowercase();

        match name.as_str() {
            "start" | "help" => Command::Help,
            "ctx" => Command::Ctx {
                name: first_word(rest),
            },
            "contexts" => Command::Contexts,
            "newctx" => parse_newctx(rest),
            "rmctx" => Command::RmCtx {
                name: first_word(rest),
            },
            "stop" => Command::Stop,
            "clear" => Command::Clear,
            "q" => Command::Queue {
                prompt: rest.to_string(),
            },
            "task" => Command::Task {
                prompt: rest.to_string(),
            },
            "tasks" => Command::Tasks,
            "status" => Command::Status,
            "history" => Command::History,
            "shell" => Command::Shell {
                command: rest.to_string(),
            },
            _ => Command::Unknown { command: name },
        }
    }
}

fn first_word(rest: &str) -> Option<String> {
    rest.split_whitespace().next().map(str::to_string)
}

/// `/newctx <name> [path...]`; the path keeps its inner spaces.
fn parse_newctx(rest: &str) -> Command {
    let (name, path) = match rest.split_once(char::is_whitespace) {
        Some((name, path)) => (name, path.trim()),
        None => (rest, ""),
    };
    Command::NewCtx {
        name: (!name.is_empty()).then(|| name.to_string()),
        path: (!path.is_empty()).then(|| path.to_string()),
    }
}
