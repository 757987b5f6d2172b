//! Command router: turns inbound chat messages into store, scheduler and
//! shell operations, and replies through the transport.

pub mod command;

use std::collections::HashMap;
use std::sync::Arc;

use crate::app::AppContext;
use crate::channels::{IncomingMessage, chunk_message};
use crate::config::{DEFAULT_CONTEXT, MAX_MESSAGE_CHARS};
use crate::error::Error;
use crate::worker::describe::truncate_chars;
use crate::worker::state::{NewTask, Task, TaskStatus};

pub use command::{Command, CommandParser};

const HELP_TEXT: &str = "Just send a message and I'll queue it for execution.\n\n\
Commands:\n\
/ctx <name> - switch context\n\
/contexts - list available contexts\n\
/newctx <name> [path] - create context\n\
/rmctx <name> - remove custom context\n\
/stop - kill running task in current context\n\
/clear - clear conversation history\n\
/q <task> - queue task silently\n\
/task <prompt> - force multi-agent pipeline\n\
/tasks - show recent tasks\n\
/status - show current state\n\
/history - show recent conversation\n\
/shell <cmd> - run shell command directly";

/// Shell output is wrapped in a code block; leave room for the fences.
const SHELL_CHUNK_CHARS: usize = 4000;

pub struct Router {
    app: Arc<AppContext>,
}

impl Router {
    pub fn new(app: Arc<AppContext>) -> Self {
        Self { app }
    }

    /// Handle one message. Errors are reported back to the chat.
    pub async fn handle(&self, msg: IncomingMessage) {
        let command = CommandParser::parse(&msg.content);
        tracing::debug!(
            chat_id = %msg.chat_id,
            user = %msg.user_id,
            submits = command.submits_task(),
            "Routing {command:?}"
        );

        if let Err(e) = self.dispatch(&msg.chat_id, command).await {
            tracing::error!(chat_id = %msg.chat_id, "Command failed: {e}");
            self.reply(&msg.chat_id, &format!("Error: {e}")).await;
        }
    }

    async fn dispatch(&self, chat: &str, command: Command) -> Result<(), Error> {
        match command {
            Command::Empty => Ok(()),
            Command::Help => self.help(chat).await,
            Command::Ctx { name } => self.switch_context(chat, name).await,
            Command::Contexts => self.list_contexts(chat).await,
            Command::NewCtx { name, path } => self.new_context(chat, name, path).await,
            Command::RmCtx { name } => self.remove_context(chat, name).await,
            Command::Stop => self.stop(chat).await,
            Command::Clear => self.clear(chat).await,
            Command::Queue { prompt } => self.queue_silently(chat, &prompt).await,
            Command::Task { prompt } => self.submit(chat, &prompt, true).await,
            Command::Prompt { content } => self.submit(chat, &content, false).await,
            Command::Tasks => self.tasks(chat).await,
            Command::Status => self.status(chat).await,
            Command::History => self.history(chat).await,
            Command::Shell { command } => self.shell(chat, &command).await,
            Command::Unknown { command } => {
                self.reply(
                    chat,
                    &format!("Unknown command: /{command}\nSend /help for the list."),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn reply(&self, chat: &str, text: &str) {
        for chunk in chunk_message(text, MAX_MESSAGE_CHARS) {
            if let Err(e) = self.app.transport.send_message(chat, &chunk).await {
                tracing::warn!(chat_id = chat, "Reply failed: {e}");
            }
        }
    }

    async fn help(&self, chat: &str) -> Result<(), Error> {
        let ctx = self.app.contexts.active(chat).await;
        self.reply(chat, &format!("Dispatcher online. Context: *{ctx}*\n\n{HELP_TEXT}"))
            .await;
        Ok(())
    }

    async fn switch_context(&self, chat: &str, name: Option<String>) -> Result<(), Error> {
        let contexts = &self.app.contexts;
        let Some(name) = name else {
            let current = contexts.active(chat).await;
            self.reply(chat, &format!("Current context: *{current}*\nUsage: /ctx <name>"))
                .await;
            return Ok(());
        };

        let Some(target) = contexts.resolve_name(&name).await? else {
            let available = contexts.available().await?;
            self.reply(
                chat,
                &format!("Unknown context: {name}\nAvailable: {}", available.join(", ")),
            )
            .await;
            return Ok(());
        };

        let old = contexts.active(chat).await;
        contexts.set_active(chat, &target).await?;

        let extra = match self.app.scheduler.running_task_id(&old).await {
            Some(id) if old != target => format!("\n(#{id} still running in {old})"),
            _ => String::new(),
        };
        self.reply(chat, &format!("Switched: *{old}* -> *{target}*{extra}"))
            .await;
        Ok(())
    }

    async fn list_contexts(&self, chat: &str) -> Result<(), Error> {
        let contexts = &self.app.contexts;
        let available = contexts.available().await?;
        let custom: HashMap<String, String> = contexts.custom().await?.into_iter().collect();
        let active = contexts.active(chat).await;
        let busy = self.app.scheduler.busy_contexts().await;

        let lines: Vec<String> = available
            .iter()
            .map(|c| {
                let is_active = *c == active;
                format!(
                    "  {} {c}{}{}{}",
                    if is_active { '>' } else { ' ' },
                    if is_active { " (active)" } else { "" },
                    if busy.contains(c) { " [running]" } else { "" },
                    custom.get(c).map(|p| format!(" -> {p}")).unwrap_or_default(),
                )
            })
            .collect();

        self.reply(
            chat,
            &format!(
                "Available contexts:\n{}\n\nCreate: /newctx <name> [path]\nRemove: /rmctx <name>",
                lines.join("\n")
            ),
        )
        .await;
        Ok(())
    }

    async fn new_context(
        &self,
        chat: &str,
        name: Option<String>,
        path: Option<String>,
    ) -> Result<(), Error> {
        let Some(name) = name else {
            self.reply(
                chat,
                "Usage: /newctx <name> [path]\nPath is optional - auto-resolves from repos dir.",
            )
            .await;
            return Ok(());
        };
        if name == DEFAULT_CONTEXT {
            self.reply(chat, &format!("Cannot override the default '{DEFAULT_CONTEXT}' context."))
                .await;
            return Ok(());
        }

        let contexts = &self.app.contexts;
        let path = match path {
            Some(path) => path,
            None => match contexts.resolve_repo_path(&name).await {
                Some(found) => found.display().to_string(),
                None => {
                    self.reply(
                        chat,
                        &format!(
                            "No repo matching '{name}' found in {}\n\
                             Provide path explicitly: /newctx <name> <path>",
                            contexts.repos_dir().display()
                        ),
                    )
                    .await;
                    return Ok(());
                }
            },
        };

        contexts.add_custom(&name, &path).await?;
        contexts.set_active(chat, &name).await?;
        tracing::info!(context = %name, path = %path, "Custom context created");
        self.reply(
            chat,
            &format!("Context *{name}* created -> {path}\nSwitched to *{name}*"),
        )
        .await;
        Ok(())
    }

    async fn remove_context(&self, chat: &str, name: Option<String>) -> Result<(), Error> {
        let Some(name) = name else {
            self.reply(chat, "Usage: /rmctx <name>").await;
            return Ok(());
        };
        if name == DEFAULT_CONTEXT {
            self.reply(chat, &format!("Cannot remove the default '{DEFAULT_CONTEXT}' context."))
                .await;
            return Ok(());
        }

        let contexts = &self.app.contexts;
        if contexts.remove_custom(&name).await? {
            if contexts.active(chat).await == name {
                contexts.set_active(chat, DEFAULT_CONTEXT).await?;
            }
            self.reply(chat, &format!("Context *{name}* removed.")).await;
        } else {
            self.reply(
                chat,
                &format!("No custom context named '{name}'. (Repo contexts can't be removed.)"),
            )
            .await;
        }
        Ok(())
    }

    async fn stop(&self, chat: &str) -> Result<(), Error> {
        let ctx = self.app.contexts.active(chat).await;
        let report = self.app.scheduler.stop_context(&ctx).await?;

        let text = if report.stopped_task.is_some() || report.cancelled_pending > 0 {
            let mut text = format!("Stopped {ctx}.");
            if report.cancelled_pending > 0 {
                text.push_str(&format!(
                    " Cancelled {} pending task(s).",
                    report.cancelled_pending
                ));
            }
            text
        } else {
            format!("Nothing running in {ctx}.")
        };
        self.reply(chat, &text).await;
        Ok(())
    }

    async fn clear(&self, chat: &str) -> Result<(), Error> {
        let ctx = self.app.contexts.active(chat).await;
        self.app.db.clear_conversation(chat, &ctx).await?;
        self.reply(chat, &format!("Conversation cleared for *{ctx}*."))
            .await;
        Ok(())
    }

    /// `/q`: queue with no progress indicator; confirm with the task id.
    async fn queue_silently(&self, chat: &str, prompt: &str) -> Result<(), Error> {
        if prompt.is_empty() {
            self.reply(chat, "Usage: /q <task>").await;
            return Ok(());
        }
        let ctx = self.app.contexts.active(chat).await;
        let busy = self.app.scheduler.is_context_busy(&ctx).await;
        let ahead = self.app.db.pending_count(&ctx).await? + usize::from(busy);

        let task = self.app.db.submit_task(NewTask::new(chat, &ctx, prompt)).await?;
        tracing::info!(task_id = task.id, context = %ctx, "Task queued");

        let text = if ahead > 0 {
            format!("Queued as #{} in {ctx} ({ahead} ahead)", task.id)
        } else {
            format!("Queued as #{} in {ctx}", task.id)
        };
        self.reply(chat, &text).await;
        Ok(())
    }

    /// Plain text and `/task`: queue behind a progress indicator.
    async fn submit(&self, chat: &str, prompt: &str, orchestrate: bool) -> Result<(), Error> {
        if prompt.is_empty() {
            if orchestrate {
                self.reply(
                    chat,
                    "Usage: /task <prompt>\nForces multi-agent orchestration \
                     (planner, coder, tester, reviewer).",
                )
                .await;
            }
            return Ok(());
        }

        let ctx = self.app.contexts.active(chat).await;
        let indicator = if self.app.scheduler.is_context_busy(&ctx).await {
            let ahead = self.app.db.pending_count(&ctx).await? + 1;
            if orchestrate {
                format!("Queued multi-agent in {ctx} ({ahead} ahead)")
            } else {
                format!("Queued in {ctx} ({ahead} ahead)")
            }
        } else if orchestrate {
            "Multi-agent thinking...".to_string()
        } else {
            "Thinking...".to_string()
        };

        let handle = match self.app.transport.create_progress(chat, &indicator).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(chat_id = chat, "Could not create progress indicator: {e}");
                None
            }
        };

        let new_task = NewTask::new(chat, &ctx, prompt)
            .with_progress_handle(handle)
            .with_orchestration(orchestrate);
        match self.app.db.submit_task(new_task).await {
            Ok(task) => {
                tracing::info!(task_id = task.id, context = %ctx, orchestrate, "Task queued");
                Ok(())
            }
            Err(e) => {
                if let Some(handle) = handle {
                    let _ = self.app.transport.delete_progress(chat, handle).await;
                }
                Err(e.into())
            }
        }
    }

    async fn tasks(&self, chat: &str) -> Result<(), Error> {
        let recent = self.app.db.recent_tasks(chat, 10).await?;
        if recent.is_empty() {
            self.reply(chat, "No tasks yet.").await;
            return Ok(());
        }
        let lines: Vec<String> = recent.iter().map(task_line).collect();
        self.reply(chat, &format!("Recent tasks:\n{}", lines.join("\n")))
            .await;
        Ok(())
    }

    async fn status(&self, chat: &str) -> Result<(), Error> {
        let ctx = self.app.contexts.active(chat).await;
        let mut lines = vec![format!("Context: *{ctx}*")];

        let running = self.app.db.all_running().await?;
        if running.is_empty() {
            lines.push("\nNo tasks running.".to_string());
        } else {
            lines.push("\nRunning:".to_string());
            for task in &running {
                let secs = task.elapsed().map_or(0, |d| d.as_secs());
                lines.push(format!(
                    "  {} #{} [{}] {} ({secs}s)",
                    status_icon(TaskStatus::Running),
                    task.id,
                    task.context,
                    shorten(&task.prompt, 30)
                ));
            }
        }

        let pending = self.app.db.pending_count(&ctx).await?;
        if pending > 0 {
            lines.push(format!("\n{pending} pending in {ctx}"));
        }

        self.reply(chat, &lines.join("\n")).await;
        Ok(())
    }

    async fn history(&self, chat: &str) -> Result<(), Error> {
        let ctx = self.app.contexts.active(chat).await;
        let turns = self
            .app
            .db
            .recent_turns(chat, &ctx, self.app.context_window)
            .await?;
        if turns.is_empty() {
            self.reply(chat, &format!("No conversation history in {ctx}."))
                .await;
            return Ok(());
        }

        let mut text = format!("History for *{ctx}* (last {} turns):", turns.len());
        for turn in &turns {
            text.push_str(&format!("\n\n{}: {}", turn.role, shorten(&turn.content, 200)));
        }
        self.reply(chat, &text).await;
        Ok(())
    }

    async fn shell(&self, chat: &str, command: &str) -> Result<(), Error> {
        if command.is_empty() {
            self.reply(chat, "Usage: /shell <command>").await;
            return Ok(());
        }

        let output = match self.app.shell.execute(command).await {
            Ok(output) => output,
            Err(e) => e.to_string(),
        };

        let fenced = format!("```\n{output}\n```");
        if fenced.chars().count() <= MAX_MESSAGE_CHARS {
            self.reply(chat, &fenced).await;
        } else {
            for chunk in chunk_message(&output, SHELL_CHUNK_CHARS) {
                self.reply(chat, &format!("```\n{chunk}\n```")).await;
            }
        }
        Ok(())
    }
}

fn status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "⏳",
        TaskStatus::Running => "⚡",
        TaskStatus::Completed => "✅",
        TaskStatus::Failed => "❌",
        TaskStatus::Cancelled => "🚫",
    }
}

fn shorten(text: &str, max: usize) -> String {
    let short = truncate_chars(text, max);
    if short.len() < text.len() {
        format!("{short}...")
    } else {
        short.to_string()
    }
}

/// One `/tasks` line: icon, id, context, prompt and duration.
fn task_line(task: &Task) -> String {
    let duration = match (task.elapsed(), task.finished_at) {
        (Some(d), Some(_)) => format!(" ({}s)", d.as_secs()),
        (Some(d), None) => format!(" ({}s...)", d.as_secs()),
        (None, _) => String::new(),
    };
    format!(
        "{} #{} [{}] {}{duration}",
        status_icon(task.status),
        task.id,
        task.context,
        shorten(&task.prompt, 40)
    )
}
