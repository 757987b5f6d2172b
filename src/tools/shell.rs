//! Direct shell pass-through for `/shell`.
//!
//! Commands run under `sh -c` with:
//! - an exact-match deny set and a deny-prefix list checked before spawning
//! - a timeout, after which the child is killed
//! - combined output truncated to a byte budget, followed by the exit code

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::LazyLock;

use tokio::process::Command;

use crate::config::ShellConfig;
use crate::error::ShellError;

/// Commands refused when they match exactly (after trimming).
static BLOCKED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "rm -rf /",
        "rm -rf /*",
        "mkfs",
        "dd if=/dev/zero",
        ":(){ :|:& };:", // Fork bomb
        "> /dev/sda",
        "shutdown",
        "reboot",
        "halt",
        "poweroff",
        "init 0",
        "init 6",
    ])
});

/// Commands refused when they start with one of these.
const BLOCKED_PREFIXES: &[&str] = &[
    "rm -rf /",
    "mkfs.",
    "dd if=/dev/zero",
    "dd if=/dev/random",
    "chmod -R 777 /",
    "chown -R",
    "> /dev/sd",
];

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    config: ShellConfig,
}

impl ShellExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// Reason `command` is refused, if it is.
    pub fn check(&self, command: &str) -> Option<String> {
        let cmd = command.trim();
        if BLOCKED_COMMANDS.contains(cmd) {
            return Some("This command is blocked for safety reasons.".into());
        }
        BLOCKED_PREFIXES
            .iter()
            .find(|prefix| cmd.starts_with(*prefix))
            .map(|prefix| format!("Commands starting with '{prefix}' are blocked."))
    }

    /// Run `command` and return its formatted output.
    pub async fn execute(&self, command: &str) -> Result<String, ShellError> {
        if let Some(reason) = self.check(command) {
            tracing::warn!(command = %truncate_for_log(command), "Blocked shell command");
            return Err(ShellError::Blocked { reason });
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(command = %truncate_for_log(command), "Running shell command");
        let child = cmd.spawn()?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(output) => output?,
            Err(_) => {
                return Err(ShellError::Timeout {
                    timeout: self.config.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());

        Ok(format_output(&stdout, &stderr, &code, self.config.max_output))
    }
}

/// Combine the streams, truncate to `max_bytes` and append the exit code.
pub fn format_output(stdout: &str, stderr: &str, code: &str, max_bytes: usize) -> String {
    let mut output = stdout.to_string();
    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push_str("\n--- STDERR ---\n");
        }
        output.push_str(stderr);
    }
    if output.trim().is_empty() {
        output = "(no output)".to_string();
    }

    if output.len() > max_bytes {
        let total = output.chars().count();
        let cut = floor_char_boundary(&output, max_bytes);
        output.truncate(cut);
        output.push_str(&format!("\n... (truncated, {total} total chars)"));
    }

    output.push_str(&format!("\n[exit code: {code}]"));
    output
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_log(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}
