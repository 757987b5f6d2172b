//! One-line rendering of tool invocations for progress indicators.

use std::path::Path;

use crate::worker::events::ToolInvocation;

/// Take at most `max` characters of `s`.
pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn input_str<'a>(call: &'a ToolInvocation, key: &str) -> &'a str {
    call.input.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// Render a tool call, shortening paths under `repos_dir`.
pub fn describe_tool_call(call: &ToolInvocation, repos_dir: &Path) -> String {
    let short_path = || {
        let path = input_str(call, "file_path");
        let prefix = format!("{}/", repos_dir.display().to_string().trim_end_matches('/'));
        path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string()
    };

    match call.name.as_str() {
        "Bash" => format!("Running: {}", truncate_chars(input_str(call, "command"), 60)),
        "Read" => format!("Reading {}", short_path()),
        "Write" => format!("Writing {}", short_path()),
        "Edit" => format!("Editing {}", short_path()),
        "Grep" => format!("Searching: {}", truncate_chars(input_str(call, "pattern"), 40)),
        "Glob" => format!("Finding files: {}", truncate_chars(input_str(call, "pattern"), 40)),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, input: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            name: name.into(),
            input,
        }
    }

    const REPOS: &str = "/opt/dispatch/repos";

    #[test]
    fn bash_command_truncated_to_60() {
        let long = "x".repeat(100);
        let out = describe_tool_call(&call("Bash", serde_json::json!({"command": long})), Path::new(REPOS));
        assert_eq!(out, format!("Running: {}", "x".repeat(60)));
    }

    #[test]
    fn file_tools_strip_repos_prefix() {
        let input = serde_json::json!({"file_path": "/opt/dispatch/repos/api/src/main.rs"});
        let repos = Path::new(REPOS);
        assert_eq!(describe_tool_call(&call("Read", input.clone()), repos), "Reading api/src/main.rs");
        assert_eq!(describe_tool_call(&call("Write", input.clone()), repos), "Writing api/src/main.rs");
        assert_eq!(describe_tool_call(&call("Edit", input), repos), "Editing api/src/main.rs");
    }

    #[test]
    fn paths_outside_repos_are_kept() {
        let input = serde_json::json!({"file_path": "/etc/hosts"});
        assert_eq!(
            describe_tool_call(&call("Read", input), Path::new("/opt/dispatch/repos/")),
            "Reading /etc/hosts"
        );
    }

    #[test]
    fn search_tools_truncate_pattern() {
        let pattern = "p".repeat(50);
        let repos = Path::new(REPOS);
        assert_eq!(
            describe_tool_call(&call("Grep", serde_json::json!({"pattern": pattern})), repos),
            format!("Searching: {}", "p".repeat(40))
        );
        assert_eq!(
            describe_tool_call(&call("Glob", serde_json::json!({"pattern": "**/*.rs"})), repos),
            "Finding files: **/*.rs"
        );
    }

    #[test]
    fn unknown_tool_renders_name() {
        assert_eq!(
            describe_tool_call(&call("WebFetch", serde_json::json!({})), Path::new(REPOS)),
            "WebFetch"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
