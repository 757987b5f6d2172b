//! Sub-role catalog handed to the orchestrating agent.

use serde::Serialize;

/// A specialized role the orchestrator can delegate to.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubRole {
    #[serde(skip)]
    pub name: &'static str,
    pub description: &'static str,
    pub prompt: &'static str,
    pub tools: &'static [&'static str],
}

const READ_ONLY: &[&str] = &["Read", "Glob", "Grep"];

pub static SUB_ROLES: &[SubRole] = &[
    SubRole {
        name: "planner",
        description: "Breaks complex tasks into ordered implementation steps after reading the code.",
        prompt: "You plan work. Study the codebase, then split the task into concrete numbered \
                 steps, naming the files each step touches and what it should achieve.",
        tools: READ_ONLY,
    },
    SubRole {
        name: "architect",
        description: "Chooses the technical approach after exploring existing patterns and dependencies.",
        prompt: "You design solutions. Examine existing patterns, dependencies and constraints, \
                 then recommend one approach with its rationale, covering edge cases, error \
                 handling and compatibility.",
        tools: READ_ONLY,
    },
    SubRole {
        name: "coder",
        description: "Implements features, fixes bugs and refactors following project conventions.",
        prompt: "You write code. Read the relevant files first, follow the project's conventions, \
                 keep changes minimal and focused, and confirm the result builds.",
        tools: &["Read", "Write", "Edit", "Bash", "Glob", "Grep"],
    },
    SubRole {
        name: "tester",
        description: "Runs builds and tests to validate changes and catch regressions.",
        prompt: "You verify work. Run the existing tests, report failures with details, and when \
                 no tests exist describe what should be covered.",
        tools: &["Bash", "Read", "Glob", "Grep"],
    },
    SubRole {
        name: "reviewer",
        description: "Reviews code for bugs, security problems and quality issues.",
        prompt: "You review code. Look for security vulnerabilities, performance problems, missing \
                 error handling and quality issues. Cite exact locations and propose fixes.",
        tools: READ_ONLY,
    },
];

/// The catalog as the `--agents` JSON object, keyed by role name.
pub fn agents_json() -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = SUB_ROLES
        .iter()
        .map(|role| {
            (
                role.name.to_string(),
                serde_json::to_value(role).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_five_roles() {
        let names: Vec<&str> = SUB_ROLES.iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["planner", "architect", "coder", "tester", "reviewer"]);
    }

    #[test]
    fn only_coder_can_write() {
        for role in SUB_ROLES {
            let writes = role.tools.contains(&"Write") || role.tools.contains(&"Edit");
            assert_eq!(writes, role.name == "coder", "role {}", role.name);
        }
    }

    #[test]
    fn agents_json_shape() {
        let json = agents_json();
        let tester = &json["tester"];
        assert_eq!(tester["tools"], serde_json::json!(["Bash", "Read", "Glob", "Grep"]));
        assert!(tester["description"].as_str().unwrap().contains("tests"));
        assert!(tester.get("name").is_none());
        assert_eq!(json.as_object().unwrap().len(), 5);
    }
}
