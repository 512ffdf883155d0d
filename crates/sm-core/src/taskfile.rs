//! The `tasks.md` on-disk format.
//!
//! One human-editable markdown document per project:
//!
//! ```text
//! # tasks.md
//!
//! ## Task: Add login page
//! - id: add-login-page
//! - branch: feature-auth
//! - status: UNCLAIMED
//! - dependencies: [foundation]
//! - priority: 5
//! ```
//!
//! Every attribute is a `- key: value` bullet. Lists are `[a, b, c]`,
//! absence is the token `null`, booleans are lowercase. Keys we do not
//! recognize are carried through verbatim so external tools can annotate
//! tasks without us destroying their data.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Task, TaskStatus};

pub const HEADER: &str = "# tasks.md";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TaskfileError {
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("task {task}: invalid field {field}: {reason}")]
    InvalidField {
        task: String,
        field: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, TaskfileError>;

fn parse_err(line: usize, reason: impl Into<String>) -> TaskfileError {
    TaskfileError::Parse {
        line,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a full `tasks.md` document into tasks, preserving block order.
pub fn parse_tasks(text: &str) -> Result<Vec<Task>> {
    let mut lines = text.lines().enumerate().peekable();

    // Header line (blank lines before it are tolerated).
    loop {
        match lines.peek() {
            Some((_, l)) if l.trim().is_empty() => {
                lines.next();
            }
            Some((_, l)) if l.trim() == HEADER => {
                lines.next();
                break;
            }
            Some((n, l)) => {
                return Err(parse_err(
                    n + 1,
                    format!("expected `{HEADER}` header, found {:?}", l.trim()),
                ));
            }
            None => return Ok(Vec::new()),
        }
    }

    let mut tasks = Vec::new();
    let mut current: Option<(usize, Task)> = None;

    for (idx, raw) in lines {
        let lineno = idx + 1;
        let line = raw.trim_end();
        let trimmed = line.trim_start();

        if trimmed.is_empty() {
            continue;
        }

        if let Some(title) = trimmed.strip_prefix("## Task:") {
            if let Some((start, task)) = current.take() {
                finish_task(start, task, &mut tasks)?;
            }
            let title = title.trim();
            if title.is_empty() {
                return Err(parse_err(lineno, "task block has an empty title"));
            }
            current = Some((lineno, Task::new(title, "")));
            continue;
        }

        if let Some(bullet) = trimmed.strip_prefix("- ") {
            let (_, task) = current
                .as_mut()
                .ok_or_else(|| parse_err(lineno, "attribute bullet outside a task block"))?;
            let (key, value) = bullet
                .split_once(':')
                .ok_or_else(|| parse_err(lineno, "bullet is not a `key: value` pair"))?;
            apply_field(task, key.trim(), value.trim(), lineno)?;
            continue;
        }

        return Err(parse_err(
            lineno,
            format!("unrecognized line {trimmed:?} (expected task block or bullet)"),
        ));
    }

    if let Some((start, task)) = current.take() {
        finish_task(start, task, &mut tasks)?;
    }

    Ok(tasks)
}

fn finish_task(start_line: usize, task: Task, out: &mut Vec<Task>) -> Result<()> {
    if task.branch.is_empty() {
        return Err(parse_err(
            start_line,
            format!("task {:?} has no `branch` field", task.title),
        ));
    }
    out.push(task);
    Ok(())
}

fn apply_field(task: &mut Task, key: &str, value: &str, line: usize) -> Result<()> {
    match key {
        "id" => task.id = value.to_string(),
        "description" => task.description = unescape(value),
        "prompt" => task.prompt = parse_opt_string(value),
        "branch" => task.branch = value.to_string(),
        "session" => task.session = parse_opt_string(value),
        "status" => {
            task.status = TaskStatus::parse(value)
                .ok_or_else(|| parse_err(line, format!("unknown status {value:?}")))?;
        }
        "dependencies" => task.dependencies = parse_list(value, line)?,
        "initialization_deps" => task.initialization_deps = parse_list(value, line)?,
        "priority" => task.priority = parse_int(value, line)?,
        "merge_order" => task.merge_order = parse_int(value, line)?,
        "exclusive_files" => task.exclusive_files = parse_list(value, line)?,
        "shared_files" => task.shared_files = parse_list(value, line)?,
        "spawn_attempts" => {
            task.spawn_attempts = parse_int(value, line)?.try_into().map_err(|_| {
                parse_err(line, format!("spawn_attempts {value:?} is negative"))
            })?;
        }
        "blocked" => {
            task.blocked = match value {
                "true" => true,
                "false" => false,
                other => return Err(parse_err(line, format!("bad boolean {other:?}"))),
            };
        }
        "created_at" => task.created_at = parse_ts(value, line)?,
        "updated_at" => task.updated_at = parse_ts(value, line)?,
        "completed_at" => task.completed_at = parse_opt_ts(value, line)?,
        "merged_at" => task.merged_at = parse_opt_ts(value, line)?,
        unknown => {
            task.unknown_fields
                .push((unknown.to_string(), value.to_string()));
        }
    }
    Ok(())
}

fn parse_opt_string(value: &str) -> Option<String> {
    if value == "null" {
        None
    } else {
        Some(unescape(value))
    }
}

fn parse_list(value: &str, line: usize) -> Result<Vec<String>> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(|| parse_err(line, format!("expected a `[a, b]` list, found {value:?}")))?;
    Ok(inner
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect())
}

fn parse_int(value: &str, line: usize) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|_| parse_err(line, format!("expected an integer, found {value:?}")))
}

fn parse_ts(value: &str, line: usize) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| parse_err(line, format!("bad RFC 3339 timestamp {value:?}")))
}

fn parse_opt_ts(value: &str, line: usize) -> Result<Option<DateTime<Utc>>> {
    if value == "null" {
        Ok(None)
    } else {
        parse_ts(value, line).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Render tasks back to the `tasks.md` document, in the given order.
pub fn serialize_tasks(tasks: &[Task]) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');

    for task in tasks {
        out.push('\n');
        out.push_str(&format!("## Task: {}\n", task.title));
        push_field(&mut out, "id", &task.id);
        push_field(&mut out, "branch", &task.branch);
        push_field(&mut out, "status", task.status.as_str());
        push_field(&mut out, "description", &escape(&task.description));
        push_opt(&mut out, "prompt", task.prompt.as_deref().map(escape));
        push_opt(&mut out, "session", task.session.clone());
        push_list(&mut out, "dependencies", &task.dependencies);
        push_list(&mut out, "initialization_deps", &task.initialization_deps);
        push_field(&mut out, "priority", &task.priority.to_string());
        push_field(&mut out, "merge_order", &task.merge_order.to_string());
        push_list(&mut out, "exclusive_files", &task.exclusive_files);
        push_list(&mut out, "shared_files", &task.shared_files);
        push_field(&mut out, "spawn_attempts", &task.spawn_attempts.to_string());
        push_field(&mut out, "blocked", if task.blocked { "true" } else { "false" });
        push_field(&mut out, "created_at", &task.created_at.to_rfc3339());
        push_field(&mut out, "updated_at", &task.updated_at.to_rfc3339());
        push_opt(
            &mut out,
            "completed_at",
            task.completed_at.map(|t| t.to_rfc3339()),
        );
        push_opt(&mut out, "merged_at", task.merged_at.map(|t| t.to_rfc3339()));
        for (key, value) in &task.unknown_fields {
            push_field(&mut out, key, value);
        }
    }

    out
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("- {key}: {value}\n"));
}

fn push_opt(out: &mut String, key: &str, value: Option<String>) {
    match value {
        Some(v) => push_field(out, key, &v),
        None => push_field(out, key, "null"),
    }
}

fn push_list(out: &mut String, key: &str, items: &[String]) {
    push_field(out, key, &format!("[{}]", items.join(", ")));
}

/// Free-text values are single-line in the bullet grammar; embedded
/// newlines are folded.
fn escape(value: &str) -> String {
    value.replace('\n', " ")
}

fn unescape(value: &str) -> String {
    value.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> &'static str {
        "# tasks.md\n\
         \n\
         ## Task: Add login page\n\
         - id: add-login-page\n\
         - branch: feature-auth\n\
         - status: UNCLAIMED\n\
         - description: Build the login form\n\
         - dependencies: [foundation]\n\
         - priority: 5\n\
         - merge_order: 1\n\
         - exclusive_files: [src/login.rs, src/auth.rs]\n\
         \n\
         ## Task: Foundation\n\
         - id: foundation\n\
         - branch: foundation\n\
         - status: COMPLETED\n\
         - completed_at: 2026-01-15T10:00:00+00:00\n"
    }

    #[test]
    fn parses_two_tasks_in_order() {
        let tasks = parse_tasks(sample_doc()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "add-login-page");
        assert_eq!(tasks[0].dependencies, vec!["foundation"]);
        assert_eq!(tasks[0].priority, 5);
        assert_eq!(
            tasks[0].exclusive_files,
            vec!["src/login.rs", "src/auth.rs"]
        );
        assert_eq!(tasks[1].status, TaskStatus::Completed);
        assert!(tasks[1].completed_at.is_some());
    }

    #[test]
    fn round_trip_is_identity() {
        let tasks = parse_tasks(sample_doc()).unwrap();
        let text = serialize_tasks(&tasks);
        let again = parse_tasks(&text).unwrap();
        assert_eq!(tasks.len(), again.len());
        for (a, b) in tasks.iter().zip(again.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.title, b.title);
            assert_eq!(a.branch, b.branch);
            assert_eq!(a.status, b.status);
            assert_eq!(a.dependencies, b.dependencies);
            assert_eq!(a.priority, b.priority);
            assert_eq!(a.merge_order, b.merge_order);
            assert_eq!(a.exclusive_files, b.exclusive_files);
            assert_eq!(a.created_at, b.created_at);
        }
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let doc = "# tasks.md\n\n## Task: T\n- branch: t\n- reviewer: alice\n- estimate: 3d\n";
        let tasks = parse_tasks(doc).unwrap();
        assert_eq!(
            tasks[0].unknown_fields,
            vec![
                ("reviewer".to_string(), "alice".to_string()),
                ("estimate".to_string(), "3d".to_string())
            ]
        );
        let text = serialize_tasks(&tasks);
        assert!(text.contains("- reviewer: alice"));
        assert!(text.contains("- estimate: 3d"));
        let again = parse_tasks(&text).unwrap();
        assert_eq!(again[0].unknown_fields, tasks[0].unknown_fields);
    }

    #[test]
    fn missing_header_is_rejected_with_line() {
        let err = parse_tasks("## Task: T\n- branch: t\n").unwrap_err();
        match err {
            TaskfileError::Parse { line, .. } => assert_eq!(line, 1),
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn bullet_outside_block_is_rejected() {
        let err = parse_tasks("# tasks.md\n- id: stray\n").unwrap_err();
        match err {
            TaskfileError::Parse { line, reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("outside"));
            }
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn bad_status_reports_line_number() {
        let doc = "# tasks.md\n\n## Task: T\n- branch: t\n- status: DONE\n";
        let err = parse_tasks(doc).unwrap_err();
        match err {
            TaskfileError::Parse { line, .. } => assert_eq!(line, 5),
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn task_without_branch_is_rejected() {
        let doc = "# tasks.md\n\n## Task: T\n- id: t\n";
        assert!(parse_tasks(doc).is_err());
    }

    #[test]
    fn empty_document_parses_to_no_tasks() {
        assert!(parse_tasks("# tasks.md\n").unwrap().is_empty());
        assert!(parse_tasks("").unwrap().is_empty());
    }

    #[test]
    fn null_tokens_parse_to_none() {
        let doc = "# tasks.md\n\n## Task: T\n- branch: t\n- session: null\n- prompt: null\n- completed_at: null\n";
        let tasks = parse_tasks(doc).unwrap();
        assert!(tasks[0].session.is_none());
        assert!(tasks[0].prompt.is_none());
        assert!(tasks[0].completed_at.is_none());
    }
}
