//! Well-known subjects shared by every node.

pub const TASK_CREATE: &str = "task.create";
pub const TASK_REQUEST: &str = "task.request";
pub const TASK_ASSIGN: &str = "task.assign";
pub const TASK_UPDATE: &str = "task.update";
pub const TASK_COMPLETE: &str = "task.complete";
pub const TASK_FAIL: &str = "task.fail";
pub const TASK_CANCEL: &str = "task.cancel";

pub const SYSTEM_REGISTER: &str = "system.register";
pub const SYSTEM_LOAD: &str = "system.load";
pub const SYSTEM_HEALTH: &str = "system.health";

pub const PERSISTENCE_ACK: &str = "a2a.persistence.ack";

/// Prefix for per-request reply subjects
pub const INBOX_PREFIX: &str = "_INBOX";

/// Every task lifecycle subject, in publication order
pub const TASK_SUBJECTS: [&str; 7] = [
    TASK_CREATE,
    TASK_REQUEST,
    TASK_ASSIGN,
    TASK_UPDATE,
    TASK_COMPLETE,
    TASK_FAIL,
    TASK_CANCEL,
];

/// Subject an alert of the given severity is republished on
pub fn alert_subject(base: &str, severity: &str) -> String {
    format!("{base}.{severity}")
}

/// Check a concrete subject against a pattern with `*` (one token) and
/// `>` (one or more trailing tokens) wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subject used for publishing: non-empty tokens, no wildcards
pub fn is_valid_publish_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|token| !token.is_empty() && token != "*" && token != ">")
}
