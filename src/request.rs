use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Binding the submitted code must assign its output to.
pub const RESULT_BINDING: &str = "result";

/// Names the execution host binds itself; context may not shadow them.
pub const RESERVED_BINDINGS: &[&str] = &[
    RESULT_BINDING,
    "SafeArray",
    "SafeTable",
    "read_only_connect",
];

/// A single execution submitted by a caller. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source_code: String,
    /// Variables bound into the execution scope before `source_code` runs.
    #[serde(default)]
    pub context: Map<String, Value>,
    pub policy_name: String,
    /// Clamped to `[1, policy.max_execution_seconds]`; `None` selects the
    /// policy maximum.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>, policy_name: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            context: Map::new(),
            policy_name: policy_name.into(),
            timeout_seconds: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.context.insert(name.into(), value);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// Check that every context name can be bound in the execution scope.
pub fn validate_context_names(context: &Map<String, Value>) -> Result<(), String> {
    for name in context.keys() {
        if RESERVED_BINDINGS.contains(&name.as_str()) {
            return Err(format!("context name '{}' is reserved", name));
        }
        if name.starts_with("__") {
            return Err(format!("context name '{}' may not start with '__'", name));
        }
        let mut chars = name.chars();
        let valid_start = matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic());
        if !valid_start || !chars.all(|c| c == '_' || c.is_alphanumeric()) {
            return Err(format!("context name '{}' is not an identifier", name));
        }
        if PYTHON_KEYWORDS.contains(&name.as_str()) {
            return Err(format!("context name '{}' is a keyword", name));
        }
    }
    Ok(())
}

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Closed failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ValidationRejected,
    CapabilityDenied,
    DataWriteRejected,
    Timeout,
    MemoryExceeded,
    NonSerializableResult,
    MissingResultBinding,
    RuntimeError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ValidationRejected => "validation_rejected",
            FailureReason::CapabilityDenied => "capability_denied",
            FailureReason::DataWriteRejected => "data_write_rejected",
            FailureReason::Timeout => "timeout",
            FailureReason::MemoryExceeded => "memory_exceeded",
            FailureReason::NonSerializableResult => "non_serializable_result",
            FailureReason::MissingResultBinding => "missing_result_binding",
            FailureReason::RuntimeError => "runtime_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one request. Constructed once and returned; the engine keeps
/// nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_value: Option<Value>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
}

impl ExecutionResult {
    pub fn success(request_id: Uuid, value: Value) -> Self {
        Self {
            request_id,
            succeeded: true,
            result_value: Some(value),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            failure_reason: None,
            failure_detail: None,
        }
    }

    pub fn failure(request_id: Uuid, reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            request_id,
            succeeded: false,
            result_value: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            failure_reason: Some(reason),
            failure_detail: Some(detail.into()),
        }
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Truncate a UTF-8 string at or before `max_bytes`, respecting char boundaries.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
