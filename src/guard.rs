//! Read-Only Data Guard.
//!
//! Classifies individual SQL statements as read-only or mutating. The same
//! rules are applied statically by the [`crate::validator`] to SQL-looking
//! string literals and, inside the execution host, to every statement passed
//! to a guarded database connection (see [`python_guard_source`]).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Keywords a read-only statement may start with.
pub const READ_LEADERS: &[&str] = &[
    "select",
    "with",
    "explain",
    "pragma",
    "values",
    "show",
    "describe",
    "summarize",
];

/// Keywords that mark a statement as mutating wherever they appear.
pub const MUTATION_VERBS: &[&str] = &[
    "insert", "update", "delete", "replace", "drop", "truncate", "alter", "create", "attach",
    "detach", "merge", "upsert", "grant", "revoke", "commit", "vacuum", "reindex", "copy",
];

static LITERALS_AND_COMMENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|/\*.*?\*/"#)
        .expect("literal pattern is valid")
});

static SQL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?s)^\s*(?:",
        r"select\b.*\bfrom\b|with\s+\w+(?:\s*\([^)]*\))?\s+as\s*\(|pragma\s+\w+|explain\b|values\s*\(",
        r"|delete\s+from\s+\w|insert\s+(?:or\s+\w+\s+)?into\s+\w|replace\s+into\s+\w",
        r"|update\s+(?:or\s+\w+\s+)?\w+\s+set\b",
        r"|(?:drop|create|alter|truncate)\s+(?:table|view|index|trigger|database|schema|temp|temporary|unique|virtual|if)\b",
        r"|attach\s|detach\s|(?:commit|vacuum)\s*(?:;|$)|merge\s+into\b|upsert\b|grant\s|revoke\s",
        r"|copy\s+\w+\s+(?:from|to)\b",
        r")",
    ))
    .expect("sql shape pattern is valid")
});

static WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z_][a-z0-9_]*").expect("word pattern is valid"));

/// Why a statement was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardRejection {
    /// Statement contains a mutation verb.
    MutationVerb { verb: String },
    /// Statement does not start with a read keyword.
    NotReadOnly { leader: String },
    /// `PRAGMA name = value`.
    PragmaAssignment,
}

impl fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardRejection::MutationVerb { verb } => {
                write!(f, "statement contains mutation verb '{}'", verb)
            }
            GuardRejection::NotReadOnly { leader } => {
                write!(f, "statement type '{}' is not read-only", leader)
            }
            GuardRejection::PragmaAssignment => write!(f, "pragma assignment is not read-only"),
        }
    }
}

/// Outcome of [`ReadOnlyGuard::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allowed,
    Rejected(GuardRejection),
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlyGuard;

impl ReadOnlyGuard {
    pub fn new() -> Self {
        Self
    }

    /// Check a statement, or a `;`-separated batch of statements.
    ///
    /// Empty input is allowed; it does nothing.
    pub fn check(&self, statement: &str) -> GuardDecision {
        let normalized = normalize(statement);
        for part in normalized.split(';') {
            if let Some(rejection) = check_single(part) {
                return GuardDecision::Rejected(rejection);
            }
        }
        GuardDecision::Allowed
    }

    /// Whether `text` plausibly is a SQL statement rather than prose. Used to
    /// pick the string literals the validator checks.
    pub fn looks_like_sql(&self, text: &str) -> bool {
        SQL_SHAPE.is_match(&normalize(text))
    }
}

fn normalize(statement: &str) -> String {
    LITERALS_AND_COMMENTS
        .replace_all(statement, " ''")
        .to_lowercase()
}

fn check_single(part: &str) -> Option<GuardRejection> {
    let tokens: Vec<&str> = WORD.find_iter(part).map(|m| m.as_str()).collect();
    let leader = *tokens.first()?;

    for (i, token) in tokens.iter().enumerate() {
        if !MUTATION_VERBS.contains(token) {
            continue;
        }
        // REPLACE is also a scalar string function.
        if *token == "replace" {
            let into_follows = tokens.get(i + 1) == Some(&"into");
            let or_precedes = i > 0 && tokens[i - 1] == "or";
            if !(into_follows || or_precedes || i == 0) {
                continue;
            }
        }
        return Some(GuardRejection::MutationVerb {
            verb: token.to_string(),
        });
    }

    if !READ_LEADERS.contains(&leader) {
        return Some(GuardRejection::NotReadOnly {
            leader: leader.to_string(),
        });
    }
    if leader == "pragma" && part.contains('=') {
        return Some(GuardRejection::PragmaAssignment);
    }
    None
}

fn python_str_set(items: &[&str]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("'{}'", s)).collect();
    format!("frozenset({{{}}})", quoted.join(", "))
}

/// Python rendering of [`ReadOnlyGuard::check`] for the execution host.
///
/// Defines `check_statement(sql) -> None | str` at the indentation of the
/// host's main function body.
pub fn python_guard_source() -> String {
    format!(
        r#"
    guard_read_leaders = {leaders}
    guard_mutation_verbs = {verbs}
    guard_literals = _re.compile(r"'(?:[^']|'')*'|\"(?:[^\"]|\"\")*\"|--[^\n]*|/\*.*?\*/", _re.S)
    guard_word = _re.compile(r"[a-z_][a-z0-9_]*")

    def check_statement(sql):
        if not isinstance(sql, str):
            return "statement is not text"
        normalized = guard_literals.sub(" ''", sql).lower()
        for part in normalized.split(";"):
            tokens = guard_word.findall(part)
            if not tokens:
                continue
            for i, token in enumerate(tokens):
                if token not in guard_mutation_verbs:
                    continue
                if token == "replace":
                    into_follows = i + 1 < len(tokens) and tokens[i + 1] == "into"
                    or_precedes = i > 0 and tokens[i - 1] == "or"
                    if not (into_follows or or_precedes or i == 0):
                        continue
                return "statement contains mutation verb '%s'" % token
            if tokens[0] not in guard_read_leaders:
                return "statement type '%s' is not read-only" % tokens[0]
            if tokens[0] == "pragma" and "=" in part:
                return "pragma assignment is not read-only"
        return None
"#,
        leaders = python_str_set(READ_LEADERS),
        verbs = python_str_set(MUTATION_VERBS),
    )
}
