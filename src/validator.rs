//! Static pre-execution scan of submitted source.
//!
//! This is a fast first line of defense, not a parse-level guarantee. The
//! capability gate and its audit hook inside the execution host are the
//! enforcement boundary.

use crate::guard::{GuardDecision, ReadOnlyGuard};
use crate::policy::Policy;
use crate::request::FailureReason;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    DynamicEvaluation,
    IntrospectionEscape,
    ProcessSpawn,
    FileAccess,
    DataWrite,
}

impl PatternCategory {
    pub fn description(&self) -> &'static str {
        match self {
            PatternCategory::DynamicEvaluation => "dynamic evaluation",
            PatternCategory::IntrospectionEscape => "introspection escape",
            PatternCategory::ProcessSpawn => "process spawning",
            PatternCategory::FileAccess => "raw file access",
            PatternCategory::DataWrite => "data write",
        }
    }
}

struct ForbiddenPattern {
    label: &'static str,
    category: PatternCategory,
    regex: Regex,
}

fn pattern(label: &'static str, category: PatternCategory, re: &str) -> ForbiddenPattern {
    ForbiddenPattern {
        label,
        category,
        regex: Regex::new(re).expect("forbidden pattern is valid"),
    }
}

// A bare call is one not preceded by `.` or an identifier character, so
// `re.compile(` and `conn.execute(` stay legal.
static CODE_PATTERNS: Lazy<Vec<ForbiddenPattern>> = Lazy::new(|| {
    use PatternCategory::*;
    vec![
        pattern("eval(", DynamicEvaluation, r"(?m)(?:^|[^.\w])eval\s*\("),
        pattern("exec(", DynamicEvaluation, r"(?m)(?:^|[^.\w])exec\s*\("),
        pattern("compile(", DynamicEvaluation, r"(?m)(?:^|[^.\w])compile\s*\("),
        pattern("__import__", DynamicEvaluation, r"__import__"),
        pattern("importlib", DynamicEvaluation, r"\bimportlib\b"),
        pattern("__builtins__", IntrospectionEscape, r"__builtins__"),
        pattern("__globals__", IntrospectionEscape, r"__globals__"),
        pattern("__subclasses__", IntrospectionEscape, r"__subclasses__"),
        pattern("__closure__", IntrospectionEscape, r"__closure__"),
        pattern("__code__", IntrospectionEscape, r"__code__"),
        pattern("__bases__", IntrospectionEscape, r"__bases__"),
        pattern("__mro__", IntrospectionEscape, r"__mro__"),
        pattern("f_globals", IntrospectionEscape, r"\bf_(?:globals|locals|back|builtins)\b"),
        pattern("gi_frame", IntrospectionEscape, r"\b(?:gi|cr|tb)_frame\b"),
        pattern("._os", IntrospectionEscape, r"\.\s*_os\b"),
        pattern("subprocess", ProcessSpawn, r"subprocess"),
        pattern("os.system", ProcessSpawn, r"(?:\b|_)os\s*\.\s*system\b"),
        pattern("os.popen", ProcessSpawn, r"(?:\b|_)os\s*\.\s*popen\b"),
        pattern("os.spawn*", ProcessSpawn, r"(?:\b|_)os\s*\.\s*spawn\w*"),
        pattern("os.exec*", ProcessSpawn, r"(?:\b|_)os\s*\.\s*exec\w*"),
        pattern("os.fork", ProcessSpawn, r"(?:\b|_)os\s*\.\s*fork\w*"),
        pattern("fork(", ProcessSpawn, r"\bfork(?:pty)?\s*\("),
        pattern("setsid(", ProcessSpawn, r"\b(?:setsid|setpgid|setpgrp)\s*\("),
        pattern("pty.spawn", ProcessSpawn, r"\bpty\s*\.\s*spawn\b"),
        pattern("Popen", ProcessSpawn, r"\bPopen\b"),
        pattern("open(", FileAccess, r"(?m)(?:^|[^.\w])open\s*\("),
        pattern("io.open", FileAccess, r"(?:\b|_)io\s*\.\s*open\b"),
        pattern("os.open", FileAccess, r"(?:\b|_)os\s*\.\s*open\b"),
        pattern("pathlib", FileAccess, r"\bpathlib\b"),
        pattern(".write_text(", FileAccess, r"\.write_text\s*\("),
        pattern(".write_bytes(", FileAccess, r"\.write_bytes\s*\("),
    ]
});

static DATA_WRITE_PATTERNS: Lazy<Vec<ForbiddenPattern>> = Lazy::new(|| {
    use PatternCategory::DataWrite;
    vec![
        pattern(".commit(", DataWrite, r"\.commit\s*\("),
        pattern(".executemany(", DataWrite, r"\.executemany\s*\("),
        pattern(".executescript(", DataWrite, r"\.executescript\s*\("),
    ]
});

static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)[rRuUbBfF]{0,2}(?:"""(.*?)"""|'''(.*?)'''|"((?:[^"\\\n]|\\.)*)"|'((?:[^'\\\n]|\\.)*)')"#)
        .expect("string literal pattern is valid")
});

/// Why a source was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub category: PatternCategory,
    /// Label of the forbidden form, e.g. `eval(`.
    pub pattern: String,
    /// The text that matched.
    pub matched: String,
    /// 1-based line of the match.
    pub line: usize,
}

impl Rejection {
    pub fn failure_reason(&self) -> FailureReason {
        match self.category {
            PatternCategory::DataWrite => FailureReason::DataWriteRejected,
            _ => FailureReason::ValidationRejected,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "forbidden pattern `{}` ({}) at line {}: `{}`",
            self.pattern,
            self.category.description(),
            self.line,
            self.matched
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    Rejected(Rejection),
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationOutcome::Ok)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CodeValidator {
    guard: ReadOnlyGuard,
}

impl CodeValidator {
    pub fn new() -> Self {
        Self {
            guard: ReadOnlyGuard::new(),
        }
    }

    /// Scan `source` against the forbidden forms. Data-write forms only apply
    /// when `policy` grants database access.
    pub fn validate(&self, source: &str, policy: &Policy) -> ValidationOutcome {
        if let Some(rejection) = first_match(source, &CODE_PATTERNS) {
            return ValidationOutcome::Rejected(rejection);
        }
        if policy.database_access() {
            if let Some(rejection) = first_match(source, &DATA_WRITE_PATTERNS) {
                return ValidationOutcome::Rejected(rejection);
            }
            if let Some(rejection) = self.check_sql_literals(source) {
                return ValidationOutcome::Rejected(rejection);
            }
        }
        ValidationOutcome::Ok
    }

    fn check_sql_literals(&self, source: &str) -> Option<Rejection> {
        for caps in STRING_LITERAL.captures_iter(source) {
            let Some(body) = (1..=4).find_map(|i| caps.get(i)) else {
                continue;
            };
            let text = body
                .as_str()
                .replace("\\n", " ")
                .replace("\\t", " ")
                .replace("\\r", " ");
            if !self.guard.looks_like_sql(&text) {
                continue;
            }
            if let GuardDecision::Rejected(reason) = self.guard.check(&text) {
                return Some(Rejection {
                    category: PatternCategory::DataWrite,
                    pattern: reason.to_string(),
                    matched: body.as_str().trim().to_string(),
                    line: line_of(source, body.start()),
                });
            }
        }
        None
    }
}

fn first_match(source: &str, patterns: &[ForbiddenPattern]) -> Option<Rejection> {
    patterns
        .iter()
        .filter_map(|p| p.regex.find(source).map(|m| (p, m)))
        .min_by_key(|(_, m)| m.start())
        .map(|(p, m)| {
            let matched = m
                .as_str()
                .trim_start_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'));
            Rejection {
                category: p.category,
                pattern: p.label.to_string(),
                matched: matched.to_string(),
                line: line_of(source, m.start() + (m.as_str().len() - matched.len())),
            }
        })
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection(source: &str, policy: &Policy) -> Rejection {
        match CodeValidator::new().validate(source, policy) {
            ValidationOutcome::Rejected(r) => r,
            ValidationOutcome::Ok => panic!("expected rejection for {:?}", source),
        }
    }

    #[test]
    fn test_plain_analysis_code_passes() {
        let policy = Policy::hardened();
        let validator = CodeValidator::new();
        for source in [
            "result = {'sum': sum([1, 2, 3])}",
            "import re\npattern = re.compile(r'\\d+')\nresult = pattern.findall('a1b22')",
            "table = SafeTable(rows)\nresult = table.where('x', 'gt', 1).to_list()",
            "evaluation = 3\nresult = evaluation",
            "def reopen(x):\n    return x\nresult = reopen(1)",
        ] {
            assert!(validator.validate(source, &policy).is_ok(), "{}", source);
        }
    }

    #[test]
    fn test_dynamic_evaluation_rejected() {
        let policy = Policy::hardened();
        let r = rejection("x = 1\ny = eval ('2+2')", &policy);
        assert_eq!(r.category, PatternCategory::DynamicEvaluation);
        assert_eq!(r.pattern, "eval(");
        assert_eq!(r.line, 2);
        assert_eq!(r.matched, "eval (");

        assert_eq!(rejection("exec('x=1')", &policy).pattern, "exec(");
        assert_eq!(rejection("m = __import__('os')", &policy).pattern, "__import__");
        assert_eq!(
            rejection("().__class__.__bases__[0].__subclasses__()", &policy).category,
            PatternCategory::IntrospectionEscape
        );
    }

    #[test]
    fn test_process_and_file_access_rejected() {
        let policy = Policy::permissive();
        assert_eq!(
            rejection("import subprocess", &policy).category,
            PatternCategory::ProcessSpawn
        );
        assert_eq!(rejection("os.system('ls')", &policy).pattern, "os.system");
        assert_eq!(rejection("os.execv('/bin/sh', [])", &policy).pattern, "os.exec*");
        assert_eq!(
            rejection("f = open('/etc/passwd')", &policy).category,
            PatternCategory::FileAccess
        );
        assert_eq!(rejection("from pathlib import Path", &policy).pattern, "pathlib");
    }

    #[test]
    fn test_os_reached_through_module_attributes_rejected() {
        let policy = Policy::hardened();
        let r = rejection(
            "import random\nfd = random._os.open('/etc/hostname', 0)",
            &policy,
        );
        assert_eq!(r.pattern, "._os");
        assert_eq!(r.line, 2);

        assert_eq!(rejection("_os.system('id')", &policy).pattern, "os.system");
        assert_eq!(rejection("_os.fork()", &policy).pattern, "os.fork");
        assert_eq!(rejection("o = m\nif o.fork() == 0:\n    pass", &policy).pattern, "fork(");
        assert_eq!(rejection("o.setsid()", &policy).pattern, "setsid(");
        assert_eq!(
            rejection("import _posixsubprocess", &policy).category,
            PatternCategory::ProcessSpawn
        );
        // Names that merely end in "os" are not `os`
        assert!(CodeValidator::new()
            .validate("photos = [1]\nresult = photos.count(1)", &policy)
            .is_ok());
    }

    #[test]
    fn test_earliest_match_is_reported() {
        let r = rejection("open('x')\neval('1')", &Policy::hardened());
        assert_eq!(r.pattern, "open(");
        assert_eq!(r.line, 1);
    }

    #[test]
    fn test_sql_literals_checked_only_with_database_access() {
        let source = "conn = read_only_connect()\nrows = conn.execute(\"DELETE FROM t\")";
        assert!(CodeValidator::new()
            .validate(source, &Policy::hardened())
            .is_ok());

        let r = rejection(source, &Policy::standard());
        assert_eq!(r.category, PatternCategory::DataWrite);
        assert_eq!(r.failure_reason(), FailureReason::DataWriteRejected);
        assert_eq!(r.matched, "DELETE FROM t");
        assert_eq!(r.line, 2);
    }

    #[test]
    fn test_sql_reads_and_prose_pass() {
        let policy = Policy::standard();
        let validator = CodeValidator::new();
        for source in [
            "rows = conn.execute('SELECT * FROM t WHERE a = 1').fetchall()",
            "rows = conn.table('''\n    select name, replace(city, 'x', 'y')\n    from people\n''')",
            "note = 'Delete the old rows later'",
            "msg = \"update the chart\"",
        ] {
            assert!(validator.validate(source, &policy).is_ok(), "{}", source);
        }
    }

    #[test]
    fn test_write_calls_rejected_with_database_access() {
        let policy = Policy::standard();
        assert_eq!(rejection("conn.commit()", &policy).pattern, ".commit(");
        assert_eq!(
            rejection("conn.executemany('x', [])", &policy).failure_reason(),
            FailureReason::DataWriteRejected
        );
        assert_eq!(
            rejection("conn.execute('drop table t')", &policy).pattern,
            "statement contains mutation verb 'drop'"
        );
    }
}
