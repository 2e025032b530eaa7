//! Execution Policy System
//!
//! A [`Policy`] is an immutable trust tier: which capabilities (top-level
//! Python module names) code may resolve, and the resource ceilings its host
//! process runs under. Policies are grouped in a named, versioned
//! [`PolicySet`] which is handed to the [`crate::SandboxManager`] at
//! construction and never mutated afterwards.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  PolicySet (version N)                                       │
//! │  - hardened / standard / permissive (+ file-defined tiers)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Policy                                                      │
//! │  - allowed capabilities   (resolvable from caller code)      │
//! │  - internal capabilities  (resolvable only from inside an    │
//! │                            already-loaded module)            │
//! │  - time / memory / output ceilings, network targets          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Absolute wall-clock ceiling for any execution, regardless of policy.
pub const MAX_EXECUTION_SECONDS_CEILING: u64 = 120;

/// Version of the built-in capability tables.
pub const BUILTIN_POLICY_VERSION: u32 = 1;

/// Capabilities that grant embedded-database access.
pub const DATABASE_CAPABILITIES: &[&str] = &["sqlite3"];

/// Capabilities that reach the network. Only valid with `allow_network`.
pub const NETWORK_CAPABILITIES: &[&str] = &[
    "socket",
    "_socket",
    "ssl",
    "_ssl",
    "http",
    "urllib",
    "urllib3",
    "requests",
    "ftplib",
    "smtplib",
    "poplib",
    "imaplib",
    "telnetlib",
    "asyncio",
    "selectors",
    "select",
];

// ============================================================================
// CAPABILITY TABLES
// ============================================================================

const HARDENED_ALLOWED: &[&str] = &[
    "math",
    "cmath",
    "statistics",
    "json",
    "datetime",
    "calendar",
    "time",
    "collections",
    "itertools",
    "functools",
    "operator",
    "re",
    "decimal",
    "fractions",
    "numbers",
    "random",
    "string",
    "textwrap",
    "bisect",
    "heapq",
    "enum",
    "copy",
    "_strptime",
];

/// Modules the hardened tier's capabilities pull in transitively.
const HARDENED_INTERNAL: &[&str] = &[
    "_abc",
    "_bisect",
    "_collections",
    "_collections_abc",
    "_contextvars",
    "_datetime",
    "_decimal",
    "_functools",
    "_heapq",
    "_io",
    "_json",
    "_locale",
    "_operator",
    "_pydecimal",
    "_pydatetime",
    "_random",
    "_sha2",
    "_sha256",
    "_sha512",
    "_blake2",
    "_hashlib",
    "_sre",
    "_stat",
    "_statistics",
    "_string",
    "_struct",
    "_thread",
    "_warnings",
    "_weakref",
    "_weakrefset",
    "abc",
    "binascii",
    "builtins",
    "codecs",
    "contextvars",
    "copyreg",
    "encodings",
    "genericpath",
    "hashlib",
    "keyword",
    "locale",
    // Looked up and expected to be missing by `copy`.
    "org",
    "os",
    "posixpath",
    "reprlib",
    "sre_compile",
    "sre_constants",
    "sre_parse",
    "stat",
    "struct",
    "sys",
    "types",
    "warnings",
    "weakref",
];

const STANDARD_EXTRA_ALLOWED: &[&str] = &[
    "sqlite3",
    "csv",
    "base64",
    "hashlib",
    "uuid",
    "zlib",
    "unicodedata",
    "array",
    "struct",
    "binascii",
    "typing",
    "dataclasses",
];

const STANDARD_EXTRA_INTERNAL: &[&str] = &[
    "_sqlite3",
    "_csv",
    "_uuid",
    "_md5",
    "_sha1",
    "_sha3",
    "ast",
    "_ast",
    "dis",
    "opcode",
    "_opcode",
    "inspect",
    "importlib",
    "linecache",
    "tokenize",
    "token",
    "io",
    "_io",
    "platform",
    "contextlib",
    "annotationlib",
];

const PERMISSIVE_EXTRA_ALLOWED: &[&str] = &[
    "numpy",
    "pandas",
    "scipy",
    "statsmodels",
    "sklearn",
    "duckdb",
    "pyarrow",
    "dateutil",
    "pytz",
    "tzdata",
    "io",
    "gzip",
    "bz2",
    "lzma",
    "zipfile",
    "socket",
    "ssl",
    "urllib",
    "http",
];

const PERMISSIVE_EXTRA_INTERNAL: &[&str] = &[
    "_bz2",
    "_lzma",
    "_compression",
    "_ctypes",
    "ctypes",
    "_decimal",
    "_pickle",
    "pickle",
    "_compat_pickle",
    "_posixsubprocess",
    "_socket",
    "_ssl",
    "atexit",
    "concurrent",
    "email",
    "errno",
    "fnmatch",
    "gc",
    "glob",
    "logging",
    "mmap",
    "ntpath",
    "pathlib",
    "pprint",
    "queue",
    "_queue",
    "select",
    "selectors",
    "shutil",
    "signal",
    "_signal",
    "six",
    "sysconfig",
    "tempfile",
    "threading",
    "traceback",
    "unittest",
    "_multiprocessing",
    "numexpr",
    "bottleneck",
    "joblib",
    "threadpoolctl",
    "packaging",
    "cython_runtime",
];

/// Capabilities available to the fixed named-analysis templates.
const NAMED_ANALYSIS_ALLOWED: &[&str] = &["math", "statistics"];

// ============================================================================
// POLICY
// ============================================================================

/// An immutable trust tier.
///
/// Construct through [`Policy::builder`] or one of the named tiers; there are
/// no setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    name: String,
    allowed_capabilities: BTreeSet<String>,
    internal_capabilities: BTreeSet<String>,
    max_execution_seconds: u64,
    max_memory_mb: u64,
    max_output_bytes: usize,
    allow_network: bool,
    allowed_network_targets: BTreeSet<String>,
}

impl Policy {
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder::new(name)
    }

    /// Smallest tier: pure computation over injected context.
    pub fn hardened() -> Self {
        Self::builtin(
            Policy::builder("hardened")
                .allow(HARDENED_ALLOWED.iter().copied())
                .internal(HARDENED_INTERNAL.iter().copied())
                .max_execution_seconds(30)
                .max_memory_mb(256)
                .max_output_bytes(64 * 1024),
        )
    }

    /// Hardened plus read-only SQLite access and common encoders.
    pub fn standard() -> Self {
        Self::builtin(
            Policy::builder("standard")
                .allow(HARDENED_ALLOWED.iter().copied())
                .allow(STANDARD_EXTRA_ALLOWED.iter().copied())
                .internal(HARDENED_INTERNAL.iter().copied())
                .internal(STANDARD_EXTRA_INTERNAL.iter().copied())
                .max_execution_seconds(60)
                .max_memory_mb(512)
                .max_output_bytes(256 * 1024),
        )
    }

    /// Standard plus the numeric stack. Network capabilities are resolvable
    /// but no target is reachable.
    pub fn permissive() -> Self {
        Self::builtin(
            Policy::builder("permissive")
                .allow(HARDENED_ALLOWED.iter().copied())
                .allow(STANDARD_EXTRA_ALLOWED.iter().copied())
                .allow(PERMISSIVE_EXTRA_ALLOWED.iter().copied())
                .internal(HARDENED_INTERNAL.iter().copied())
                .internal(STANDARD_EXTRA_INTERNAL.iter().copied())
                .internal(PERMISSIVE_EXTRA_INTERNAL.iter().copied())
                .max_execution_seconds(MAX_EXECUTION_SECONDS_CEILING)
                .max_memory_mb(2048)
                .max_output_bytes(1024 * 1024)
                .network(true, Vec::<String>::new()),
        )
    }

    /// Implicit tier for [`crate::analysis`] templates.
    pub fn named_analysis() -> Self {
        Self::builtin(
            Policy::builder("named_analysis")
                .allow(NAMED_ANALYSIS_ALLOWED.iter().copied())
                .internal(HARDENED_ALLOWED.iter().copied())
                .internal(HARDENED_INTERNAL.iter().copied())
                .max_execution_seconds(30)
                .max_memory_mb(256)
                .max_output_bytes(64 * 1024),
        )
    }

    // Built-in tables are static and covered by tests.
    fn builtin(builder: PolicyBuilder) -> Self {
        match builder.build() {
            Ok(policy) => policy,
            Err(e) => unreachable!("built-in policy is invalid: {}", e),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allowed_capabilities(&self) -> &BTreeSet<String> {
        &self.allowed_capabilities
    }

    pub fn internal_capabilities(&self) -> &BTreeSet<String> {
        &self.internal_capabilities
    }

    pub fn max_execution_seconds(&self) -> u64 {
        self.max_execution_seconds
    }

    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    pub fn allow_network(&self) -> bool {
        self.allow_network
    }

    pub fn allowed_network_targets(&self) -> &BTreeSet<String> {
        &self.allowed_network_targets
    }

    /// Whether code under this policy may import an embedded database, which
    /// puts the Read-Only Data Guard in force.
    pub fn database_access(&self) -> bool {
        DATABASE_CAPABILITIES
            .iter()
            .any(|cap| self.allowed_capabilities.contains(*cap))
    }

    /// Check a module name requested from caller code.
    pub fn allows(&self, module: &str) -> bool {
        self.allowed_capabilities.contains(root_capability(module))
    }

    /// Check a module name requested from inside an already-loaded module.
    pub fn allows_transitively(&self, module: &str) -> bool {
        let root = root_capability(module);
        self.allowed_capabilities.contains(root) || self.internal_capabilities.contains(root)
    }

    /// Clamp a caller-requested timeout to `[1, max_execution_seconds]`.
    /// `None` selects the policy maximum.
    pub fn clamp_timeout(&self, requested: Option<u64>) -> Duration {
        let secs = requested
            .unwrap_or(self.max_execution_seconds)
            .clamp(1, self.max_execution_seconds);
        Duration::from_secs(secs)
    }
}

/// Top-level segment of a dotted module name.
pub fn root_capability(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn is_network_target(target: &str) -> bool {
    match target.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Policy`]. Validation happens once, in [`PolicyBuilder::build`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    name: String,
    allowed: BTreeSet<String>,
    internal: BTreeSet<String>,
    max_execution_seconds: u64,
    max_memory_mb: u64,
    max_output_bytes: usize,
    allow_network: bool,
    network_targets: BTreeSet<String>,
}

impl PolicyBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: BTreeSet::new(),
            internal: BTreeSet::new(),
            max_execution_seconds: 30,
            max_memory_mb: 512,
            max_output_bytes: 64 * 1024,
            allow_network: false,
            network_targets: BTreeSet::new(),
        }
    }

    pub fn allow<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn internal<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.internal.extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn max_execution_seconds(mut self, secs: u64) -> Self {
        self.max_execution_seconds = secs;
        self
    }

    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn network<I, S>(mut self, allow: bool, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_network = allow;
        self.network_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<Policy> {
        let invalid = |reason: String| SandboxError::InvalidPolicy {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("policy name is empty".to_string()));
        }
        if self.max_execution_seconds == 0 {
            return Err(invalid("max_execution_seconds must be positive".to_string()));
        }
        if self.max_memory_mb == 0 {
            return Err(invalid("max_memory_mb must be positive".to_string()));
        }
        if self.max_output_bytes == 0 {
            return Err(invalid("max_output_bytes must be positive".to_string()));
        }
        for cap in self.allowed.iter().chain(self.internal.iter()) {
            if !is_identifier(cap) {
                return Err(invalid(format!(
                    "capability '{}' is not a top-level module name",
                    cap
                )));
            }
        }
        if !self.allow_network {
            if let Some(cap) = self
                .allowed
                .iter()
                .chain(self.internal.iter())
                .find(|cap| NETWORK_CAPABILITIES.contains(&cap.as_str()))
            {
                return Err(invalid(format!(
                    "network capability '{}' requires allow_network",
                    cap
                )));
            }
            if !self.network_targets.is_empty() {
                return Err(invalid(
                    "network targets listed but allow_network is false".to_string(),
                ));
            }
        }
        if let Some(target) = self.network_targets.iter().find(|t| !is_network_target(t)) {
            return Err(invalid(format!(
                "network target '{}' is not host:port",
                target
            )));
        }

        let max_execution_seconds = if self.max_execution_seconds > MAX_EXECUTION_SECONDS_CEILING {
            tracing::warn!(
                "[SANDBOX] Policy '{}' asks for {}s, clamped to {}s",
                self.name,
                self.max_execution_seconds,
                MAX_EXECUTION_SECONDS_CEILING
            );
            MAX_EXECUTION_SECONDS_CEILING
        } else {
            self.max_execution_seconds
        };

        Ok(Policy {
            name: self.name,
            allowed_capabilities: self.allowed,
            internal_capabilities: self.internal,
            max_execution_seconds,
            max_memory_mb: self.max_memory_mb,
            max_output_bytes: self.max_output_bytes,
            allow_network: self.allow_network,
            allowed_network_targets: self
                .network_targets
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
        })
    }
}

// ============================================================================
// POLICY FILES
// ============================================================================

/// Serialized form of a policy, as found in policy files.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDefinition {
    pub name: String,
    pub allowed_capabilities: Vec<String>,
    #[serde(default)]
    pub internal_capabilities: Vec<String>,
    pub max_execution_seconds: u64,
    pub max_memory_mb: u64,
    #[serde(default = "default_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub allowed_network_targets: Vec<String>,
}

fn default_output_bytes() -> usize {
    64 * 1024
}

impl PolicyDefinition {
    pub fn into_policy(self) -> Result<Policy> {
        Policy::builder(self.name)
            .allow(self.allowed_capabilities)
            .internal(self.internal_capabilities)
            .max_execution_seconds(self.max_execution_seconds)
            .max_memory_mb(self.max_memory_mb)
            .max_output_bytes(self.max_output_bytes)
            .network(self.allow_network, self.allowed_network_targets)
            .build()
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    version: u32,
    policies: Vec<PolicyDefinition>,
}

// ============================================================================
// POLICY SET
// ============================================================================

/// Named, versioned collection of policies.
#[derive(Debug, Clone)]
pub struct PolicySet {
    version: u32,
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicySet {
    pub fn empty(version: u32) -> Self {
        Self {
            version,
            policies: HashMap::new(),
        }
    }

    /// The `hardened`, `standard` and `permissive` tiers.
    pub fn builtin() -> Self {
        Self::empty(BUILTIN_POLICY_VERSION)
            .with_policy(Policy::hardened())
            .with_policy(Policy::standard())
            .with_policy(Policy::permissive())
    }

    /// Add or replace a policy, producing a new set.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies
            .insert(policy.name().to_string(), Arc::new(policy));
        self
    }

    /// Built-in tiers overlaid with the policies from a JSON policy file.
    ///
    /// The file's `version` becomes the set's version.
    pub fn load_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: PolicyFile = serde_json::from_str(&content)?;
        let mut set = Self::builtin();
        set.version = file.version;
        for definition in file.policies {
            set = set.with_policy(definition.into_policy()?);
        }
        tracing::info!(
            "[SANDBOX] Loaded policy file {:?} (version {}, {} policies)",
            path,
            set.version,
            set.policies.len()
        );
        Ok(set)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<Policy>> {
        self.get(name)
            .ok_or_else(|| SandboxError::UnknownPolicy(name.to_string()))
    }

    /// Policy names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.values()
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tiers_are_valid_and_nested() {
        let hardened = Policy::hardened();
        let standard = Policy::standard();
        let permissive = Policy::permissive();

        assert!(hardened
            .allowed_capabilities()
            .is_subset(standard.allowed_capabilities()));
        assert!(standard
            .allowed_capabilities()
            .is_subset(permissive.allowed_capabilities()));
        assert!(!hardened.database_access());
        assert!(standard.database_access());
        assert!(!standard.allow_network());
        assert!(permissive.allow_network());
        assert!(permissive.allowed_network_targets().is_empty());
    }

    #[test]
    fn test_allows_checks_top_level_segment() {
        let policy = Policy::hardened();
        assert!(policy.allows("collections.abc"));
        assert!(policy.allows("json"));
        assert!(!policy.allows("os"));
        assert!(!policy.allows("os.path"));
        assert!(!policy.allows("subprocess"));
        assert!(policy.allows_transitively("os"));
        assert!(!policy.allows_transitively("subprocess"));
    }

    #[test]
    fn test_execution_ceiling_is_absolute() {
        let policy = Policy::builder("greedy")
            .allow(["math"])
            .max_execution_seconds(10_000)
            .build()
            .unwrap();
        assert_eq!(policy.max_execution_seconds(), MAX_EXECUTION_SECONDS_CEILING);
    }

    #[test]
    fn test_clamp_timeout() {
        let policy = Policy::hardened();
        assert_eq!(policy.clamp_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(policy.clamp_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(policy.clamp_timeout(Some(999)), Duration::from_secs(30));
        assert_eq!(policy.clamp_timeout(None), Duration::from_secs(30));
    }

    #[test]
    fn test_builder_rejects_invalid_definitions() {
        assert!(Policy::builder("").allow(["math"]).build().is_err());
        assert!(Policy::builder("x").max_memory_mb(0).build().is_err());
        assert!(Policy::builder("x").allow(["*"]).build().is_err());
        assert!(Policy::builder("x").allow(["numpy.linalg"]).build().is_err());
        assert!(Policy::builder("x").allow(["socket"]).build().is_err());
        assert!(Policy::builder("x")
            .network(false, ["example.com:443"])
            .build()
            .is_err());
        assert!(Policy::builder("x")
            .network(true, ["example.com"])
            .build()
            .is_err());

        let ok = Policy::builder("x")
            .allow(["socket"])
            .network(true, ["Example.COM:443"])
            .build()
            .unwrap();
        assert!(ok.allowed_network_targets().contains("example.com:443"));
    }

    #[test]
    fn test_policy_set_lookup_and_override() {
        let set = PolicySet::builtin();
        assert_eq!(set.version(), BUILTIN_POLICY_VERSION);
        assert_eq!(set.names(), vec!["hardened", "permissive", "standard"]);
        assert!(set.get("hardened").is_some());
        assert!(matches!(
            set.require("nope"),
            Err(SandboxError::UnknownPolicy(_))
        ));

        let custom = Policy::builder("hardened")
            .allow(["math"])
            .build()
            .unwrap();
        let set = set.with_policy(custom);
        assert_eq!(set.get("hardened").unwrap().allowed_capabilities().len(), 1);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"{
                "version": 7,
                "policies": [
                    {
                        "name": "reporting",
                        "allowed_capabilities": ["math", "statistics"],
                        "max_execution_seconds": 15,
                        "max_memory_mb": 128
                    }
                ]
            }"#,
        )
        .unwrap();

        let set = PolicySet::load_json_file(&path).unwrap();
        assert_eq!(set.version(), 7);
        let reporting = set.get("reporting").unwrap();
        assert_eq!(reporting.max_execution_seconds(), 15);
        assert!(reporting.allows("statistics"));
        assert!(set.get("hardened").is_some());
    }
}
