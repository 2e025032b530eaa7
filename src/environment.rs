//! Environment Builder: the only environment the execution host ever sees.

use std::collections::BTreeMap;
use std::path::Path;

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Substrings that mark a variable name as credential-shaped.
const CREDENTIAL_MARKERS: &[&str] = &[
    "API_KEY",
    "APIKEY",
    "SECRET",
    "TOKEN",
    "PASSWORD",
    "PASSWD",
    "CREDENTIAL",
    "PRIVATE_KEY",
    "ACCESS_KEY",
    "SESSION_KEY",
    "AUTH",
];

/// Prefixes of cloud-provider variables.
const CREDENTIAL_PREFIXES: &[&str] = &["AWS_", "AZURE_", "GCP_", "GOOGLE_", "GCLOUD_"];

/// Whether `name` looks like it carries a credential.
pub fn is_credential_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    CREDENTIAL_MARKERS.iter().any(|m| upper.contains(m))
        || CREDENTIAL_PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Key/value environment handed to a child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Builds a fresh environment from a fixed allow-list plus operator-supplied
/// extras, with credential-shaped names always removed.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    max_threads: u32,
    extra: BTreeMap<String, String>,
}

impl EnvironmentBuilder {
    pub fn new(max_threads: u32) -> Self {
        Self {
            max_threads,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.extra
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn build(&self, workdir: &Path) -> Environment {
        let workdir = workdir.to_string_lossy().into_owned();
        let threads = self.max_threads.max(1).to_string();

        let mut vars = BTreeMap::new();
        for (key, value) in &self.extra {
            vars.insert(key.clone(), value.clone());
        }
        let fixed = [
            ("PATH", SAFE_PATH.to_string()),
            ("HOME", workdir.clone()),
            ("TMPDIR", workdir.clone()),
            ("PWD", workdir),
            ("LANG", "C.UTF-8".to_string()),
            ("LC_ALL", "C.UTF-8".to_string()),
            ("PYTHONUNBUFFERED", "1".to_string()),
            ("PYTHONIOENCODING", "utf-8".to_string()),
            ("PYTHONDONTWRITEBYTECODE", "1".to_string()),
            ("PYTHONHASHSEED", "0".to_string()),
            ("OMP_NUM_THREADS", threads.clone()),
            ("OPENBLAS_NUM_THREADS", threads.clone()),
            ("MKL_NUM_THREADS", threads),
        ];
        for (key, value) in fixed {
            vars.insert(key.to_string(), value);
        }

        vars.retain(|key, _| {
            let keep = !is_credential_name(key);
            if !keep {
                tracing::warn!("[SANDBOX] Dropped credential-shaped environment entry {}", key);
            }
            keep
        });

        Environment { vars }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workdir() -> PathBuf {
        PathBuf::from("/tmp/sbx-test")
    }

    #[test]
    fn test_fixed_entries_only() {
        let env = EnvironmentBuilder::new(2).build(&workdir());
        let keys: Vec<&str> = env.keys().collect();
        assert_eq!(
            keys,
            vec![
                "HOME",
                "LANG",
                "LC_ALL",
                "MKL_NUM_THREADS",
                "OMP_NUM_THREADS",
                "OPENBLAS_NUM_THREADS",
                "PATH",
                "PWD",
                "PYTHONDONTWRITEBYTECODE",
                "PYTHONHASHSEED",
                "PYTHONIOENCODING",
                "PYTHONUNBUFFERED",
                "TMPDIR",
            ]
        );
        assert_eq!(env.get("HOME"), Some("/tmp/sbx-test"));
        assert_eq!(env.get("PYTHONUNBUFFERED"), Some("1"));
        assert_eq!(env.get("OMP_NUM_THREADS"), Some("2"));
    }

    #[test]
    fn test_parent_environment_is_not_inherited() {
        let env = EnvironmentBuilder::new(1).build(&workdir());
        assert!(!env.contains("USER"));
        assert!(!env.contains("SHELL"));
    }

    #[test]
    fn test_credential_shaped_extras_are_dropped() {
        let env = EnvironmentBuilder::new(1)
            .with_extra([
                ("OPENAI_API_KEY", "sk-test"),
                ("AWS_ACCESS_KEY_ID", "AKIA"),
                ("GITHUB_TOKEN", "ghp"),
                ("DB_PASSWORD", "hunter2"),
                ("GOOGLE_APPLICATION_CREDENTIALS", "/k.json"),
                ("REPORT_TITLE", "Q3"),
            ])
            .build(&workdir());
        assert_eq!(env.get("REPORT_TITLE"), Some("Q3"));
        for secret in [
            "OPENAI_API_KEY",
            "AWS_ACCESS_KEY_ID",
            "GITHUB_TOKEN",
            "DB_PASSWORD",
            "GOOGLE_APPLICATION_CREDENTIALS",
        ] {
            assert!(!env.contains(secret), "{} must not be in sandbox env", secret);
        }
    }

    #[test]
    fn test_extras_cannot_override_fixed_entries() {
        let env = EnvironmentBuilder::new(1)
            .with_extra([("PATH", "/evil"), ("PYTHONHASHSEED", "random")])
            .build(&workdir());
        assert_eq!(env.get("PATH"), Some(SAFE_PATH));
        assert_eq!(env.get("PYTHONHASHSEED"), Some("0"));
    }

    #[test]
    fn test_is_credential_name() {
        assert!(is_credential_name("anthropic_api_key"));
        assert!(is_credential_name("AZURE_CLIENT_ID"));
        assert!(!is_credential_name("PYTHONUNBUFFERED"));
        assert!(!is_credential_name("LANG"));
    }
}
