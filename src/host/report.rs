use crate::request::FailureReason;
use serde::Deserialize;
use serde_json::Value;

/// Status the execution host reports for a run that reached its own exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Ok,
    CapabilityDenied,
    DataWriteRejected,
    MissingResultBinding,
    NonSerializableResult,
    RuntimeError,
    MemoryExceeded,
}

impl HostStatus {
    /// `None` for a successful run.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            HostStatus::Ok => None,
            HostStatus::CapabilityDenied => Some(FailureReason::CapabilityDenied),
            HostStatus::DataWriteRejected => Some(FailureReason::DataWriteRejected),
            HostStatus::MissingResultBinding => Some(FailureReason::MissingResultBinding),
            HostStatus::NonSerializableResult => Some(FailureReason::NonSerializableResult),
            HostStatus::RuntimeError => Some(FailureReason::RuntimeError),
            HostStatus::MemoryExceeded => Some(FailureReason::MemoryExceeded),
        }
    }
}

/// The single JSON document the execution host writes to its stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HostReport {
    pub status: HostStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
}

impl HostReport {
    /// Parse the whole of the host's stdout. Anything other than exactly one
    /// JSON document is not a report.
    pub fn parse(stdout: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(stdout).ok()?.trim();
        if text.is_empty() {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    pub fn detail(&self) -> String {
        match (&self.error, &self.capability) {
            (Some(error), _) => error.clone(),
            (None, Some(capability)) => format!("capability '{}' is not permitted", capability),
            (None, None) => format!("{:?}", self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ok_report() {
        let report =
            HostReport::parse(br#"{"status": "ok", "result": {"a": 1}, "stdout": "hi\n", "stderr": ""}"#)
                .unwrap();
        assert_eq!(report.status, HostStatus::Ok);
        assert_eq!(report.result, json!({"a": 1}));
        assert_eq!(report.stdout, "hi\n");
        assert_eq!(report.status.failure_reason(), None);
    }

    #[test]
    fn test_null_result_is_kept() {
        let report = HostReport::parse(br#"{"status": "ok", "result": null}"#).unwrap();
        assert_eq!(report.result, Value::Null);
    }

    #[test]
    fn test_denial_report() {
        let report = HostReport::parse(
            b"  {\"status\": \"capability_denied\", \"capability\": \"socket\"}\n",
        )
        .unwrap();
        assert_eq!(
            report.status.failure_reason(),
            Some(FailureReason::CapabilityDenied)
        );
        assert_eq!(report.detail(), "capability 'socket' is not permitted");
    }

    #[test]
    fn test_not_a_report() {
        assert!(HostReport::parse(b"").is_none());
        assert!(HostReport::parse(b"hello").is_none());
        assert!(HostReport::parse(br#"{"status": "ok"} {"status": "ok"}"#).is_none());
        assert!(HostReport::parse(br#"{"status": "exploded"}"#).is_none());
        assert!(HostReport::parse(&[0xff, 0xfe]).is_none());
    }
}
