//! Named analyses: fixed code templates over caller data.
//!
//! Data and parameters are checked on the engine side, then bound into the
//! execution scope as `data` and `params`. They are never spliced into the
//! code, so the only code that runs is the template for the chosen kind.

use crate::manager::SandboxManager;
use crate::request::{ExecutionRequest, ExecutionResult, FailureReason};
use crate::safe_data::{Aggregation, Comparison, DataError, SafeTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Filter,
    Aggregate,
    Transform,
    Validate,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 4] = [
        AnalysisKind::Filter,
        AnalysisKind::Aggregate,
        AnalysisKind::Transform,
        AnalysisKind::Validate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Filter => "filter",
            AnalysisKind::Aggregate => "aggregate",
            AnalysisKind::Transform => "transform",
            AnalysisKind::Validate => "validate",
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            AnalysisKind::Filter => FILTER_TEMPLATE,
            AnalysisKind::Aggregate => AGGREGATE_TEMPLATE,
            AnalysisKind::Transform => TRANSFORM_TEMPLATE,
            AnalysisKind::Validate => VALIDATE_TEMPLATE,
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisKind {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AnalysisError::UnknownKind(s.to_string()))
    }
}

const FILTER_TEMPLATE: &str = r#"table = SafeTable(data)
result = table.where(params["column"], params["op"], params["value"]).to_list()
"#;

const AGGREGATE_TEMPLATE: &str = r#"table = SafeTable(data)
result = table.aggregate(params["aggregations"], by=params["by"]).to_list()
"#;

const TRANSFORM_TEMPLATE: &str = r#"table = SafeTable(data)
if params["sort_by"] is not None:
    table = table.sort_by(params["sort_by"], descending=params["descending"])
if params["select"] is not None:
    table = table.select(params["select"])
if params["limit"] is not None:
    table = table.limit(params["limit"])
result = table.to_list()
"#;

const VALIDATE_TEMPLATE: &str = r#"table = SafeTable(data)
columns = table.columns
issues = []
for name in params["required_columns"]:
    if name not in columns:
        issues.append({"column": name, "issue": "missing"})
for name in params["non_null"]:
    nulls = sum(1 for value in table.values(name) if value is None)
    if nulls:
        issues.append({"column": name, "issue": "null", "count": nulls})
for name in params["numeric"]:
    bad = sum(
        1
        for value in table.values(name)
        if value is not None and (isinstance(value, bool) or not isinstance(value, (int, float)))
    )
    if bad:
        issues.append({"column": name, "issue": "non_numeric", "count": bad})
result = {"valid": not issues, "row_count": len(table), "issues": issues}
"#;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("unknown analysis kind '{0}'")]
    UnknownKind(String),

    #[error("invalid data: {0}")]
    InvalidData(#[from] DataError),

    #[error("invalid parameters for {kind}: {reason}")]
    InvalidParameters { kind: AnalysisKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterParams {
    pub column: String,
    #[serde(default = "default_comparison")]
    pub op: Comparison,
    #[serde(default)]
    pub value: Value,
}

fn default_comparison() -> Comparison {
    Comparison::Eq
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateParams {
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformParams {
    pub select: Option<Vec<String>>,
    pub sort_by: Option<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidateParams {
    pub required_columns: Vec<String>,
    pub non_null: Vec<String>,
    pub numeric: Vec<String>,
}

/// Parameters after parsing, one shape per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisParams {
    Filter(FilterParams),
    Aggregate(AggregateParams),
    Transform(TransformParams),
    Validate(ValidateParams),
}

impl AnalysisParams {
    pub fn parse(kind: AnalysisKind, parameters: &Value) -> Result<Self, AnalysisError> {
        let invalid = |reason: String| AnalysisError::InvalidParameters { kind, reason };
        // Absent parameters are only meaningful where every field has a default
        let parameters = match parameters {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        let params = match kind {
            AnalysisKind::Filter => {
                let p: FilterParams =
                    serde_json::from_value(parameters).map_err(|e| invalid(e.to_string()))?;
                if p.op == Comparison::In && !p.value.is_array() {
                    return Err(invalid("'in' needs a list value".to_string()));
                }
                if p.op != Comparison::In && (p.value.is_array() || p.value.is_object()) {
                    return Err(invalid(format!("'{}' needs a scalar value", p.op.as_str())));
                }
                AnalysisParams::Filter(p)
            }
            AnalysisKind::Aggregate => {
                let p: AggregateParams =
                    serde_json::from_value(parameters).map_err(|e| invalid(e.to_string()))?;
                if p.aggregations.is_empty() {
                    return Err(invalid("at least one aggregation is required".to_string()));
                }
                for aggregation in &p.aggregations {
                    aggregation.check().map_err(|e| invalid(e.to_string()))?;
                }
                AnalysisParams::Aggregate(p)
            }
            AnalysisKind::Transform => AnalysisParams::Transform(
                serde_json::from_value(parameters).map_err(|e| invalid(e.to_string()))?,
            ),
            AnalysisKind::Validate => AnalysisParams::Validate(
                serde_json::from_value(parameters).map_err(|e| invalid(e.to_string()))?,
            ),
        };
        Ok(params)
    }

    /// Canonical form bound as `params`; every field is present.
    pub fn to_json(&self) -> Value {
        let value = match self {
            AnalysisParams::Filter(p) => serde_json::to_value(p),
            AnalysisParams::Aggregate(p) => serde_json::to_value(p),
            AnalysisParams::Transform(p) => serde_json::to_value(p),
            AnalysisParams::Validate(p) => serde_json::to_value(p),
        };
        value.unwrap_or(Value::Null)
    }
}

/// A checked named-analysis invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedAnalysis {
    kind: AnalysisKind,
    table: SafeTable,
    params: AnalysisParams,
}

impl NamedAnalysis {
    pub fn new(kind: AnalysisKind, data: &Value, parameters: &Value) -> Result<Self, AnalysisError> {
        let table = SafeTable::from_json(data)?;
        let params = AnalysisParams::parse(kind, parameters)?;
        Ok(Self {
            kind,
            table,
            params,
        })
    }

    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    pub fn table(&self) -> &SafeTable {
        &self.table
    }

    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    pub fn to_request(&self, policy_name: &str) -> ExecutionRequest {
        ExecutionRequest::new(self.kind.template(), policy_name)
            .with_binding("data", self.table.to_json())
            .with_binding("params", self.params.to_json())
    }
}

impl SandboxManager {
    /// Run the fixed template for `kind` over `data` under the implicit
    /// named-analysis policy.
    pub async fn execute_named_analysis(
        &self,
        kind: AnalysisKind,
        data: Value,
        parameters: Value,
    ) -> ExecutionResult {
        let request_id = Uuid::new_v4();
        let analysis = match NamedAnalysis::new(kind, &data, &parameters) {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!("[SANDBOX] {} named analysis rejected: {}", request_id, e);
                return ExecutionResult::failure(
                    request_id,
                    FailureReason::ValidationRejected,
                    e.to_string(),
                );
            }
        };
        let policy = self.analysis_policy();
        let request = analysis.to_request(policy.name());
        self.execute_with_policy(request_id, &request, &policy).await
    }
}
