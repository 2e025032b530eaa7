//! End-to-end runs against a real interpreter. Every test returns early when
//! no `python3` is on `PATH`.

use analysis_sandbox::{
    create_sandbox_with_config, AnalysisKind, EngineConfig, ExecutionRequest, FailureReason,
    Policy, PolicySet, PythonProcessBackend, SandboxManager,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn sandbox() -> Option<(SandboxManager, TempDir)> {
    let python = which::which("python3").ok()?;
    let dir = tempfile::tempdir().ok()?;
    let config = EngineConfig {
        python_path: Some(python),
        workspace_base: dir.path().join("workspaces"),
        ..EngineConfig::default()
    };
    let manager = create_sandbox_with_config(config).ok()?;
    Some((manager, dir))
}

macro_rules! sandbox_or_skip {
    () => {
        match sandbox() {
            Some(s) => s,
            None => {
                eprintln!("python3 not found; skipping");
                return;
            }
        }
    };
}

fn workspaces_left(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path().join("workspaces"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn scenario_a_sum_of_literal_list() {
    let (sandbox, dir) = sandbox_or_skip!();
    let result = sandbox
        .execute(ExecutionRequest::new(
            r#"result = {"sum": sum([1,2,3])}"#,
            "hardened",
        ))
        .await;

    assert!(result.succeeded, "{:?}", result.failure_detail);
    assert_eq!(result.result_value, Some(json!({"sum": 6})));
    assert_eq!(result.failure_reason, None);
    assert_eq!(workspaces_left(&dir), 0);
}

#[tokio::test]
async fn scenario_b_unlisted_capability_is_denied() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let result = sandbox
        .execute(ExecutionRequest::new("import os\nresult = os.getcwd()", "hardened"))
        .await;

    assert!(!result.succeeded);
    assert_eq!(result.failure_reason, Some(FailureReason::CapabilityDenied));
    assert!(result.failure_detail.unwrap().contains("'os'"));
    assert_eq!(result.result_value, None);
}

#[tokio::test]
async fn denial_cannot_be_caught() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = "try:\n    import socket\nexcept BaseException:\n    pass\nresult = 'escaped'";
    let result = sandbox.execute(ExecutionRequest::new(source, "hardened")).await;

    assert_eq!(result.failure_reason, Some(FailureReason::CapabilityDenied));
    assert_eq!(result.result_value, None);
}

#[tokio::test]
async fn operating_system_reached_through_attributes_is_denied() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let reach = "import random\no = getattr(random, '_o' + 's')\n";
    for (body, operation) in [
        ("result = o.listdir('/')", "os.listdir"),
        ("fd = o.open('/etc/hostname', 0)\nresult = o.read(fd, 64)", "open"),
        ("try:\n    o.system('true')\nexcept BaseException:\n    pass\nresult = 1", "os.system"),
    ] {
        let source = format!("{}{}", reach, body);
        let result = sandbox.execute(ExecutionRequest::new(source, "hardened")).await;
        assert_eq!(result.failure_reason, Some(FailureReason::CapabilityDenied), "{}", body);
        assert!(
            result.failure_detail.as_deref().unwrap_or("").contains(operation),
            "{:?}",
            result.failure_detail
        );
        assert_eq!(result.result_value, None);
    }
}

#[tokio::test]
async fn detached_child_cannot_outlive_the_deadline() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = r#"
import random, time
o = getattr(random, "_o" + "s")
spawn = getattr(o, "fo" + "rk")
if spawn() == 0:
    getattr(o, "set" + "sid")()
    time.sleep(20)
result = 1
"#;
    let started = Instant::now();
    let result = sandbox
        .execute(ExecutionRequest::new(source, "hardened").with_timeout_seconds(2))
        .await;

    assert!(started.elapsed() < Duration::from_secs(5), "returned after {:?}", started.elapsed());
    assert_eq!(result.failure_reason, Some(FailureReason::CapabilityDenied));
    assert!(result.failure_detail.unwrap().contains("os.fork"));
}

#[tokio::test]
async fn allowed_capabilities_resolve_with_their_internals() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = r#"
import math, statistics, decimal, datetime, collections, random
result = {
    "sqrt": math.sqrt(16),
    "mean": statistics.mean([1, 2, 3, 4]),
    "dec": str(decimal.Decimal("1.10") + decimal.Decimal("2.20")),
    "year": datetime.date(2024, 5, 1).year,
    "counts": collections.Counter("aab")["a"],
}
"#;
    let result = sandbox.execute(ExecutionRequest::new(source, "hardened")).await;

    assert!(result.succeeded, "{:?}", result.failure_detail);
    assert_eq!(
        result.result_value,
        Some(json!({"sqrt": 4.0, "mean": 2.5, "dec": "3.30", "year": 2024, "counts": 2}))
    );
}

#[tokio::test]
async fn scenario_c_runaway_loop_times_out() {
    let (sandbox, dir) = sandbox_or_skip!();
    let started = Instant::now();
    let result = sandbox
        .execute(ExecutionRequest::new("while True:\n    pass", "hardened").with_timeout_seconds(2))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.failure_reason, Some(FailureReason::Timeout));
    assert!(elapsed >= Duration::from_secs(2), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "returned after {:?}", elapsed);
    assert_eq!(workspaces_left(&dir), 0);
}

#[tokio::test]
async fn scenario_d_missing_result_binding() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let result = sandbox
        .execute(ExecutionRequest::new("total = 1 + 2", "hardened"))
        .await;

    assert!(!result.succeeded);
    assert_eq!(result.failure_reason, Some(FailureReason::MissingResultBinding));
}

#[tokio::test]
async fn scenario_e_delete_is_rejected_before_execution() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = r#"
conn = read_only_connect({"t": rows})
conn.execute("DELETE FROM t")
result = 1
"#;
    let request = ExecutionRequest::new(source, "standard").with_binding("rows", json!([{"a": 1}]));
    let result = sandbox.execute(request).await;

    assert_eq!(result.failure_reason, Some(FailureReason::DataWriteRejected));
    assert!(result.failure_detail.unwrap().contains("delete"));
    assert!(result.stdout.is_empty());
}

#[tokio::test]
async fn assembled_write_is_rejected_at_runtime() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = r#"
conn = read_only_connect({"t": rows})
verb = "DEL" + "ETE"
conn.execute(verb + " FROM t")
result = 1
"#;
    let request = ExecutionRequest::new(source, "standard").with_binding("rows", json!([{"a": 1}]));
    let result = sandbox.execute(request).await;

    assert_eq!(result.failure_reason, Some(FailureReason::DataWriteRejected));
    assert_eq!(result.result_value, None);
}

#[tokio::test]
async fn read_only_connection_answers_queries() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = r#"
conn = read_only_connect({"sales": rows})
table = conn.table(
    "SELECT region, SUM(amount) AS total FROM sales WHERE amount > ? GROUP BY region ORDER BY region",
    [1],
)
result = {"rows": table.to_list(), "columns": table.columns}
"#;
    let rows = json!([
        {"region": "east", "amount": 5},
        {"region": "west", "amount": 2},
        {"region": "east", "amount": 3},
        {"region": "west", "amount": 1}
    ]);
    let request = ExecutionRequest::new(source, "standard").with_binding("rows", rows);
    let result = sandbox.execute(request).await;

    assert!(result.succeeded, "{:?}", result.failure_detail);
    assert_eq!(
        result.result_value,
        Some(json!({
            "rows": [{"region": "east", "total": 8}, {"region": "west", "total": 2}],
            "columns": ["region", "total"]
        }))
    );
}

#[tokio::test]
async fn context_round_trips_unchanged() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let value = json!({
        "text": "quote \" backslash \\ newline \n unicode é ✓",
        "numbers": [0, -1, 2.5, 1e100],
        "flags": [true, false, null],
        "nested": {"empty": {}, "list": [[]]}
    });
    let request = ExecutionRequest::new("result = value", "hardened").with_binding("value", value.clone());
    let result = sandbox.execute(request).await;

    assert!(result.succeeded, "{:?}", result.failure_detail);
    assert_eq!(result.result_value, Some(value));
}

#[tokio::test]
async fn identical_requests_give_identical_values() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = r#"
names = {"b", "a", "c"}
result = {"order": list(names), "hash": hash("stable")}
"#;
    let first = sandbox.execute(ExecutionRequest::new(source, "hardened")).await;
    let second = sandbox.execute(ExecutionRequest::new(source, "hardened")).await;

    assert!(first.succeeded, "{:?}", first.failure_detail);
    assert_eq!(first.result_value, second.result_value);
    assert_ne!(first.request_id, second.request_id);
}

#[tokio::test]
async fn output_and_runtime_errors_are_reported() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = "print('working')\nvalue = 1 / 0\nresult = value";
    let result = sandbox.execute(ExecutionRequest::new(source, "hardened")).await;

    assert_eq!(result.failure_reason, Some(FailureReason::RuntimeError));
    assert_eq!(result.stdout, "working\n");
    let detail = result.failure_detail.unwrap();
    assert!(detail.contains("ZeroDivisionError"), "{}", detail);
    assert!(detail.contains("line 2"), "{}", detail);
}

#[tokio::test]
async fn non_finite_result_is_not_serializable() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let result = sandbox
        .execute(ExecutionRequest::new("result = float('nan')", "hardened"))
        .await;
    assert_eq!(result.failure_reason, Some(FailureReason::NonSerializableResult));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn oversized_allocation_is_memory_exceeded() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = "block = bytearray(1024 * 1024 * 1024)\nresult = len(block)";
    let result = sandbox.execute(ExecutionRequest::new(source, "hardened")).await;
    assert_eq!(result.failure_reason, Some(FailureReason::MemoryExceeded));
}

#[tokio::test]
async fn safe_data_types_are_bound() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let source = r#"
prices = SafeArray([4, 1, 3, 2])
table = SafeTable(rows)
result = {
    "median": prices.median(),
    "sorted": prices.sort().to_list(),
    "by_group": table.aggregate([{"column": "x", "func": "sum"}], by="g").to_list(),
}
"#;
    let rows = json!([{"g": "a", "x": 1}, {"g": "b", "x": 2}, {"g": "a", "x": 3}]);
    let request = ExecutionRequest::new(source, "hardened").with_binding("rows", rows);
    let result = sandbox.execute(request).await;

    assert!(result.succeeded, "{:?}", result.failure_detail);
    assert_eq!(
        result.result_value,
        Some(json!({
            "median": 2.5,
            "sorted": [1, 2, 3, 4],
            "by_group": [{"g": "a", "sum_x": 4}, {"g": "b", "sum_x": 2}]
        }))
    );
}

#[tokio::test]
async fn named_analyses_run_their_templates() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let data = json!([
        {"region": "east", "sales": 10},
        {"region": "west", "sales": 4},
        {"region": "east", "sales": 6}
    ]);

    let aggregated = sandbox
        .execute_named_analysis(
            AnalysisKind::Aggregate,
            data.clone(),
            json!({"aggregations": [{"column": "sales", "func": "sum", "alias": "total"}], "by": "region"}),
        )
        .await;
    assert!(aggregated.succeeded, "{:?}", aggregated.failure_detail);
    assert_eq!(
        aggregated.result_value,
        Some(json!([{"region": "east", "total": 16}, {"region": "west", "total": 4}]))
    );

    let filtered = sandbox
        .execute_named_analysis(
            AnalysisKind::Filter,
            data.clone(),
            json!({"column": "sales", "op": "ge", "value": 6}),
        )
        .await;
    assert_eq!(
        filtered.result_value,
        Some(json!([{"region": "east", "sales": 10}, {"region": "east", "sales": 6}]))
    );

    let validated = sandbox
        .execute_named_analysis(
            AnalysisKind::Validate,
            data,
            json!({"required_columns": ["region", "cost"]}),
        )
        .await;
    assert_eq!(
        validated.result_value,
        Some(json!({
            "valid": false,
            "row_count": 3,
            "issues": [{"column": "cost", "issue": "missing"}]
        }))
    );
}

#[tokio::test]
async fn named_analysis_rejects_bad_input() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let not_a_table = sandbox
        .execute_named_analysis(AnalysisKind::Filter, json!(42), json!({"column": "a", "value": 1}))
        .await;
    assert_eq!(not_a_table.failure_reason, Some(FailureReason::ValidationRejected));

    let unknown_param = sandbox
        .execute_named_analysis(AnalysisKind::Transform, json!([]), json!({"code": "import os"}))
        .await;
    assert_eq!(unknown_param.failure_reason, Some(FailureReason::ValidationRejected));
}

#[tokio::test]
async fn requests_run_concurrently_and_independently() {
    let (sandbox, dir) = sandbox_or_skip!();
    let request = |n: i64| {
        ExecutionRequest::new("result = n * n", "hardened").with_binding("n", json!(n))
    };
    let (a, b, c) = tokio::join!(
        sandbox.execute(request(2)),
        sandbox.execute(request(3)),
        sandbox.execute(request(4)),
    );

    let values: Vec<Value> = [a, b, c]
        .into_iter()
        .map(|r| r.result_value.unwrap_or(Value::Null))
        .collect();
    assert_eq!(values, vec![json!(4), json!(9), json!(16)]);
    assert_eq!(workspaces_left(&dir), 0);
}

const CONNECT_BOTH_WAYS: &str = r#"
import socket
outcome = {}
try:
    socket.create_connection(("localhost", 9), timeout=2).close()
    outcome["named"] = "connected"
except PermissionError:
    outcome["named"] = "denied"
except OSError:
    outcome["named"] = "attempted"
raw = socket.socket()
try:
    socket._socket.socket.connect(raw, ("127.0.0.1", 10))
    outcome["raw"] = "connected"
except PermissionError:
    outcome["raw"] = "denied"
except OSError:
    outcome["raw"] = "attempted"
raw.close()
result = outcome
"#;

#[tokio::test]
async fn network_without_targets_reaches_nothing() {
    let (sandbox, _dir) = sandbox_or_skip!();
    let result = sandbox
        .execute(ExecutionRequest::new(CONNECT_BOTH_WAYS, "permissive"))
        .await;

    assert!(result.succeeded, "{:?}", result.failure_detail);
    assert_eq!(
        result.result_value,
        Some(json!({"named": "denied", "raw": "denied"}))
    );
}

#[tokio::test]
async fn network_targets_are_the_only_reachable_addresses() {
    let Ok(python) = which::which("python3") else {
        eprintln!("python3 not found; skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let permissive = Policy::permissive();
    let outbound = Policy::builder("outbound")
        .allow(permissive.allowed_capabilities().iter().cloned())
        .internal(permissive.internal_capabilities().iter().cloned())
        .max_execution_seconds(10)
        .max_memory_mb(512)
        .network(true, ["localhost:9"])
        .build()
        .unwrap();
    let config = EngineConfig {
        workspace_base: dir.path().join("workspaces"),
        ..EngineConfig::default()
    };
    let sandbox = SandboxManager::new(
        config,
        PolicySet::builtin().with_policy(outbound),
        Arc::new(PythonProcessBackend::with_python_path(python).unwrap()),
    )
    .unwrap();

    let result = sandbox
        .execute(ExecutionRequest::new(CONNECT_BOTH_WAYS, "outbound"))
        .await;

    assert!(result.succeeded, "{:?}", result.failure_detail);
    let value = result.result_value.unwrap();
    assert_ne!(value["named"], json!("denied"), "{}", value);
    assert_eq!(value["raw"], json!("denied"));
}
