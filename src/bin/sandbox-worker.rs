use analysis_sandbox::{
    create_sandbox_with_config, AnalysisKind, EngineConfig, ExecutionRequest, SandboxManager,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Environment first, then `--python-path` / `--policy-file` /
/// `--workspace-dir` arguments on top.
fn config_from_env_and_args() -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::from_env()?;
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).map(PathBuf::from);
        match (args[i].as_str(), value) {
            ("--python-path", Some(v)) => {
                config.python_path = Some(v);
                i += 2;
            }
            ("--policy-file", Some(v)) => {
                config.policy_file = Some(v);
                i += 2;
            }
            ("--workspace-dir", Some(v)) => {
                config.workspace_base = v;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sandbox_worker=info,analysis_sandbox=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = config_from_env_and_args()?;
    let manager = create_sandbox_with_config(config)?;
    let info = manager.backend_info();
    tracing::info!(
        "sandbox-worker starting (backend={}, interpreter={:?})",
        info.name,
        info.interpreter
    );

    let manager = Arc::new(manager);
    serve(manager.clone(), BufReader::new(io::stdin()), io::stdout()).await?;
    manager.shutdown();
    Ok(())
}

/// Read request lines until EOF, `shutdown` or `exit`. Each request runs on
/// its own task, so the manager's concurrency bound is what limits parallel
/// executions. Responses are written one line at a time in completion order.
async fn serve<R, W>(manager: Arc<SandboxManager>, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let (responses, mut pending) = mpsc::unbounded_channel::<Value>();
    let mut in_flight = JoinSet::new();
    let mut reading = true;

    loop {
        tokio::select! {
            Some(response) = pending.recv() => write_line(&mut output, &response).await?,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("request task failed: {}", e);
                }
            }
            line = lines.next_line(), if reading => match line? {
                None => reading = false,
                Some(line) => {
                    if let Some(msg) = parse_line(&line) {
                        reading = !stops_worker(&msg);
                        let manager = manager.clone();
                        let responses = responses.clone();
                        in_flight.spawn(async move {
                            if let Some(response) = handle_message(&manager, msg).await {
                                let _ = responses.send(response);
                            }
                        });
                    }
                }
            },
        }
        if !reading && in_flight.is_empty() {
            break;
        }
    }

    while let Ok(response) = pending.try_recv() {
        write_line(&mut output, &response).await?;
    }
    Ok(())
}

fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("invalid request line: {} | err={}", line, e);
            None
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, response: &Value) -> anyhow::Result<()> {
    let s = serde_json::to_string(response)?;
    output.write_all(s.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// `shutdown` requests and the `exit` notification end the read loop.
fn stops_worker(msg: &Value) -> bool {
    let method = msg.get("method").and_then(|m| m.as_str());
    matches!(
        (method, msg.get("id")),
        (Some("shutdown"), Some(_)) | (Some("exit"), None)
    )
}

/// Returns the response line, if any. Notifications get none.
async fn handle_message(manager: &SandboxManager, msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned()?;
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "initialize" => Ok(json!({
            "serverInfo": {
                "name": "sandbox-worker",
                "version": env!("CARGO_PKG_VERSION")
            },
            "methods": ["execute", "execute_named_analysis", "policies/list", "shutdown"]
        })),
        "execute" => execute(manager, &params).await,
        "execute_named_analysis" => execute_named_analysis(manager, &params).await,
        "policies/list" => Ok(policies_list(manager)),
        "shutdown" => Ok(json!({})),
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    Some(match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    })
}

fn invalid_params(message: impl Into<String>) -> Value {
    json!({ "code": -32602, "message": message.into() })
}

async fn execute(manager: &SandboxManager, params: &Value) -> Result<Value, Value> {
    let request: ExecutionRequest =
        serde_json::from_value(params.clone()).map_err(|e| invalid_params(e.to_string()))?;
    tracing::info!(
        "execute: policy={} bindings={}",
        request.policy_name,
        request.context.len()
    );

    let result = match params.get("cache_key").and_then(|k| k.as_str()) {
        Some(key) => manager.execute_cached(key, request).await,
        None => manager.execute(request).await,
    };
    serde_json::to_value(result).map_err(|e| invalid_params(e.to_string()))
}

async fn execute_named_analysis(manager: &SandboxManager, params: &Value) -> Result<Value, Value> {
    let kind = params
        .get("analysis")
        .and_then(|k| k.as_str())
        .ok_or_else(|| invalid_params("missing 'analysis'"))?;
    let kind = AnalysisKind::from_str(kind).map_err(|e| invalid_params(e.to_string()))?;
    let data = params.get("data").cloned().unwrap_or(Value::Null);
    let parameters = params.get("parameters").cloned().unwrap_or_else(|| json!({}));

    tracing::info!("execute_named_analysis: {}", kind);
    let result = manager.execute_named_analysis(kind, data, parameters).await;
    serde_json::to_value(result).map_err(|e| invalid_params(e.to_string()))
}

fn policies_list(manager: &SandboxManager) -> Value {
    let policies: Vec<Value> = manager
        .policies()
        .names()
        .into_iter()
        .filter_map(|name| manager.policies().get(name))
        .map(|p| {
            json!({
                "name": p.name(),
                "allowed_capabilities": p.allowed_capabilities(),
                "max_execution_seconds": p.max_execution_seconds(),
                "max_memory_mb": p.max_memory_mb(),
                "max_output_bytes": p.max_output_bytes(),
                "allow_network": p.allow_network(),
                "database_access": p.database_access(),
            })
        })
        .collect();
    json!({
        "version": manager.policies().version(),
        "policies": policies,
        "analyses": AnalysisKind::ALL.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
    })
}
