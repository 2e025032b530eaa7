use analysis_sandbox::{create_default_sandbox, AnalysisKind, ExecutionRequest, ExecutionResult};
use serde_json::json;

fn show(label: &str, outcome: &ExecutionResult) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", label);
    match &outcome.failure_reason {
        None => println!(
            "Result ({}ms): {}\n",
            outcome.duration_ms,
            serde_json::to_string_pretty(&outcome.result_value)?
        ),
        Some(reason) => println!(
            "Failed: {} - {}\n",
            reason,
            outcome.failure_detail.as_deref().unwrap_or("")
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Analysis Sandbox Simple Demo ===\n");

    let sandbox = create_default_sandbox()?;
    let info = sandbox.backend_info();
    println!("Backend: {} ({:?})", info.name, info.interpreter);
    println!("Policies: {:?}\n", sandbox.policies().names());

    let code1 = r#"
data = [1, 2, 3, 4, 5]
result = {
    'sum': sum(data),
    'mean': sum(data) / len(data),
    'max': max(data),
    'min': min(data),
    'count': len(data)
}
"#;
    let outcome = sandbox.execute(ExecutionRequest::new(code1, "hardened")).await;
    show("Example 1: Basic calculation", &outcome)?;

    let code2 = r#"
prices = SafeArray([p["price"] for p in products])
result = {
    'total_sales': sum(p['price'] * p['quantity'] for p in products),
    'price_summary': prices.describe(),
    'most_expensive': max(products, key=lambda p: p['price'])['name'],
}
"#;
    let products = json!([
        {"name": "Widget A", "price": 10.50, "quantity": 100},
        {"name": "Widget B", "price": 25.00, "quantity": 50},
        {"name": "Widget C", "price": 5.99, "quantity": 200}
    ]);
    let request = ExecutionRequest::new(code2, "hardened").with_binding("products", products.clone());
    show("Example 2: Context data with SafeArray", &sandbox.execute(request).await)?;

    let code3 = "import os\nresult = os.getcwd()";
    let outcome = sandbox.execute(ExecutionRequest::new(code3, "hardened")).await;
    show("Example 3: Blocked capability", &outcome)?;

    let code4 = r#"
conn = read_only_connect({"products": products})
result = conn.table("SELECT name, price FROM products WHERE price > ? ORDER BY price", [8]).to_list()
"#;
    let request = ExecutionRequest::new(code4, "standard").with_binding("products", products.clone());
    show("Example 4: Read-only SQL", &sandbox.execute(request).await)?;

    let outcome = sandbox
        .execute_named_analysis(
            AnalysisKind::Aggregate,
            products,
            json!({"aggregations": [{"column": "quantity", "func": "sum"}]}),
        )
        .await;
    show("Example 5: Named aggregate analysis", &outcome)?;

    let request = ExecutionRequest::new("while True:\n    pass", "hardened").with_timeout_seconds(1);
    show("Example 6: Timeout", &sandbox.execute(request).await)?;

    sandbox.shutdown();
    Ok(())
}
