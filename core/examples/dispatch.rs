//! Run a small batch and a routed request against flaky fake backends
//!
//! `RUST_LOG=relay_machines=debug cargo run --example dispatch`

use futures::FutureExt;
use relay_machines::{
    BoxError, OperationDescriptor, RelayConfig, RelayContext, RouteRequest, StaticHealth,
    Strategy, StrategyExecutor, SystemHealth, Urgency, ensure_required,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
[dispatch]
max_concurrency = 2
default_timeout_ms = 500
base_delay_ms = 50
max_delay_ms = 400

[breaker]
failure_threshold = 2
reset_timeout_ms = 1000
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let context = RelayContext::from_config(RelayConfig::from_toml_str(CONFIG)?);

    let flaky_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&flaky_calls);

    let batch = vec![
        OperationDescriptor::new("outline", || async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok::<_, BoxError>("outline ready".to_string())
        })
        .required(true),
        OperationDescriptor::new("search", move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err::<String, BoxError>("search index warming up".into())
                } else {
                    Ok(format!("search results after {} attempts", attempt + 1))
                }
            }
        }),
        OperationDescriptor::new("enrich", || async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<_, BoxError>("never seen".to_string())
        })
        .max_retries(0)
        .fallback_value("enrichment skipped".to_string()),
    ];

    let results = context.dispatcher().execute_concurrently(batch).await;
    for result in &results {
        match (result.value(), result.error()) {
            (Some(value), _) => println!(
                "{:<8} {:?} in {:?} ({} retries): {value}",
                result.name,
                result.status(),
                result.duration,
                result.retry_count
            ),
            (None, Some(error)) => println!("{:<8} {:?}: {error}", result.name, result.status()),
            (None, None) => {}
        }
    }
    ensure_required(&results)?;

    let background = context.background().clone();
    background.spawn("audit", async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, BoxError>(())
    });

    let executor: Arc<dyn StrategyExecutor<String>> =
        Arc::new(|strategy: Strategy, request: RouteRequest| {
            async move {
                if strategy == Strategy::Streamlined {
                    Err::<String, BoxError>("streamlined backend overloaded".into())
                } else {
                    Ok(format!("{strategy} answer for '{}'", request.topic))
                }
            }
            .boxed()
        });

    let router = context.router(
        context.cache(),
        executor,
        Arc::new(StaticHealth::new(SystemHealth::Degraded)),
    );

    let request = RouteRequest::new("release notes").urgency(Urgency::High);
    for _ in 0..2 {
        let routed = router.route_and_execute(request.clone()).await?;
        println!(
            "routed via {} (chosen {}, fallback: {}): {}",
            routed.executed, routed.routing.strategy, routed.is_fallback, routed.result
        );
    }

    background.shutdown().await;
    println!("background: {:?}", background.metrics());
    println!("circuits: {:?}", context.registry().states());

    Ok(())
}
