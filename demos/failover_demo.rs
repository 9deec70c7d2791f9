//! Failover demo: one flaky and two healthy endpoints behind a governed cluster.
//!
//! Run with: RUST_LOG=outbound_governance=debug cargo run --example failover_demo

use async_trait::async_trait;
use futures::future::join_all;
use outbound_governance::cluster::{ClusterAdapter, ClusterInvoker, Endpoint, OperationInfo};
use outbound_governance::policy::{ClusterPolicy, RetryPolicy};
use outbound_governance::resilience::CircuitBreakerPolicy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("{endpoint} timed out")]
struct SimulatedTimeout {
    endpoint: String,
}

/// `10.0.0.1` fails every other call; the others answer with fixed latencies.
struct SimulatedCluster {
    calls: AtomicU64,
}

#[async_trait]
impl ClusterAdapter for SimulatedCluster {
    type Request = u64;
    type Response = String;
    type Error = SimulatedTimeout;

    fn service(&self, _request: &u64) -> String {
        "inventory".to_string()
    }

    fn operation(&self, _request: &u64) -> OperationInfo {
        OperationInfo::new("/stock").with_method("GET")
    }

    async fn route(&self, _request: &u64) -> outbound_governance::Result<Vec<Endpoint>> {
        Ok((1..=3)
            .map(|i| Endpoint::new(format!("10.0.0.{i}"), 9000))
            .collect())
    }

    async fn invoke(&self, request: &u64, endpoint: &Endpoint) -> Result<String, SimulatedTimeout> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = match endpoint.host.as_str() {
            "10.0.0.1" => 5,
            "10.0.0.2" => 15,
            _ => 30,
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;
        if endpoint.host == "10.0.0.1" && n % 2 == 0 {
            return Err(SimulatedTimeout {
                endpoint: endpoint.id.clone(),
            });
        }
        Ok(format!("item {} served by {}", request, endpoint))
    }

    fn is_retryable(&self, _error: &SimulatedTimeout) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let invoker = ClusterInvoker::new(SimulatedCluster {
        calls: AtomicU64::new(0),
    });
    let policy = ClusterPolicy::failover(
        RetryPolicy::new(2)
            .with_interval(Duration::from_millis(5))
            .with_timeout(Duration::from_secs(1)),
    )
    .with_circuit_breaker(
        CircuitBreakerPolicy::new()
            .with_sliding_window_size(10)
            .with_minimum_calls(4)
            .with_wait_duration_in_open(Duration::from_secs(5)),
    );

    for round in 0..3 {
        let calls = (0..20u64).map(|i| invoker.execute(round * 100 + i, Some(policy.clone())));
        let results = join_all(calls).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        println!("round {}: {}/{} succeeded", round, ok, results.len());
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            println!("  failed: {}", err);
        }
    }

    println!("\n=== Endpoint stats ===");
    for stats in invoker.endpoint_stats("inventory") {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    invoker.destroy();
    Ok(())
}
