mod common;

use std::sync::Arc;

use anyhow::Result;
use opgraph::backend::device::Device;
use opgraph::exec::{ExecutorConfig, OpByOpExecutor};
use opgraph::ir::ops::{add, leaky_relu};
use opgraph::profiling;

use common::{shared, CountingClient};

#[test]
fn executor_reports_cache_activity() -> Result<()> {
    profiling::reset();
    let client = shared(CountingClient::new());
    let executor = OpByOpExecutor::new(
        Arc::clone(&client),
        ExecutorConfig::default().with_worker_threads(2),
    )?;
    let device = Device::cpu(0);

    for _ in 0..2 {
        let x = client.input(&device, &[3], &[1.0, -1.0, 0.5]);
        executor.execute(&[add(&leaky_relu(&x, 0.2), &x)], &device, &[])?;
    }

    assert_eq!(profiling::metric("op_by_op::compile_cache_miss").count, 2);
    assert_eq!(profiling::metric("op_by_op::compile_cache_hit").count, 2);
    assert_eq!(profiling::metric("op_by_op::compile").count, 2);
    assert_eq!(profiling::metric("op_by_op::nodes").count, 6);

    let report = profiling::snapshot();
    let names: Vec<&str> = report.rows.iter().map(|(name, _)| *name).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);
    assert!(report.to_string().starts_with("metric"));

    profiling::reset();
    assert_eq!(profiling::metric("op_by_op::compile").count, 0);
    Ok(())
}
