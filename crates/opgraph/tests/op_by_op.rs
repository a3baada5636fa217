mod common;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use opgraph::backend::client::ClientError;
use opgraph::backend::device::Device;
use opgraph::backend::spec::{Program, TensorSpec};
use opgraph::exec::{execute_fused, ExecutorConfig, OpByOpExecutor, OpInput, RootOutput};
use opgraph::ir::ops::{
    add, expand, flip, get_dimensions_size, leaky_relu, mul, prod, scalar, softshrink, sub, view,
};
use opgraph::ir::Value;
use opgraph::runtime::WaitError;

use common::{shared, CountingClient};

fn executor(client: &Arc<CountingClient>) -> Result<Arc<OpByOpExecutor<CountingClient>>> {
    common::init_tracing();
    OpByOpExecutor::new(
        Arc::clone(client),
        ExecutorConfig::default().with_worker_threads(4),
    )
}

#[test]
fn adds_two_vectors_and_reuses_the_compiled_program() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let a = client.input(&device, &[4], &[1.0, 2.0, 3.0, 4.0]);
    let b = client.input(&device, &[4], &[10.0, 20.0, 30.0, 40.0]);
    let outputs = executor.execute(&[add(&a, &b)], &device, &[])?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].device(), &device);
    assert_eq!(client.read(&outputs[0]), vec![11.0, 22.0, 33.0, 44.0]);
    assert_eq!(client.compiles(), 1);

    // Fresh buffers, same structure: served from the cache.
    let c = client.input(&device, &[4], &[0.5; 4]);
    let d = client.input(&device, &[4], &[1.5; 4]);
    let outputs = executor.execute(&[add(&c, &d)], &device, &[])?;
    assert_eq!(client.read(&outputs[0]), vec![2.0; 4]);
    assert_eq!(client.compiles(), 1);

    let stats = executor.stats();
    assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
    assert_eq!(stats.compiles, 1);
    assert_eq!(stats.cached_computations, 1);
    Ok(())
}

#[test]
fn runs_nodes_after_their_operands() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let x = client.input(&device, &[4], &[-2.0, -0.5, 0.5, 2.0]);
    let relu = leaky_relu(&x, 0.5);
    let shrunk = softshrink(&relu, 0.25);
    let root = add(&relu, &shrunk);

    let outputs = executor.execute(&[root], &device, &[])?;
    // relu: [-1, -0.25, 0.5, 2]; shrink: [-0.75, 0, 0.25, 1.75]
    assert_eq!(client.read(&outputs[0]), vec![-1.75, -0.25, 0.75, 3.75]);
    assert_eq!(
        client.executed(),
        vec!["op_leaky_relu", "op_softshrink", "op_add"]
    );
    Ok(())
}

#[test]
fn structurally_identical_nodes_compile_once_per_call() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let a = client.input(&device, &[3], &[1.0, -1.0, 2.0]);
    let b = client.input(&device, &[3], &[-3.0, 3.0, -4.0]);
    let root = add(&leaky_relu(&a, 0.1), &leaky_relu(&b, 0.1));

    let outputs = executor.execute(&[root], &device, &[])?;
    let result = client.read(&outputs[0]);
    let expected = [1.0 - 0.3, -0.1 + 3.0, 2.0 - 0.4];
    for (got, want) in result.iter().zip(expected) {
        assert!((got - want).abs() < 1e-6, "{result:?}");
    }
    assert_eq!(client.compiles(), 2);
    let executed = client.executed();
    assert_eq!(executed.iter().filter(|e| *e == "op_leaky_relu").count(), 2);
    Ok(())
}

#[test]
fn repeated_and_shared_roots_are_returned_in_order() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let x = client.input(&device, &[2], &[3.0, -3.0]);
    let doubled = add(&x, &x);
    let outputs = executor.execute(&[doubled.clone(), x.clone(), doubled], &device, &[])?;
    assert_eq!(outputs.len(), 3);
    assert_eq!(client.read(&outputs[0]), vec![6.0, -6.0]);
    assert_eq!(client.read(&outputs[1]), vec![3.0, -3.0]);
    assert!(Arc::ptr_eq(&outputs[0], &outputs[2]));
    Ok(())
}

#[test]
fn agrees_with_fused_execution() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let a = client.input(&device, &[2, 3], &[1.0, -2.0, 3.0, -4.0, 5.0, -6.0]);
    let b = client.input(&device, &[3], &[0.5, 0.25, -0.5]);
    let sum = add(&a, &b);
    let activated = softshrink(&leaky_relu(&sum, 0.1), 0.2);
    let reshaped = view(&flip(&activated, vec![0, 1]), vec![3, 2]);
    let product = prod(&reshaped, vec![1], false, None);
    let expanded = expand(&product, vec![2, 3]);
    let size = get_dimensions_size(&a, vec![1]);
    let scaled = mul(&expanded, &size);
    let root = sub(&scaled, &scalar(0.5, TensorSpec::f32(vec![2, 3])));
    let roots: Vec<Value> = vec![root, sum];

    let fused = execute_fused(client.as_ref(), &roots, &device, &[])?;
    let stepped = executor.execute(&roots, &device, &[])?;
    for (fused, stepped) in fused.iter().zip(&stepped) {
        assert_eq!(client.read(fused), client.read(stepped));
    }
    Ok(())
}

#[test]
fn compile_failures_surface_the_client_error() -> Result<()> {
    let client = shared(CountingClient::failing_compile("op_add"));
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let x = client.input(&device, &[2], &[1.0, 2.0]);
    let err = executor
        .execute(&[add(&leaky_relu(&x, 0.1), &x)], &device, &[])
        .expect_err("compile must fail");
    assert!(
        matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::Compile { .. })
        ),
        "{err:#}"
    );
    assert!(format!("{err:#}").contains("compiling f32[2] ops::add"), "{err:#}");
    assert!(client.executed().is_empty());
    // The successful compile stays cached.
    assert_eq!(executor.stats().cached_computations, 1);
    Ok(())
}

#[test]
fn execution_failures_stop_dependent_nodes() -> Result<()> {
    let client = shared(CountingClient::failing_execute("op_softshrink"));
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let x = client.input(&device, &[2], &[1.0, 2.0]);
    let relu = leaky_relu(&x, 0.1);
    let root = add(&softshrink(&relu, 0.5), &relu);
    let err = executor
        .execute(&[root], &device, &[])
        .expect_err("execution must fail");

    assert!(
        matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::Execution { .. })
        ),
        "{err:#}"
    );
    assert_eq!(client.executed(), vec!["op_leaky_relu", "op_softshrink"]);
    Ok(())
}

#[test]
fn async_execution_delivers_results_and_errors() -> Result<()> {
    let client = shared(CountingClient::failing_execute("op_mul"));
    let config = ExecutorConfig::default()
        .with_worker_threads(2)
        .with_wait_timeout(Duration::from_secs(30));
    let executor = OpByOpExecutor::new(Arc::clone(&client), config)?;
    let device = Device::cpu(0);

    let x = client.input(&device, &[2], &[1.0, 2.0]);
    let ok = executor.execute_async(vec![add(&x, &x)], device.clone(), Vec::new());
    let failing = executor.execute_async(vec![mul(&x, &x)], device.clone(), Vec::new());

    let outputs = executor.wait(&ok)?;
    assert_eq!(client.read(&outputs[0]), vec![2.0, 4.0]);

    let err = executor.wait(&failing).expect_err("mul refuses to run");
    assert!(format!("{err:#}").contains("refusing to run @op_mul"), "{err:#}");
    Ok(())
}

#[test]
fn build_ops_describes_the_chain_without_running_it() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let a = client.input(&device, &[2], &[1.0, 2.0]);
    let b = client.input(&device, &[2], &[3.0, 4.0]);
    let left = add(&a, &b);
    let right = add(&a, &b);
    let root = mul(&left, &right);

    let ops = executor.build_ops(&[root.clone(), left.clone()], &device, &[])?;
    assert!(client.executed().is_empty());
    assert_eq!(client.compiles(), 2);
    assert_eq!(ops.len(), 5);

    let index = |value: &Value| {
        ops.iter()
            .position(|op| Arc::ptr_eq(&op.node, value.node()))
            .expect("node has an op")
    };
    for data in [&a, &b] {
        let op = &ops[index(data)];
        assert!(op.device_data.is_some());
        assert!(op.cache_key.is_none());
        assert!(op.computation.is_none());
        assert!(op.inputs.is_empty());
    }

    let (left_op, right_op) = (&ops[index(&left)], &ops[index(&right)]);
    assert!(left_op.cache_key.is_some());
    assert_eq!(left_op.cache_key, right_op.cache_key);
    assert!(Arc::ptr_eq(
        left_op.computation.as_ref().expect("compiled"),
        right_op.computation.as_ref().expect("compiled"),
    ));
    assert_eq!(
        left_op.inputs,
        vec![
            OpInput { op_index: index(&a), output_index: 0 },
            OpInput { op_index: index(&b), output_index: 0 },
        ]
    );

    let root_op = &ops[index(&root)];
    assert_ne!(root_op.cache_key, left_op.cache_key);
    assert_eq!(
        root_op.inputs,
        vec![
            OpInput { op_index: index(&left), output_index: 0 },
            OpInput { op_index: index(&right), output_index: 0 },
        ]
    );
    assert_eq!(root_op.outputs, vec![RootOutput { result_index: 0, output_index: 0 }]);
    assert_eq!(left_op.outputs, vec![RootOutput { result_index: 1, output_index: 0 }]);
    assert!(right_op.outputs.is_empty());
    for (position, op) in ops.iter().enumerate() {
        assert!(op.inputs.iter().all(|input| input.op_index < position));
    }
    Ok(())
}

#[test]
fn waiting_past_the_configured_timeout_fails() -> Result<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let client = shared(CountingClient::with_compile_hook(Box::new(move |_program: &Program| {
        let _ = release_rx.lock().expect("release channel poisoned").recv();
    })));
    let config = ExecutorConfig::default()
        .with_worker_threads(2)
        .with_wait_timeout(Duration::from_millis(50));
    let executor = OpByOpExecutor::new(Arc::clone(&client), config)?;
    let device = Device::cpu(0);

    let x = client.input(&device, &[2], &[1.0, 2.0]);
    let task = executor.execute_async(vec![add(&x, &x)], device.clone(), Vec::new());
    let err = executor.wait(&task).expect_err("compile is still blocked");
    assert!(
        matches!(err.downcast_ref::<WaitError>(), Some(WaitError::TimedOut { .. })),
        "{err:#}"
    );

    release_tx.send(())?;
    task.wait()?;
    let outputs = task.consume_value()?;
    assert_eq!(client.read(&outputs[0]), vec![2.0, 4.0]);
    Ok(())
}

#[test]
fn compiles_run_outside_the_cache_lock() -> Result<()> {
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let client = shared(CountingClient::with_compile_hook(Box::new(move |_program: &Program| {
        let _ = entered_tx.send(());
        let _ = release_rx.lock().expect("release channel poisoned").recv();
    })));
    let executor = executor(&client)?;
    let device = Device::cpu(0);

    let x = client.input(&device, &[2], &[1.0, 2.0]);
    let task = executor.execute_async(vec![add(&x, &x)], device.clone(), Vec::new());
    entered_rx.recv_timeout(Duration::from_secs(30))?;

    // Both take the cache lock; they would block behind a compile holding it.
    let stats = executor.stats();
    assert_eq!(stats.compiles, 1);
    assert_eq!(stats.cached_computations, 0);
    executor.clear_cache();

    release_tx.send(())?;
    let outputs = executor.wait(&task)?;
    assert_eq!(client.read(&outputs[0]), vec![2.0, 4.0]);
    assert_eq!(executor.stats().cached_computations, 1);
    Ok(())
}

#[test]
fn small_caches_evict_old_programs() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = OpByOpExecutor::new(
        Arc::clone(&client),
        ExecutorConfig::default()
            .with_worker_threads(2)
            .with_compile_cache_size(1),
    )?;
    let device = Device::cpu(0);
    let x = client.input(&device, &[2], &[1.0, 2.0]);

    executor.execute(&[add(&x, &x)], &device, &[])?;
    executor.execute(&[mul(&x, &x)], &device, &[])?;
    executor.execute(&[add(&x, &x)], &device, &[])?;

    let stats = executor.stats();
    assert_eq!(stats.compiles, 3);
    assert_eq!(stats.cache_evictions, 2);
    assert_eq!(stats.cached_computations, 1);
    Ok(())
}

#[test]
fn device_keys_separate_compiled_programs() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;

    for ordinal in 0..2 {
        let device = Device::cpu(ordinal);
        let x = client.input(&device, &[2], &[1.0, 2.0]);
        let outputs = executor.execute(&[add(&x, &x)], &device, &[])?;
        assert_eq!(outputs[0].device(), &device);
    }
    assert_eq!(client.compiles(), 2);
    Ok(())
}

#[test]
fn rejects_data_placed_on_another_device() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;

    let x = client.input(&Device::cpu(1), &[2], &[1.0, 2.0]);
    let err = executor
        .execute(&[add(&x, &x)], &Device::cpu(0), &[])
        .expect_err("placement mismatch");
    assert!(format!("{err:#}").contains("lives on CPU:1"), "{err:#}");
    assert!(client.executed().is_empty());
    Ok(())
}

#[test]
fn empty_roots_do_nothing() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    assert!(executor.execute(&[], &Device::cpu(0), &[])?.is_empty());
    assert_eq!(client.compiles(), 0);
    Ok(())
}

#[test]
fn device_data_roots_skip_compilation() -> Result<()> {
    let client = shared(CountingClient::new());
    let executor = executor(&client)?;
    let device = Device::cpu(0);
    let x = client.input(&device, &[2], &[1.0, 2.0]);

    let outputs = executor.execute(&[x], &device, &[])?;
    assert_eq!(client.read(&outputs[0]), vec![1.0, 2.0]);
    assert_eq!(client.compiles(), 0);
    Ok(())
}
