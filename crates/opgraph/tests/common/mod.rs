#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use opgraph::backend::client::{ClientError, ClientResult, ComputationClient, DataHandle};
use opgraph::backend::device::Device;
use opgraph::backend::spec::{Program, TensorLiteral};
use opgraph::ir::ops::device_data;
use opgraph::ir::Value;
use opgraph_backend_ref_cpu::{CpuClient, CpuComputation};

pub type CompileHook = Box<dyn Fn(&Program) + Send + Sync>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct CountedComputation {
    pub entry: String,
    inner: CpuComputation,
}

/// CPU client that counts compiles, records execution order and can inject failures by entry
/// function name (`op_add`, `op_leaky_relu`, `fused`, ...).
#[derive(Default)]
pub struct CountingClient {
    inner: CpuClient,
    compiles: AtomicUsize,
    executed: Mutex<Vec<String>>,
    fail_compile: Option<String>,
    fail_execute: Option<String>,
    compile_hook: Option<CompileHook>,
}

impl CountingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_compile(entry: &str) -> Self {
        Self {
            fail_compile: Some(entry.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_execute(entry: &str) -> Self {
        Self {
            fail_execute: Some(entry.to_string()),
            ..Self::default()
        }
    }

    pub fn with_compile_hook(hook: CompileHook) -> Self {
        Self {
            compile_hook: Some(hook),
            ..Self::default()
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("execution log poisoned").clone()
    }

    pub fn input(&self, device: &Device, dims: &[usize], values: &[f32]) -> Value {
        device_data(
            self.inner
                .buffer_from_f32(device, dims, values)
                .expect("cpu transfer"),
        )
    }

    pub fn read(&self, data: &DataHandle) -> Vec<f32> {
        self.inner.read_f32(data).expect("cpu readback")
    }
}

impl ComputationClient for CountingClient {
    type Computation = CountedComputation;

    fn name(&self) -> &str {
        "counting-cpu"
    }

    fn compile(
        &self,
        program: &Program,
        device: &Device,
        devices: &[Device],
    ) -> ClientResult<CountedComputation> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.compile_hook {
            hook(program);
        }
        if self.fail_compile.as_deref() == Some(program.entry.as_str()) {
            return Err(ClientError::compile(device, format!("refusing @{}", program.entry)));
        }
        Ok(CountedComputation {
            entry: program.entry.clone(),
            inner: self.inner.compile(program, device, devices)?,
        })
    }

    fn execute(
        &self,
        computation: &CountedComputation,
        inputs: &[DataHandle],
        device: &Device,
    ) -> ClientResult<Vec<DataHandle>> {
        self.executed
            .lock()
            .expect("execution log poisoned")
            .push(computation.entry.clone());
        if self.fail_execute.as_deref() == Some(computation.entry.as_str()) {
            return Err(ClientError::execution(
                device,
                format!("refusing to run @{}", computation.entry),
            ));
        }
        self.inner.execute(&computation.inner, inputs, device)
    }

    fn transfer(&self, literal: TensorLiteral, device: &Device) -> ClientResult<DataHandle> {
        self.inner.transfer(literal, device)
    }

    fn to_literal(&self, data: &DataHandle) -> ClientResult<TensorLiteral> {
        self.inner.to_literal(data)
    }
}

pub fn shared(client: CountingClient) -> Arc<CountingClient> {
    Arc::new(client)
}
