//! Dependency-ordered execution of per-node programs.
//!
//! Every op of a chain becomes one job on the worker pool. A job is spawned once all ops it
//! reads from have finished, so an op never runs before its inputs exist. Once an op fails, the
//! remaining jobs are skipped; they still report to the barrier so the call always completes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail, ensure, Context, Result};
use rayon::Scope;

use crate::backend::client::{ComputationClient, DataHandle};
use crate::backend::device::Device;
use crate::ir::node::NodePtr;
use crate::runtime::{MultiWait, TaskError, WorkerPool};

/// Output `output_index` of the op at `op_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInput {
    pub op_index: usize,
    pub output_index: usize,
}

/// Output `output_index` of an op is root number `result_index` of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootOutput {
    pub result_index: usize,
    pub output_index: usize,
}

/// One step of an op-by-op run.
///
/// Device data nodes carry their buffer and no computation; every other node carries the
/// compiled per-node program and where its inputs come from.
pub struct ChainedOp<T> {
    pub node: NodePtr,
    pub device_data: Option<DataHandle>,
    pub computation: Option<Arc<T>>,
    pub cache_key: Option<u64>,
    pub inputs: Vec<OpInput>,
    pub outputs: Vec<RootOutput>,
}

impl<T> fmt::Debug for ChainedOp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedOp")
            .field("node", &format_args!("{}", self.node))
            .field("device_data", &self.device_data.is_some())
            .field("cache_key", &self.cache_key)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Runs `ops` (in topological order) and returns the `root_count` root outputs.
pub(crate) fn execute_chain<C: ComputationClient>(
    client: &C,
    pool: &WorkerPool,
    ops: &[ChainedOp<C::Computation>],
    device: &Device,
    root_count: usize,
) -> Result<Vec<DataHandle>> {
    let mut users = vec![Vec::new(); ops.len()];
    let mut pending = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        let mut producers: Vec<usize> = op.inputs.iter().map(|input| input.op_index).collect();
        producers.sort_unstable();
        producers.dedup();
        for producer in &producers {
            ensure!(
                *producer < index,
                "op {index} reads op {producer}, which does not precede it"
            );
            users[*producer].push(index);
        }
        pending.push(AtomicUsize::new(producers.len()));
    }

    let run = ChainRun {
        client,
        ops,
        device,
        users,
        pending,
        results: (0..ops.len()).map(|_| OnceLock::new()).collect(),
        aborted: AtomicBool::new(false),
        mwait: MultiWait::new(ops.len()),
    };
    pool.scope(|scope| {
        for (index, pending) in run.pending.iter().enumerate() {
            if pending.load(Ordering::Acquire) == 0 {
                run.spawn(scope, index);
            }
        }
    });
    let outcome = run.mwait.wait();
    let ChainRun { results, mwait, .. } = run;
    // Release the barrier's copy so the original error can be unwrapped.
    drop(mwait);
    outcome.map_err(TaskError::into_error)?;

    let mut roots: Vec<Option<DataHandle>> = vec![None; root_count];
    for (op, outputs) in ops.iter().zip(&results) {
        for output in &op.outputs {
            let data = outputs
                .get()
                .and_then(|outputs| outputs.get(output.output_index))
                .ok_or_else(|| anyhow!("{} produced no output {}", op.node, output.output_index))?;
            roots[output.result_index] = Some(DataHandle::clone(data));
        }
    }
    roots
        .into_iter()
        .enumerate()
        .map(|(index, data)| data.ok_or_else(|| anyhow!("root {index} was never produced")))
        .collect()
}

struct ChainRun<'a, C: ComputationClient> {
    client: &'a C,
    ops: &'a [ChainedOp<C::Computation>],
    device: &'a Device,
    users: Vec<Vec<usize>>,
    pending: Vec<AtomicUsize>,
    results: Vec<OnceLock<Vec<DataHandle>>>,
    aborted: AtomicBool,
    mwait: MultiWait,
}

impl<'a, C: ComputationClient> ChainRun<'a, C> {
    fn spawn<'s>(&'s self, scope: &Scope<'s>, index: usize) {
        scope.spawn(move |scope| {
            let task = self.mwait.completer(|| self.run_op(index));
            task();
            for &user in &self.users[index] {
                if self.pending[user].fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.spawn(scope, user);
                }
            }
        });
    }

    fn run_op(&self, index: usize) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            tracing::trace!(index, "skipping op after earlier failure");
            return Ok(());
        }
        let outcome = self.execute_op(index);
        if outcome.is_err() {
            self.aborted.store(true, Ordering::Release);
        }
        outcome
    }

    fn execute_op(&self, index: usize) -> Result<()> {
        let op = &self.ops[index];
        let outputs = match (&op.device_data, &op.computation) {
            (Some(data), _) => {
                ensure!(
                    data.device() == self.device,
                    "{} lives on {} but execution targets {}",
                    op.node,
                    data.device(),
                    self.device
                );
                vec![DataHandle::clone(data)]
            }
            (None, Some(computation)) => {
                let inputs = op
                    .inputs
                    .iter()
                    .map(|input| self.output(input))
                    .collect::<Result<Vec<_>>>()?;
                tracing::trace!(node = %op.node, "executing per-node program");
                let outputs = self
                    .client
                    .execute(computation, &inputs, self.device)
                    .with_context(|| format!("executing {}", op.node))?;
                ensure!(
                    outputs.len() == op.node.num_outputs(),
                    "{} returned {} buffers for {} outputs",
                    op.node,
                    outputs.len(),
                    op.node.num_outputs()
                );
                outputs
            }
            (None, None) => bail!("{} has neither device data nor a computation", op.node),
        };
        if self.results[index].set(outputs).is_err() {
            bail!("{} executed twice", op.node);
        }
        Ok(())
    }

    fn output(&self, input: &OpInput) -> Result<DataHandle> {
        self.results[input.op_index]
            .get()
            .and_then(|outputs| outputs.get(input.output_index))
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "output {} of {} is not available",
                    input.output_index,
                    self.ops[input.op_index].node
                )
            })
    }
}
