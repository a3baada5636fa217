//! Op-by-op execution: one compiled program per graph node, chained in dependency order.
//!
//! ## Flow
//!
//! 1. **Order**: nodes reachable from the roots are visited once each, operands first.
//! 2. **Key**: every non-data node gets a compile cache key built from the target devices, its
//!    operand specs, its output specs and its `node_hash`. Structurally identical nodes in
//!    different graphs therefore share one compiled program.
//! 3. **Compile**: misses are deduplicated within the call and compiled in parallel on the
//!    worker pool. The cache lock is only held for lookups and inserts, never across a compile.
//! 4. **Chain**: [`execute_chain`](super::chain) runs each program once its inputs exist.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context, Result};

use crate::backend::client::{ComputationClient, DataHandle};
use crate::backend::device::Device;
use crate::backend::hashing::{hash_combine, hash_value};
use crate::backend::spec::Program;
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{NodeId, NodePtr, Value};
use crate::ir::ops::DeviceData;
use crate::ir::util::post_order;
use crate::profiling;
use crate::runtime::{AsyncTask, Cache, MultiWait, TaskError, WorkerPool};

use super::chain::{execute_chain, ChainedOp, OpInput, RootOutput};
use super::ExecutorConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    /// Compile requests issued to the client.
    pub compiles: u64,
    pub cached_computations: usize,
}

/// Executes graphs node by node against one computation client.
///
/// The executor is caller-owned and shared through `Arc`; everything it caches lives in the
/// instance, so one shared cache per process is a matter of sharing one executor.
pub struct OpByOpExecutor<C: ComputationClient> {
    client: Arc<C>,
    pool: Arc<WorkerPool>,
    cache: Cache<u64, C::Computation>,
    compiles: AtomicU64,
    config: ExecutorConfig,
}

impl<C: ComputationClient> OpByOpExecutor<C> {
    pub fn new(client: Arc<C>, config: ExecutorConfig) -> Result<Arc<Self>> {
        let pool = WorkerPool::new(config.worker_threads)?;
        Ok(Self::with_pool(client, Arc::new(pool), config))
    }

    /// Builds an executor that schedules on an existing pool.
    pub fn with_pool(client: Arc<C>, pool: Arc<WorkerPool>, config: ExecutorConfig) -> Arc<Self> {
        tracing::debug!(
            client = client.name(),
            cache_size = config.compile_cache_size,
            threads = pool.num_threads(),
            "op-by-op executor created"
        );
        Arc::new(Self {
            client,
            pool,
            cache: Cache::new(config.compile_cache_size),
            compiles: AtomicU64::new(0),
            config,
        })
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn stats(&self) -> ExecutorStats {
        let cache = self.cache.stats();
        ExecutorStats {
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            compiles: self.compiles.load(Ordering::Relaxed),
            cached_computations: self.cache.len(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Orders, keys and compiles the nodes under `roots` without running anything.
    #[tracing::instrument(skip_all, fields(roots = roots.len(), device = %device))]
    pub fn build_ops(
        &self,
        roots: &[Value],
        device: &Device,
        devices: &[Device],
    ) -> Result<Vec<ChainedOp<C::Computation>>> {
        let order = post_order(roots);
        let seed = hash_combine(hash_value(device), hash_value(devices));
        let mut index_of: HashMap<NodeId, usize> = HashMap::with_capacity(order.len());
        let mut ops = Vec::with_capacity(order.len());
        let mut misses: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut to_compile: Vec<(u64, NodePtr)> = Vec::new();

        for node in order {
            let index = ops.len();
            index_of.insert(node.id(), index);
            if let Some(data) = node.kind::<DeviceData>() {
                let data = DataHandle::clone(data.data());
                ops.push(ChainedOp {
                    node,
                    device_data: Some(data),
                    computation: None,
                    cache_key: None,
                    inputs: Vec::new(),
                    outputs: Vec::new(),
                });
                continue;
            }
            let inputs = node
                .operands()
                .iter()
                .map(|operand| {
                    index_of
                        .get(&operand.node().id())
                        .map(|op_index| OpInput {
                            op_index: *op_index,
                            output_index: operand.index(),
                        })
                        .ok_or_else(|| anyhow!("operand of {node} was not ordered before it"))
                })
                .collect::<Result<Vec<_>>>()?;
            let key = node_cache_key(seed, &node);
            let computation = self.cache.get(&key);
            if computation.is_some() {
                profiling::cache_event("op_by_op::compile_cache_hit");
            } else {
                profiling::cache_event("op_by_op::compile_cache_miss");
                let pending = misses.entry(key).or_default();
                if pending.is_empty() {
                    to_compile.push((key, NodePtr::clone(&node)));
                }
                pending.push(index);
            }
            ops.push(ChainedOp {
                node,
                device_data: None,
                computation,
                cache_key: Some(key),
                inputs,
                outputs: Vec::new(),
            });
        }

        profiling::counter_add("op_by_op::nodes", ops.len() as u64);
        if !to_compile.is_empty() {
            tracing::debug!(
                nodes = ops.len(),
                compiles = to_compile.len(),
                "compiling per-node programs"
            );
            let compiled = self.compile_all(&to_compile, device, devices)?;
            for ((key, _), computation) in to_compile.iter().zip(compiled) {
                for index in misses.get(key).into_iter().flatten() {
                    ops[*index].computation = Some(Arc::clone(&computation));
                }
            }
        }

        for (result_index, root) in roots.iter().enumerate() {
            let index = index_of
                .get(&root.node().id())
                .copied()
                .ok_or_else(|| anyhow!("root {result_index} was not ordered"))?;
            ops[index].outputs.push(RootOutput {
                result_index,
                output_index: root.index(),
            });
        }
        Ok(ops)
    }

    /// Runs the graph under `roots` and returns one buffer per root, on `device`.
    #[tracing::instrument(skip_all, fields(roots = roots.len(), device = %device))]
    pub fn execute(
        &self,
        roots: &[Value],
        device: &Device,
        devices: &[Device],
    ) -> Result<Vec<DataHandle>> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        let ops = self.build_ops(roots, device, devices)?;
        execute_chain(self.client.as_ref(), &self.pool, &ops, device, roots.len())
    }

    /// [`OpByOpExecutor::execute`] as a task scheduled on the worker pool.
    pub fn execute_async(
        self: &Arc<Self>,
        roots: Vec<Value>,
        device: Device,
        devices: Vec<Device>,
    ) -> AsyncTask<Vec<DataHandle>> {
        let executor = Arc::clone(self);
        let task = AsyncTask::new(move || executor.execute(&roots, &device, &devices));
        task.schedule(&self.pool);
        task
    }

    /// Waits for a task returned by [`OpByOpExecutor::execute_async`], bounded by the configured
    /// wait timeout.
    pub fn wait(&self, task: &AsyncTask<Vec<DataHandle>>) -> Result<Vec<DataHandle>> {
        match self.config.wait_timeout {
            Some(timeout) => {
                task.wait_for(timeout)?;
            }
            None => {
                task.wait().map_err(TaskError::into_error)?;
            }
        }
        task.consume_value().map_err(TaskError::into_error)
    }

    fn compile_all(
        &self,
        pending: &[(u64, NodePtr)],
        device: &Device,
        devices: &[Device],
    ) -> Result<Vec<Arc<C::Computation>>> {
        let slots: Vec<OnceLock<Arc<C::Computation>>> =
            (0..pending.len()).map(|_| OnceLock::new()).collect();
        let mwait = MultiWait::new(pending.len());
        {
            let slots = &slots;
            let mwait = &mwait;
            self.pool.scope(|scope| {
                for (slot, (key, node)) in pending.iter().enumerate() {
                    let task = mwait.completer(move || {
                        let computation = Arc::new(self.compile_node(node, device, devices)?);
                        let _ = slots[slot].set(self.cache.add(*key, computation));
                        Ok(())
                    });
                    scope.spawn(move |_| task());
                }
            });
        }
        let outcome = mwait.wait();
        drop(mwait);
        outcome.map_err(TaskError::into_error)?;
        slots
            .into_iter()
            .zip(pending)
            .map(|(slot, (_, node))| {
                slot.into_inner()
                    .ok_or_else(|| anyhow!("no computation was produced for {node}"))
            })
            .collect()
    }

    fn compile_node(
        &self,
        node: &NodePtr,
        device: &Device,
        devices: &[Device],
    ) -> Result<C::Computation> {
        let program = lower_node_program(node, device)?;
        tracing::debug!(node = %node, "compiling per-node program");
        self.compiles.fetch_add(1, Ordering::Relaxed);
        let _scope = profiling::compile_scope("op_by_op::compile");
        self.client
            .compile(&program, device, devices)
            .with_context(|| format!("compiling {node}"))
    }
}

fn node_cache_key(seed: u64, node: &NodePtr) -> u64 {
    let mut key = seed;
    for operand in node.operands() {
        key = hash_combine(key, hash_value(operand.spec()));
    }
    for spec in node.shapes() {
        key = hash_combine(key, hash_value(spec));
    }
    hash_combine(key, node.node_hash())
}

/// Program computing `node` alone; each operand becomes a parameter in operand order.
pub fn lower_node_program(node: &NodePtr, device: &Device) -> Result<Program> {
    let mut ctx = LoweringContext::new(format!("op_{}", node.op().name()), device.clone());
    for operand in node.operands() {
        let parameter = ctx.add_parameter(operand.spec().clone());
        ctx.assign_output_op(operand, parameter);
    }
    for op in ctx.lower_node(node)? {
        ctx.add_result(op);
    }
    Ok(ctx.build()?.program)
}
