//! Translation of IR nodes into a backend [`Program`].
//!
//! A [`LoweringContext`] covers one compilation unit. It memoizes the instruction produced for
//! every node output, so a node shared by several consumers is lowered once per context, and it
//! walks unlowered operands iteratively so deep graphs do not grow the call stack.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, ensure, Context, Result};

use crate::backend::client::{data_identity, DataHandle};
use crate::backend::device::Device;
use crate::backend::spec::{
    Operand, Operation, Program, ProgramBuilder, TensorLiteral, TensorSpec, ValueId,
};
use crate::backend::topology::validate_function_topology;
use crate::ir::node::{NodeId, NodePtr, Value};
use crate::ir::util::post_order_where;

/// Program produced by a context, together with the device data bound to its parameters.
pub struct LoweredProgram {
    pub program: Program,
    /// One entry per program parameter; `None` for parameters the caller binds at execution.
    pub parameter_data: Vec<Option<DataHandle>>,
}

impl LoweredProgram {
    /// Device data for every parameter, in parameter order.
    pub fn bound_inputs(&self) -> Result<Vec<DataHandle>> {
        self.parameter_data
            .iter()
            .enumerate()
            .map(|(index, data)| {
                data.clone()
                    .ok_or_else(|| anyhow!("parameter {index} of @{} has no bound data", self.program.entry))
            })
            .collect()
    }
}

pub struct LoweringContext {
    name: String,
    device: Device,
    builder: ProgramBuilder,
    emitted: HashMap<(NodeId, usize), ValueId>,
    lowered: HashSet<NodeId>,
    parameter_data: Vec<Option<DataHandle>>,
    data_parameters: HashMap<usize, ValueId>,
    results: Vec<ValueId>,
    lowered_nodes: usize,
}

impl LoweringContext {
    pub fn new(name: impl Into<String>, device: Device) -> Self {
        Self {
            name: name.into(),
            device,
            builder: ProgramBuilder::new(),
            emitted: HashMap::new(),
            lowered: HashSet::new(),
            parameter_data: Vec::new(),
            data_parameters: HashMap::new(),
            results: Vec::new(),
            lowered_nodes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Declares a parameter the caller binds at execution time.
    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueId {
        self.parameter_data.push(None);
        self.builder.add_parameter(spec)
    }

    /// Parameter fed by `data`. The same buffer maps to the same parameter.
    pub fn get_parameter(&mut self, data: &DataHandle) -> ValueId {
        let identity = data_identity(data);
        if let Some(id) = self.data_parameters.get(&identity) {
            return *id;
        }
        let id = self.builder.add_parameter(data.spec().clone());
        self.parameter_data.push(Some(DataHandle::clone(data)));
        self.data_parameters.insert(identity, id);
        id
    }

    /// Binds `value` to an existing instruction; its node is then never lowered by this context.
    pub fn assign_output_op(&mut self, value: &Value, op: ValueId) {
        self.emitted.insert((value.node().id(), value.index()), op);
        self.lowered.insert(value.node().id());
    }

    /// Instruction computing `value`, lowering its node and any unlowered ancestors first.
    pub fn get_output_op(&mut self, value: &Value) -> Result<ValueId> {
        let key = (value.node().id(), value.index());
        if let Some(id) = self.emitted.get(&key) {
            return Ok(*id);
        }
        let lowered = &self.lowered;
        let pending = post_order_where([value.node()], |node| !lowered.contains(&node.id()));
        for node in &pending {
            self.lower_pending(node)?;
        }
        self.emitted.get(&key).copied().ok_or_else(|| {
            anyhow!(
                "{} did not produce output {}",
                value.node(),
                value.index()
            )
        })
    }

    /// Instructions for every output of `node`.
    pub fn lower_node(&mut self, node: &NodePtr) -> Result<Vec<ValueId>> {
        (0..node.num_outputs())
            .map(|index| self.get_output_op(&Value::new(NodePtr::clone(node), index)))
            .collect()
    }

    pub fn emit(&mut self, op: Operation, operands: &[ValueId], output: TensorSpec) -> ValueId {
        let operands = operands.iter().copied().map(Operand::Value).collect();
        self.builder.emit(op, operands, output)
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> ValueId {
        let spec = literal.spec.clone();
        self.builder.emit(Operation::Constant(literal), Vec::new(), spec)
    }

    /// Marks `op` as a program result; returns its result index.
    pub fn add_result(&mut self, op: ValueId) -> usize {
        self.results.push(op);
        self.results.len() - 1
    }

    /// Number of node `lower` calls issued by this context.
    pub fn lowered_node_count(&self) -> usize {
        self.lowered_nodes
    }

    pub fn build(self) -> Result<LoweredProgram> {
        let function = self
            .builder
            .finish(self.name.clone(), self.results)
            .with_context(|| format!("finishing @{}", self.name))?;
        validate_function_topology(&function)
            .with_context(|| format!("validating @{}", self.name))?;
        Ok(LoweredProgram {
            program: Program::new(self.name).with_functions(vec![function]),
            parameter_data: self.parameter_data,
        })
    }

    fn lower_pending(&mut self, node: &NodePtr) -> Result<()> {
        let outputs = node.lower(self).with_context(|| format!("lowering {node}"))?;
        ensure!(
            outputs.len() == node.num_outputs(),
            "{node} lowered to {} values for {} outputs",
            outputs.len(),
            node.num_outputs()
        );
        for (index, id) in outputs.into_iter().enumerate() {
            self.emitted.insert((node.id(), index), id);
        }
        self.lowered.insert(node.id());
        self.lowered_nodes += 1;
        Ok(())
    }
}
