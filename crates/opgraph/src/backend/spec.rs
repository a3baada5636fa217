//! Backend-facing program description.
//!
//! A [`Program`] is what the lowering context produces and what a
//! [`ComputationClient`](crate::backend::client::ComputationClient) compiles. Programs are plain
//! SSA data: a list of functions, each with typed parameters, a body of [`Instruction`]s in
//! dependency order, and result value ids.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{ser::SerializeStruct, Serialize};
use thiserror::Error;

use crate::backend::hashing::{fnv1a_hash, FingerprintHasher, StructuralHash};

/// Scalar element types understood by the program description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    F32,
    Si32,
    I1,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::Si32 => 4,
            DType::I1 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::Si32 => "s32",
            DType::I1 => "pred",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical tensor shape as an ordered list of static extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (index, dim) in self.dims.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn f32(dims: impl Into<Vec<usize>>) -> Self {
        Self::new(DType::F32, Shape::new(dims))
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

impl StructuralHash for DType {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_str(self.name());
    }
}

impl StructuralHash for Shape {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write(&self.dims);
    }
}

impl StructuralHash for TensorSpec {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write(&self.dtype);
        hasher.write(&self.shape);
    }
}

/// Dense literal tensor payload, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(TensorSpec::new(DType::F32, shape), Arc::from(bytes))
    }

    pub fn from_i32(shape: Shape, values: &[i32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(TensorSpec::new(DType::Si32, shape), Arc::from(bytes))
    }

    /// Fills `spec` with a single scalar value converted to its dtype.
    pub fn splat(spec: TensorSpec, value: f64) -> Self {
        let count = spec.element_count();
        let mut bytes = Vec::with_capacity(spec.byte_len());
        for _ in 0..count {
            match spec.dtype {
                DType::F32 => bytes.extend_from_slice(&(value as f32).to_le_bytes()),
                DType::Si32 => bytes.extend_from_slice(&(value as i32).to_le_bytes()),
                DType::I1 => bytes.push(u8::from(value != 0.0)),
            }
        }
        Self::new(spec, Arc::from(bytes))
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Decodes an `F32` payload; `None` for any other dtype.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.spec.dtype != DType::F32 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }

    /// Decodes an `Si32` payload; `None` for any other dtype.
    pub fn to_i32_vec(&self) -> Option<Vec<i32>> {
        if self.spec.dtype != DType::Si32 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Rsqrt,
    Reciprocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReduceKind {
    Sum,
    Prod,
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReshapeSpec {
    pub new_shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReverseSpec {
    pub axes: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeakyReluSpec {
    pub negative_slope: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SoftshrinkSpec {
    pub lambda: f64,
}

/// Unique identifier for SSA values inside one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ValueId(pub u32);

/// Operand reference in an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Operand {
    Value(ValueId),
    Literal(TensorLiteral),
}

/// Declarative form of the operations a backend has to support.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    LeakyRelu(LeakyReluSpec),
    Softshrink(SoftshrinkSpec),
    BroadcastTo(BroadcastToSpec),
    Reshape(ReshapeSpec),
    Reverse(ReverseSpec),
    Reduce(ReduceSpec),
    Cast(CastSpec),
}

impl Operation {
    /// Stable short name used in diagnostics and profiling labels.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(_) => "elementwise_unary",
            Operation::ElementwiseBinary(_) => "elementwise_binary",
            Operation::LeakyRelu(_) => "leaky_relu",
            Operation::Softshrink(_) => "softshrink",
            Operation::BroadcastTo(_) => "broadcast_to",
            Operation::Reshape(_) => "reshape",
            Operation::Reverse(_) => "reverse",
            Operation::Reduce(_) => "reduce",
            Operation::Cast(_) => "cast",
        }
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: TensorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

/// Complete program handed to a computation client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramBuildError {
    #[error("result value %{0:?} was never defined")]
    UndefinedResult(ValueId),
    #[error("operand value %{0:?} was never defined")]
    UndefinedOperand(ValueId),
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }

    /// Structural fingerprint of the serialized program.
    pub fn fingerprint(&self) -> Result<u64, bincode::Error> {
        let bytes = bincode::serialize(self)?;
        Ok(fnv1a_hash(&bytes))
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("program @{} {{", self.entry))?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_line(f, indent, &format!("func @{} {{", function.name))?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, spec) in function
            .parameter_ids
            .iter()
            .zip(function.parameters.iter())
        {
            write_line(f, indent + 2, &format!("%{} : {}", value_id.0, spec))?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !function.result_ids.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (value_id, spec) in function.result_ids.iter().zip(function.results.iter()) {
            write_line(f, indent + 2, &format!("%{} : {}", value_id.0, spec))?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(format_operand)
        .collect::<Vec<_>>()
        .join(", ");
    let op_repr = format!("{:?}", instruction.op);
    let line = if operands.is_empty() {
        format!("%{} = {} -> {}", instruction.id.0, op_repr, instruction.output)
    } else {
        format!(
            "%{} = {}({}) -> {}",
            instruction.id.0, op_repr, operands, instruction.output
        )
    };
    write_line(f, indent, &line)
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => format!("%{}", id.0),
        Operand::Literal(lit) => format!("literal({})", lit.spec),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Lightweight builder for constructing functions programmatically.
#[derive(Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, TensorSpec)>,
    instructions: Vec<Instruction>,
    value_specs: HashMap<ValueId, TensorSpec>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueId {
        let id = self.next_id();
        self.value_specs.insert(id, spec.clone());
        self.parameters.push((id, spec));
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: TensorSpec) -> ValueId {
        let id = self.next_id();
        self.value_specs.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_spec(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value_specs.get(&id)
    }

    pub fn finish(
        self,
        name: impl Into<String>,
        result_ids: Vec<ValueId>,
    ) -> Result<Function, ProgramBuildError> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let spec = self
                .value_specs
                .get(id)
                .ok_or(ProgramBuildError::UndefinedResult(*id))?;
            results.push(spec.clone());
        }
        for instruction in &self.instructions {
            for operand in &instruction.operands {
                if let Operand::Value(id) = operand {
                    if !self.value_specs.contains_key(id) {
                        return Err(ProgramBuildError::UndefinedOperand(*id));
                    }
                }
            }
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        })
    }

    fn next_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }
}
