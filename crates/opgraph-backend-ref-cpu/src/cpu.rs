use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use opgraph::backend::client::{ClientError, ClientResult, ComputationClient, DataHandle, DeviceBuffer};
use opgraph::backend::device::{Device, DeviceType};
use opgraph::backend::spec::{
    BroadcastToSpec, CastSpec, DType, ElementwiseBinaryOp, ElementwiseUnaryOp, Function,
    Instruction, LeakyReluSpec, Operand, Operation, Program, ReduceKind, ReduceSpec, ReshapeSpec,
    ReverseSpec, Shape, SoftshrinkSpec, TensorLiteral, TensorSpec, ValueId,
};
use opgraph::backend::topology::validate_function_topology;

#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si32(Arc<[i32]>),
    Bool(Arc<[u8]>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    /// Element `sources[i]` of `self` becomes element `i` of the result.
    fn gather(&self, sources: &[usize]) -> TensorData {
        match self {
            TensorData::F32(values) => TensorData::F32(sources.iter().map(|&i| values[i]).collect()),
            TensorData::Si32(values) => {
                TensorData::Si32(sources.iter().map(|&i| values[i]).collect())
            }
            TensorData::Bool(values) => {
                TensorData::Bool(sources.iter().map(|&i| values[i]).collect())
            }
        }
    }
}

/// Buffer living in host memory, tagged with the device it was placed on.
#[derive(Debug)]
pub struct CpuBuffer {
    device: Device,
    tensor: CpuTensor,
}

impl CpuBuffer {
    pub fn tensor(&self) -> &CpuTensor {
        &self.tensor
    }
}

impl DeviceBuffer for CpuBuffer {
    fn device(&self) -> &Device {
        &self.device
    }

    fn spec(&self) -> &TensorSpec {
        &self.tensor.spec
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Validated program ready for interpretation.
pub struct CpuComputation {
    program: Arc<Program>,
    entry: usize,
    fingerprint: u64,
}

impl CpuComputation {
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    fn entry(&self) -> &Function {
        &self.program.functions[self.entry]
    }
}

/// Interpreter over host memory serving every `CPU:n` device.
#[derive(Debug, Clone, Default)]
pub struct CpuClient;

impl CpuClient {
    pub fn new() -> Self {
        CpuClient
    }

    pub fn buffer_from_f32(&self, device: &Device, dims: &[usize], values: &[f32]) -> ClientResult<DataHandle> {
        self.transfer(TensorLiteral::from_f32(Shape::new(dims), values), device)
    }

    pub fn read_f32(&self, data: &DataHandle) -> ClientResult<Vec<f32>> {
        let literal = self.to_literal(data)?;
        literal.to_f32_vec().ok_or_else(|| {
            ClientError::transfer(data.device(), format!("{} is not an f32 buffer", literal.spec))
        })
    }
}

fn ensure_cpu(device: &Device) -> Result<(), String> {
    if device.hw_type == DeviceType::Cpu {
        Ok(())
    } else {
        Err(format!("cpu client cannot target {device}"))
    }
}

impl ComputationClient for CpuClient {
    type Computation = CpuComputation;

    fn name(&self) -> &str {
        "cpu"
    }

    fn compile(
        &self,
        program: &Program,
        device: &Device,
        devices: &[Device],
    ) -> ClientResult<CpuComputation> {
        ensure_cpu(device).map_err(|message| ClientError::compile(device, message))?;
        for replica in devices {
            ensure_cpu(replica).map_err(|message| ClientError::compile(device, message))?;
        }
        let entry = program
            .functions
            .iter()
            .position(|function| function.name == program.entry)
            .ok_or_else(|| {
                ClientError::compile(device, format!("entry function @{} not found", program.entry))
            })?;
        validate_function_topology(&program.functions[entry])
            .map_err(|err| ClientError::compile(device, err.to_string()))?;
        let fingerprint = program
            .fingerprint()
            .map_err(|err| ClientError::compile(device, format!("fingerprint failed: {err}")))?;
        tracing::trace!(entry = %program.entry, fingerprint, "compiled cpu program");
        Ok(CpuComputation {
            program: Arc::new(program.clone()),
            entry,
            fingerprint,
        })
    }

    fn execute(
        &self,
        computation: &CpuComputation,
        inputs: &[DataHandle],
        device: &Device,
    ) -> ClientResult<Vec<DataHandle>> {
        ensure_cpu(device).map_err(|message| ClientError::execution(device, message))?;
        let function = computation.entry();
        if function.parameters.len() != inputs.len() {
            return Err(ClientError::execution(
                device,
                format!(
                    "@{} expects {} inputs, got {}",
                    function.name,
                    function.parameters.len(),
                    inputs.len()
                ),
            ));
        }
        let mut tensors = Vec::with_capacity(inputs.len());
        for (index, (input, expected)) in inputs.iter().zip(&function.parameters).enumerate() {
            let buffer = input
                .as_any()
                .downcast_ref::<CpuBuffer>()
                .ok_or_else(|| ClientError::execution(device, format!("input {index} is not a cpu buffer")))?;
            if buffer.device() != device {
                return Err(ClientError::execution(
                    device,
                    format!("input {index} lives on {}", buffer.device()),
                ));
            }
            if buffer.spec() != expected {
                return Err(ClientError::execution(
                    device,
                    format!("input {index} is {}, expected {expected}", buffer.spec()),
                ));
            }
            tensors.push(buffer.tensor.clone());
        }
        let outputs = run_function(function, tensors, device)?;
        Ok(outputs
            .into_iter()
            .map(|tensor| {
                Arc::new(CpuBuffer {
                    device: device.clone(),
                    tensor,
                }) as DataHandle
            })
            .collect())
    }

    fn transfer(&self, literal: TensorLiteral, device: &Device) -> ClientResult<DataHandle> {
        ensure_cpu(device).map_err(|message| ClientError::transfer(device, message))?;
        let tensor = literal_to_tensor(&literal).map_err(|err| match err {
            KernelError::Invalid(message) => ClientError::transfer(device, message),
            KernelError::Unsupported { op, reason } => ClientError::unimplemented(op, reason),
        })?;
        Ok(Arc::new(CpuBuffer {
            device: device.clone(),
            tensor,
        }))
    }

    fn to_literal(&self, data: &DataHandle) -> ClientResult<TensorLiteral> {
        let buffer = data
            .as_any()
            .downcast_ref::<CpuBuffer>()
            .ok_or_else(|| ClientError::transfer(data.device(), "not a cpu buffer"))?;
        Ok(tensor_to_literal(&buffer.tensor))
    }
}

#[derive(Debug)]
enum KernelError {
    Invalid(String),
    Unsupported { op: &'static str, reason: String },
}

type KernelResult<T> = Result<T, KernelError>;

fn invalid<T>(message: impl Into<String>) -> KernelResult<T> {
    Err(KernelError::Invalid(message.into()))
}

fn run_function(
    function: &Function,
    inputs: Vec<CpuTensor>,
    device: &Device,
) -> ClientResult<Vec<CpuTensor>> {
    let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
    for (id, tensor) in function.parameter_ids.iter().zip(inputs) {
        values.insert(*id, tensor);
    }
    for instruction in &function.body {
        let mut operands = Vec::with_capacity(instruction.operands.len());
        for operand in &instruction.operands {
            let tensor = match operand {
                Operand::Value(id) => values.get(id).cloned().ok_or_else(|| {
                    ClientError::execution(device, format!("operand %{} missing", id.0))
                })?,
                Operand::Literal(literal) => literal_to_tensor(literal)
                    .map_err(|err| augment_error(err, function, instruction, device))?,
            };
            operands.push(tensor);
        }
        let output = execute_instruction(instruction, &operands)
            .map_err(|err| augment_error(err, function, instruction, device))?;
        values.insert(instruction.id, output);
    }
    function
        .result_ids
        .iter()
        .map(|id| {
            values.get(id).cloned().ok_or_else(|| {
                ClientError::execution(device, format!("result %{} missing", id.0))
            })
        })
        .collect()
}

fn augment_error(
    err: KernelError,
    function: &Function,
    instruction: &Instruction,
    device: &Device,
) -> ClientError {
    match err {
        KernelError::Invalid(message) => ClientError::execution(
            device,
            format!(
                "@{} %{} = {} -> {}: {message}",
                function.name,
                instruction.id.0,
                instruction.op.name(),
                instruction.output
            ),
        ),
        KernelError::Unsupported { op, reason } => ClientError::unimplemented(op, reason),
    }
}

fn execute_instruction(instruction: &Instruction, inputs: &[CpuTensor]) -> KernelResult<CpuTensor> {
    let output = &instruction.output;
    let tensor = match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal)?,
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs, output, *op)?,
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, output, *op)?,
        Operation::LeakyRelu(spec) => op_leaky_relu(inputs, output, spec)?,
        Operation::Softshrink(spec) => op_softshrink(inputs, output, spec)?,
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec)?,
        Operation::Reshape(spec) => op_reshape(inputs, output, spec)?,
        Operation::Reverse(spec) => op_reverse(inputs, output, spec)?,
        Operation::Reduce(spec) => op_reduce(inputs, output, spec)?,
        Operation::Cast(spec) => op_cast(inputs, output, spec)?,
    };
    if tensor.data.len() != output.element_count() {
        return invalid(format!(
            "produced {} elements for {}",
            tensor.data.len(),
            output
        ));
    }
    Ok(tensor)
}

fn literal_to_tensor(literal: &TensorLiteral) -> KernelResult<CpuTensor> {
    if literal.byte_len() != literal.spec.byte_len() {
        return invalid(format!(
            "literal of {} carries {} bytes",
            literal.spec,
            literal.byte_len()
        ));
    }
    let data = match literal.spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(literal.to_f32_vec().unwrap_or_default())),
        DType::Si32 => TensorData::Si32(Arc::from(literal.to_i32_vec().unwrap_or_default())),
        DType::I1 => TensorData::Bool(Arc::clone(&literal.bytes)),
    };
    Ok(CpuTensor {
        spec: literal.spec.clone(),
        data,
    })
}

fn tensor_to_literal(tensor: &CpuTensor) -> TensorLiteral {
    match &tensor.data {
        TensorData::F32(values) => TensorLiteral::from_f32(tensor.spec.shape.clone(), values),
        TensorData::Si32(values) => TensorLiteral::from_i32(tensor.spec.shape.clone(), values),
        TensorData::Bool(values) => TensorLiteral::new(tensor.spec.clone(), Arc::clone(values)),
    }
}

fn expect_single(inputs: &[CpuTensor]) -> KernelResult<&CpuTensor> {
    match inputs {
        [input] => Ok(input),
        _ => invalid(format!("expected one operand, got {}", inputs.len())),
    }
}

fn expect_f32(tensor: &CpuTensor) -> KernelResult<&[f32]> {
    match &tensor.data {
        TensorData::F32(values) => Ok(&values[..]),
        _ => invalid(format!("expected an f32 operand, got {}", tensor.spec)),
    }
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseUnaryOp,
) -> KernelResult<CpuTensor> {
    let values = expect_f32(expect_single(inputs)?)?;
    let f: fn(f32) -> f32 = match op {
        ElementwiseUnaryOp::Neg => |x| -x,
        ElementwiseUnaryOp::Abs => f32::abs,
        ElementwiseUnaryOp::Exp => f32::exp,
        ElementwiseUnaryOp::Log => f32::ln,
        ElementwiseUnaryOp::Tanh => f32::tanh,
        ElementwiseUnaryOp::Rsqrt => |x| 1.0 / x.sqrt(),
        ElementwiseUnaryOp::Reciprocal => |x| 1.0 / x,
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::F32(values.iter().map(|&x| f(x)).collect()),
    })
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> KernelResult<CpuTensor> {
    let [lhs, rhs] = inputs else {
        return invalid(format!("expected two operands, got {}", inputs.len()));
    };
    if lhs.data.len() != rhs.data.len() {
        return invalid(format!("operand sizes differ: {} vs {}", lhs.spec, rhs.spec));
    }
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(
            a.iter()
                .zip(b.iter())
                .map(|(&x, &y)| match op {
                    ElementwiseBinaryOp::Add => x + y,
                    ElementwiseBinaryOp::Sub => x - y,
                    ElementwiseBinaryOp::Mul => x * y,
                    ElementwiseBinaryOp::Div => x / y,
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                })
                .collect(),
        ),
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            let mut result = Vec::with_capacity(a.len());
            for (&x, &y) in a.iter().zip(b.iter()) {
                result.push(match op {
                    ElementwiseBinaryOp::Add => x.wrapping_add(y),
                    ElementwiseBinaryOp::Sub => x.wrapping_sub(y),
                    ElementwiseBinaryOp::Mul => x.wrapping_mul(y),
                    ElementwiseBinaryOp::Div => match x.checked_div(y) {
                        Some(value) => value,
                        None => return invalid("integer division by zero"),
                    },
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                });
            }
            TensorData::Si32(Arc::from(result))
        }
        _ => {
            return Err(KernelError::Unsupported {
                op: "elementwise_binary",
                reason: format!("operands {} and {}", lhs.spec, rhs.spec),
            })
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_leaky_relu(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &LeakyReluSpec,
) -> KernelResult<CpuTensor> {
    let values = expect_f32(expect_single(inputs)?)?;
    let slope = spec.negative_slope as f32;
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::F32(
            values
                .iter()
                .map(|&x| if x > 0.0 { x } else { x * slope })
                .collect(),
        ),
    })
}

fn op_softshrink(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &SoftshrinkSpec,
) -> KernelResult<CpuTensor> {
    let values = expect_f32(expect_single(inputs)?)?;
    let lambda = spec.lambda as f32;
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::F32(
            values
                .iter()
                .map(|&x| {
                    if x > lambda {
                        x - lambda
                    } else if x < -lambda {
                        x + lambda
                    } else {
                        0.0
                    }
                })
                .collect(),
        ),
    })
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> KernelResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let in_dims = input.spec.shape.dims();
    let out_dims = output.shape.dims();
    if out_dims != spec.result_shape.dims() {
        return invalid("broadcast_to result shape mismatch");
    }
    if out_dims.len() < in_dims.len() {
        return invalid("broadcast_to result rank must be >= operand rank");
    }
    let rank_diff = out_dims.len() - in_dims.len();
    let mut aligned = vec![1usize; out_dims.len()];
    aligned[rank_diff..].copy_from_slice(in_dims);
    for (axis, (&dim, &out_dim)) in aligned.iter().zip(out_dims).enumerate() {
        if dim != 1 && dim != out_dim {
            return invalid(format!("broadcast_to dimension {axis} is {dim}, target {out_dim}"));
        }
    }
    let in_strides = compute_strides(&aligned);
    let sources: Vec<usize> = (0..output.element_count())
        .map(|index| {
            unravel_index(index, out_dims)
                .iter()
                .zip(&aligned)
                .zip(&in_strides)
                .map(|((&coord, &dim), &stride)| if dim == 1 { 0 } else { coord * stride })
                .sum()
        })
        .collect();
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.gather(&sources),
    })
}

fn op_reshape(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReshapeSpec,
) -> KernelResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if spec.new_shape != output.shape {
        return invalid("reshape target mismatch");
    }
    if input.spec.element_count() != output.element_count() {
        return invalid(format!("cannot reshape {} to {}", input.spec, output));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.clone(),
    })
}

fn op_reverse(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReverseSpec,
) -> KernelResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.spec.shape.dims();
    if let Some(axis) = spec.axes.iter().find(|axis| **axis >= dims.len()) {
        return invalid(format!("reverse axis {axis} out of range"));
    }
    let strides = compute_strides(dims);
    let sources: Vec<usize> = (0..input.spec.element_count())
        .map(|index| {
            let mut coords = unravel_index(index, dims);
            for axis in &spec.axes {
                coords[*axis] = dims[*axis] - 1 - coords[*axis];
            }
            coords.iter().zip(&strides).map(|(c, s)| c * s).sum()
        })
        .collect();
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.gather(&sources),
    })
}

fn op_reduce(inputs: &[CpuTensor], output: &TensorSpec, spec: &ReduceSpec) -> KernelResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.spec.shape.dims();
    if let Some(axis) = spec.axes.iter().find(|axis| **axis >= dims.len()) {
        return invalid(format!("reduce axis {axis} out of range"));
    }
    let kept: Vec<usize> = dims
        .iter()
        .enumerate()
        .map(|(axis, dim)| if spec.axes.contains(&axis) { 1 } else { *dim })
        .collect();
    let out_strides = compute_strides(&kept);
    let targets: Vec<usize> = (0..input.spec.element_count())
        .map(|index| {
            unravel_index(index, dims)
                .iter()
                .zip(&kept)
                .zip(&out_strides)
                .map(|((&coord, &dim), &stride)| if dim == 1 { 0 } else { coord * stride })
                .sum()
        })
        .collect();
    let out_len: usize = kept.iter().product();
    let data = match &input.data {
        TensorData::F32(values) => {
            let (init, combine): (f32, fn(f32, f32) -> f32) = match spec.kind {
                ReduceKind::Sum => (0.0, |a, b| a + b),
                ReduceKind::Prod => (1.0, |a, b| a * b),
                ReduceKind::Max => (f32::NEG_INFINITY, f32::max),
                ReduceKind::Min => (f32::INFINITY, f32::min),
            };
            TensorData::F32(Arc::from(accumulate(values, &targets, out_len, init, combine)))
        }
        TensorData::Si32(values) => {
            let (init, combine): (i32, fn(i32, i32) -> i32) = match spec.kind {
                ReduceKind::Sum => (0, i32::wrapping_add),
                ReduceKind::Prod => (1, i32::wrapping_mul),
                ReduceKind::Max => (i32::MIN, std::cmp::max),
                ReduceKind::Min => (i32::MAX, std::cmp::min),
            };
            TensorData::Si32(Arc::from(accumulate(values, &targets, out_len, init, combine)))
        }
        TensorData::Bool(_) => {
            return Err(KernelError::Unsupported {
                op: "reduce",
                reason: "predicate reductions".to_string(),
            })
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn accumulate<T: Copy>(
    values: &[T],
    targets: &[usize],
    out_len: usize,
    init: T,
    combine: fn(T, T) -> T,
) -> Vec<T> {
    let mut result = vec![init; out_len];
    for (value, target) in values.iter().zip(targets) {
        result[*target] = combine(result[*target], *value);
    }
    result
}

fn f32_to_i32_trunc_saturating(value: f32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    let truncated = value.trunc();
    if truncated > i32::MAX as f32 {
        i32::MAX
    } else if truncated < i32::MIN as f32 {
        i32::MIN
    } else {
        truncated as i32
    }
}

fn op_cast(inputs: &[CpuTensor], output: &TensorSpec, spec: &CastSpec) -> KernelResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if output.dtype != spec.dtype {
        return invalid("cast output dtype mismatch");
    }
    if input.spec.shape != output.shape {
        return invalid("cast shape mismatch");
    }
    let data = match (&input.data, spec.dtype) {
        (TensorData::F32(_), DType::F32)
        | (TensorData::Si32(_), DType::Si32)
        | (TensorData::Bool(_), DType::I1) => input.data.clone(),
        (TensorData::Si32(values), DType::F32) => {
            TensorData::F32(values.iter().map(|&x| x as f32).collect())
        }
        (TensorData::Bool(values), DType::F32) => {
            TensorData::F32(values.iter().map(|&x| f32::from(x != 0)).collect())
        }
        (TensorData::F32(values), DType::Si32) => TensorData::Si32(
            values
                .iter()
                .map(|&x| f32_to_i32_trunc_saturating(x))
                .collect(),
        ),
        (TensorData::Bool(values), DType::Si32) => {
            TensorData::Si32(values.iter().map(|&x| i32::from(x != 0)).collect())
        }
        (TensorData::F32(values), DType::I1) => {
            TensorData::Bool(values.iter().map(|&x| u8::from(x != 0.0)).collect())
        }
        (TensorData::Si32(values), DType::I1) => {
            TensorData::Bool(values.iter().map(|&x| u8::from(x != 0)).collect())
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}
