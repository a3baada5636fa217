use std::any::Any;
use std::fmt;

use anyhow::Result;

use crate::backend::spec::{
    CastSpec, DType, Operation, ReduceKind, ReduceSpec, Shape, TensorSpec, ValueId,
};
use crate::fingerprint;
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{Node, NodeKind, NodePtr, NodeShape, Value};
use crate::ir::op_kind::OpKind;

use super::check_dimensions;

/// Product over `dimensions` (every dimension when empty), optionally computed in `dtype`.
pub struct Prod {
    dimensions: Vec<usize>,
    keep_reduced_dimensions: bool,
    dtype: Option<DType>,
}

fn reduced_shape(input: &Shape, axes: &[usize], keepdims: bool) -> Shape {
    let dims = input
        .dims()
        .iter()
        .enumerate()
        .filter_map(|(axis, dim)| match (axes.contains(&axis), keepdims) {
            (false, _) => Some(*dim),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect::<Vec<_>>();
    Shape::new(dims)
}

impl Prod {
    pub fn create(
        input: &Value,
        dimensions: Vec<usize>,
        keep_reduced_dimensions: bool,
        dtype: Option<DType>,
    ) -> NodePtr {
        let seed = fingerprint!(dimensions, keep_reduced_dimensions, dtype);
        let operand = input.clone();
        let axes = dimensions.clone();
        let shape = NodeShape::deferred(move || {
            let spec = operand.spec();
            let axes = resolve_axes(spec.shape.rank(), &axes);
            check_dimensions(spec.shape.rank(), &axes)?;
            Ok(TensorSpec::new(
                dtype.unwrap_or(spec.dtype),
                reduced_shape(&spec.shape, &axes, keep_reduced_dimensions),
            ))
        });
        Node::new(
            OpKind::ops("prod"),
            [input.clone()],
            shape,
            1,
            seed,
            Prod {
                dimensions,
                keep_reduced_dimensions,
                dtype,
            },
        )
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    pub fn keep_reduced_dimensions(&self) -> bool {
        self.keep_reduced_dimensions
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }
}

fn resolve_axes(rank: usize, dimensions: &[usize]) -> Vec<usize> {
    if dimensions.is_empty() {
        (0..rank).collect()
    } else {
        dimensions.to_vec()
    }
}

impl NodeKind for Prod {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let input = node.operand(0);
        let output = node.shape(0).clone();
        let mut operand = ctx.get_output_op(input)?;
        if input.spec().dtype != output.dtype {
            operand = ctx.emit(
                Operation::Cast(CastSpec {
                    dtype: output.dtype,
                }),
                &[operand],
                TensorSpec::new(output.dtype, input.spec().shape.clone()),
            );
        }
        let axes = resolve_axes(input.spec().shape.rank(), &self.dimensions);
        Ok(vec![ctx.emit(
            Operation::Reduce(ReduceSpec {
                kind: ReduceKind::Prod,
                axes,
                keepdims: self.keep_reduced_dimensions,
            }),
            &[operand],
            output,
        )])
    }

    fn clone_with(&self, _node: &Node, operands: &[Value]) -> NodePtr {
        Prod::create(
            &operands[0],
            self.dimensions.clone(),
            self.keep_reduced_dimensions,
            self.dtype,
        )
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ", dimensions={:?}, keep_reduced_dimensions={}",
            self.dimensions, self.keep_reduced_dimensions
        )?;
        if let Some(dtype) = self.dtype {
            write!(f, ", dtype={dtype}")?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn prod(
    input: &Value,
    dimensions: Vec<usize>,
    keep_reduced_dimensions: bool,
    dtype: Option<DType>,
) -> Value {
    Value::from(Prod::create(
        input,
        dimensions,
        keep_reduced_dimensions,
        dtype,
    ))
}
