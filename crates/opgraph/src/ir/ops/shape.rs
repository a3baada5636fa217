//! Layout nodes: broadcasting, reversal, reshaping and extent queries.

use std::any::Any;
use std::fmt;

use anyhow::{ensure, Result};

use crate::backend::hashing::hash_value;
use crate::backend::spec::{
    BroadcastToSpec, DType, Operation, ReshapeSpec, ReverseSpec, Shape, TensorLiteral, TensorSpec,
    ValueId,
};
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{Node, NodeKind, NodePtr, NodeShape, Value};
use crate::ir::op_kind::OpKind;

use super::check_dimensions;

/// Broadcasts the input to `size`. Input dims align with the trailing dims of `size` and must
/// either match or be 1.
pub struct Expand {
    size: Vec<usize>,
}

fn expand_shape(input: &Shape, size: &[usize]) -> Result<Shape> {
    ensure!(
        input.rank() <= size.len(),
        "cannot expand {input} to lower rank {size:?}"
    );
    let offset = size.len() - input.rank();
    for (axis, dim) in input.dims().iter().enumerate() {
        let target = size[offset + axis];
        ensure!(
            *dim == target || *dim == 1,
            "cannot expand {input} to {size:?}: dimension {axis} is {dim}, target {target}"
        );
    }
    Ok(Shape::new(size.to_vec()))
}

impl Expand {
    pub fn create(input: &Value, size: Vec<usize>) -> NodePtr {
        let seed = hash_value(&size);
        let (operand, target) = (input.clone(), size.clone());
        let shape = NodeShape::deferred(move || {
            let spec = operand.spec();
            Ok(TensorSpec::new(spec.dtype, expand_shape(&spec.shape, &target)?))
        });
        Node::new(OpKind::ops("expand"), [input.clone()], shape, 1, seed, Expand { size })
    }

    pub fn size(&self) -> &[usize] {
        &self.size
    }
}

impl NodeKind for Expand {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let input = ctx.get_output_op(node.operand(0))?;
        let output = node.shape(0).clone();
        Ok(vec![ctx.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: output.shape.clone(),
            }),
            &[input],
            output,
        )])
    }

    fn clone_with(&self, _node: &Node, operands: &[Value]) -> NodePtr {
        Expand::create(&operands[0], self.size.clone())
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", size={:?}", self.size)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn expand(input: &Value, size: Vec<usize>) -> Value {
    Value::from(Expand::create(input, size))
}

/// Reverses the input along `dims`.
pub struct Flip {
    dims: Vec<usize>,
}

impl Flip {
    pub fn create(input: &Value, dims: Vec<usize>) -> NodePtr {
        let seed = hash_value(&dims);
        let (operand, axes) = (input.clone(), dims.clone());
        let shape = NodeShape::deferred(move || {
            let spec = operand.spec();
            check_dimensions(spec.shape.rank(), &axes)?;
            Ok(spec.clone())
        });
        Node::new(OpKind::ops("flip"), [input.clone()], shape, 1, seed, Flip { dims })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
}

impl NodeKind for Flip {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let input = ctx.get_output_op(node.operand(0))?;
        Ok(vec![ctx.emit(
            Operation::Reverse(ReverseSpec {
                axes: self.dims.clone(),
            }),
            &[input],
            node.shape(0).clone(),
        )])
    }

    fn clone_with(&self, _node: &Node, operands: &[Value]) -> NodePtr {
        Flip::create(&operands[0], self.dims.clone())
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", dims={:?}", self.dims)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn flip(input: &Value, dims: Vec<usize>) -> Value {
    Value::from(Flip::create(input, dims))
}

/// Reinterprets the input with `output_size`; the element count must be unchanged.
pub struct View {
    output_size: Vec<usize>,
}

impl View {
    pub fn create(input: &Value, output_size: Vec<usize>) -> NodePtr {
        let seed = hash_value(&output_size);
        let (operand, target) = (input.clone(), Shape::new(output_size.clone()));
        let shape = NodeShape::deferred(move || {
            let spec = operand.spec();
            ensure!(
                spec.shape.element_count() == target.element_count(),
                "cannot view {} as {target}",
                spec.shape
            );
            Ok(TensorSpec::new(spec.dtype, target.clone()))
        });
        Node::new(
            OpKind::ops("view"),
            [input.clone()],
            shape,
            1,
            seed,
            View { output_size },
        )
    }

    pub fn output_size(&self) -> &[usize] {
        &self.output_size
    }
}

impl NodeKind for View {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let input = ctx.get_output_op(node.operand(0))?;
        let output = node.shape(0).clone();
        Ok(vec![ctx.emit(
            Operation::Reshape(ReshapeSpec {
                new_shape: output.shape.clone(),
            }),
            &[input],
            output,
        )])
    }

    fn clone_with(&self, _node: &Node, operands: &[Value]) -> NodePtr {
        View::create(&operands[0], self.output_size.clone())
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", output_size={:?}", self.output_size)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn view(input: &Value, output_size: Vec<usize>) -> Value {
    Value::from(View::create(input, output_size))
}

/// Product of the input's extents along `dimensions`, as an `s32` scalar.
///
/// Extents are static, so the result lowers to a constant; the input is never read.
pub struct GetDimensionsSize {
    dimensions: Vec<usize>,
}

impl GetDimensionsSize {
    pub fn create(input: &Value, dimensions: Vec<usize>) -> NodePtr {
        let seed = hash_value(&dimensions);
        let (operand, axes) = (input.clone(), dimensions.clone());
        let shape = NodeShape::deferred(move || {
            check_dimensions(operand.spec().shape.rank(), &axes)?;
            Ok(TensorSpec::new(DType::Si32, Shape::scalar()))
        });
        Node::new(
            OpKind::prim("get_dimensions_size"),
            [input.clone()],
            shape,
            1,
            seed,
            GetDimensionsSize { dimensions },
        )
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }
}

impl NodeKind for GetDimensionsSize {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let dims = node.operand(0).spec().shape.dims();
        let size: usize = self.dimensions.iter().map(|dim| dims[*dim]).product();
        let size = i32::try_from(size)?;
        Ok(vec![
            ctx.constant(TensorLiteral::from_i32(Shape::scalar(), &[size]))
        ])
    }

    fn clone_with(&self, _node: &Node, operands: &[Value]) -> NodePtr {
        GetDimensionsSize::create(&operands[0], self.dimensions.clone())
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", dimensions={:?}", self.dimensions)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn get_dimensions_size(input: &Value, dimensions: Vec<usize>) -> Value {
    Value::from(GetDimensionsSize::create(input, dimensions))
}
