//! Nodes whose lowering is an arbitrary closure, and the arithmetic builders on top of them.

use std::any::Any;
use std::ops;
use std::sync::Arc;

use anyhow::Result;

use crate::backend::hashing::Fingerprint;
use crate::backend::spec::{ElementwiseBinaryOp, Operation, TensorSpec, ValueId};
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{Node, NodeKind, NodePtr, NodeShape, Value};
use crate::ir::op_kind::OpKind;

use super::{broadcast_shapes, coerce, promote_types};

pub type LowerFn = Arc<dyn Fn(&Node, &mut LoweringContext) -> Result<Vec<ValueId>> + Send + Sync>;

/// Node lowered by a caller-supplied function.
///
/// The lowering function does not take part in the structural hash; `hash_seed` has to
/// distinguish generic nodes sharing an op kind that lower differently.
#[derive(Clone)]
pub struct Generic {
    lower_fn: LowerFn,
    hash_seed: Fingerprint,
}

impl Generic {
    pub fn create(
        op: OpKind,
        operands: impl IntoIterator<Item = Value>,
        shape: impl Into<NodeShape>,
        num_outputs: usize,
        lower_fn: LowerFn,
        hash_seed: Fingerprint,
    ) -> NodePtr {
        Node::new(
            op,
            operands,
            shape,
            num_outputs,
            hash_seed,
            Generic {
                lower_fn,
                hash_seed,
            },
        )
    }

    pub fn hash_seed(&self) -> Fingerprint {
        self.hash_seed
    }
}

impl NodeKind for Generic {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        (self.lower_fn)(node, ctx)
    }

    fn clone_with(&self, node: &Node, operands: &[Value]) -> NodePtr {
        Node::new(
            node.op().clone(),
            operands.iter().cloned(),
            node.shapes().to_vec(),
            node.num_outputs(),
            self.hash_seed,
            self.clone(),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn binary_spec(lhs: &TensorSpec, rhs: &TensorSpec) -> Result<TensorSpec> {
    Ok(TensorSpec::new(
        promote_types(lhs.dtype, rhs.dtype),
        broadcast_shapes(&lhs.shape, &rhs.shape)?,
    ))
}

fn lower_binary(
    op: ElementwiseBinaryOp,
    node: &Node,
    ctx: &mut LoweringContext,
) -> Result<Vec<ValueId>> {
    let (lhs, rhs) = (node.operand(0), node.operand(1));
    let output = node.shape(0).clone();
    let lhs_id = ctx.get_output_op(lhs)?;
    let rhs_id = ctx.get_output_op(rhs)?;
    let lhs_id = coerce(ctx, lhs_id, lhs.spec(), &output);
    let rhs_id = coerce(ctx, rhs_id, rhs.spec(), &output);
    Ok(vec![ctx.emit(
        Operation::ElementwiseBinary(op),
        &[lhs_id, rhs_id],
        output,
    )])
}

fn binary(name: &str, op: ElementwiseBinaryOp, lhs: &Value, rhs: &Value) -> Value {
    let (l, r) = (lhs.clone(), rhs.clone());
    let shape = NodeShape::deferred(move || binary_spec(l.spec(), r.spec()));
    let lower_fn: LowerFn = Arc::new(move |node: &Node, ctx: &mut LoweringContext| {
        lower_binary(op, node, ctx)
    });
    Value::from(Generic::create(
        OpKind::ops(name),
        [lhs.clone(), rhs.clone()],
        shape,
        1,
        lower_fn,
        0,
    ))
}

pub fn add(lhs: &Value, rhs: &Value) -> Value {
    binary("add", ElementwiseBinaryOp::Add, lhs, rhs)
}

pub fn sub(lhs: &Value, rhs: &Value) -> Value {
    binary("sub", ElementwiseBinaryOp::Sub, lhs, rhs)
}

pub fn mul(lhs: &Value, rhs: &Value) -> Value {
    binary("mul", ElementwiseBinaryOp::Mul, lhs, rhs)
}

pub fn div(lhs: &Value, rhs: &Value) -> Value {
    binary("div", ElementwiseBinaryOp::Div, lhs, rhs)
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $builder:ident) => {
        impl ops::$trait<&Value> for &Value {
            type Output = Value;

            fn $method(self, rhs: &Value) -> Value {
                $builder(self, rhs)
            }
        }
    };
}

impl_binary_operator!(Add, add, add);
impl_binary_operator!(Sub, sub, sub);
impl_binary_operator!(Mul, mul, mul);
impl_binary_operator!(Div, div, div);
