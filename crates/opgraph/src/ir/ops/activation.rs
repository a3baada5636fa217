use std::any::Any;
use std::fmt;

use anyhow::{ensure, Result};

use crate::backend::hashing::hash_value;
use crate::backend::spec::{LeakyReluSpec, Operation, SoftshrinkSpec, ValueId};
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{Node, NodeKind, NodePtr, Value};
use crate::ir::op_kind::OpKind;

use super::same_shape_as;

/// `x` for positive inputs, `negative_slope * x` otherwise.
pub struct LeakyRelu {
    negative_slope: f64,
}

impl LeakyRelu {
    pub fn create(input: &Value, negative_slope: f64) -> NodePtr {
        Node::new(
            OpKind::ops("leaky_relu"),
            [input.clone()],
            same_shape_as(input),
            1,
            hash_value(&negative_slope),
            LeakyRelu { negative_slope },
        )
    }

    pub fn negative_slope(&self) -> f64 {
        self.negative_slope
    }
}

impl NodeKind for LeakyRelu {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let input = node.operand(0);
        ensure!(
            input.spec().dtype.is_float(),
            "leaky_relu expects a float input, got {}",
            input.spec()
        );
        let operand = ctx.get_output_op(input)?;
        Ok(vec![ctx.emit(
            Operation::LeakyRelu(LeakyReluSpec {
                negative_slope: self.negative_slope,
            }),
            &[operand],
            node.shape(0).clone(),
        )])
    }

    fn clone_with(&self, _node: &Node, operands: &[Value]) -> NodePtr {
        LeakyRelu::create(&operands[0], self.negative_slope)
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", negative_slope={}", self.negative_slope)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn leaky_relu(input: &Value, negative_slope: f64) -> Value {
    Value::from(LeakyRelu::create(input, negative_slope))
}

/// Shrinks inputs towards zero by `lambda`, zeroing everything inside `[-lambda, lambda]`.
pub struct Softshrink {
    lambda: f64,
}

impl Softshrink {
    pub fn create(input: &Value, lambda: f64) -> NodePtr {
        Node::new(
            OpKind::ops("softshrink"),
            [input.clone()],
            same_shape_as(input),
            1,
            hash_value(&lambda),
            Softshrink { lambda },
        )
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }
}

impl NodeKind for Softshrink {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let input = node.operand(0);
        ensure!(
            input.spec().dtype.is_float(),
            "softshrink expects a float input, got {}",
            input.spec()
        );
        let operand = ctx.get_output_op(input)?;
        Ok(vec![ctx.emit(
            Operation::Softshrink(SoftshrinkSpec {
                lambda: self.lambda,
            }),
            &[operand],
            node.shape(0).clone(),
        )])
    }

    fn clone_with(&self, _node: &Node, operands: &[Value]) -> NodePtr {
        Softshrink::create(&operands[0], self.lambda)
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", lambda={}", self.lambda)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn softshrink(input: &Value, lambda: f64) -> Value {
    Value::from(Softshrink::create(input, lambda))
}
