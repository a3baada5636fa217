//! Leaf nodes: device-resident inputs and broadcast scalar constants.

use std::any::Any;
use std::fmt;

use anyhow::Result;

use crate::backend::client::{data_identity, DataHandle};
use crate::backend::hashing::hash_value;
use crate::backend::spec::{TensorLiteral, TensorSpec, ValueId};
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{Node, NodeKind, NodePtr, Value};
use crate::ir::op_kind::OpKind;

/// Tensor already materialized on a device. Lowered as a program parameter.
///
/// The structural hash covers only the spec, so graphs over different buffers of the same spec
/// share compiled programs.
pub struct DeviceData {
    data: DataHandle,
}

impl DeviceData {
    pub fn create(data: DataHandle) -> NodePtr {
        let spec = data.spec().clone();
        Node::new(OpKind::prim("device_data"), [], spec, 1, 0, DeviceData { data })
    }

    pub fn data(&self) -> &DataHandle {
        &self.data
    }
}

impl NodeKind for DeviceData {
    fn lower(&self, _node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        Ok(vec![ctx.get_parameter(&self.data)])
    }

    fn clone_with(&self, _node: &Node, _operands: &[Value]) -> NodePtr {
        DeviceData::create(DataHandle::clone(&self.data))
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", device={}", self.data.device())
    }

    fn data_identity(&self) -> Option<usize> {
        Some(data_identity(&self.data))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn device_data(data: DataHandle) -> Value {
    Value::from(DeviceData::create(data))
}

/// Constant `value` broadcast to `spec`.
pub struct Scalar {
    value: f64,
}

impl Scalar {
    pub fn create(value: f64, spec: TensorSpec) -> NodePtr {
        Node::new(
            OpKind::prim("scalar"),
            [],
            spec,
            1,
            hash_value(&value),
            Scalar { value },
        )
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl NodeKind for Scalar {
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        let literal = TensorLiteral::splat(node.shape(0).clone(), self.value);
        Ok(vec![ctx.constant(literal)])
    }

    fn clone_with(&self, node: &Node, _operands: &[Value]) -> NodePtr {
        Scalar::create(self.value, node.shape(0).clone())
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", value={}", self.value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn scalar(value: f64, spec: TensorSpec) -> Value {
    Value::from(Scalar::create(value, spec))
}
