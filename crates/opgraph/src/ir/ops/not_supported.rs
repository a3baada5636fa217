use std::any::Any;
use std::fmt;

use anyhow::{bail, Result};

use crate::backend::hashing::hash_value;
use crate::backend::spec::{TensorSpec, ValueId};
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{Node, NodeKind, NodePtr, Value};
use crate::ir::op_kind::OpKind;

/// Placeholder for an operation the graph can describe but no backend can lower.
pub struct NotSupported {
    description: String,
}

impl NotSupported {
    pub fn create(
        description: impl Into<String>,
        operands: impl IntoIterator<Item = Value>,
        spec: TensorSpec,
    ) -> NodePtr {
        let description = description.into();
        Node::new(
            OpKind::prim("not_supported"),
            operands,
            spec,
            1,
            hash_value(&description),
            NotSupported { description },
        )
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl NodeKind for NotSupported {
    fn lower(&self, node: &Node, _ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        bail!("{} cannot be lowered: {}", node.op(), self.description)
    }

    fn clone_with(&self, node: &Node, operands: &[Value]) -> NodePtr {
        NotSupported::create(
            self.description.clone(),
            operands.iter().cloned(),
            node.shape(0).clone(),
        )
    }

    fn fmt_metadata(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ", description={}", self.description)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn not_supported(
    description: impl Into<String>,
    operands: impl IntoIterator<Item = Value>,
    spec: TensorSpec,
) -> Value {
    Value::from(NotSupported::create(description, operands, spec))
}
