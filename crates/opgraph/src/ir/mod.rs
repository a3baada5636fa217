//! Immutable tensor IR: interned op kinds, structurally hashed nodes, lowering into programs.
pub mod lowering;
pub mod node;
pub mod op_kind;
pub mod ops;
pub mod util;

pub use lowering::{LoweredProgram, LoweringContext};
pub use node::{Node, NodeId, NodeKind, NodePtr, NodeShape, ShapeFn, Value};
pub use op_kind::OpKind;
pub use util::{deduplicate, graph_size, post_order};
