//! Immutable, structurally hashed graph nodes and the values flowing between them.
//!
//! A [`Node`] is built once and never mutated. It shares its operands through [`Value`]s, so a
//! graph is a DAG of reference-counted nodes. Two fingerprints are computed at construction:
//!
//! - `node_hash` covers the operation and its metadata (and the output shape for leaves),
//! - `hash` folds every operand's structural hash into `node_hash`.
//!
//! Independently built subgraphs describing the same computation therefore hash identically,
//! which is what per-context lowering memoization, [`deduplicate`](crate::ir::util::deduplicate)
//! and the op-by-op compile cache key on.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use smallvec::SmallVec;

use crate::backend::hashing::{hash_combine, hash_value, Fingerprint};
use crate::backend::spec::{TensorSpec, ValueId};
use crate::ir::lowering::LoweringContext;
use crate::ir::op_kind::OpKind;

pub type NodePtr = Arc<Node>;

/// Computes the output specs of a node on first observation.
pub type ShapeFn = Box<dyn Fn() -> Result<Vec<TensorSpec>> + Send + Sync>;

/// Operand lists are short; two inline slots cover unary and binary ops.
pub type Operands = SmallVec<[Value; 2]>;

/// Process-unique node identity. Never reused while the process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Output specs of a node under construction.
pub enum NodeShape {
    Known(Vec<TensorSpec>),
    Deferred(ShapeFn),
}

impl NodeShape {
    /// Single-output shape computed lazily by `f`.
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn() -> Result<TensorSpec> + Send + Sync + 'static,
    {
        NodeShape::Deferred(Box::new(move || f().map(|spec| vec![spec])))
    }
}

impl From<TensorSpec> for NodeShape {
    fn from(spec: TensorSpec) -> Self {
        NodeShape::Known(vec![spec])
    }
}

impl From<Vec<TensorSpec>> for NodeShape {
    fn from(specs: Vec<TensorSpec>) -> Self {
        NodeShape::Known(specs)
    }
}

/// Behaviour every concrete node kind provides.
pub trait NodeKind: Send + Sync + 'static {
    /// Emits the instructions computing `node`'s outputs, one value id per output.
    ///
    /// Implementations reach their inputs only through `ctx.get_output_op` on `node`'s own
    /// operands.
    fn lower(&self, node: &Node, ctx: &mut LoweringContext) -> Result<Vec<ValueId>>;

    /// Builds a node of the same kind and metadata over `operands`.
    fn clone_with(&self, node: &Node, operands: &[Value]) -> NodePtr;

    /// Appends kind metadata to the node's diagnostic rendering, e.g. `", dims=[0]"`.
    fn fmt_metadata(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }

    /// Identity beyond structure. Nodes wrapping runtime data return the data's identity so
    /// that structurally equal but distinct inputs are never merged.
    fn data_identity(&self) -> Option<usize> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

pub struct Node {
    id: NodeId,
    op: OpKind,
    operands: Operands,
    num_outputs: usize,
    shapes: OnceLock<Vec<TensorSpec>>,
    shape_fn: Option<ShapeFn>,
    node_hash: Fingerprint,
    hash: Fingerprint,
    kind: Box<dyn NodeKind>,
}

impl Node {
    /// Builds a node.
    ///
    /// # Panics
    /// When `num_outputs` is zero, when a known shape list does not have `num_outputs` entries,
    /// or when a leaf (no operands) does not provide a known shape.
    pub fn new<K: NodeKind>(
        op: OpKind,
        operands: impl IntoIterator<Item = Value>,
        shape: impl Into<NodeShape>,
        num_outputs: usize,
        hash_seed: Fingerprint,
        kind: K,
    ) -> NodePtr {
        assert!(num_outputs >= 1, "node {op} must have at least one output");
        let operands: Operands = operands.into_iter().collect();
        let mut node_hash = hash_combine(op.fingerprint(), hash_seed);
        let shapes = OnceLock::new();
        let shape_fn = match shape.into() {
            NodeShape::Known(specs) => {
                assert_eq!(
                    specs.len(),
                    num_outputs,
                    "node {op} declares {num_outputs} outputs but {} shapes",
                    specs.len()
                );
                if operands.is_empty() {
                    node_hash = hash_combine(node_hash, hash_value(&specs));
                }
                let _ = shapes.set(specs);
                None
            }
            NodeShape::Deferred(shape_fn) => {
                assert!(
                    !operands.is_empty(),
                    "leaf node {op} must provide its shape up front"
                );
                Some(shape_fn)
            }
        };
        let hash = operands
            .iter()
            .fold(node_hash, |acc, operand| hash_combine(acc, operand.hash()));
        Arc::new(Node {
            id: NodeId::next(),
            op,
            operands,
            num_outputs,
            shapes,
            shape_fn,
            node_hash,
            hash,
            kind: Box::new(kind),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> &OpKind {
        &self.op
    }

    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> &Value {
        &self.operands[index]
    }

    pub fn is_leaf(&self) -> bool {
        self.operands.is_empty()
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Output specs, computing them on first use.
    ///
    /// # Panics
    /// When the deferred shape function fails; that is a construction error surfacing late.
    pub fn shapes(&self) -> &[TensorSpec] {
        self.shapes.get_or_init(|| {
            let specs = match &self.shape_fn {
                Some(shape_fn) => shape_fn()
                    .unwrap_or_else(|err| panic!("shape inference failed for {}: {err:#}", self.op)),
                None => unreachable!("known shapes are set at construction"),
            };
            assert_eq!(
                specs.len(),
                self.num_outputs,
                "shape inference for {} produced {} shapes for {} outputs",
                self.op,
                specs.len(),
                self.num_outputs
            );
            specs
        })
    }

    pub fn shape(&self, index: usize) -> &TensorSpec {
        &self.shapes()[index]
    }

    /// Whether the output shapes were observed yet.
    pub fn shape_computed(&self) -> bool {
        self.shapes.get().is_some()
    }

    pub fn node_hash(&self) -> Fingerprint {
        self.node_hash
    }

    pub fn hash(&self) -> Fingerprint {
        self.hash
    }

    pub fn kind<K: NodeKind>(&self) -> Option<&K> {
        self.kind.as_any().downcast_ref::<K>()
    }

    pub fn data_identity(&self) -> Option<usize> {
        self.kind.data_identity()
    }

    pub fn lower(&self, ctx: &mut LoweringContext) -> Result<Vec<ValueId>> {
        self.kind.lower(self, ctx)
    }

    /// New node of the same kind and metadata with `operands` substituted.
    pub fn clone_with_operands(&self, operands: &[Value]) -> NodePtr {
        assert_eq!(
            operands.len(),
            self.operands.len(),
            "clone of {} expects {} operands",
            self.op,
            self.operands.len()
        );
        self.kind.clone_with(self, operands)
    }
}

impl Drop for Node {
    /// Releases operand chains with an explicit stack; long chains would otherwise recurse once
    /// per node.
    fn drop(&mut self) {
        // Shape closures hold operand clones; release those first so the operand list owns the
        // last reference.
        self.shape_fn = None;
        let mut pending: Vec<Value> = std::mem::take(&mut self.operands).into_vec();
        while let Some(value) = pending.pop() {
            if let Ok(mut node) = Arc::try_unwrap(value.node) {
                node.shape_fn = None;
                pending.extend(std::mem::take(&mut node.operands));
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shapes() {
            [single] => write!(f, "{single}")?,
            many => {
                f.write_str("(")?;
                for (index, spec) in many.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{spec}")?;
                }
                f.write_str(")")?;
            }
        }
        write!(f, " {}", self.op)?;
        if self.num_outputs > 1 {
            write!(f, ", num_outputs={}", self.num_outputs)?;
        }
        self.kind.fmt_metadata(f)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("operands", &self.operands.len())
            .field("hash", &format_args!("{:#018x}", self.hash))
            .finish()
    }
}

/// One output of a node.
#[derive(Clone)]
pub struct Value {
    node: NodePtr,
    index: usize,
}

impl Value {
    pub fn new(node: NodePtr, index: usize) -> Self {
        assert!(
            index < node.num_outputs(),
            "output {index} out of range for {} with {} outputs",
            node.op(),
            node.num_outputs()
        );
        Self { node, index }
    }

    pub fn node(&self) -> &NodePtr {
        &self.node
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &TensorSpec {
        self.node.shape(self.index)
    }

    /// Structural hash of this output.
    pub fn hash(&self) -> Fingerprint {
        hash_combine(self.node.hash(), self.index as u64)
    }
}

impl From<NodePtr> for Value {
    fn from(node: NodePtr) -> Self {
        Value::new(node, 0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.node.id == other.node.id && self.index == other.index
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.id.hash(state);
        self.index.hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}", self.node.id, self.index, self.node.op)
    }
}
