//! Concrete node kinds and the shape rules they share.

pub mod activation;
pub mod data;
pub mod generic;
pub mod not_supported;
pub mod reduce;
pub mod shape;

use anyhow::{bail, ensure, Result};

use crate::backend::spec::{
    BroadcastToSpec, CastSpec, DType, Operation, Shape, TensorSpec, ValueId,
};
use crate::ir::lowering::LoweringContext;
use crate::ir::node::{NodeShape, Value};

pub use activation::{leaky_relu, softshrink, LeakyRelu, Softshrink};
pub use data::{device_data, scalar, DeviceData, Scalar};
pub use generic::{add, div, mul, sub, Generic, LowerFn};
pub use not_supported::{not_supported, NotSupported};
pub use reduce::{prod, Prod};
pub use shape::{expand, flip, get_dimensions_size, view, Expand, Flip, GetDimensionsSize, View};

/// Numpy-style broadcast of two shapes, aligned at the trailing dimension.
pub fn broadcast_shapes(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = vec![0usize; rank];
    for axis in 0..rank {
        let l = extent_from_back(lhs, rank - 1 - axis);
        let r = extent_from_back(rhs, rank - 1 - axis);
        dims[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => bail!("shapes {lhs} and {rhs} are not broadcastable ({a} vs {b})"),
        };
    }
    Ok(Shape::new(dims))
}

fn extent_from_back(shape: &Shape, offset: usize) -> usize {
    let dims = shape.dims();
    if offset < dims.len() {
        dims[dims.len() - 1 - offset]
    } else {
        1
    }
}

/// Element type both operands of an arithmetic op are converted to.
pub fn promote_types(lhs: DType, rhs: DType) -> DType {
    fn rank(dtype: DType) -> u8 {
        match dtype {
            DType::I1 => 0,
            DType::Si32 => 1,
            DType::F32 => 2,
        }
    }
    if rank(lhs) >= rank(rhs) {
        lhs
    } else {
        rhs
    }
}

/// Checks that `dims` are distinct axes of a rank-`rank` tensor.
pub fn check_dimensions(rank: usize, dims: &[usize]) -> Result<()> {
    for (index, dim) in dims.iter().enumerate() {
        ensure!(*dim < rank, "dimension {dim} out of range for rank {rank}");
        ensure!(
            !dims[..index].contains(dim),
            "dimension {dim} listed more than once"
        );
    }
    Ok(())
}

/// Deferred shape equal to `input`'s.
pub(crate) fn same_shape_as(input: &Value) -> NodeShape {
    let input = input.clone();
    NodeShape::deferred(move || Ok(input.spec().clone()))
}

/// Converts `id`, described by `from`, to `to` by casting and then broadcasting as needed.
pub(crate) fn coerce(
    ctx: &mut LoweringContext,
    id: ValueId,
    from: &TensorSpec,
    to: &TensorSpec,
) -> ValueId {
    let mut id = id;
    if from.dtype != to.dtype {
        id = ctx.emit(
            Operation::Cast(CastSpec { dtype: to.dtype }),
            &[id],
            TensorSpec::new(to.dtype, from.shape.clone()),
        );
    }
    if from.shape != to.shape {
        id = ctx.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: to.shape.clone(),
            }),
            &[id],
            to.clone(),
        );
    }
    id
}
