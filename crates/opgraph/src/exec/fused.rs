use anyhow::{ensure, Context, Result};

use crate::backend::client::{ComputationClient, DataHandle};
use crate::backend::device::Device;
use crate::ir::lowering::{LoweredProgram, LoweringContext};
use crate::ir::node::Value;

/// Lowers the whole graph under `roots` into one program with one result per root.
pub fn lower_fused(roots: &[Value], device: &Device) -> Result<LoweredProgram> {
    let mut ctx = LoweringContext::new("fused", device.clone());
    for root in roots {
        let op = ctx.get_output_op(root)?;
        ctx.add_result(op);
    }
    tracing::debug!(
        roots = roots.len(),
        lowered = ctx.lowered_node_count(),
        "lowered fused program"
    );
    let lowered = ctx.build()?;
    tracing::trace!(program = %lowered.program, "fused program");
    Ok(lowered)
}

/// Compiles and runs the graph under `roots` as a single program.
#[tracing::instrument(skip_all, fields(roots = roots.len(), device = %device))]
pub fn execute_fused<C: ComputationClient>(
    client: &C,
    roots: &[Value],
    device: &Device,
    devices: &[Device],
) -> Result<Vec<DataHandle>> {
    if roots.is_empty() {
        return Ok(Vec::new());
    }
    let lowered = lower_fused(roots, device)?;
    let inputs = lowered.bound_inputs()?;
    for input in &inputs {
        ensure!(
            input.device() == device,
            "input {} lives on {} but execution targets {device}",
            input.spec(),
            input.device()
        );
    }
    let computation = {
        let _scope = crate::profiling::compile_scope("fused::compile");
        client
            .compile(&lowered.program, device, devices)
            .context("compiling fused program")?
    };
    let outputs = client
        .execute(&computation, &inputs, device)
        .context("executing fused program")?;
    ensure!(
        outputs.len() == roots.len(),
        "fused program returned {} buffers for {} roots",
        outputs.len(),
        roots.len()
    );
    Ok(outputs)
}
