mod common;

use anyhow::Result;
use opgraph::backend::device::Device;
use opgraph::backend::spec::{DType, Operation, Shape, TensorSpec};
use opgraph::exec::{execute_fused, lower_fused, op_by_op::lower_node_program};
use opgraph::ir::ops::{add, get_dimensions_size, leaky_relu, mul, not_supported, prod, scalar};
use opgraph::ir::LoweringContext;

use common::CountingClient;

#[test]
fn shared_nodes_are_lowered_once_per_context() -> Result<()> {
    let client = CountingClient::new();
    let device = Device::cpu(0);
    let x = client.input(&device, &[4], &[1.0, -2.0, 3.0, -4.0]);
    let shared = leaky_relu(&x, 0.5);
    let root = mul(&shared, &shared);

    let mut ctx = LoweringContext::new("memo", device.clone());
    let first = ctx.get_output_op(&shared)?;
    let root_op = ctx.get_output_op(&root)?;
    assert_eq!(ctx.get_output_op(&shared)?, first);
    assert_eq!(ctx.lowered_node_count(), 3);
    ctx.add_result(root_op);

    let lowered = ctx.build()?;
    let function = lowered.program.entry_function().expect("entry function");
    let relus = function
        .body
        .iter()
        .filter(|instruction| matches!(instruction.op, Operation::LeakyRelu(_)))
        .count();
    assert_eq!(relus, 1);
    assert_eq!(function.parameters, vec![TensorSpec::f32(vec![4])]);
    assert_eq!(lowered.bound_inputs()?.len(), 1);
    Ok(())
}

#[test]
fn the_same_buffer_binds_one_parameter() -> Result<()> {
    let client = CountingClient::new();
    let device = Device::cpu(0);
    let x = client.input(&device, &[2], &[1.0, 2.0]);
    let data = x
        .node()
        .kind::<opgraph::ir::ops::DeviceData>()
        .expect("device data")
        .data()
        .clone();
    let again = opgraph::ir::ops::device_data(data);

    let lowered = lower_fused(&[add(&x, &again)], &device)?;
    let function = lowered.program.entry_function().expect("entry function");
    assert_eq!(function.parameters.len(), 1);
    Ok(())
}

#[test]
fn assigned_outputs_are_not_lowered_again() -> Result<()> {
    let client = CountingClient::new();
    let device = Device::cpu(0);
    let x = client.input(&device, &[3], &[1.0, 2.0, 3.0]);
    let relu = leaky_relu(&x, 0.1);

    let program = lower_node_program(relu.node(), &device)?;
    let function = program.entry_function().expect("entry function");
    assert_eq!(program.entry, "op_leaky_relu");
    assert_eq!(function.parameters, vec![TensorSpec::f32(vec![3])]);
    assert_eq!(function.body.len(), 1);
    assert_eq!(function.results, vec![TensorSpec::f32(vec![3])]);
    Ok(())
}

#[test]
fn programs_render_as_text() -> Result<()> {
    let client = CountingClient::new();
    let device = Device::cpu(0);
    let x = client.input(&device, &[3], &[1.0, 2.0, 3.0]);

    let text = lower_node_program(leaky_relu(&x, 0.1).node(), &device)?.to_string();
    assert!(text.starts_with("program @op_leaky_relu {\n"), "{text}");
    assert!(text.contains("  func @op_leaky_relu {\n"), "{text}");
    assert!(text.contains("      %0 : f32[3]\n"), "{text}");
    assert!(text.contains("= LeakyRelu("), "{text}");
    assert!(text.contains("(%0) -> f32[3]\n"), "{text}");
    assert!(text.ends_with("}\n"), "{text}");
    Ok(())
}

#[test]
fn unsupported_nodes_fail_lowering_with_context() {
    let client = CountingClient::new();
    let device = Device::cpu(0);
    let x = client.input(&device, &[2], &[1.0, 2.0]);
    let odd = not_supported("aten::frobnicate", [x.clone()], TensorSpec::f32(vec![2]));
    let root = add(&odd, &x);

    let err = match lower_fused(&[root], &device) {
        Ok(_) => panic!("lowering should fail"),
        Err(err) => format!("{err:#}"),
    };
    assert!(err.contains("lowering f32[2] prim::not_supported"), "{err}");
    assert!(err.contains("aten::frobnicate"), "{err}");
}

#[test]
fn fused_execution_computes_the_whole_graph() -> Result<()> {
    common::init_tracing();
    let client = CountingClient::new();
    let device = Device::cpu(0);
    let a = client.input(&device, &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = client.input(&device, &[2], &[10.0, 20.0]);
    let sum = add(&a, &b);
    let product = prod(&sum, vec![1], false, None);
    let size = get_dimensions_size(&a, vec![0]);
    let scaled = mul(&product, &size);
    let offset = add(&scaled, &scalar(1.0, TensorSpec::new(DType::F32, Shape::scalar())));

    let outputs = execute_fused(&client, &[offset, sum], &device, &[])?;
    assert_eq!(outputs.len(), 2);
    // rows [11, 22] and [13, 24]; products 242 and 312; doubled plus one
    assert_eq!(client.read(&outputs[0]), vec![485.0, 625.0]);
    assert_eq!(client.read(&outputs[1]), vec![11.0, 22.0, 13.0, 24.0]);
    assert_eq!(client.compiles(), 1);
    assert_eq!(client.executed(), vec!["fused".to_string()]);
    Ok(())
}

#[test]
fn fused_execution_rejects_foreign_inputs() {
    let client = CountingClient::new();
    let x = client.input(&Device::cpu(1), &[2], &[1.0, 2.0]);
    let err = execute_fused(&client, &[add(&x, &x)], &Device::cpu(0), &[])
        .expect_err("input lives elsewhere");
    assert!(err.to_string().contains("CPU:1"), "{err}");
    assert_eq!(client.compiles(), 0);
}
