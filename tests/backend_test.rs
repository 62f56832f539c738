use std::{fs, path::Path};

use tempfile::TempDir;

use sam_seg_rs::{
    probe, DType, DimOverride, Environment, OptLevel, Provider, Result, RunError, SegError,
    TensorMut, TensorView,
};

const ELEM_FLOAT: u64 = 1;
const ELEM_FLOAT16: u64 = 10;

fn varint(mut v: u64, out: &mut Vec<u8>) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn field_varint(num: u64, v: u64, out: &mut Vec<u8>) {
    varint(num << 3, out);
    varint(v, out);
}

fn field_bytes(num: u64, bytes: &[u8], out: &mut Vec<u8>) {
    varint((num << 3) | 2, out);
    varint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

#[derive(Clone, Copy)]
enum Dim {
    Fixed(u64),
    Named(&'static str),
}

fn value_info(name: &str, elem_type: u64, dims: &[Dim]) -> Vec<u8> {
    let mut shape = Vec::new();
    for d in dims {
        let mut dim = Vec::new();
        match *d {
            Dim::Fixed(v) => field_varint(1, v, &mut dim),
            Dim::Named(param) => field_bytes(2, param.as_bytes(), &mut dim),
        }
        field_bytes(1, &dim, &mut shape);
    }
    let mut tensor = Vec::new();
    field_varint(1, elem_type, &mut tensor);
    field_bytes(2, &shape, &mut tensor);
    let mut ty = Vec::new();
    field_bytes(1, &tensor, &mut ty);

    let mut vi = Vec::new();
    field_bytes(1, name.as_bytes(), &mut vi);
    field_bytes(2, &ty, &mut vi);
    vi
}

/// Serialized graph computing `y = x + x` over a tensor of shape `dims`.
fn doubler_graph(elem_type: u64, dims: &[Dim]) -> Vec<u8> {
    let mut node = Vec::new();
    field_bytes(1, b"x", &mut node);
    field_bytes(1, b"x", &mut node);
    field_bytes(2, b"y", &mut node);
    field_bytes(4, b"Add", &mut node);

    let mut graph = Vec::new();
    field_bytes(1, &node, &mut graph);
    field_bytes(2, b"doubler", &mut graph);
    field_bytes(11, &value_info("x", elem_type, dims), &mut graph);
    field_bytes(12, &value_info("y", elem_type, dims), &mut graph);

    let mut opset = Vec::new();
    field_bytes(1, b"", &mut opset);
    field_varint(2, 13, &mut opset);

    let mut model = Vec::new();
    field_varint(1, 8, &mut model);
    field_bytes(2, b"sam-seg-tests", &mut model);
    field_bytes(7, &graph, &mut model);
    field_bytes(8, &opset, &mut model);
    model
}

fn doubler_model(elem_type: u64) -> Vec<u8> {
    doubler_graph(
        elem_type,
        &[Dim::Fixed(1), Dim::Fixed(3), Dim::Fixed(4), Dim::Fixed(4)],
    )
}

fn write_graph(root: &Path, id: &str, config: &str, graph: &[u8]) -> Result<()> {
    let dir = root.join(id);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("config.json"), config)?;
    fs::write(dir.join("model.onnx"), graph)?;
    Ok(())
}

fn write_model(root: &Path, id: &str, config: &str, elem_type: u64) -> Result<()> {
    write_graph(root, id, config, &doubler_model(elem_type))
}

fn setup() -> Result<(TempDir, std::sync::Arc<Environment>)> {
    let tmp = TempDir::new()?;
    write_model(
        tmp.path(),
        "doubler",
        r#"{"id": "doubler", "name": "Doubler", "task": "test"}"#,
        ELEM_FLOAT,
    )?;
    write_model(
        tmp.path(),
        "doubler16",
        r#"{"id": "doubler16", "name": "Doubler fp16", "task": "test"}"#,
        ELEM_FLOAT16,
    )?;
    write_model(
        tmp.path(),
        "foreign",
        r#"{"id": "foreign", "name": "Foreign", "backend": "tflite"}"#,
        ELEM_FLOAT,
    )?;
    write_graph(
        tmp.path(),
        "doubler-dyn",
        r#"{"id": "doubler-dyn", "name": "Doubler with free length", "task": "dynamic"}"#,
        &doubler_graph(ELEM_FLOAT, &[Dim::Fixed(1), Dim::Named("n")]),
    )?;
    let search = tmp.path().to_string_lossy().into_owned();
    let env = Environment::with_options(Some(&search), None, Provider::Cpu)?;
    Ok((tmp, env))
}

#[test]
fn catalog_discovers_models() -> Result<()> {
    let (_tmp, env) = setup()?;
    assert_eq!(env.model_count(), 4);
    assert_eq!(env.models_for_task("test").len(), 2);
    let info = env
        .model_info_by_id("doubler")
        .ok_or_else(|| SegError::ModelNotFound { id: "doubler".into() })?;
    assert_eq!(info.name, "Doubler");
    assert_eq!(info.backend, "onnx");
    assert!(env.model_info_by_index(4).is_none());
    Ok(())
}

#[test]
fn doubler_runs_on_every_available_provider() -> Result<()> {
    let (_tmp, env) = setup()?;
    let input = vec![1.0f32; 48];

    for provider in Provider::available() {
        let mut ctx = env.load("doubler", None, provider)?;
        assert_eq!(ctx.inputs().len(), 1);
        assert_eq!(ctx.inputs()[0].name, "x");
        assert_eq!(ctx.input_type(0), Some(DType::Float32));
        assert_eq!(ctx.output_type(0), Some(DType::Float32));
        assert_eq!(ctx.input_shape(0), Some(&[1, 3, 4, 4][..]));
        assert!(!ctx.has_dynamic_outputs());

        let mut output = vec![0.0f32; 48];
        {
            let inputs = [TensorView::f32(&input, [1, 3, 4, 4])];
            let mut outputs = [TensorMut::f32(&mut output, [1, 3, 4, 4])];
            ctx.run(&inputs, &mut outputs).map_err(SegError::from)?;
        }
        assert!(output.iter().all(|&v| v == 2.0), "provider {provider}");
    }
    Ok(())
}

#[test]
fn float16_model_takes_float32_buffers() -> Result<()> {
    let (_tmp, env) = setup()?;
    let mut ctx = env.load("doubler16", None, Provider::Cpu)?;
    assert_eq!(ctx.input_type(0), Some(DType::Float16));

    let input: Vec<f32> = (0..48).map(|i| i as f32 * 0.5).collect();
    let mut output = vec![0.0f32; 48];
    let shape = {
        let inputs = [TensorView::f32(&input, [1, 3, 4, 4])];
        let mut outputs = [TensorMut::f32(&mut output, [1, 3, 4, 4])];
        ctx.run(&inputs, &mut outputs).map_err(SegError::from)?;
        outputs[0].shape.clone()
    };
    assert_eq!(shape, vec![1, 3, 4, 4]);
    for (i, v) in output.iter().enumerate() {
        assert_eq!(*v, i as f32);
    }
    Ok(())
}

#[test]
fn symbolic_output_shape_is_reported_by_run() -> Result<()> {
    let (_tmp, env) = setup()?;
    let mut ctx = env.load("doubler-dyn", None, Provider::Cpu)?;
    assert!(ctx.has_dynamic_outputs());
    assert_eq!(ctx.input_shape(0), Some(&[1, -1][..]));

    let input = vec![1.5f32; 6];
    // caller guesses a longer output than the runtime produces
    let mut output = vec![-1.0f32; 8];
    let shape = {
        let inputs = [TensorView::f32(&input, [1, 6])];
        let mut outputs = [TensorMut::f32(&mut output, [1, 8])];
        ctx.run(&inputs, &mut outputs).map_err(SegError::from)?;
        outputs[0].shape.clone()
    };
    assert_eq!(shape, vec![1, 6]);
    assert_eq!(&output[..6], &[3.0; 6]);
    assert_eq!(&output[6..], &[-1.0; 2]);

    // a shorter guess gets truncated, not rejected
    let mut short = vec![0.0f32; 4];
    let shape = {
        let inputs = [TensorView::f32(&input, [1, 6])];
        let mut outputs = [TensorMut::f32(&mut short, [1, 4])];
        ctx.run(&inputs, &mut outputs).map_err(SegError::from)?;
        outputs[0].shape.clone()
    };
    assert_eq!(shape, vec![1, 6]);
    assert_eq!(short, vec![3.0; 4]);
    Ok(())
}

#[test]
fn dimension_overrides_load_and_run() -> Result<()> {
    let (_tmp, env) = setup()?;
    let input = vec![2.0f32; 6];

    for overrides in [
        vec![DimOverride::new("n", 6)],
        vec![DimOverride::new("num_labels", 1)],
        vec![DimOverride::new("num_labels", 1), DimOverride::new("n", 6)],
    ] {
        let mut ctx = env.load_ext("doubler-dyn", None, Provider::Cpu, OptLevel::Basic, &overrides)?;
        let mut output = vec![0.0f32; 6];
        let shape = {
            let inputs = [TensorView::f32(&input, [1, 6])];
            let mut outputs = [TensorMut::f32(&mut output, [1, 6])];
            ctx.run(&inputs, &mut outputs).map_err(SegError::from)?;
            outputs[0].shape.clone()
        };
        assert_eq!(shape, vec![1, 6], "overrides {overrides:?}");
        assert_eq!(output, vec![4.0; 6]);
    }
    Ok(())
}

#[test]
fn run_rejects_bad_calls_with_codes() -> Result<()> {
    let (_tmp, env) = setup()?;
    let mut ctx = env.load("doubler", None, Provider::Cpu)?;
    let input = vec![1.0f32; 48];
    let mut output = vec![0.0f32; 48];

    let mut outputs = [TensorMut::f32(&mut output, [1, 3, 4, 4])];
    let err = ctx.run(&[], &mut outputs);
    assert!(matches!(err, Err(RunError::IoCountMismatch { expected: 1, got: 0 })));
    assert_eq!(err.err().map(|e| e.code()), Some(-2));

    let inputs = [TensorView::f32(&input, [1, 3, -4, 4])];
    let err = ctx.run(&inputs, &mut outputs);
    assert_eq!(err.err().map(|e| e.code()), Some(-4));

    let inputs = [TensorView::f32(&input[..10], [1, 3, 4, 4])];
    let err = ctx.run(&inputs, &mut outputs);
    assert!(matches!(err, Err(RunError::InvalidTensor { index: 0, .. })));
    Ok(())
}

#[test]
fn load_failures_are_typed() -> Result<()> {
    let (_tmp, env) = setup()?;
    assert!(matches!(
        env.load("nope", None, Provider::Cpu),
        Err(SegError::ModelNotFound { .. })
    ));
    assert!(matches!(
        env.load("foreign", None, Provider::Cpu),
        Err(SegError::UnknownBackend { .. })
    ));
    assert!(matches!(
        env.load("doubler", Some("missing.onnx"), Provider::Cpu),
        Err(SegError::FileSystem { .. })
    ));
    Ok(())
}

#[test]
fn auto_resolves_to_environment_provider() -> Result<()> {
    let (_tmp, env) = setup()?;
    let ctx = env.load("doubler", None, Provider::Auto)?;
    assert_eq!(ctx.provider(), Provider::Cpu);
    Ok(())
}

#[test]
fn probe_is_total() {
    assert!(probe(Provider::Auto));
    assert!(probe(Provider::Cpu));
    for p in Provider::available() {
        let _ = probe(p);
    }
}
