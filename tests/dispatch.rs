mod common;

use blockwise::prelude::*;
use common::{MockFunction, MockGenerator, MockRuntime, init_logger};
use ndarray::{Array1, Array2, Array3, array};
use rstest::rstest;

type Registry = FunctionRegistry<CompiledKernel<MockFunction>>;

fn compiled(runtime: &MockRuntime, decls: Vec<BlockFunction>) -> Registry {
    let mut registry = Registry::new();
    for decl in decls {
        registry.register(decl).unwrap();
    }
    RegistryCompiler::new(&MockGenerator::default(), runtime)
        .compile_all(&mut registry)
        .unwrap();
    registry
}

fn f32_array() -> ElementType {
    ElementType::Array(ScalarType::F32)
}

/// Adds one to every element; the block covers the whole array
fn increment_runtime() -> MockRuntime {
    MockRuntime::new().with_kernel("_kernel_increment", |ctx| {
        let values: Vec<i32> = ctx.read(0);
        ctx.write(0, &values.iter().map(|v| v + 1).collect::<Vec<_>>());
        Ok(())
    })
}

fn increment(shape: [usize; 3]) -> BlockFunction {
    BlockFunction::builder("increment")
        .arg("x", "int32[]".parse::<ElementType>().unwrap())
        .block_shape("x", shape)
        .overlapping(false)
        .build()
}

#[test]
fn test_round_trip_reconstructs_shape() {
    init_logger();
    let runtime = increment_runtime().with_kernel("_kernel_inspect", |ctx| {
        let desc = ctx.descriptor(0);
        if desc.shape() != vec![2, 3, 4] || desc.ndim != 3 || desc.size != 24 {
            return Err(format!("bad descriptor {desc:?}"));
        }
        if desc.dim[3] != 0 || desc.offset != [0; 4] {
            return Err("descriptor not zero padded".into());
        }
        Ok(())
    });
    let registry = compiled(
        &runtime,
        vec![
            increment([2, 3, 4]),
            BlockFunction::builder("inspect")
                .arg("x", ElementType::Array(ScalarType::I32))
                .block_shape("x", [2, 3, 4])
                .overlapping(false)
                .build(),
        ],
    );

    let original = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as i32);
    let mut x = original.clone();
    registry
        .invoke(&runtime, "inspect", &mut [KernelArg::raw(&mut x)])
        .unwrap();
    assert_eq!(x, original);

    registry
        .invoke(&runtime, "increment", &mut [KernelArg::raw(&mut x)])
        .unwrap();
    assert_eq!(x, &original + 1);

    let launches = runtime.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].args.last(), Some(&LaunchArg::Scalar(ScalarValue::I32(1))));
    assert_eq!(runtime.live_allocations(), 0);
}

#[test]
fn test_sliding_window_filter() {
    init_logger();
    let runtime = MockRuntime::new().with_kernel("_kernel_box", |ctx| {
        let img: Vec<f32> = ctx.read(0);
        let w = ctx.descriptor(0).dim[1] as usize;
        let ScalarValue::F32(scale) = ctx.scalar(2) else {
            return Err("scale must be f32".into());
        };
        let mut out: Vec<f32> = ctx.read(1);
        let out_w = ctx.descriptor(1).dim[1] as usize;
        for idx in 0..ctx.count() {
            let (y, x) = (idx / out_w, idx % out_w);
            let mut acc = 0.0;
            for dy in 0..3 {
                for dx in 0..3 {
                    acc += img[(y + dy) * w + x + dx];
                }
            }
            out[idx] = acc * scale;
        }
        ctx.write(1, &out);
        Ok(())
    });
    let registry = compiled(
        &runtime,
        vec![
            BlockFunction::builder("box")
                .args(["img", "out", "scale"])
                .arg_types(["img", "out"], f32_array())
                .arg_types("scale", ScalarType::F32)
                .block_shape("img", [3, 3])
                .block_shape("out", [1, 1])
                .build(),
        ],
    );

    let mut img = Array2::from_shape_fn((5, 5), |(i, j)| (i * 5 + j) as f32);
    let mut out = Array2::<f32>::zeros((3, 3));
    registry
        .invoke(
            &runtime,
            "box",
            &mut [
                KernelArg::raw(&mut img),
                KernelArg::raw(&mut out),
                KernelArg::scalar(1.0f32 / 9.0),
            ],
        )
        .unwrap();

    // the mean of a 3x3 window over a linear ramp is its center value
    for ((y, x), v) in out.indexed_iter() {
        let center = ((y + 1) * 5 + x + 1) as f32;
        assert!((v - center).abs() < 1e-4, "out[{y},{x}] = {v}");
    }
    let launch = &runtime.launches()[0];
    let codes: String = launch.args.iter().map(LaunchArg::marshal_code).collect();
    assert_eq!(codes, "PPfi");
    assert_eq!(launch.args[3], LaunchArg::Scalar(ScalarValue::I32(9)));
    assert_eq!(runtime.live_allocations(), 0);
}

#[test]
fn test_inconsistent_block_count_allocates_nothing() {
    init_logger();
    let runtime = MockRuntime::new().with_kernel("_kernel_pair", |_| Ok(()));
    let registry = compiled(
        &runtime,
        vec![
            BlockFunction::builder("pair")
                .args(["a", "b"])
                .arg_types(["a", "b"], f32_array())
                .block_shape(["a", "b"], [2, 2])
                .overlapping(false)
                .build(),
        ],
    );

    let mut a = Array2::<f32>::zeros((4, 4));
    let mut b = Array2::<f32>::zeros((4, 6));
    let err = registry
        .invoke(
            &runtime,
            "pair",
            &mut [KernelArg::raw(&mut a), KernelArg::raw(&mut b)],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BlockwiseError::InconsistentBlockCount {
            ref argument,
            expected: 4,
            found: 6,
        } if argument == "b"
    ));

    let mut c = Array2::<f32>::zeros((5, 4));
    let err = registry
        .invoke(
            &runtime,
            "pair",
            &mut [KernelArg::raw(&mut c), KernelArg::raw(&mut a)],
        )
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::IndivisibleBlockShape { .. }));

    assert_eq!(runtime.total_allocations(), 0);
    assert!(runtime.launches().is_empty());
}

#[test]
fn test_not_compiled() {
    init_logger();
    let runtime = MockRuntime::new();
    let mut registry = Registry::new();
    registry.register(increment([4, 1, 1])).unwrap();

    let mut x = Array3::<i32>::zeros((4, 1, 1));
    let err = registry
        .invoke(&runtime, "increment", &mut [KernelArg::raw(&mut x)])
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::NotCompiled(ref name) if name == "increment"));

    let err = registry
        .invoke(&runtime, "decrement", &mut [KernelArg::raw(&mut x)])
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::UnknownFunction(_)));
    assert_eq!(runtime.total_allocations(), 0);
}

#[test]
fn test_argument_validation() {
    init_logger();
    let runtime = MockRuntime::new().with_kernel("_kernel_scale", |_| Ok(()));
    let registry = compiled(
        &runtime,
        vec![
            BlockFunction::builder("scale")
                .arg("x", f32_array())
                .arg("factor", ScalarType::F32)
                .block_shape("x", [1])
                .build(),
        ],
    );

    let mut x = Array1::<f32>::zeros(8);
    let err = registry
        .invoke(&runtime, "scale", &mut [KernelArg::raw(&mut x)])
        .unwrap_err();
    assert!(matches!(
        err,
        BlockwiseError::ArgumentCount { expected: 2, found: 1, .. }
    ));

    let mut wrong = Array1::<f64>::zeros(8);
    let err = registry
        .invoke(
            &runtime,
            "scale",
            &mut [KernelArg::raw(&mut wrong), KernelArg::scalar(2.0f32)],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BlockwiseError::ArgumentTypeMismatch { ref argument, .. } if argument == "x"
    ));

    let err = registry
        .invoke(
            &runtime,
            "scale",
            &mut [KernelArg::raw(&mut x), KernelArg::scalar(2i32)],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BlockwiseError::ArgumentTypeMismatch { ref argument, .. } if argument == "factor"
    ));

    let mut y = Array1::<f32>::zeros(8);
    let err = registry
        .invoke(
            &runtime,
            "scale",
            &mut [KernelArg::raw(&mut x), KernelArg::raw(&mut y)],
        )
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::ArgumentTypeMismatch { .. }));

    let mut rank2 = Array2::<f32>::zeros((2, 4));
    let err = registry
        .invoke(
            &runtime,
            "scale",
            &mut [KernelArg::raw(&mut rank2), KernelArg::scalar(2.0f32)],
        )
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::ShapeMismatch { .. }));

    let mut rank5 = ndarray::ArrayD::<f32>::zeros(vec![1, 1, 1, 1, 8]);
    let err = registry
        .invoke(
            &runtime,
            "scale",
            &mut [KernelArg::raw(&mut rank5), KernelArg::scalar(2.0f32)],
        )
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::UnsupportedRank { ndim: 5, .. }));

    assert_eq!(runtime.total_allocations(), 0);
}

#[test]
fn test_launch_failure_skips_copy_back() {
    init_logger();
    let runtime = increment_runtime().failing_launch("device fault");
    let registry = compiled(&runtime, vec![increment([2, 2, 1])]);

    let original = Array3::from_shape_fn((2, 2, 1), |(i, j, _)| (i * 2 + j) as i32);
    let mut x = original.clone();
    let err = registry
        .invoke(&runtime, "increment", &mut [KernelArg::raw(&mut x)])
        .unwrap_err();
    assert!(matches!(
        err,
        BlockwiseError::KernelExecutionError { ref function, source: RuntimeError::Launch(_) }
            if function == "increment"
    ));
    assert_eq!(x, original);
    assert_eq!(runtime.live_allocations(), 0);
}

#[rstest]
#[case([1, 1, 1], [8, 2, 1])]
#[case([1, 1, 1], [32, 1, 1])]
#[case([2, 1, 2], [32, 1, 1])]
#[case([0, 1, 1], [128, 1, 1])]
fn test_runtime_launch_shape_must_cover_blocks_once(
    #[case] grid: [u32; 3],
    #[case] block: [u32; 3],
) {
    init_logger();
    let runtime = increment_runtime().with_launch_shape(LaunchShape { grid, block });
    let registry = compiled(&runtime, vec![increment([1, 1, 1])]);

    let mut x = Array3::<i32>::zeros((10, 10, 1));
    let err = registry
        .invoke(&runtime, "increment", &mut [KernelArg::raw(&mut x)])
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::InvalidLaunchShape { count: 100, .. }));
    assert_eq!(runtime.total_allocations(), 0);
    assert!(runtime.launches().is_empty());
}

#[test]
fn test_runtime_launch_shape_override() {
    init_logger();
    let shape = LaunchShape {
        grid: [2, 2, 1],
        block: [32, 1, 1],
    };
    let runtime = increment_runtime().with_launch_shape(shape);
    let registry = compiled(&runtime, vec![increment([1, 1, 1])]);

    let mut x = Array3::<i32>::zeros((10, 10, 1));
    registry
        .invoke(&runtime, "increment", &mut [KernelArg::raw(&mut x)])
        .unwrap();
    assert_eq!(runtime.launches()[0].shape, shape);
    assert!(x.iter().all(|&v| v == 1));
}

#[test]
fn test_allocation_failure_releases_partial_uploads() {
    init_logger();
    let runtime = increment_runtime().with_allocation_limit(1);
    let registry = compiled(&runtime, vec![increment([1, 1, 1])]);

    let mut x = Array3::<i32>::zeros((1, 1, 1));
    let err = registry
        .invoke(&runtime, "increment", &mut [KernelArg::raw(&mut x)])
        .unwrap_err();
    assert!(matches!(err, BlockwiseError::Runtime(RuntimeError::Allocation(_))));
    assert_eq!(runtime.total_allocations(), 1);
    assert_eq!(runtime.live_allocations(), 0);
    assert!(runtime.launches().is_empty());
}

#[test]
fn test_device_array_is_not_copied_back() {
    init_logger();
    let runtime = MockRuntime::new().with_kernel("_kernel_apply_lut", |ctx| {
        let img: Vec<u8> = ctx.read(0);
        let lut: Vec<u8> = ctx.read(1);
        ctx.write(0, &img.iter().map(|&v| lut[v as usize]).collect::<Vec<_>>());
        // a kernel may scribble over a retained array; the host never sees it
        ctx.write(1, &vec![0u8; lut.len()]);
        Ok(())
    });
    let registry = compiled(
        &runtime,
        vec![
            BlockFunction::builder("apply_lut")
                .args(["img", "lut"])
                .arg_types(["img", "lut"], "uint8[]".parse::<ElementType>().unwrap())
                .block_shape("img", [1])
                .build(),
        ],
    );

    let lut_host = Array1::from_shape_fn(256, |i| 255 - i as u8);
    let lut = DeviceArray::upload(&runtime, "lut", &lut_host).unwrap();
    assert_eq!(runtime.live_allocations(), 2);

    let mut img = array![0u8, 1, 2, 250];
    registry
        .invoke(
            &runtime,
            "apply_lut",
            &mut [KernelArg::raw(&mut img), KernelArg::device(&lut)],
        )
        .unwrap();
    assert_eq!(img, array![255u8, 254, 253, 5]);
    assert_eq!(runtime.live_allocations(), 2);

    let mut retained = Array1::<u8>::ones(256);
    lut.download_into(&runtime, &mut retained).unwrap();
    assert!(retained.iter().all(|&v| v == 0));

    drop(lut);
    assert_eq!(runtime.live_allocations(), 0);
}

#[test]
fn test_launch_shape_folds_into_second_axis() {
    init_logger();
    let limits = DeviceLimits {
        warp_size: 4,
        max_threads_per_group: 8,
        max_grid_dim: 2,
    };
    let runtime = MockRuntime::new()
        .with_limits(limits)
        .with_kernel("_kernel_fill", |ctx| {
            let n = ctx.count();
            ctx.write(0, &(0..n as i64).collect::<Vec<_>>());
            Ok(())
        });
    let registry = compiled(
        &runtime,
        vec![
            BlockFunction::builder("fill")
                .arg("x", ElementType::Array(ScalarType::I64))
                .block_shape("x", [1])
                .overlapping(false)
                .build(),
        ],
    );

    let mut x = Array1::<i64>::zeros(40);
    registry
        .invoke(&runtime, "fill", &mut [KernelArg::raw(&mut x)])
        .unwrap();
    assert_eq!(x, Array1::from_iter(0..40i64));

    let shape = runtime.launches()[0].shape;
    assert_eq!(shape.block, [8, 1, 1]);
    assert_eq!(shape.grid, [2, 3, 1]);
}

#[test]
fn test_empty_array_launches_guarded_warp() {
    init_logger();
    let runtime = MockRuntime::new().with_kernel("_kernel_fill", |ctx| {
        assert_eq!(ctx.count(), 0);
        Ok(())
    });
    let registry = compiled(
        &runtime,
        vec![
            BlockFunction::builder("fill")
                .arg("x", ElementType::Array(ScalarType::I64))
                .block_shape("x", [1])
                .overlapping(false)
                .build(),
        ],
    );

    let mut x = Array1::<i64>::zeros(0);
    registry
        .invoke(&runtime, "fill", &mut [KernelArg::raw(&mut x)])
        .unwrap();
    let shape = runtime.launches()[0].shape;
    assert_eq!(shape.grid, [1, 1, 1]);
    assert_eq!(shape.block, [32, 1, 1]);
}

#[test]
fn test_centered_blocks_cover_every_element() {
    init_logger();
    let runtime = MockRuntime::new().with_kernel("_kernel_count", |ctx| {
        let n = ctx.count() as f64;
        ctx.write(1, &vec![n; ctx.descriptor(1).size as usize]);
        Ok(())
    });
    let registry = compiled(
        &runtime,
        vec![
            BlockFunction::builder("count")
                .args(["img", "out"])
                .arg_types(["img", "out"], ElementType::Array(ScalarType::F64))
                .block_shape("img", [3, 5])
                .block_shape("out", [1, 1])
                .center_as_origin(true)
                .build(),
        ],
    );

    let mut img = Array2::<f64>::zeros((4, 7));
    let mut out = Array2::<f64>::zeros((4, 7));
    registry
        .invoke(
            &runtime,
            "count",
            &mut [KernelArg::raw(&mut img), KernelArg::raw(&mut out)],
        )
        .unwrap();
    assert!(out.iter().all(|&v| v == 28.0));
}

#[test]
fn test_dispatcher_accepts_views() {
    init_logger();
    let runtime = increment_runtime();
    let registry = compiled(&runtime, vec![increment([2, 2, 1])]);

    let mut big = Array3::<i32>::zeros((4, 4, 1));
    {
        let mut corner = big.slice_mut(ndarray::s![1..3, 2..4, ..]);
        Dispatcher::new(&runtime)
            .invoke(
                registry.lookup("increment").unwrap(),
                &mut [KernelArg::raw(&mut corner)],
            )
            .unwrap();
    }
    assert_eq!(big.sum(), 4);
    assert_eq!(big[[1, 2, 0]], 1);
    assert_eq!(big[[0, 0, 0]], 0);
}
