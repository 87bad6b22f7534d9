//! Host-memory device runtime and code generator for integration tests

#![allow(dead_code)]

use blockwise::descriptor::DeviceArrayDescriptor;
use blockwise::dtype::{Element, ScalarValue};
use blockwise::runtime::{
    CodeGenerator, DeviceLimits, DeviceRuntime, GeneratedKernel, KernelDescription, LaunchArg,
    LaunchShape, RuntimeError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const BASE_ADDRESS: u64 = 0x1000_0000;
const ALIGNMENT: u64 = 256;

pub type KernelFn = Arc<dyn Fn(&KernelContext<'_>) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
struct Memory {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    next: AtomicU64,
    live: AtomicUsize,
    allocations: AtomicUsize,
}

/// Simulated device allocation; dropping it frees the block
pub struct MockBuffer {
    addr: u64,
    len: usize,
    memory: Arc<Memory>,
}

impl MockBuffer {
    pub fn addr(&self) -> u64 {
        self.addr
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        self.memory.blocks.lock().unwrap().remove(&self.addr);
        self.memory.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockModule {
    pub source: String,
}

#[derive(Clone)]
pub struct MockFunction {
    pub name: String,
    kernel: KernelFn,
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub function: String,
    pub args: Vec<LaunchArg>,
    pub shape: LaunchShape,
}

/// Device runtime backed by host memory
///
/// Kernels are Rust closures registered under their entry point; they see
/// the marshaled arguments and can read and write arrays through the
/// descriptors, like generated device code would.
#[derive(Default)]
pub struct MockRuntime {
    memory: Arc<Memory>,
    kernels: Mutex<HashMap<String, KernelFn>>,
    limits: DeviceLimits,
    launch_shape: Option<LaunchShape>,
    fail_compile: Option<String>,
    fail_launch: Option<String>,
    allocation_limit: Option<usize>,
    sources: Mutex<Vec<String>>,
    launches: Mutex<Vec<Launch>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel<F>(self, entry_point: &str, kernel: F) -> Self
    where
        F: Fn(&KernelContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.kernels
            .lock()
            .unwrap()
            .insert(entry_point.to_string(), Arc::new(kernel));
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replaces the default splay with a fixed shape
    pub fn with_launch_shape(mut self, shape: LaunchShape) -> Self {
        self.launch_shape = Some(shape);
        self
    }

    pub fn failing_compile(mut self, diagnostic: &str) -> Self {
        self.fail_compile = Some(diagnostic.to_string());
        self
    }

    pub fn failing_launch(mut self, message: &str) -> Self {
        self.fail_launch = Some(message.to_string());
        self
    }

    /// Allocations beyond the first `n` fail
    pub fn with_allocation_limit(mut self, n: usize) -> Self {
        self.allocation_limit = Some(n);
        self
    }

    /// Buffers currently allocated
    pub fn live_allocations(&self) -> usize {
        self.memory.live.load(Ordering::SeqCst)
    }

    /// Successful allocations since creation
    pub fn total_allocations(&self) -> usize {
        self.memory.allocations.load(Ordering::SeqCst)
    }

    pub fn compiled_sources(&self) -> Vec<String> {
        self.sources.lock().unwrap().clone()
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    fn insert(&self, data: Vec<u8>) -> Result<MockBuffer, RuntimeError> {
        let done = self.memory.allocations.load(Ordering::SeqCst);
        if self.allocation_limit.is_some_and(|limit| done >= limit) {
            return Err(RuntimeError::Allocation("out of simulated memory".into()));
        }
        let len = data.len();
        let span = (len as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        let addr = BASE_ADDRESS + self.memory.next.fetch_add(span, Ordering::SeqCst);
        self.memory.blocks.lock().unwrap().insert(addr, data);
        self.memory.allocations.fetch_add(1, Ordering::SeqCst);
        self.memory.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockBuffer {
            addr,
            len,
            memory: Arc::clone(&self.memory),
        })
    }
}

impl DeviceRuntime for MockRuntime {
    type Buffer = MockBuffer;
    type Module = MockModule;
    type Function = MockFunction;

    fn allocate(&self, bytes: usize) -> Result<MockBuffer, RuntimeError> {
        self.insert(vec![0; bytes])
    }

    fn upload(&self, data: &[u8]) -> Result<MockBuffer, RuntimeError> {
        self.insert(data.to_vec())
    }

    fn write(&self, dst: &mut MockBuffer, data: &[u8]) -> Result<(), RuntimeError> {
        if data.len() > dst.len {
            return Err(RuntimeError::SizeMismatch {
                expected: dst.len,
                actual: data.len(),
            });
        }
        let mut blocks = self.memory.blocks.lock().unwrap();
        let block = blocks
            .get_mut(&dst.addr)
            .ok_or_else(|| RuntimeError::Transfer(format!("{:#x} not allocated", dst.addr)))?;
        block[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, src: &MockBuffer, dst: &mut [u8]) -> Result<(), RuntimeError> {
        if dst.len() > src.len {
            return Err(RuntimeError::SizeMismatch {
                expected: src.len,
                actual: dst.len(),
            });
        }
        let blocks = self.memory.blocks.lock().unwrap();
        let block = blocks
            .get(&src.addr)
            .ok_or_else(|| RuntimeError::Transfer(format!("{:#x} not allocated", src.addr)))?;
        dst.copy_from_slice(&block[..dst.len()]);
        Ok(())
    }

    fn device_address(&self, buffer: &MockBuffer) -> u64 {
        buffer.addr
    }

    fn compile_module(&self, source: &str) -> Result<MockModule, RuntimeError> {
        self.sources.lock().unwrap().push(source.to_string());
        if let Some(diagnostic) = &self.fail_compile {
            return Err(RuntimeError::Compile(diagnostic.clone()));
        }
        Ok(MockModule {
            source: source.to_string(),
        })
    }

    fn get_function(&self, module: &MockModule, name: &str) -> Result<MockFunction, RuntimeError> {
        let kernel = self.kernels.lock().unwrap().get(name).cloned();
        match kernel {
            Some(kernel) if module.source.contains(name) => Ok(MockFunction {
                name: name.to_string(),
                kernel,
            }),
            _ => Err(RuntimeError::FunctionNotFound(name.to_string())),
        }
    }

    fn launch(
        &self,
        function: &MockFunction,
        args: &[LaunchArg],
        shape: LaunchShape,
    ) -> Result<(), RuntimeError> {
        self.launches.lock().unwrap().push(Launch {
            function: function.name.clone(),
            args: args.to_vec(),
            shape,
        });
        if let Some(message) = &self.fail_launch {
            return Err(RuntimeError::Launch(message.clone()));
        }
        let ctx = KernelContext {
            memory: &self.memory,
            args,
            shape,
        };
        assert!(
            shape.capacity() >= ctx.count() as u64,
            "launch {shape:?} does not cover {} blocks",
            ctx.count()
        );
        (function.kernel)(&ctx).map_err(RuntimeError::Launch)
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn splay(&self, count: usize) -> LaunchShape {
        self.launch_shape
            .unwrap_or_else(|| blockwise::dispatch::splay(count, &self.limits))
    }
}

/// What a simulated kernel sees
pub struct KernelContext<'a> {
    memory: &'a Memory,
    pub args: &'a [LaunchArg],
    pub shape: LaunchShape,
}

impl KernelContext<'_> {
    /// Trailing block count argument
    pub fn count(&self) -> usize {
        match self.args.last() {
            Some(LaunchArg::Scalar(ScalarValue::I32(n))) => *n as usize,
            other => panic!("last argument is not the block count: {other:?}"),
        }
    }

    pub fn scalar(&self, index: usize) -> ScalarValue {
        match self.args[index] {
            LaunchArg::Scalar(v) => v,
            LaunchArg::Pointer(_) => panic!("argument {index} is a pointer"),
        }
    }

    /// Decodes the descriptor record argument `index` points to
    pub fn descriptor(&self, index: usize) -> DeviceArrayDescriptor {
        let LaunchArg::Pointer(addr) = self.args[index] else {
            panic!("argument {index} is not a pointer");
        };
        let blocks = self.memory.blocks.lock().unwrap();
        DeviceArrayDescriptor::from_bytes(&blocks[&addr]).expect("descriptor record")
    }

    /// Elements of array argument `index` in row-major order
    pub fn read<T: Element>(&self, index: usize) -> Vec<T> {
        let desc = self.descriptor(index);
        let blocks = self.memory.blocks.lock().unwrap();
        blocks[&desc.data]
            .chunks_exact(T::SCALAR.size_bytes())
            .take(desc.size as usize)
            .map(T::read_ne_bytes)
            .collect()
    }

    pub fn write<T: Element>(&self, index: usize, values: &[T]) {
        let desc = self.descriptor(index);
        assert_eq!(values.len(), desc.size as usize);
        let mut bytes = Vec::with_capacity(values.len() * T::SCALAR.size_bytes());
        for &v in values {
            v.write_ne_bytes(&mut bytes);
        }
        let mut blocks = self.memory.blocks.lock().unwrap();
        blocks
            .get_mut(&desc.data)
            .expect("array data")
            .copy_from_slice(&bytes);
    }
}

/// Code generator emitting placeholder kernels
#[derive(Debug, Default)]
pub struct MockGenerator {
    /// Function whose generation fails
    pub fail_on: Option<String>,
}

impl MockGenerator {
    pub fn failing_on(name: &str) -> Self {
        Self {
            fail_on: Some(name.to_string()),
        }
    }
}

impl CodeGenerator for MockGenerator {
    fn generate(&self, kernel: &KernelDescription<'_>) -> Result<GeneratedKernel, RuntimeError> {
        if self.fail_on.as_deref() == Some(kernel.name) {
            return Err(RuntimeError::Codegen(format!(
                "cannot lower body of {}",
                kernel.name
            )));
        }
        let params = kernel
            .params
            .iter()
            .map(|p| format!("{} {}", p.ty.native_name(), p.name))
            .chain(std::iter::once("int count".to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        let prototype = format!("void {}({})", kernel.entry_point, params);
        Ok(GeneratedKernel {
            source: format!("{prototype}\n{{\n}}\n"),
            prototype,
        })
    }
}
