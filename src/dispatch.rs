//! Argument marshaling and kernel invocation
//!
//! A call goes through three phases:
//!
//! 1. validation: arity, argument kinds and element types, descriptor
//!    limits and the shared block count. Nothing touches the device yet, so
//!    a bad call never allocates.
//! 2. marshaling: raw host arrays are uploaded with a descriptor, retained
//!    device arrays pass their descriptor address through, scalars pass
//!    through as-is, and the block count is appended.
//! 3. launch and copy-back: the kernel runs to completion, then every
//!    uploaded array is copied back into the host array it came from.
//!
//! Device buffers created for the call are dropped on every exit path.

use crate::array::HostArray;
use crate::descriptor::{DeviceArray, check_shape};
use crate::dtype::{Element, ElementType, ScalarValue};
use crate::error::{BlockwiseError, Result};
use crate::partition;
use crate::registry::{CompiledKernel, FunctionRegistry, RegistryEntry};
use crate::runtime::{DeviceLimits, DeviceRuntime, LaunchArg, LaunchShape};
use log::{debug, trace};

/// One argument of a block function call
pub enum KernelArg<'a, B> {
    /// Host array; uploaded for the call and copied back afterwards
    RawArray(&'a mut dyn HostArray),
    /// Array already resident on the device; not copied back
    Device(&'a DeviceArray<B>),
    Scalar(ScalarValue),
}

impl<'a, B> KernelArg<'a, B> {
    pub fn raw(array: &'a mut dyn HostArray) -> Self {
        KernelArg::RawArray(array)
    }

    pub fn device(array: &'a DeviceArray<B>) -> Self {
        KernelArg::Device(array)
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        KernelArg::Scalar(value.into_scalar())
    }

    fn shape(&self) -> Option<&[usize]> {
        match self {
            KernelArg::RawArray(a) => Some(a.shape()),
            KernelArg::Device(d) => Some(d.shape()),
            KernelArg::Scalar(_) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            KernelArg::RawArray(a) => {
                format!("{} host array", ElementType::Array(a.element_type()))
            }
            KernelArg::Device(d) => {
                format!("{} device array", ElementType::Array(d.element_type()))
            }
            KernelArg::Scalar(v) => format!("{} scalar", v.scalar_type()),
        }
    }
}

impl<B> std::fmt::Debug for KernelArg<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Chooses a launch shape covering `count` block invocations
///
/// Thread groups are a warp multiple, capped at the device limit; groups are
/// folded into a second grid axis when the first one would overflow. Every
/// flattened index `(blockIdx.y * gridDim.x + blockIdx.x) * blockDim.x +
/// threadIdx.x` below `count` is visited exactly once.
pub fn splay(count: usize, limits: &DeviceLimits) -> LaunchShape {
    let warp = limits.warp_size.max(1) as usize;
    let max_threads = (limits.max_threads_per_group as usize).max(warp) / warp * warp;
    let max_grid = limits.max_grid_dim.max(1) as usize;

    let threads = count.max(1).div_ceil(warp).saturating_mul(warp).min(max_threads);
    let groups = count.div_ceil(threads).max(1);
    let (x, y) = if groups <= max_grid {
        (groups, 1)
    } else {
        let y = groups.div_ceil(max_grid);
        (groups.div_ceil(y), y)
    };

    LaunchShape {
        grid: [x as u32, y as u32, 1],
        block: [threads as u32, 1, 1],
    }
}

/// Runs compiled block functions on a device runtime
pub struct Dispatcher<'r, R: DeviceRuntime + ?Sized> {
    runtime: &'r R,
}

impl<'r, R: DeviceRuntime + ?Sized> Dispatcher<'r, R> {
    pub fn new(runtime: &'r R) -> Self {
        Self { runtime }
    }

    /// Executes `entry` once per block of its arguments
    ///
    /// Blocks until the kernel has finished and all host arrays have been
    /// updated. If the launch itself fails, host arrays are left untouched
    /// and the error is returned as [`BlockwiseError::KernelExecutionError`].
    pub fn invoke(
        &self,
        entry: &RegistryEntry<CompiledKernel<R::Function>>,
        args: &mut [KernelArg<'_, R::Buffer>],
    ) -> Result<()> {
        let kernel = entry
            .callable()
            .ok_or_else(|| BlockwiseError::NotCompiled(entry.name().to_string()))?;

        let count = self.validate(entry, args)?;
        // check_shape already bounds element counts by i32::MAX
        let count_arg =
            i32::try_from(count).map_err(|_| BlockwiseError::BlockCountOverflow(count))?;
        let shape = self.runtime.splay(count);
        if !shape.is_flat()
            || shape.capacity() < count as u64
            || shape.grid.contains(&0)
            || shape.block.contains(&0)
        {
            return Err(BlockwiseError::InvalidLaunchShape {
                function: entry.name().to_string(),
                count,
                grid: shape.grid,
                block: shape.block,
            });
        }
        debug!(
            "Dispatching '{}': {} blocks, grid={:?}, block={:?}",
            entry.name(),
            count,
            shape.grid,
            shape.block
        );

        let mut uploads = Vec::new();
        let mut launch_args = Vec::with_capacity(args.len() + 1);
        for (name, arg) in entry.argument_order().iter().zip(args.iter()) {
            match arg {
                KernelArg::RawArray(host) => {
                    let device = DeviceArray::upload(self.runtime, name, &**host)?;
                    launch_args.push(LaunchArg::Pointer(
                        self.runtime.device_address(device.descriptor_buffer()),
                    ));
                    uploads.push(device);
                }
                KernelArg::Device(device) => launch_args.push(LaunchArg::Pointer(
                    self.runtime.device_address(device.descriptor_buffer()),
                )),
                KernelArg::Scalar(v) => launch_args.push(LaunchArg::Scalar(*v)),
            }
        }
        launch_args.push(LaunchArg::Scalar(ScalarValue::I32(count_arg)));
        debug_assert_eq!(
            launch_args.iter().map(LaunchArg::marshal_code).collect::<String>(),
            kernel.signature
        );

        self.runtime
            .launch(&kernel.function, &launch_args, shape)
            .map_err(|source| BlockwiseError::KernelExecutionError {
                function: entry.name().to_string(),
                source,
            })?;

        let mut uploaded = uploads.iter();
        for (name, arg) in entry.argument_order().iter().zip(args.iter_mut()) {
            if let KernelArg::RawArray(host) = arg
                && let Some(device) = uploaded.next()
            {
                device.download_into(self.runtime, &mut **host)?;
                trace!("Copied '{}' back to host", name);
            }
        }
        Ok(())
    }

    /// Checks every argument against the declaration and returns the block count
    fn validate(
        &self,
        entry: &RegistryEntry<CompiledKernel<R::Function>>,
        args: &[KernelArg<'_, R::Buffer>],
    ) -> Result<usize> {
        let order = entry.argument_order();
        if args.len() != order.len() {
            return Err(BlockwiseError::ArgumentCount {
                function: entry.name().to_string(),
                expected: order.len(),
                found: args.len(),
            });
        }

        for (name, arg) in order.iter().zip(args) {
            let declared = entry.arg_type(name).ok_or_else(|| {
                BlockwiseError::invalid(entry.name(), format!("argument \"{name}\" has no type"))
            })?;
            let matches = match (declared, arg) {
                (ElementType::Array(t), KernelArg::RawArray(a)) => a.element_type() == t,
                (ElementType::Array(t), KernelArg::Device(d)) => d.element_type() == t,
                (ElementType::Scalar(t), KernelArg::Scalar(v)) => v.scalar_type() == t,
                _ => false,
            };
            if !matches {
                return Err(BlockwiseError::ArgumentTypeMismatch {
                    argument: name.clone(),
                    expected: declared.to_string(),
                    found: arg.describe(),
                });
            }
            if let Some(shape) = arg.shape() {
                check_shape(name, shape)?;
            }
        }

        let arrays = order
            .iter()
            .zip(args)
            .filter_map(|(name, arg)| arg.shape().map(|s| (name.as_str(), s)));
        partition::block_count(entry, arrays)
    }
}

impl<F> FunctionRegistry<CompiledKernel<F>> {
    /// Looks up `name` and dispatches it on `runtime`
    pub fn invoke<R>(
        &self,
        runtime: &R,
        name: &str,
        args: &mut [KernelArg<'_, R::Buffer>],
    ) -> Result<()>
    where
        R: DeviceRuntime<Function = F> + ?Sized,
    {
        Dispatcher::new(runtime).invoke(self.lookup(name)?, args)
    }
}
