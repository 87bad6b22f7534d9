//! Registry compiler
//!
//! Turns every unbound entry of a [`FunctionRegistry`] into device code,
//! compiles all of them as a single module and binds the resulting kernels.
//! Binding is all-or-nothing: if any stage fails, no entry changes.

use crate::descriptor::typedef_preamble;
use crate::error::{BlockwiseError, Result};
use crate::registry::{CompiledKernel, FunctionRegistry};
use crate::runtime::{CodeGenerator, DeviceRuntime, GeneratedKernel};
use log::{debug, info};

/// Environment variable that turns on [`CompileOptions::dump_source`]
pub const DUMP_SOURCE_ENV: &str = "BLOCKWISE_DUMP_SOURCE";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Log the assembled module at info level instead of debug
    pub dump_source: bool,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dump_source(mut self, dump_source: bool) -> Self {
        self.dump_source = dump_source;
        self
    }

    pub fn from_env() -> Self {
        let dump_source = std::env::var(DUMP_SOURCE_ENV).is_ok_and(|v| v.trim() == "1");
        Self { dump_source }
    }
}

/// Generates one module for every unbound entry of `registry`
///
/// Returns the names of the included functions and the full source:
/// typedef preamble, then all prototypes, then all kernel bodies.
pub fn assemble_module<G, K>(
    generator: &G,
    registry: &FunctionRegistry<K>,
) -> Result<(Vec<String>, String)>
where
    G: CodeGenerator + ?Sized,
{
    let mut names = Vec::new();
    let mut kernels: Vec<GeneratedKernel> = Vec::new();
    for entry in registry.entries().filter(|e| !e.is_bound()) {
        let generated = generator.generate(&entry.describe()).map_err(|e| {
            BlockwiseError::CompilationError {
                function: entry.name().to_string(),
                message: e.to_string(),
            }
        })?;
        debug!("Generated kernel for '{}'", entry.name());
        names.push(entry.name().to_string());
        kernels.push(generated);
    }

    let mut source = typedef_preamble();
    for kernel in &kernels {
        source.push_str(kernel.prototype.trim_end().trim_end_matches(';'));
        source.push_str(";\n");
    }
    source.push('\n');
    for kernel in &kernels {
        source.push_str(&kernel.source);
        if !kernel.source.ends_with('\n') {
            source.push('\n');
        }
        source.push('\n');
    }
    Ok((names, source))
}

/// Compiles registered block functions with a code generator and runtime
pub struct RegistryCompiler<'a, G: ?Sized, R: ?Sized> {
    generator: &'a G,
    runtime: &'a R,
    options: CompileOptions,
}

impl<'a, G, R> RegistryCompiler<'a, G, R>
where
    G: CodeGenerator + ?Sized,
    R: DeviceRuntime + ?Sized,
{
    pub fn new(generator: &'a G, runtime: &'a R) -> Self {
        Self {
            generator,
            runtime,
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    /// Assembles the module source for every unbound entry
    pub fn assemble(
        &self,
        registry: &FunctionRegistry<CompiledKernel<R::Function>>,
    ) -> Result<(Vec<String>, String)> {
        assemble_module(self.generator, registry)
    }

    /// Compiles and binds every unbound entry, returning how many were bound
    pub fn compile_all(
        &self,
        registry: &mut FunctionRegistry<CompiledKernel<R::Function>>,
    ) -> Result<usize> {
        let (names, source) = self.assemble(registry)?;
        if names.is_empty() {
            debug!("All block functions already compiled");
            return Ok(0);
        }
        info!("Compiling {} block function(s)", names.len());
        if self.options.dump_source {
            info!("Generated module source:\n{}", source);
        } else {
            debug!("Generated module source:\n{}", source);
        }

        let module = self.runtime.compile_module(&source).map_err(|e| {
            BlockwiseError::CompilationError {
                function: names.join(", "),
                message: e.to_string(),
            }
        })?;

        let mut kernels = Vec::with_capacity(names.len());
        for name in &names {
            let entry = registry.lookup(name)?;
            let entry_point = entry.entry_point();
            let function = self
                .runtime
                .get_function(&module, &entry_point)
                .map_err(|e| BlockwiseError::CompilationError {
                    function: name.clone(),
                    message: e.to_string(),
                })?;
            kernels.push(CompiledKernel {
                function,
                entry_point,
                signature: entry.signature(),
            });
        }

        for (name, kernel) in names.iter().zip(kernels) {
            registry.bind_callable(name, kernel)?;
        }
        Ok(names.len())
    }
}
