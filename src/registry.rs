//! Registry of declared block functions
//!
//! A block function is declared once with [`BlockFunction::builder`], added
//! to a [`FunctionRegistry`] and later bound to a compiled kernel by the
//! registry compiler. Binding happens exactly once; after that an entry is
//! immutable and the registry can be shared for concurrent dispatch.

use crate::ast::Stmt;
use crate::descriptor::MAX_DIMS;
use crate::dtype::{ElementType, kernel_signature};
use crate::error::{BlockwiseError, Result};
use crate::runtime::{KernelDescription, KernelParam};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Prefix of the exported kernel symbol generated for each function
pub const ENTRY_POINT_PREFIX: &str = "_kernel_";

/// Extent of one block along each axis
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockShape(Vec<usize>);

impl BlockShape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        BlockShape(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Number of elements in one block
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// `true` for the single-element window `(1, 1, ..)`
    pub fn is_unit(&self) -> bool {
        self.0.iter().all(|&d| d == 1)
    }
}

impl From<Vec<usize>> for BlockShape {
    fn from(dims: Vec<usize>) -> Self {
        BlockShape(dims)
    }
}

impl From<&[usize]> for BlockShape {
    fn from(dims: &[usize]) -> Self {
        BlockShape(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for BlockShape {
    fn from(dims: [usize; N]) -> Self {
        BlockShape(dims.to_vec())
    }
}

impl fmt::Display for BlockShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// One or more argument names sharing a block shape or type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgGroup(Vec<String>);

impl ArgGroup {
    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for ArgGroup {
    fn from(name: &str) -> Self {
        ArgGroup(vec![name.to_string()])
    }
}

impl From<String> for ArgGroup {
    fn from(name: String) -> Self {
        ArgGroup(vec![name])
    }
}

impl<const N: usize> From<[&str; N]> for ArgGroup {
    fn from(names: [&str; N]) -> Self {
        ArgGroup(names.iter().map(|s| s.to_string()).collect())
    }
}

impl From<&[&str]> for ArgGroup {
    fn from(names: &[&str]) -> Self {
        ArgGroup(names.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<&str>> for ArgGroup {
    fn from(names: Vec<&str>) -> Self {
        names.as_slice().into()
    }
}

impl From<Vec<String>> for ArgGroup {
    fn from(names: Vec<String>) -> Self {
        ArgGroup(names)
    }
}

/// Unvalidated declaration of a block function
#[derive(Debug, Clone, Default)]
pub struct BlockFunction {
    name: String,
    argument_order: Vec<String>,
    block_shapes: Vec<(ArgGroup, BlockShape)>,
    arg_types: Vec<(ArgGroup, ElementType)>,
    overlapping: bool,
    center_as_origin: bool,
    body: Vec<Stmt>,
}

impl BlockFunction {
    /// Starts a declaration; blocks overlap unless told otherwise
    pub fn builder(name: impl Into<String>) -> BlockFunctionBuilder {
        BlockFunctionBuilder {
            decl: BlockFunction {
                name: name.into(),
                overlapping: true,
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for [`BlockFunction`]
#[derive(Debug, Clone)]
pub struct BlockFunctionBuilder {
    decl: BlockFunction,
}

impl BlockFunctionBuilder {
    /// Appends an argument with its type
    pub fn arg(mut self, name: impl Into<String>, ty: impl Into<ElementType>) -> Self {
        let name = name.into();
        self.decl
            .arg_types
            .push((ArgGroup::from(name.clone()), ty.into()));
        self.decl.argument_order.push(name);
        self
    }

    /// Appends arguments whose types are given separately with [`Self::arg_types`]
    pub fn args(mut self, names: impl Into<ArgGroup>) -> Self {
        self.decl.argument_order.extend(names.into().0);
        self
    }

    pub fn arg_types(mut self, names: impl Into<ArgGroup>, ty: impl Into<ElementType>) -> Self {
        self.decl.arg_types.push((names.into(), ty.into()));
        self
    }

    pub fn block_shape(mut self, names: impl Into<ArgGroup>, shape: impl Into<BlockShape>) -> Self {
        self.decl.block_shapes.push((names.into(), shape.into()));
        self
    }

    pub fn overlapping(mut self, overlapping: bool) -> Self {
        self.decl.overlapping = overlapping;
        self
    }

    pub fn center_as_origin(mut self, center_as_origin: bool) -> Self {
        self.decl.center_as_origin = center_as_origin;
        self
    }

    pub fn body(mut self, body: Vec<Stmt>) -> Self {
        self.decl.body = body;
        self
    }

    pub fn build(self) -> BlockFunction {
        self.decl
    }
}

/// Compiled kernel bound to a registry entry
#[derive(Debug, Clone)]
pub struct CompiledKernel<F> {
    pub function: F,
    pub entry_point: String,
    /// Marshal codes of all arguments plus the trailing block count
    pub signature: String,
}

/// Validated, registered block function
#[derive(Debug)]
pub struct RegistryEntry<K> {
    name: String,
    block_shapes: HashMap<String, BlockShape>,
    arg_types: HashMap<String, ElementType>,
    overlapping: bool,
    center_as_origin: bool,
    argument_order: Vec<String>,
    body: Vec<Stmt>,
    callable: Option<K>,
}

impl<K> RegistryEntry<K> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn overlapping(&self) -> bool {
        self.overlapping
    }

    pub fn center_as_origin(&self) -> bool {
        self.center_as_origin
    }

    pub fn argument_order(&self) -> &[String] {
        &self.argument_order
    }

    pub fn block_shape(&self, arg: &str) -> Option<&BlockShape> {
        self.block_shapes.get(arg)
    }

    pub fn arg_type(&self, arg: &str) -> Option<ElementType> {
        self.arg_types.get(arg).copied()
    }

    pub fn body(&self) -> &[Stmt] {
        &self.body
    }

    /// Argument types in declaration order
    pub fn ordered_types(&self) -> impl Iterator<Item = ElementType> + '_ {
        self.argument_order.iter().map(|a| self.arg_types[a])
    }

    pub fn entry_point(&self) -> String {
        format!("{ENTRY_POINT_PREFIX}{}", self.name)
    }

    pub fn signature(&self) -> String {
        kernel_signature(self.ordered_types())
    }

    pub fn callable(&self) -> Option<&K> {
        self.callable.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.callable.is_some()
    }

    /// View handed to a code generator
    pub fn describe(&self) -> KernelDescription<'_> {
        KernelDescription {
            name: &self.name,
            entry_point: self.entry_point(),
            params: self
                .argument_order
                .iter()
                .map(|a| KernelParam {
                    name: a,
                    ty: self.arg_types[a],
                    block_shape: self.block_shapes.get(a),
                })
                .collect(),
            overlapping: self.overlapping,
            center_as_origin: self.center_as_origin,
            body: &self.body,
        }
    }
}

/// Owns every declared block function
#[derive(Debug)]
pub struct FunctionRegistry<K> {
    entries: Vec<RegistryEntry<K>>,
    index: HashMap<String, usize>,
}

impl<K> Default for FunctionRegistry<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K> FunctionRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a declaration
    ///
    /// All configuration errors surface here, never at call time.
    pub fn register(&mut self, decl: BlockFunction) -> Result<&RegistryEntry<K>> {
        let name = decl.name;
        if name.is_empty() {
            return Err(BlockwiseError::invalid(&name, "function name must not be empty"));
        }
        if self.index.contains_key(&name) {
            return Err(BlockwiseError::DuplicateRegistration(name));
        }

        let block_shapes = flatten(&name, decl.block_shapes)?;
        let arg_types = flatten(&name, decl.arg_types)?;

        if decl.center_as_origin && !decl.overlapping {
            return Err(BlockwiseError::invalid(
                &name,
                "you can't have overlapping=false and center_as_origin=true",
            ));
        }

        let mut seen = HashSet::new();
        for arg in &decl.argument_order {
            if !seen.insert(arg.as_str()) {
                return Err(BlockwiseError::DuplicateVariable {
                    function: name.clone(),
                    variable: arg.clone(),
                });
            }
            if !arg_types.contains_key(arg) {
                return Err(BlockwiseError::invalid(
                    &name,
                    format!("argument \"{arg}\" has no declared type"),
                ));
            }
        }
        for arg in arg_types.keys().chain(block_shapes.keys()) {
            if !seen.contains(arg.as_str()) {
                return Err(BlockwiseError::invalid(
                    &name,
                    format!("\"{arg}\" is not an argument of the function"),
                ));
            }
        }

        if block_shapes.is_empty() {
            return Err(BlockwiseError::invalid(
                &name,
                "at least one argument needs a block shape",
            ));
        }
        for (arg, shape) in &block_shapes {
            validate_block_shape(&name, arg, shape, decl.center_as_origin)?;
            if !arg_types[arg].is_array() {
                return Err(BlockwiseError::invalid(
                    &name,
                    format!(
                        "block-shaped argument \"{arg}\" must have an array type, not {}",
                        arg_types[arg]
                    ),
                ));
            }
        }

        let entry = RegistryEntry {
            name: name.clone(),
            block_shapes,
            arg_types,
            overlapping: decl.overlapping,
            center_as_origin: decl.center_as_origin,
            argument_order: decl.argument_order,
            body: decl.body,
            callable: None,
        };
        debug!(
            "Registered block function '{}' ({}, overlapping={}, center_as_origin={})",
            name,
            entry.signature(),
            entry.overlapping,
            entry.center_as_origin
        );

        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(name, idx);
        Ok(&self.entries[idx])
    }

    pub fn lookup(&self, name: &str) -> Result<&RegistryEntry<K>> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| BlockwiseError::UnknownFunction(name.to_string()))
    }

    /// Sets the compiled kernel of `name`; only the first call succeeds
    pub fn bind_callable(&mut self, name: &str, handle: K) -> Result<()> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| BlockwiseError::UnknownFunction(name.to_string()))?;
        let entry = &mut self.entries[idx];
        if entry.callable.is_some() {
            return Err(BlockwiseError::AlreadyBound(name.to_string()));
        }
        entry.callable = Some(handle);
        debug!("Bound compiled kernel to '{}'", name);
        Ok(())
    }

    /// Entries in declaration order
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry<K>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expands grouped keys into one entry per argument name
fn flatten<V: Clone>(function: &str, groups: Vec<(ArgGroup, V)>) -> Result<HashMap<String, V>> {
    let mut flat = HashMap::new();
    for (group, value) in groups {
        for name in group.0 {
            if flat.contains_key(&name) {
                return Err(BlockwiseError::DuplicateVariable {
                    function: function.to_string(),
                    variable: name,
                });
            }
            flat.insert(name, value.clone());
        }
    }
    Ok(flat)
}

fn validate_block_shape(
    function: &str,
    arg: &str,
    shape: &BlockShape,
    center_as_origin: bool,
) -> Result<()> {
    if shape.ndim() == 0 || shape.ndim() > MAX_DIMS {
        return Err(BlockwiseError::invalid(
            function,
            format!(
                "block shape of \"{arg}\" must have between 1 and {MAX_DIMS} dimensions, got {shape}"
            ),
        ));
    }
    if shape.dims().contains(&0) {
        return Err(BlockwiseError::invalid(
            function,
            format!("block shape of \"{arg}\" has a zero dimension: {shape}"),
        ));
    }
    if center_as_origin && shape.dims().iter().any(|d| d % 2 == 0) {
        return Err(BlockwiseError::invalid(
            function,
            format!(
                "block dimensions must be uneven when using center_as_origin=true, \
                 please check \"{arg}\" {shape}"
            ),
        ));
    }
    Ok(())
}
