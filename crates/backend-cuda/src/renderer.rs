//! CUDA code renderer
//!
//! Converts a block function description into a CUDA kernel. Each thread
//! handles one block: it computes the flattened block index, returns early
//! past the block count, derives the block origin of every block-shaped
//! array and then runs the body.

use blockwise::ast::{BinaryOp, Expr, Literal, Stmt, UnaryOp};
use blockwise::descriptor::MAX_DIMS;
use blockwise::partition::BlockMode;
use blockwise::registry::BlockShape;
use blockwise::runtime::{
    CodeGenerator, GeneratedKernel, KernelDescription, KernelParam, RuntimeError,
};
use std::collections::HashMap;
use std::fmt::Write;

/// Flattened block index inside generated kernels
pub const INDEX_VAR: &str = "idx";
/// Trailing block count parameter
pub const COUNT_PARAM: &str = "count";
/// Prefix of every other name the renderer introduces
pub const GENERATED_PREFIX: &str = "_o_";

/// CUDA code renderer
#[derive(Debug, Clone)]
pub struct CudaRenderer {
    indent_width: usize,
}

impl Default for CudaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl CudaRenderer {
    pub fn new() -> Self {
        Self { indent_width: 4 }
    }

    pub fn with_indent_width(mut self, width: usize) -> Self {
        self.indent_width = width;
        self
    }

    /// Declaration of the kernel entry point, without the trailing `;`
    pub fn render_prototype(&self, kernel: &KernelDescription<'_>) -> String {
        let params = kernel
            .params
            .iter()
            .map(render_param)
            .chain(std::iter::once(format!("int {COUNT_PARAM}")))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "extern \"C\" __global__ void {}({})",
            kernel.entry_point, params
        )
    }

    /// Full kernel definition
    pub fn render_kernel(&self, kernel: &KernelDescription<'_>) -> Result<String, RuntimeError> {
        check_names(kernel)?;
        let mut writer = KernelWriter::new(kernel, self.indent_width);

        writer.code.push_str(&self.render_prototype(kernel));
        writer.code.push_str("\n{\n");
        writer.indent += 1;
        writer.line(&format!(
            "const int {INDEX_VAR} = (blockIdx.y * gridDim.x + blockIdx.x) * blockDim.x + threadIdx.x;"
        ));
        writer.line(&format!("if ({INDEX_VAR} >= {COUNT_PARAM}) return;"));
        writer.origins();
        for stmt in kernel.body {
            writer.stmt(stmt)?;
        }
        writer.indent -= 1;
        writer.code.push_str("}\n");
        Ok(writer.code)
    }
}

impl CodeGenerator for CudaRenderer {
    fn generate(&self, kernel: &KernelDescription<'_>) -> Result<GeneratedKernel, RuntimeError> {
        let source = self.render_kernel(kernel)?;
        log::trace!("Rendered CUDA kernel '{}':\n{}", kernel.entry_point, source);
        Ok(GeneratedKernel {
            source,
            prototype: self.render_prototype(kernel),
        })
    }
}

fn render_param(param: &KernelParam<'_>) -> String {
    format!("{} {}", param.ty.native_name(), param.name)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_name(function: &str, name: &str) -> Result<(), RuntimeError> {
    if !is_identifier(name) {
        return Err(RuntimeError::Codegen(format!(
            "{function}: \"{name}\" is not a valid identifier"
        )));
    }
    if name == INDEX_VAR || name == COUNT_PARAM || name.starts_with(GENERATED_PREFIX) {
        return Err(RuntimeError::Codegen(format!(
            "{function}: name \"{name}\" is reserved"
        )));
    }
    Ok(())
}

/// Parameter names must be plain identifiers that do not shadow generated ones
fn check_names(kernel: &KernelDescription<'_>) -> Result<(), RuntimeError> {
    for param in &kernel.params {
        check_name(kernel.name, param.name)?;
    }
    Ok(())
}

fn origin_var(array: &str, axis: usize) -> String {
    format!("{GENERATED_PREFIX}{array}_{axis}")
}

fn render_literal(lit: &Literal) -> String {
    match *lit {
        Literal::Int(v) if i32::try_from(v).is_ok() => v.to_string(),
        Literal::Int(v) => format!("{v}LL"),
        Literal::Float(v) if v.is_nan() => "NAN".to_string(),
        Literal::Float(v) if v.is_infinite() => {
            let inf = if v > 0.0 { "INFINITY" } else { "(-INFINITY)" };
            inf.to_string()
        }
        Literal::Float(v) => format!("{v:?}"),
    }
}

struct KernelWriter<'k> {
    mode: BlockMode,
    name: &'k str,
    /// Array parameters and their block shape, if partitioned
    arrays: HashMap<&'k str, Option<&'k BlockShape>>,
    blocked: Vec<(&'k str, &'k BlockShape)>,
    code: String,
    indent: usize,
    indent_width: usize,
}

impl<'k> KernelWriter<'k> {
    fn new(kernel: &'k KernelDescription<'k>, indent_width: usize) -> Self {
        let array_params = kernel.params.iter().filter(|p| p.ty.is_array());
        Self {
            mode: BlockMode::new(kernel.overlapping, kernel.center_as_origin),
            name: kernel.name,
            arrays: array_params.clone().map(|p| (p.name, p.block_shape)).collect(),
            blocked: array_params
                .filter_map(|p| p.block_shape.map(|b| (p.name, b)))
                .collect(),
            code: String::new(),
            indent: 0,
            indent_width,
        }
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(
            self.code,
            "{:width$}{}",
            "",
            text,
            width = self.indent * self.indent_width
        );
    }

    fn error(&self, msg: impl std::fmt::Display) -> RuntimeError {
        RuntimeError::Codegen(format!("{}: {msg}", self.name))
    }

    /// Decomposes the block index into a per-axis origin for each blocked array
    fn origins(&mut self) {
        for (array, shape) in self.blocked.clone() {
            let rem = format!("{GENERATED_PREFIX}{array}_rem");
            self.line(&format!("int {rem} = {INDEX_VAR};"));
            for (axis, &b) in shape.dims().iter().enumerate().rev() {
                let extent = match self.mode {
                    BlockMode::Tiled => format!("({array}->dim[{axis}] / {b})"),
                    BlockMode::Sliding if b > 1 => {
                        format!("({array}->dim[{axis}] - {})", b - 1)
                    }
                    BlockMode::Sliding | BlockMode::Centered => format!("{array}->dim[{axis}]"),
                };
                let position = if axis == 0 {
                    rem.clone()
                } else {
                    format!("{rem} % {extent}")
                };
                let origin = match self.mode {
                    BlockMode::Tiled if b > 1 => format!("({position}) * {b}"),
                    _ => position,
                };
                self.line(&format!("const int {} = {origin};", origin_var(array, axis)));
                if axis > 0 {
                    self.line(&format!("{rem} /= {extent};"));
                }
            }
        }
    }

    /// Per-axis coordinates of an element access
    fn coordinates(&self, array: &str, offset: &[Expr]) -> Result<Vec<String>, RuntimeError> {
        let Some(&block) = self.arrays.get(array) else {
            return Err(self.error(format!("\"{array}\" is not an array argument")));
        };
        let rank = block.map_or(offset.len(), BlockShape::ndim);
        if offset.len() != rank || rank == 0 || rank > MAX_DIMS {
            return Err(self.error(format!(
                "access to \"{array}\" needs {rank} indices, got {}",
                offset.len()
            )));
        }
        offset
            .iter()
            .enumerate()
            .map(|(axis, e)| {
                let e = self.expr(e)?;
                Ok(match block {
                    Some(_) => format!("{} + {e}", origin_var(array, axis)),
                    None => e,
                })
            })
            .collect()
    }

    fn linear_index(array: &str, coords: &[String]) -> String {
        let mut index = format!("({})", coords[0]);
        for (axis, c) in coords.iter().enumerate().skip(1) {
            index = format!("{index} * {array}->dim[{axis}] + ({c})");
        }
        index
    }

    fn load(&self, array: &str, offset: &[Expr]) -> Result<String, RuntimeError> {
        let mut coords = self.coordinates(array, offset)?;
        // centered windows reach past the array edge; reads clamp to it
        if self.mode == BlockMode::Centered && self.arrays[array].is_some() {
            for (axis, c) in coords.iter_mut().enumerate() {
                *c = format!("min(max({c}, 0), {array}->dim[{axis}] - 1)");
            }
        }
        Ok(format!("{array}->data[{}]", Self::linear_index(array, &coords)))
    }

    fn store(&mut self, array: &str, offset: &[Expr], value: &Expr) -> Result<(), RuntimeError> {
        let coords = self.coordinates(array, offset)?;
        let value = self.expr(value)?;
        if self.mode == BlockMode::Centered && self.arrays[array].is_some() {
            // writes past the edge are dropped
            self.line("{");
            self.indent += 1;
            let names: Vec<String> = (0..coords.len())
                .map(|a| format!("{GENERATED_PREFIX}{array}_c{a}"))
                .collect();
            for (name, c) in names.iter().zip(&coords) {
                self.line(&format!("const int {name} = {c};"));
            }
            let inside = names
                .iter()
                .enumerate()
                .map(|(axis, n)| format!("{n} >= 0 && {n} < {array}->dim[{axis}]"))
                .collect::<Vec<_>>()
                .join(" && ");
            self.line(&format!(
                "if ({inside}) {array}->data[{}] = {value};",
                Self::linear_index(array, &names)
            ));
            self.indent -= 1;
            self.line("}");
        } else {
            self.line(&format!(
                "{array}->data[{}] = {value};",
                Self::linear_index(array, &coords)
            ));
        }
        Ok(())
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), RuntimeError> {
        self.indent += 1;
        for s in stmts {
            self.stmt(s)?;
        }
        self.indent -= 1;
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), RuntimeError> {
        match stmt {
            Stmt::Let { name, ty, value } => {
                check_name(self.name, name)?;
                let value = self.expr(value)?;
                self.line(&format!("{} {name} = {value};", ty.native_name()));
            }
            Stmt::Assign { name, value } => {
                check_name(self.name, name)?;
                let value = self.expr(value)?;
                self.line(&format!("{name} = {value};"));
            }
            Stmt::Store {
                array,
                offset,
                value,
            } => self.store(array, offset, value)?,
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.expr(cond)?;
                self.line(&format!("if ({cond}) {{"));
                self.block(then)?;
                if !otherwise.is_empty() {
                    self.line("} else {");
                    self.block(otherwise)?;
                }
                self.line("}");
            }
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                check_name(self.name, var)?;
                let (start, end) = (self.expr(start)?, self.expr(end)?);
                self.line(&format!("for (int {var} = {start}; {var} < {end}; ++{var}) {{"));
                self.block(body)?;
                self.line("}");
            }
            Stmt::Sync => self.line("__syncthreads();"),
        }
        Ok(())
    }

    fn expr(&self, expr: &Expr) -> Result<String, RuntimeError> {
        Ok(match expr {
            Expr::Const(lit) => render_literal(lit),
            Expr::Var(name) => {
                check_name(self.name, name)?;
                name.clone()
            }
            Expr::BlockIndex => INDEX_VAR.to_string(),
            Expr::Dim { array, axis } => {
                if !self.arrays.contains_key(array.as_str()) {
                    return Err(self.error(format!("\"{array}\" is not an array argument")));
                }
                if *axis >= MAX_DIMS {
                    return Err(self.error(format!("axis {axis} of \"{array}\" out of range")));
                }
                format!("{array}->dim[{axis}]")
            }
            Expr::Load { array, offset } => self.load(array, offset)?,
            Expr::Binary { op, lhs, rhs } => {
                let (l, r) = (self.expr(lhs)?, self.expr(rhs)?);
                match op {
                    BinaryOp::Min => format!("min({l}, {r})"),
                    BinaryOp::Max => format!("max({l}, {r})"),
                    _ => format!("({l} {} {r})", infix(*op)),
                }
            }
            Expr::Unary { op, operand } => {
                let v = self.expr(operand)?;
                match op {
                    UnaryOp::Neg => format!("(-{v})"),
                    UnaryOp::Not => format!("(!{v})"),
                    UnaryOp::Abs => format!("abs({v})"),
                    UnaryOp::Sqrt => format!("sqrt({v})"),
                    UnaryOp::Exp => format!("exp({v})"),
                    UnaryOp::Log => format!("log({v})"),
                }
            }
            Expr::Cast { ty, value } => format!("(({})({}))", ty.native_name(), self.expr(value)?),
            Expr::Select {
                cond,
                then,
                otherwise,
            } => format!(
                "({} ? {} : {})",
                self.expr(cond)?,
                self.expr(then)?,
                self.expr(otherwise)?
            ),
        })
    }
}

fn infix(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Min | BinaryOp::Max => unreachable!("rendered as calls"),
    }
}
