//! Language-neutral description of a block function's body
//!
//! A block function body is a list of [`Stmt`]s over [`Expr`]s. Array
//! accesses are written relative to the current block: `load("img", [dy, dx])`
//! reads the element at offset `(dy, dx)` from the block origin of `img`
//! (its top-left corner, or its center when the function is declared with
//! center-as-origin). A code generator decides how the origin is computed
//! from the flattened block index.
//!
//! ```ignore
//! use blockwise::ast::*;
//!
//! let body = vec![
//!     let_("acc", ScalarType::F32, 0.0f32),
//!     for_("dy", -1, 2, vec![
//!         for_("dx", -1, 2, vec![
//!             assign("acc", var("acc") + load("img", [var("dy"), var("dx")])),
//!         ]),
//!     ]),
//!     store("out", [0, 0], var("acc") / 9.0f32),
//! ];
//! ```

use crate::dtype::ScalarType;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Sqrt,
    Exp,
    Log,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Literal),
    /// Local variable or scalar parameter
    Var(String),
    /// Flattened index of the block being processed
    BlockIndex,
    /// Extent of an array argument along one axis
    Dim { array: String, axis: usize },
    /// Element at `offset` from the block origin of `array`
    Load { array: String, offset: Vec<Expr> },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Cast { ty: ScalarType, value: Box<Expr> },
    Select {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        ty: ScalarType,
        value: Expr,
    },
    Assign { name: String, value: Expr },
    /// Writes `value` at `offset` from the block origin of `array`
    Store {
        array: String,
        offset: Vec<Expr>,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    /// `for (var = start; var < end; var++)`
    For {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    /// Thread-group barrier
    Sync,
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Const(Literal::Int(v))
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Const(Literal::Int(i64::from(v)))
    }
}

/// Values above `i64::MAX` saturate
impl From<usize> for Expr {
    fn from(v: usize) -> Self {
        Expr::Const(Literal::Int(i64::try_from(v).unwrap_or(i64::MAX)))
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::Const(Literal::Float(v as f64))
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Const(Literal::Float(v))
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Var(name.to_string())
    }
}

// ============================================================================
// Expression helpers
// ============================================================================

macro_rules! impl_binary_helper {
    ($fn_name:ident, $variant:ident, $doc:expr) => {
        #[doc = $doc]
        pub fn $fn_name(self, rhs: impl Into<Expr>) -> Expr {
            self.binary(BinaryOp::$variant, rhs.into())
        }
    };
}

macro_rules! impl_unary_helper {
    ($fn_name:ident, $variant:ident, $doc:expr) => {
        #[doc = $doc]
        pub fn $fn_name(self) -> Expr {
            Expr::Unary {
                op: UnaryOp::$variant,
                operand: Box::new(self),
            }
        }
    };
}

impl Expr {
    fn binary(self, op: BinaryOp, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    impl_binary_helper!(min, Min, "min(self, rhs)");
    impl_binary_helper!(max, Max, "max(self, rhs)");
    impl_binary_helper!(lt, Lt, "self < rhs");
    impl_binary_helper!(le, Le, "self <= rhs");
    impl_binary_helper!(gt, Gt, "self > rhs");
    impl_binary_helper!(ge, Ge, "self >= rhs");
    impl_binary_helper!(eq_, Eq, "self == rhs");
    impl_binary_helper!(ne_, Ne, "self != rhs");
    impl_binary_helper!(and, And, "self && rhs");
    impl_binary_helper!(or, Or, "self || rhs");

    impl_unary_helper!(not, Not, "!self");
    impl_unary_helper!(abs, Abs, "|self|");
    impl_unary_helper!(sqrt, Sqrt, "sqrt(self)");
    impl_unary_helper!(exp, Exp, "e^self");
    impl_unary_helper!(log, Log, "ln(self)");

    pub fn cast(self, ty: ScalarType) -> Expr {
        Expr::Cast {
            ty,
            value: Box::new(self),
        }
    }

    pub fn select(self, then: impl Into<Expr>, otherwise: impl Into<Expr>) -> Expr {
        Expr::Select {
            cond: Box::new(self),
            then: Box::new(then.into()),
            otherwise: Box::new(otherwise.into()),
        }
    }
}

macro_rules! impl_ops_trait {
    ($trait:ident, $fname:ident, $variant:ident) => {
        impl<T> std::ops::$trait<T> for Expr
        where
            T: Into<Expr>,
        {
            type Output = Expr;
            fn $fname(self, rhs: T) -> Expr {
                self.binary(BinaryOp::$variant, rhs.into())
            }
        }
    };
}

impl_ops_trait!(Add, add, Add);
impl_ops_trait!(Sub, sub, Sub);
impl_ops_trait!(Mul, mul, Mul);
impl_ops_trait!(Div, div, Div);
impl_ops_trait!(Rem, rem, Rem);

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(self),
        }
    }
}

pub fn var(name: impl Into<String>) -> Expr {
    Expr::Var(name.into())
}

pub fn block_index() -> Expr {
    Expr::BlockIndex
}

pub fn dim(array: impl Into<String>, axis: usize) -> Expr {
    Expr::Dim {
        array: array.into(),
        axis,
    }
}

pub fn load<I, E>(array: impl Into<String>, offset: I) -> Expr
where
    I: IntoIterator<Item = E>,
    E: Into<Expr>,
{
    Expr::Load {
        array: array.into(),
        offset: offset.into_iter().map(Into::into).collect(),
    }
}

// ============================================================================
// Statement helpers
// ============================================================================

pub fn let_(name: impl Into<String>, ty: ScalarType, value: impl Into<Expr>) -> Stmt {
    Stmt::Let {
        name: name.into(),
        ty,
        value: value.into(),
    }
}

pub fn assign(name: impl Into<String>, value: impl Into<Expr>) -> Stmt {
    Stmt::Assign {
        name: name.into(),
        value: value.into(),
    }
}

pub fn store<I, E>(array: impl Into<String>, offset: I, value: impl Into<Expr>) -> Stmt
where
    I: IntoIterator<Item = E>,
    E: Into<Expr>,
{
    Stmt::Store {
        array: array.into(),
        offset: offset.into_iter().map(Into::into).collect(),
        value: value.into(),
    }
}

pub fn if_(cond: Expr, then: Vec<Stmt>) -> Stmt {
    Stmt::If {
        cond,
        then,
        otherwise: Vec::new(),
    }
}

pub fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Stmt {
    Stmt::If {
        cond,
        then,
        otherwise,
    }
}

pub fn for_(
    var: impl Into<String>,
    start: impl Into<Expr>,
    end: impl Into<Expr>,
    body: Vec<Stmt>,
) -> Stmt {
    Stmt::For {
        var: var.into(),
        start: start.into(),
        end: end.into(),
        body,
    }
}

pub fn sync() -> Stmt {
    Stmt::Sync
}

impl Stmt {
    /// Names of every array this statement reads or writes, in visit order
    pub fn arrays(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit_arrays(&mut out);
        out
    }

    fn visit_arrays<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Stmt::Let { value, .. } | Stmt::Assign { value, .. } => value.visit_arrays(out),
            Stmt::Store {
                array,
                offset,
                value,
            } => {
                out.push(array);
                offset.iter().for_each(|e| e.visit_arrays(out));
                value.visit_arrays(out);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                cond.visit_arrays(out);
                then.iter().chain(otherwise).for_each(|s| s.visit_arrays(out));
            }
            Stmt::For {
                start, end, body, ..
            } => {
                start.visit_arrays(out);
                end.visit_arrays(out);
                body.iter().for_each(|s| s.visit_arrays(out));
            }
            Stmt::Sync => {}
        }
    }
}

impl Expr {
    fn visit_arrays<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Const(_) | Expr::Var(_) | Expr::BlockIndex => {}
            Expr::Dim { array, .. } => out.push(array),
            Expr::Load { array, offset } => {
                out.push(array);
                offset.iter().for_each(|e| e.visit_arrays(out));
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit_arrays(out);
                rhs.visit_arrays(out);
            }
            Expr::Unary { operand, .. } => operand.visit_arrays(out),
            Expr::Cast { value, .. } => value.visit_arrays(out),
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                cond.visit_arrays(out);
                then.visit_arrays(out);
                otherwise.visit_arrays(out);
            }
        }
    }
}
