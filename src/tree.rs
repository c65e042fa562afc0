use serde::{Serialize, Deserialize};

use crate::span::Spanned;

/// Index into a [`BoundOperation`]'s locals table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalId(pub u32);

/// Constraint set on the receiver's type parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Unconstrained,
    Class,
    Struct,
    Interface(String),
}

impl ConstraintKind {
    /// True when the static type is known to be a reference type.
    pub fn is_reference(&self) -> bool {
        matches!(self, ConstraintKind::Class)
    }
}

/// Storage type of a frame slot. `TypeParam` slots hold a value of the
/// generic parameter's type; the concrete shape is only known at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeHint {
    TypeParam,
    Int,
    Str,
    Bool,
}

impl TypeHint {
    /// Slots of these types may retain a heap reference and must be
    /// defaulted once a durable spill is no longer needed.
    pub fn is_reference_like(&self) -> bool {
        matches!(self, TypeHint::TypeParam | TypeHint::Str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDecl {
    pub name: String,
    pub ty: TypeHint,
    pub is_param: bool,
}

/// The receiver expression: always a local (or parameter) whose static type
/// is the operation's generic type parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverVar {
    pub local: LocalId,
    pub constraint: ConstraintKind,
    /// True for a `ref T` parameter: the slot aliases caller storage.
    pub by_ref: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
}

/// An argument to a helper function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HelperArg {
    Value(Spanned<Expr>),
    /// Passed by reference; the helper may reassign the local.
    Ref(LocalId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Str(String),
    Local(LocalId),
    /// Call to a free (static) helper function. `ret` is the bound return
    /// type; for an awaitable helper it is the awaited payload's type.
    Helper {
        name: String,
        args: Vec<Spanned<HelperArg>>,
        ret: TypeHint,
    },
    /// Suspension point: evaluates the inner expression to an awaitable,
    /// then suspends until it completes.
    Await(Box<Spanned<Expr>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    /// `recv.M(args)` or `recv?.M(args)`.
    Call {
        member: String,
        args: Vec<Spanned<Expr>>,
        conditional: bool,
    },
    /// `recv.P op= rhs`.
    PropertyCompound {
        property: String,
        op: BinOp,
        rhs: Spanned<Expr>,
    },
    /// `recv.P ??= rhs`.
    PropertyCoalesce {
        property: String,
        rhs: Spanned<Expr>,
    },
    /// `recv[index] op= rhs`.
    IndexerCompound {
        index: Spanned<Expr>,
        op: BinOp,
        rhs: Spanned<Expr>,
    },
    /// `recv[index] ??= rhs`.
    IndexerCoalesce {
        index: Spanned<Expr>,
        rhs: Spanned<Expr>,
    },
}

/// One bound statement containing a generic-receiver operation, plus the
/// frame it executes in. Spans point into `rendered`, which is produced by
/// `pretty::render` when the operation is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundOperation {
    pub locals: Vec<LocalDecl>,
    pub receiver: ReceiverVar,
    pub kind: Spanned<OperationKind>,
    pub rendered: String,
}

impl BoundOperation {
    pub fn new(locals: Vec<LocalDecl>, receiver: ReceiverVar, kind: OperationKind) -> Self {
        let mut op = Self {
            locals,
            receiver,
            kind: Spanned::dummy(kind),
            rendered: String::new(),
        };
        crate::pretty::render(&mut op);
        op
    }

    pub fn local(&self, id: LocalId) -> &LocalDecl {
        &self.locals[id.0 as usize]
    }
}

impl Expr {
    /// Walk the expression tree, calling `visit` on every node.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Helper { args, .. } => {
                for arg in args {
                    if let HelperArg::Value(expr) = &arg.node {
                        expr.node.walk(visit);
                    }
                }
            }
            Expr::Await(inner) => inner.node.walk(visit),
            Expr::Int(_) | Expr::Str(_) | Expr::Local(_) => {}
        }
    }
}
