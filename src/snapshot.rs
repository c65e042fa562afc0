use crate::tree::{ConstraintKind, Expr, HelperArg, LocalId, OperationKind};

/// Representation of a captured receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Copy of the object reference. Reassignment of the source variable is
    /// invisible; mutation of the pointed-to object stays visible.
    Reference,
    /// Full copy of the value. Get and set act on the frozen copy no matter
    /// what happens to the source variable in between.
    ValueCopy,
}

pub fn snapshot_kind(constraint: &ConstraintKind) -> SnapshotKind {
    if constraint.is_reference() {
        SnapshotKind::Reference
    } else {
        SnapshotKind::ValueCopy
    }
}

/// True when evaluating the expression can reassign the given local, i.e.
/// when a helper call somewhere inside takes it by `ref`.
pub fn may_reassign(expr: &Expr, local: LocalId) -> bool {
    let mut found = false;
    expr.walk(&mut |node| {
        if let Expr::Helper { args, .. } = node {
            for arg in args {
                if matches!(arg.node, HelperArg::Ref(l) if l == local) {
                    found = true;
                }
            }
        }
    });
    found
}

/// True when the expression contains a suspension point.
pub fn contains_await(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |node| {
        if matches!(node, Expr::Await(_)) {
            found = true;
        }
    });
    found
}

/// True when any sub-evaluation of the operation suspends.
pub fn operation_awaits(kind: &OperationKind) -> bool {
    match kind {
        OperationKind::Call { args, .. } => args.iter().any(|a| contains_await(&a.node)),
        OperationKind::PropertyCompound { rhs, .. }
        | OperationKind::PropertyCoalesce { rhs, .. } => contains_await(&rhs.node),
        OperationKind::IndexerCompound { index, rhs, .. }
        | OperationKind::IndexerCoalesce { index, rhs } => {
            contains_await(&index.node) || contains_await(&rhs.node)
        }
    }
}
