use serde::{Serialize, Deserialize};

use crate::snapshot::SnapshotKind;
use crate::tree::ReceiverVar;

/// How a member invocation on the receiver is dispatched. Selected once per
/// call site; every branch of emission keys off this single decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchKind {
    /// Virtual call on a reference already on the stack.
    CallVirt,
    /// Constrained virtual call on an address; skips boxing when the
    /// runtime type turns out to be a value type.
    ConstrainedCallVirt,
}

/// How the receiver itself is materialized onto the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverAccess {
    /// Load the slot's value. For a reference-constrained receiver the
    /// loaded reference is itself a snapshot: later reassignment of the
    /// variable is not observed.
    Value,
    /// Take the slot's address. Dereferenced at dispatch, so side effects
    /// on the variable between the load and the call are observed.
    Address,
    /// Load the value and box it; needed when a null test requires an
    /// object reference (conditional access on a possibly-value type).
    BoxedValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverPlan {
    pub access: ReceiverAccess,
    pub dispatch: DispatchKind,
}

/// Decide dispatch for a direct call on the receiver variable.
///
/// The receiver's static type is a type parameter, so the member comes from
/// an interface or a constraint. A reference-constrained receiver that is
/// not passed by ref loads its reference by value and uses an ordinary
/// virtual call. Everything else takes the address and lets the constrained
/// call sort out boxing at dispatch.
pub fn plan_call(receiver: &ReceiverVar, conditional: bool) -> ReceiverPlan {
    let plan = if receiver.constraint.is_reference() && !receiver.by_ref {
        // The reference itself is null-testable; conditional access needs no box.
        ReceiverPlan {
            access: ReceiverAccess::Value,
            dispatch: DispatchKind::CallVirt,
        }
    } else if conditional {
        ReceiverPlan {
            access: ReceiverAccess::BoxedValue,
            dispatch: DispatchKind::CallVirt,
        }
    } else {
        ReceiverPlan {
            access: ReceiverAccess::Address,
            dispatch: DispatchKind::ConstrainedCallVirt,
        }
    };
    tracing::debug!(
        target: "receiver_lowering",
        constraint = ?receiver.constraint,
        by_ref = receiver.by_ref,
        conditional,
        access = ?plan.access,
        dispatch = ?plan.dispatch,
        "planned receiver materialization"
    );
    plan
}

/// Decide dispatch for accessor calls made against a captured snapshot.
///
/// A reference snapshot holds an object reference, so accessors use a plain
/// virtual call on the value. A value snapshot holds a frozen copy, so
/// accessors take the copy's address and dispatch constrained.
pub fn plan_snapshot_access(kind: SnapshotKind) -> ReceiverPlan {
    match kind {
        SnapshotKind::Reference => ReceiverPlan {
            access: ReceiverAccess::Value,
            dispatch: DispatchKind::CallVirt,
        },
        SnapshotKind::ValueCopy => ReceiverPlan {
            access: ReceiverAccess::Address,
            dispatch: DispatchKind::ConstrainedCallVirt,
        },
    }
}
