//! Emission driver: turns one bound operation into a lowered op sequence.
//!
//! Two strategies, chosen once per operation. Without a suspension point,
//! sub-expressions are evaluated directly on the operand stack. With one,
//! every sub-evaluation lands in a slot first (the operand stack must be
//! empty at each await), and any slot whose definition and last use straddle
//! an await is promoted to a durable field on the state-machine record.

use crate::diagnostics::LowerError;
use crate::machine::{MachineLayout, SpillField};
use crate::ops::{Const, FieldId, LabelId, LoweredProgram, Op, TempId};
use crate::policy::{self, ReceiverAccess, ReceiverPlan};
use crate::snapshot;
use crate::span::Spanned;
use crate::tree::*;

/// Lower a bound operation to its op sequence. Deterministic: the same
/// input always yields the same program.
pub fn lower_operation(op: &BoundOperation) -> Result<LoweredProgram, LowerError> {
    validate(op)?;
    let mut emitter = Emitter::new(op);
    emitter.emit()?;
    let program = emitter.finish();
    tracing::debug!(
        target: "receiver_lowering",
        rendered = %op.rendered,
        ops = program.ops.len(),
        temps = program.temp_tys.len(),
        fields = program.machine.as_ref().map_or(0, |m| m.fields.len()),
        states = program.machine.as_ref().map_or(0, |m| m.states),
        "lowered operation"
    );
    Ok(program)
}

fn validate(op: &BoundOperation) -> Result<(), LowerError> {
    let check_local = |id: LocalId, span: crate::span::Span| {
        if (id.0 as usize) < op.locals.len() {
            Ok(())
        } else {
            Err(LowerError::internal(
                format!("local {} out of bounds for frame of {}", id.0, op.locals.len()),
                span,
            ))
        }
    };
    check_local(op.receiver.local, op.kind.span)?;

    fn validate_expr(
        expr: &Spanned<Expr>,
        check: &dyn Fn(LocalId, crate::span::Span) -> Result<(), LowerError>,
    ) -> Result<(), LowerError> {
        match &expr.node {
            Expr::Int(_) | Expr::Str(_) => Ok(()),
            Expr::Local(id) => check(*id, expr.span),
            Expr::Helper { args, .. } => {
                if args.len() > u8::MAX as usize {
                    return Err(LowerError::unsupported("too many helper arguments", expr.span));
                }
                for arg in args {
                    match &arg.node {
                        HelperArg::Value(inner) => validate_expr(inner, check)?,
                        HelperArg::Ref(id) => check(*id, arg.span)?,
                    }
                }
                Ok(())
            }
            Expr::Await(inner) => validate_expr(inner, check),
        }
    }

    let exprs: Vec<&Spanned<Expr>> = match &op.kind.node {
        OperationKind::Call { args, .. } => args.iter().collect(),
        OperationKind::PropertyCompound { rhs, .. }
        | OperationKind::PropertyCoalesce { rhs, .. } => vec![rhs],
        OperationKind::IndexerCompound { index, rhs, .. }
        | OperationKind::IndexerCoalesce { index, rhs } => vec![index, rhs],
    };
    for expr in exprs {
        validate_expr(expr, &check_local)?;
    }
    Ok(())
}

struct TempInfo {
    ty: TypeHint,
    name: String,
    def_await: u32,
    use_await: u32,
}

struct Emitter<'a> {
    op: &'a BoundOperation,
    ops: Vec<Op>,
    temps: Vec<TempInfo>,
    labels: u32,
    awaits: u32,
    has_await: bool,
}

impl<'a> Emitter<'a> {
    fn new(op: &'a BoundOperation) -> Self {
        Self {
            op,
            ops: Vec::new(),
            temps: Vec::new(),
            labels: 0,
            awaits: 0,
            has_await: snapshot::operation_awaits(&op.kind.node),
        }
    }

    fn alloc_temp(&mut self, ty: TypeHint, name: &str) -> TempId {
        let id = TempId(self.temps.len() as u32);
        self.temps.push(TempInfo {
            ty,
            name: name.to_string(),
            def_await: 0,
            use_await: 0,
        });
        id
    }

    fn store_temp(&mut self, temp: TempId) {
        self.temps[temp.0 as usize].def_await = self.awaits;
        self.ops.push(Op::StoreTemp(temp));
    }

    fn load_temp(&mut self, temp: TempId) {
        let info = &mut self.temps[temp.0 as usize];
        info.use_await = info.use_await.max(self.awaits);
        self.ops.push(Op::LoadTemp(temp));
    }

    fn load_temp_addr(&mut self, temp: TempId) {
        let info = &mut self.temps[temp.0 as usize];
        info.use_await = info.use_await.max(self.awaits);
        self.ops.push(Op::LoadTempAddr(temp));
    }

    fn fresh_label(&mut self) -> LabelId {
        let id = LabelId(self.labels);
        self.labels += 1;
        id
    }

    fn infer_ty(&self, expr: &Expr) -> TypeHint {
        match expr {
            Expr::Int(_) => TypeHint::Int,
            Expr::Str(_) => TypeHint::Str,
            Expr::Local(id) => self.op.local(*id).ty,
            Expr::Helper { ret, .. } => *ret,
            Expr::Await(inner) => self.infer_ty(&inner.node),
        }
    }

    // ── Expression emission ──────────────────────────────────────────

    /// Direct stack evaluation. Only valid when the expression cannot
    /// suspend; hitting an await here is a lowering bug.
    fn emit_expr_stack(&mut self, expr: &Spanned<Expr>) -> Result<(), LowerError> {
        match &expr.node {
            Expr::Int(v) => self.ops.push(Op::LoadConst(Const::Int(*v))),
            Expr::Str(s) => self.ops.push(Op::LoadConst(Const::Str(s.clone()))),
            Expr::Local(id) => self.ops.push(Op::LoadLocal(*id)),
            Expr::Helper { name, args, .. } => {
                for arg in args {
                    match &arg.node {
                        HelperArg::Value(inner) => self.emit_expr_stack(inner)?,
                        HelperArg::Ref(id) => self.ops.push(Op::LoadLocalAddr(*id)),
                    }
                }
                self.ops.push(Op::CallHelper {
                    name: name.clone(),
                    argc: args.len() as u8,
                });
            }
            Expr::Await(_) => {
                return Err(LowerError::internal(
                    "suspension point reached by direct stack evaluation",
                    expr.span,
                ));
            }
        }
        Ok(())
    }

    /// Flattened evaluation: leaves the value on the stack, but any
    /// sub-evaluation ordered before a suspension point goes through a
    /// slot, so the stack is empty below every await.
    fn emit_expr_flat(&mut self, expr: &Spanned<Expr>) -> Result<(), LowerError> {
        match &expr.node {
            Expr::Await(inner) => {
                self.emit_expr_flat(inner)?;
                self.awaits += 1;
                self.ops.push(Op::Await { state: self.awaits });
            }
            Expr::Helper { name, args, .. } => {
                if args
                    .iter()
                    .any(|a| matches!(&a.node, HelperArg::Value(v) if snapshot::contains_await(&v.node)))
                {
                    // Value arguments are spilled to slots; ref arguments
                    // stay deferred, their addresses are taken just before
                    // the call with no await in between.
                    let mut slots: Vec<Option<TempId>> = Vec::with_capacity(args.len());
                    for (i, arg) in args.iter().enumerate() {
                        match &arg.node {
                            HelperArg::Value(inner) => {
                                self.emit_expr_flat(inner)?;
                                let ty = self.infer_ty(&inner.node);
                                let temp = self.alloc_temp(ty, &format!("arg{i}"));
                                self.store_temp(temp);
                                slots.push(Some(temp));
                            }
                            HelperArg::Ref(_) => slots.push(None),
                        }
                    }
                    for (arg, slot) in args.iter().zip(slots) {
                        match (&arg.node, slot) {
                            (HelperArg::Value(_), Some(temp)) => self.load_temp(temp),
                            (HelperArg::Ref(id), None) => {
                                self.ops.push(Op::LoadLocalAddr(*id));
                            }
                            _ => unreachable!(),
                        }
                    }
                    self.ops.push(Op::CallHelper {
                        name: name.clone(),
                        argc: args.len() as u8,
                    });
                } else {
                    self.emit_expr_stack(expr)?;
                }
            }
            _ => self.emit_expr_stack(expr)?,
        }
        Ok(())
    }

    /// Evaluate an expression in whichever mode the operation runs in.
    fn emit_expr(&mut self, expr: &Spanned<Expr>) -> Result<(), LowerError> {
        if self.has_await {
            self.emit_expr_flat(expr)
        } else {
            self.emit_expr_stack(expr)
        }
    }

    // ── Receiver materialization ─────────────────────────────────────

    fn load_snapshot(&mut self, plan: ReceiverPlan, temp: TempId) {
        match plan.access {
            ReceiverAccess::Value => self.load_temp(temp),
            ReceiverAccess::Address => self.load_temp_addr(temp),
            ReceiverAccess::BoxedValue => self.load_temp(temp),
        }
    }

    // ── Operation emission ───────────────────────────────────────────

    fn emit(&mut self) -> Result<(), LowerError> {
        match &self.op.kind.node {
            OperationKind::Call { member, args, conditional } => {
                self.emit_call(member, args, *conditional)?;
            }
            OperationKind::PropertyCompound { property, op, rhs } => {
                let get = format!("get_{property}");
                let set = format!("set_{property}");
                self.emit_compound(&get, &set, None, *op, rhs)?;
            }
            OperationKind::IndexerCompound { index, op, rhs } => {
                self.emit_compound("get_Item", "set_Item", Some(index), *op, rhs)?;
            }
            OperationKind::PropertyCoalesce { property, rhs } => {
                let get = format!("get_{property}");
                let set = format!("set_{property}");
                self.emit_coalesce(&get, &set, None, rhs)?;
            }
            OperationKind::IndexerCoalesce { index, rhs } => {
                self.emit_coalesce("get_Item", "set_Item", Some(index), rhs)?;
            }
        }
        self.ops.push(Op::Ret);
        Ok(())
    }

    fn emit_call(
        &mut self,
        member: &str,
        args: &[Spanned<Expr>],
        conditional: bool,
    ) -> Result<(), LowerError> {
        let receiver = self.op.receiver.clone();
        let plan = policy::plan_call(&receiver, conditional);
        let argc = args.len() as u8;

        if !self.has_await {
            // Receiver first, arguments on top, then the call. For a
            // by-value receiver the stack slot is the snapshot; for an
            // address the dereference happens at dispatch.
            match plan.access {
                ReceiverAccess::Value => self.ops.push(Op::LoadLocal(receiver.local)),
                ReceiverAccess::Address => self.ops.push(Op::LoadLocalAddr(receiver.local)),
                ReceiverAccess::BoxedValue => {
                    self.ops.push(Op::LoadLocal(receiver.local));
                    self.ops.push(Op::Box);
                }
            }
            if conditional {
                let skip = self.fresh_label();
                let end = self.fresh_label();
                self.ops.push(Op::Dup);
                self.ops.push(Op::BranchIfNull(skip));
                for arg in args {
                    self.emit_expr_stack(arg)?;
                }
                self.ops.push(Op::CallMember {
                    member: member.to_string(),
                    argc,
                    dispatch: plan.dispatch,
                });
                self.ops.push(Op::Pop);
                self.ops.push(Op::Jump(end));
                self.ops.push(Op::Label(skip));
                self.ops.push(Op::Pop);
                self.ops.push(Op::Label(end));
            } else {
                for arg in args {
                    self.emit_expr_stack(arg)?;
                }
                self.ops.push(Op::CallMember {
                    member: member.to_string(),
                    argc,
                    dispatch: plan.dispatch,
                });
                self.ops.push(Op::Pop);
            }
            return Ok(());
        }

        // Suspending form. A by-value or boxed receiver is captured into a
        // slot before the arguments run; an addressable receiver stays in
        // its (hoisted) home and the address is taken at the call point.
        let recv_temp = match plan.access {
            ReceiverAccess::Value => {
                let temp = self.alloc_temp(TypeHint::TypeParam, "recv");
                self.ops.push(Op::LoadLocal(receiver.local));
                self.store_temp(temp);
                Some(temp)
            }
            ReceiverAccess::BoxedValue => {
                let temp = self.alloc_temp(TypeHint::TypeParam, "recv");
                self.ops.push(Op::LoadLocal(receiver.local));
                self.ops.push(Op::Box);
                self.store_temp(temp);
                Some(temp)
            }
            ReceiverAccess::Address => None,
        };

        let labels = if conditional {
            let skip = self.fresh_label();
            let end = self.fresh_label();
            let temp = recv_temp.expect("conditional access captures the receiver");
            self.load_temp(temp);
            self.ops.push(Op::BranchIfNull(skip));
            Some((skip, end))
        } else {
            None
        };

        let mut arg_temps = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            self.emit_expr_flat(arg)?;
            let ty = self.infer_ty(&arg.node);
            let temp = self.alloc_temp(ty, &format!("arg{i}"));
            self.store_temp(temp);
            arg_temps.push(temp);
        }

        match (plan.access, recv_temp) {
            (ReceiverAccess::Address, None) => {
                self.ops.push(Op::LoadLocalAddr(receiver.local));
            }
            (_, Some(temp)) => self.load_temp(temp),
            _ => unreachable!(),
        }
        for temp in arg_temps {
            self.load_temp(temp);
        }
        self.ops.push(Op::CallMember {
            member: member.to_string(),
            argc,
            dispatch: plan.dispatch,
        });
        self.ops.push(Op::Pop);

        if let Some((skip, end)) = labels {
            self.ops.push(Op::Jump(end));
            self.ops.push(Op::Label(skip));
            self.ops.push(Op::Label(end));
        }
        Ok(())
    }

    /// Read-modify-write: capture the receiver once, evaluate the index,
    /// get through the capture, evaluate the rhs, set through the same
    /// capture with the same index.
    fn emit_compound(
        &mut self,
        get: &str,
        set: &str,
        index: Option<&Spanned<Expr>>,
        op: BinOp,
        rhs: &Spanned<Expr>,
    ) -> Result<(), LowerError> {
        let receiver = self.op.receiver.clone();
        let kind = snapshot::snapshot_kind(&receiver.constraint);
        let plan = policy::plan_snapshot_access(kind);
        let aliased = snapshot::may_reassign(&rhs.node, receiver.local)
            || index.is_some_and(|i| snapshot::may_reassign(&i.node, receiver.local));
        tracing::debug!(
            target: "receiver_lowering",
            snapshot = ?kind,
            aliased,
            "captured receiver for read-modify-write"
        );
        let snap = self.alloc_temp(TypeHint::TypeParam, "recv");
        self.ops.push(Op::LoadLocal(receiver.local));
        self.store_temp(snap);

        let index_temp = match index {
            Some(expr) => {
                self.emit_expr(expr)?;
                let temp = self.alloc_temp(self.infer_ty(&expr.node), "index");
                self.store_temp(temp);
                Some(temp)
            }
            None => None,
        };
        let get_argc = index_temp.map_or(0, |_| 1);
        let set_argc = get_argc + 1;

        if !self.has_await {
            // The set receiver/index pair sits at the bottom of the stack
            // while the get and the rhs run above it.
            self.load_snapshot(plan, snap);
            if let Some(temp) = index_temp {
                self.load_temp(temp);
            }
            self.load_snapshot(plan, snap);
            if let Some(temp) = index_temp {
                self.load_temp(temp);
            }
            self.ops.push(Op::CallMember {
                member: get.to_string(),
                argc: get_argc,
                dispatch: plan.dispatch,
            });
            self.emit_expr_stack(rhs)?;
            self.ops.push(Op::BinOp(op));
            self.ops.push(Op::CallMember {
                member: set.to_string(),
                argc: set_argc,
                dispatch: plan.dispatch,
            });
            self.ops.push(Op::Pop);
            return Ok(());
        }

        self.load_snapshot(plan, snap);
        if let Some(temp) = index_temp {
            self.load_temp(temp);
        }
        self.ops.push(Op::CallMember {
            member: get.to_string(),
            argc: get_argc,
            dispatch: plan.dispatch,
        });
        let got = self.alloc_temp(TypeHint::Int, "get");
        self.store_temp(got);

        self.emit_expr_flat(rhs)?;
        let value = self.alloc_temp(self.infer_ty(&rhs.node), "value");
        self.store_temp(value);

        self.load_snapshot(plan, snap);
        if let Some(temp) = index_temp {
            self.load_temp(temp);
        }
        self.load_temp(got);
        self.load_temp(value);
        self.ops.push(Op::BinOp(op));
        self.ops.push(Op::CallMember {
            member: set.to_string(),
            argc: set_argc,
            dispatch: plan.dispatch,
        });
        self.ops.push(Op::Pop);
        Ok(())
    }

    /// `??=`: get through the capture; a non-null result skips the rhs
    /// entirely, otherwise the rhs runs and the set goes through the same
    /// capture and index.
    fn emit_coalesce(
        &mut self,
        get: &str,
        set: &str,
        index: Option<&Spanned<Expr>>,
        rhs: &Spanned<Expr>,
    ) -> Result<(), LowerError> {
        let receiver = self.op.receiver.clone();
        let plan = policy::plan_snapshot_access(snapshot::snapshot_kind(&receiver.constraint));
        let snap = self.alloc_temp(TypeHint::TypeParam, "recv");
        self.ops.push(Op::LoadLocal(receiver.local));
        self.store_temp(snap);

        let index_temp = match index {
            Some(expr) => {
                self.emit_expr(expr)?;
                let temp = self.alloc_temp(self.infer_ty(&expr.node), "index");
                self.store_temp(temp);
                Some(temp)
            }
            None => None,
        };
        let get_argc = index_temp.map_or(0, |_| 1);
        let set_argc = get_argc + 1;

        self.load_snapshot(plan, snap);
        if let Some(temp) = index_temp {
            self.load_temp(temp);
        }
        self.ops.push(Op::CallMember {
            member: get.to_string(),
            argc: get_argc,
            dispatch: plan.dispatch,
        });
        let assign = self.fresh_label();
        let end = self.fresh_label();
        self.ops.push(Op::BranchIfNull(assign));
        self.ops.push(Op::Jump(end));
        self.ops.push(Op::Label(assign));

        if !self.has_await {
            self.load_snapshot(plan, snap);
            if let Some(temp) = index_temp {
                self.load_temp(temp);
            }
            self.emit_expr_stack(rhs)?;
        } else {
            self.emit_expr_flat(rhs)?;
            let value = self.alloc_temp(self.infer_ty(&rhs.node), "value");
            self.store_temp(value);
            self.load_snapshot(plan, snap);
            if let Some(temp) = index_temp {
                self.load_temp(temp);
            }
            self.load_temp(value);
        }
        self.ops.push(Op::CallMember {
            member: set.to_string(),
            argc: set_argc,
            dispatch: plan.dispatch,
        });
        self.ops.push(Op::Pop);
        self.ops.push(Op::Label(end));
        Ok(())
    }

    // ── Promotion and assembly ───────────────────────────────────────

    /// Promote straddling temps to durable fields, renumber the rest, and
    /// default out reference-like fields after their last read.
    fn finish(self) -> LoweredProgram {
        let Emitter { op, mut ops, temps, awaits, .. } = self;

        let mut field_of = vec![None; temps.len()];
        let mut temp_of = vec![None; temps.len()];
        let mut fields = Vec::new();
        let mut kept = 0u32;
        let mut temp_tys = Vec::new();
        for (i, info) in temps.iter().enumerate() {
            if info.use_await > info.def_await {
                let id = FieldId(fields.len() as u32);
                fields.push(SpillField {
                    name: format!("spill_{}", info.name),
                    ty: info.ty,
                    clear_after_use: info.ty.is_reference_like(),
                });
                field_of[i] = Some(id);
            } else {
                temp_of[i] = Some(TempId(kept));
                temp_tys.push(info.ty);
                kept += 1;
            }
        }

        for emitted in &mut ops {
            let rewritten = match *emitted {
                Op::StoreTemp(t) => match field_of[t.0 as usize] {
                    Some(f) => Some(Op::StoreField(f)),
                    None => Some(Op::StoreTemp(temp_of[t.0 as usize].unwrap())),
                },
                Op::LoadTemp(t) => match field_of[t.0 as usize] {
                    Some(f) => Some(Op::LoadField(f)),
                    None => Some(Op::LoadTemp(temp_of[t.0 as usize].unwrap())),
                },
                Op::LoadTempAddr(t) => match field_of[t.0 as usize] {
                    Some(f) => Some(Op::LoadFieldAddr(f)),
                    None => Some(Op::LoadTempAddr(temp_of[t.0 as usize].unwrap())),
                },
                _ => None,
            };
            if let Some(new_op) = rewritten {
                *emitted = new_op;
            }
        }

        if !fields.is_empty() {
            // Single exit: the trailing Ret. Clears go right before it.
            let ret = ops.pop();
            debug_assert_eq!(ret, Some(Op::Ret));
            for (i, field) in fields.iter().enumerate() {
                if field.clear_after_use {
                    ops.push(Op::ClearField(FieldId(i as u32)));
                }
            }
            ops.push(Op::Ret);
        }

        let machine = if awaits > 0 {
            Some(MachineLayout { fields, states: awaits })
        } else {
            None
        };

        LoweredProgram {
            ops,
            local_names: op.locals.iter().map(|l| l.name.clone()).collect(),
            temp_tys,
            machine,
        }
    }
}
