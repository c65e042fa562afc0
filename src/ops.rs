use std::fmt;

use serde::{Serialize, Deserialize};

use crate::machine::MachineLayout;
use crate::policy::DispatchKind;
use crate::tree::{BinOp, LocalId, TypeHint};

/// Engine-allocated temporary. Ephemeral: does not survive a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(pub u32);

/// Durable field on the state-machine record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Int(i64),
    Str(String),
}

/// One low-level operation. The emitted sequence is the engine's output
/// contract: stack-based loads and stores plus the call, box, branch and
/// spill operations the materialization policy selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    LoadLocal(LocalId),
    LoadLocalAddr(LocalId),
    StoreLocal(LocalId),
    LoadTemp(TempId),
    LoadTempAddr(TempId),
    StoreTemp(TempId),
    LoadField(FieldId),
    LoadFieldAddr(FieldId),
    StoreField(FieldId),
    /// Default out a durable field after its last read.
    ClearField(FieldId),
    LoadConst(Const),
    /// Pop a value; push a boxed reference to it. Boxing a struct value
    /// copies it into a fresh heap cell; boxing a reference is the identity.
    Box,
    Dup,
    Pop,
    BinOp(BinOp),
    BranchIfNull(LabelId),
    Jump(LabelId),
    Label(LabelId),
    /// Pop argc arguments then the receiver; dispatch on the receiver's
    /// runtime type. Constrained dispatch takes the receiver as an address.
    CallMember {
        member: String,
        argc: u8,
        dispatch: DispatchKind,
    },
    /// Pop argc arguments; call a free helper function.
    CallHelper { name: String, argc: u8 },
    /// Pop an awaitable. If pending, suspend; the awaited result is on the
    /// stack after resumption. The operand stack is empty below the
    /// awaitable at every await.
    Await { state: u32 },
    Ret,
}

/// The engine's output: an op sequence plus the storage it requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoweredProgram {
    pub ops: Vec<Op>,
    /// Names of the frame locals, for display and execution.
    pub local_names: Vec<String>,
    pub temp_tys: Vec<TypeHint>,
    /// Present when the operation contains a suspension point.
    pub machine: Option<MachineLayout>,
}

impl LoweredProgram {
    fn local_name(&self, id: LocalId) -> &str {
        self.local_names
            .get(id.0 as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }
}

fn hint_name(ty: TypeHint) -> &'static str {
    match ty {
        TypeHint::TypeParam => "T",
        TypeHint::Int => "int",
        TypeHint::Str => "str",
        TypeHint::Bool => "bool",
    }
}

impl fmt::Display for LoweredProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.temp_tys.is_empty() {
            let temps: Vec<String> = self
                .temp_tys
                .iter()
                .enumerate()
                .map(|(i, ty)| format!("t{i}: {}", hint_name(*ty)))
                .collect();
            writeln!(f, "temps: {}", temps.join(", "))?;
        }
        if let Some(machine) = &self.machine {
            let fields: Vec<String> = machine
                .fields
                .iter()
                .enumerate()
                .map(|(i, field)| format!("f{i}: {}", hint_name(field.ty)))
                .collect();
            writeln!(f, "machine: [{}], states={}", fields.join(", "), machine.states)?;
        }
        for (i, op) in self.ops.iter().enumerate() {
            match op {
                Op::Label(label) => writeln!(f, "L{}:", label.0)?,
                _ => writeln!(f, "  {i:>2}: {}", self.op_text(op))?,
            }
        }
        Ok(())
    }
}

impl LoweredProgram {
    fn op_text(&self, op: &Op) -> String {
        match op {
            Op::LoadLocal(id) => format!("ld.local {}", self.local_name(*id)),
            Op::LoadLocalAddr(id) => format!("ld.addr {}", self.local_name(*id)),
            Op::StoreLocal(id) => format!("st.local {}", self.local_name(*id)),
            Op::LoadTemp(id) => format!("ld.temp t{}", id.0),
            Op::LoadTempAddr(id) => format!("ld.addr.temp t{}", id.0),
            Op::StoreTemp(id) => format!("st.temp t{}", id.0),
            Op::LoadField(id) => format!("ld.field f{}", id.0),
            Op::LoadFieldAddr(id) => format!("ld.addr.field f{}", id.0),
            Op::StoreField(id) => format!("st.field f{}", id.0),
            Op::ClearField(id) => format!("clr.field f{}", id.0),
            Op::LoadConst(Const::Int(v)) => format!("const {v}"),
            Op::LoadConst(Const::Str(s)) => format!("const \"{s}\""),
            Op::Box => "box".to_string(),
            Op::Dup => "dup".to_string(),
            Op::Pop => "pop".to_string(),
            Op::BinOp(BinOp::Add) => "add".to_string(),
            Op::BinOp(BinOp::Sub) => "sub".to_string(),
            Op::BranchIfNull(label) => format!("br.null L{}", label.0),
            Op::Jump(label) => format!("br L{}", label.0),
            Op::Label(label) => format!("L{}:", label.0),
            Op::CallMember { member, argc, dispatch } => match dispatch {
                DispatchKind::CallVirt => format!("callvirt {member} argc={argc}"),
                DispatchKind::ConstrainedCallVirt => {
                    format!("constrained.callvirt {member} argc={argc}")
                }
            },
            Op::CallHelper { name, argc } => format!("call {name} argc={argc}"),
            Op::Await { state } => format!("await state={state}"),
            Op::Ret => "ret".to_string(),
        }
    }
}
