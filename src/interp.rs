//! Executor for lowered programs: a small stack machine with real
//! suspension semantics. At a pending await the operand stack is discarded
//! and ephemeral temps are poisoned, so only durable machine fields carry
//! values across the boundary; the conformance tests rely on this to prove
//! that spill decisions are correct rather than merely plausible.

use std::collections::HashMap;

use crate::machine::MachineState;
use crate::ops::{Const, LoweredProgram, Op};
use crate::policy::DispatchKind;
use crate::runtime::Runtime;
use crate::tree::BinOp;
use crate::value::{Fault, FutureRef, ObjRef, Place, Value};

/// Receiver handed to a host member function.
pub enum This {
    /// Reference receiver: the member sees the shared instance.
    Obj(ObjRef),
    /// Constrained receiver: the member reads and writes through the
    /// address, mutating whatever storage it points at.
    Place(Place),
}

/// Host view of one call: arguments, the receiver, the frame behind any
/// addresses, and the shared output log.
pub struct HostCtx<'a> {
    pub this: Option<This>,
    pub args: Vec<Value>,
    locals: &'a mut [Value],
    temps: &'a mut [Value],
    fields: &'a mut [Value],
    out: &'a mut Vec<String>,
}

impl HostCtx<'_> {
    pub fn log(&mut self, line: impl Into<String>) {
        self.out.push(line.into());
    }

    pub fn arg(&self, index: usize) -> Result<&Value, Fault> {
        self.args
            .get(index)
            .ok_or_else(|| Fault::new(format!("missing argument {index}")))
    }

    fn read_place(&self, place: Place) -> Result<Value, Fault> {
        let value = match place {
            Place::Local(i) => self.locals.get(i as usize),
            Place::Temp(i) => self.temps.get(i as usize),
            Place::Field(i) => self.fields.get(i as usize),
        }
        .ok_or_else(|| Fault::new("dangling address"))?;
        if matches!(value, Value::Invalid) {
            return Err(Fault::new("read of an ephemeral slot after suspension"));
        }
        Ok(value.clone())
    }

    fn write_place(&mut self, place: Place, value: Value) -> Result<(), Fault> {
        let slot = match place {
            Place::Local(i) => self.locals.get_mut(i as usize),
            Place::Temp(i) => self.temps.get_mut(i as usize),
            Place::Field(i) => self.fields.get_mut(i as usize),
        }
        .ok_or_else(|| Fault::new("dangling address"))?;
        *slot = value;
        Ok(())
    }

    /// Read through a `ref` argument.
    pub fn read_ref(&self, index: usize) -> Result<Value, Fault> {
        match self.arg(index)? {
            Value::Addr(place) => self.read_place(*place),
            other => Err(Fault::new(format!("argument {index} is not a ref: {other:?}"))),
        }
    }

    /// Reassign through a `ref` argument.
    pub fn write_ref(&mut self, index: usize, value: Value) -> Result<(), Fault> {
        match self.arg(index)? {
            Value::Addr(place) => {
                let place = *place;
                self.write_place(place, value)
            }
            other => Err(Fault::new(format!("argument {index} is not a ref: {other:?}"))),
        }
    }

    fn this(&self) -> Result<&This, Fault> {
        self.this
            .as_ref()
            .ok_or_else(|| Fault::new("helper invoked as a member"))
    }

    /// Read a field of the receiver, whatever its representation.
    pub fn this_field(&self, name: &str) -> Result<Value, Fault> {
        let read = |sv: &crate::value::StructVal| {
            sv.fields
                .get(name)
                .cloned()
                .ok_or_else(|| Fault::new(format!("no field {name} on {}", sv.ty)))
        };
        match self.this()? {
            This::Obj(obj) => read(&obj.borrow()),
            This::Place(place) => match self.read_place(*place)? {
                Value::Struct(sv) => read(&sv),
                Value::Obj(obj) => read(&obj.borrow()),
                Value::Null => Err(Fault::new("null reference")),
                other => Err(Fault::new(format!("receiver {other:?} has no fields"))),
            },
        }
    }

    /// Write a field of the receiver. Through an address this mutates the
    /// storage in place; through a reference it mutates the shared instance.
    pub fn set_this_field(&mut self, name: &str, value: Value) -> Result<(), Fault> {
        match self.this()? {
            This::Obj(obj) => {
                obj.borrow_mut().fields.insert(name.to_string(), value);
                Ok(())
            }
            This::Place(place) => {
                let place = *place;
                match self.read_place(place)? {
                    Value::Struct(mut sv) => {
                        sv.fields.insert(name.to_string(), value);
                        self.write_place(place, Value::Struct(sv))
                    }
                    Value::Obj(obj) => {
                        obj.borrow_mut().fields.insert(name.to_string(), value);
                        Ok(())
                    }
                    Value::Null => Err(Fault::new("null reference")),
                    other => Err(Fault::new(format!("receiver {other:?} has no fields"))),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Suspended,
}

pub struct Exec {
    program: LoweredProgram,
    runtime: Runtime,
    locals: Vec<Value>,
    temps: Vec<Value>,
    fields: Vec<Value>,
    stack: Vec<Value>,
    ip: usize,
    state: Option<MachineState>,
    pending: Option<(FutureRef, usize)>,
    out: Vec<String>,
    labels: HashMap<u32, usize>,
}

impl Exec {
    pub fn new(program: LoweredProgram, runtime: Runtime, locals: Vec<Value>) -> Result<Self, Fault> {
        if locals.len() != program.local_names.len() {
            return Err(Fault::new(format!(
                "frame wants {} locals, got {}",
                program.local_names.len(),
                locals.len()
            )));
        }
        let temps = vec![Value::Unit; program.temp_tys.len()];
        let fields = vec![
            Value::Null;
            program.machine.as_ref().map_or(0, |m| m.fields.len())
        ];
        let state = program.machine.as_ref().map(|_| MachineState::BeforeFirstAwait);
        let labels = program
            .ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Op::Label(l) => Some((l.0, i)),
                _ => None,
            })
            .collect();
        Ok(Self {
            program,
            runtime,
            locals,
            temps,
            fields,
            stack: Vec::new(),
            ip: 0,
            state,
            pending: None,
            out: Vec::new(),
            labels,
        })
    }

    pub fn output(&self) -> &[String] {
        &self.out
    }

    pub fn into_output(self) -> Vec<String> {
        self.out
    }

    pub fn machine_state(&self) -> Option<MachineState> {
        self.state
    }

    pub fn local_value(&self, index: usize) -> &Value {
        &self.locals[index]
    }

    pub fn field_values(&self) -> &[Value] {
        &self.fields
    }

    /// Run from the beginning until the first suspension or completion.
    pub fn start(&mut self) -> Result<Outcome, Fault> {
        let result = self.run_loop();
        self.fault_on_error(result)
    }

    /// Continue after a suspension. Rejected once the machine is terminal,
    /// so a second resumption of a completed or faulted operation cannot
    /// re-run anything.
    pub fn resume(&mut self) -> Result<Outcome, Fault> {
        let state = self
            .state
            .ok_or_else(|| Fault::new("program has no suspension points"))?;
        let next = state.resume().map_err(|e| Fault::new(e.to_string()))?;
        self.state = Some(next);
        let (future, resume_ip) = self
            .pending
            .take()
            .ok_or_else(|| Fault::new("nothing to resume"))?;
        let cell = future.borrow().clone();
        if !cell.ready {
            let result = Err(Fault::new("resumed before the awaited operation completed"));
            return self.fault_on_error(result);
        }
        match cell.result {
            Ok(value) => {
                self.stack.push(value);
                self.ip = resume_ip;
                let result = self.run_loop();
                self.fault_on_error(result)
            }
            Err(fault) => self.fault_on_error(Err(fault)),
        }
    }

    /// Mark the pending awaitable completed, as the awaited operation's
    /// callback would.
    pub fn complete_pending(&mut self) {
        if let Some((future, _)) = &self.pending {
            future.borrow_mut().ready = true;
        }
    }

    /// Drive to completion, completing each pending awaitable in turn.
    pub fn run_to_completion(&mut self) -> Result<(), Fault> {
        let mut outcome = self.start()?;
        while outcome == Outcome::Suspended {
            self.complete_pending();
            outcome = self.resume()?;
        }
        Ok(())
    }

    fn fault_on_error(&mut self, result: Result<Outcome, Fault>) -> Result<Outcome, Fault> {
        if result.is_err() {
            if let Some(state) = self.state {
                if !state.is_terminal() {
                    self.state = Some(MachineState::Faulted);
                }
            }
        }
        result
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or_else(|| Fault::new("operand stack underflow"))
    }

    fn read_slot(values: &[Value], index: u32, what: &str) -> Result<Value, Fault> {
        let value = values
            .get(index as usize)
            .ok_or_else(|| Fault::new(format!("{what} {index} out of bounds")))?;
        if matches!(value, Value::Invalid) {
            return Err(Fault::new("read of an ephemeral slot after suspension"));
        }
        Ok(value.clone())
    }

    fn jump(&mut self, label: u32) -> Result<(), Fault> {
        self.ip = *self
            .labels
            .get(&label)
            .ok_or_else(|| Fault::new(format!("unknown label L{label}")))?;
        Ok(())
    }

    fn run_loop(&mut self) -> Result<Outcome, Fault> {
        loop {
            let op = self
                .program
                .ops
                .get(self.ip)
                .cloned()
                .ok_or_else(|| Fault::new("fell off the end of the program"))?;
            self.ip += 1;
            match op {
                Op::LoadLocal(id) => {
                    let value = Self::read_slot(&self.locals, id.0, "local")?;
                    self.stack.push(value);
                }
                Op::LoadLocalAddr(id) => self.stack.push(Value::Addr(Place::Local(id.0))),
                Op::StoreLocal(id) => {
                    let value = self.pop()?;
                    self.locals[id.0 as usize] = value;
                }
                Op::LoadTemp(id) => {
                    let value = Self::read_slot(&self.temps, id.0, "temp")?;
                    self.stack.push(value);
                }
                Op::LoadTempAddr(id) => self.stack.push(Value::Addr(Place::Temp(id.0))),
                Op::StoreTemp(id) => {
                    let value = self.pop()?;
                    self.temps[id.0 as usize] = value;
                }
                Op::LoadField(id) => {
                    let value = Self::read_slot(&self.fields, id.0, "field")?;
                    self.stack.push(value);
                }
                Op::LoadFieldAddr(id) => self.stack.push(Value::Addr(Place::Field(id.0))),
                Op::StoreField(id) => {
                    let value = self.pop()?;
                    self.fields[id.0 as usize] = value;
                }
                Op::ClearField(id) => {
                    self.fields[id.0 as usize] = Value::Null;
                }
                Op::LoadConst(Const::Int(v)) => self.stack.push(Value::Int(v)),
                Op::LoadConst(Const::Str(ref s)) => self.stack.push(Value::Str(s.clone())),
                Op::Box => {
                    let value = self.pop()?;
                    let boxed = match value {
                        Value::Struct(sv) => Value::obj(sv),
                        Value::Addr(_) | Value::Invalid => {
                            return Err(Fault::new("box of a non-value"));
                        }
                        other => other,
                    };
                    self.stack.push(boxed);
                }
                Op::Dup => {
                    let top = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| Fault::new("operand stack underflow"))?;
                    self.stack.push(top);
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::BinOp(op) => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let result = match (op, lhs, rhs) {
                        (BinOp::Add, Value::Int(a), Value::Int(b)) => Value::Int(a + b),
                        (BinOp::Sub, Value::Int(a), Value::Int(b)) => Value::Int(a - b),
                        (BinOp::Add, Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
                        (op, lhs, rhs) => {
                            return Err(Fault::new(format!(
                                "invalid operands for {op:?}: {lhs:?}, {rhs:?}"
                            )));
                        }
                    };
                    self.stack.push(result);
                }
                Op::BranchIfNull(label) => {
                    let value = self.pop()?;
                    if value.is_null() {
                        self.jump(label.0)?;
                    }
                }
                Op::Jump(label) => self.jump(label.0)?,
                Op::Label(_) => {}
                Op::CallMember { ref member, argc, dispatch } => {
                    self.call_member(member, argc, dispatch)?;
                }
                Op::CallHelper { ref name, argc } => {
                    self.call_helper(name, argc)?;
                }
                Op::Await { .. } => {
                    let value = self.pop()?;
                    let Value::Future(future) = value else {
                        return Err(Fault::new("await of a non-awaitable value"));
                    };
                    let ready = future.borrow().ready;
                    if ready {
                        let result = future.borrow().result.clone();
                        match result {
                            Ok(v) => self.stack.push(v),
                            Err(fault) => return Err(fault),
                        }
                    } else {
                        if !self.stack.is_empty() {
                            return Err(Fault::new("operand stack not empty at suspension"));
                        }
                        let state = self
                            .state
                            .ok_or_else(|| Fault::new("suspension without a state machine"))?;
                        self.state = Some(state.suspend().map_err(|e| Fault::new(e.to_string()))?);
                        for temp in &mut self.temps {
                            *temp = Value::Invalid;
                        }
                        self.pending = Some((future, self.ip));
                        return Ok(Outcome::Suspended);
                    }
                }
                Op::Ret => {
                    if let Some(state) = self.state {
                        self.state =
                            Some(state.complete().map_err(|e| Fault::new(e.to_string()))?);
                    }
                    return Ok(Outcome::Complete);
                }
            }
        }
    }

    fn call_member(&mut self, member: &str, argc: u8, dispatch: DispatchKind) -> Result<(), Fault> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let receiver = self.pop()?;
        let this = match (dispatch, receiver) {
            (DispatchKind::ConstrainedCallVirt, Value::Addr(place)) => This::Place(place),
            (DispatchKind::CallVirt, Value::Obj(obj)) => This::Obj(obj),
            (DispatchKind::CallVirt, Value::Null) => {
                return Err(Fault::new(format!("null reference on call to {member}")));
            }
            (DispatchKind::CallVirt, other) => {
                return Err(Fault::new(format!(
                    "virtual call on a non-reference receiver: {other:?}"
                )));
            }
            (DispatchKind::ConstrainedCallVirt, other) => {
                return Err(Fault::new(format!(
                    "constrained call needs an address, got {other:?}"
                )));
            }
        };
        let ty = match &this {
            This::Obj(obj) => obj.borrow().ty.clone(),
            This::Place(place) => {
                Self::read_slot(
                    match place {
                        Place::Local(_) => &self.locals,
                        Place::Temp(_) => &self.temps,
                        Place::Field(_) => &self.fields,
                    },
                    match place {
                        Place::Local(i) | Place::Temp(i) | Place::Field(i) => *i,
                    },
                    "slot",
                )?
                .type_name()?
            }
        };
        let Exec { runtime, locals, temps, fields, out, .. } = self;
        let host_fn = runtime.method(&ty, member)?;
        let mut ctx = HostCtx {
            this: Some(this),
            args,
            locals,
            temps,
            fields,
            out,
        };
        let result = host_fn(&mut ctx)?;
        self.stack.push(result);
        Ok(())
    }

    fn call_helper(&mut self, name: &str, argc: u8) -> Result<(), Fault> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let Exec { runtime, locals, temps, fields, out, .. } = self;
        let host_fn = runtime.helper(name)?;
        let mut ctx = HostCtx {
            this: None,
            args,
            locals,
            temps,
            fields,
            out,
        };
        let result = host_fn(&mut ctx)?;
        self.stack.push(result);
        Ok(())
    }
}
