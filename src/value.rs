use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;

/// A fault raised by executing lowered code: a null receiver, a missing
/// member, or an exception from an awaited operation. Propagated unchanged
/// through the machine's fault path.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{msg}")]
pub struct Fault {
    pub msg: String,
}

impl Fault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

/// A named record. Held directly in a slot it behaves as a value; behind an
/// [`ObjRef`] it behaves as a shared object.
#[derive(Debug, Clone, PartialEq)]
pub struct StructVal {
    pub ty: String,
    pub fields: BTreeMap<String, Value>,
}

impl StructVal {
    pub fn new(ty: impl Into<String>) -> Self {
        Self { ty: ty.into(), fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Heap instance with reference identity.
pub type ObjRef = Rc<RefCell<StructVal>>;

/// An awaitable. Completing or faulting it is the test driver's job.
#[derive(Debug, Clone, PartialEq)]
pub struct FutureCell {
    pub ready: bool,
    pub result: Result<Value, Fault>,
}

pub type FutureRef = Rc<RefCell<FutureCell>>;

/// A storage location an address can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Local(u32),
    Temp(u32),
    Field(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Inline value; cloning it is a genuine copy.
    Struct(StructVal),
    /// Shared reference; cloning it aliases.
    Obj(ObjRef),
    Future(FutureRef),
    Addr(Place),
    /// Poison written into ephemeral slots at suspension. Any read of it
    /// is a fault, which turns a missed durable promotion into a loud
    /// failure instead of silent corruption.
    Invalid,
}

impl Value {
    pub fn obj(value: StructVal) -> Self {
        Value::Obj(Rc::new(RefCell::new(value)))
    }

    pub fn ready_future(result: Value) -> Self {
        Value::Future(Rc::new(RefCell::new(FutureCell { ready: true, result: Ok(result) })))
    }

    pub fn pending_future(result: Value) -> Self {
        Value::Future(Rc::new(RefCell::new(FutureCell { ready: false, result: Ok(result) })))
    }

    pub fn faulting_future(msg: impl Into<String>) -> Self {
        Value::Future(Rc::new(RefCell::new(FutureCell {
            ready: false,
            result: Err(Fault::new(msg)),
        })))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Runtime type name, used for member dispatch.
    pub fn type_name(&self) -> Result<String, Fault> {
        match self {
            Value::Struct(sv) => Ok(sv.ty.clone()),
            Value::Obj(obj) => Ok(obj.borrow().ty.clone()),
            Value::Null => Err(Fault::new("null reference")),
            other => Err(Fault::new(format!("value {other:?} has no members"))),
        }
    }
}
