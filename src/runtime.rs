use std::collections::HashMap;

use crate::interp::HostCtx;
use crate::value::{Fault, Value};

pub type HostFn = Box<dyn Fn(&mut HostCtx<'_>) -> Result<Value, Fault>>;

/// Registry of host functions executable programs call into: members keyed
/// by the receiver's runtime type (that lookup is the virtual dispatch) and
/// free helper functions.
#[derive(Default)]
pub struct Runtime {
    methods: HashMap<(String, String), HostFn>,
    helpers: HashMap<String, HostFn>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_method(
        &mut self,
        ty: impl Into<String>,
        member: impl Into<String>,
        f: impl Fn(&mut HostCtx<'_>) -> Result<Value, Fault> + 'static,
    ) {
        self.methods.insert((ty.into(), member.into()), Box::new(f));
    }

    pub fn register_helper(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut HostCtx<'_>) -> Result<Value, Fault> + 'static,
    ) {
        self.helpers.insert(name.into(), Box::new(f));
    }

    pub fn method(&self, ty: &str, member: &str) -> Result<&HostFn, Fault> {
        self.methods
            .get(&(ty.to_string(), member.to_string()))
            .ok_or_else(|| Fault::new(format!("missing member {ty}::{member}")))
    }

    pub fn helper(&self, name: &str) -> Result<&HostFn, Fault> {
        self.helpers
            .get(name)
            .ok_or_else(|| Fault::new(format!("missing helper {name}")))
    }
}
