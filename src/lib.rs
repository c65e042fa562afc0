pub mod span;
pub mod diagnostics;
pub mod tree;
pub mod pretty;
pub mod policy;
pub mod snapshot;
pub mod machine;
pub mod ops;
pub mod lower;
pub mod value;
pub mod runtime;
pub mod interp;

use diagnostics::LowerError;
use interp::Exec;
use ops::LoweredProgram;
use runtime::Runtime;
use tree::BoundOperation;
use value::Value;

pub use lower::lower_operation;

/// Lower an operation and execute it against the given runtime, driving
/// every suspension to completion. Returns the observable output log.
/// Useful when a test only cares about behavior, not instruction text.
pub fn lower_and_run(
    op: &BoundOperation,
    runtime: Runtime,
    locals: Vec<Value>,
) -> Result<Vec<String>, LowerError> {
    let program = lower_operation(op)?;
    run_program(program, runtime, locals)
}

/// Execute an already-lowered program to completion.
pub fn run_program(
    program: LoweredProgram,
    runtime: Runtime,
    locals: Vec<Value>,
) -> Result<Vec<String>, LowerError> {
    let mut exec = Exec::new(program, runtime, locals).map_err(|e| LowerError::exec(e.msg))?;
    exec.run_to_completion().map_err(|e| LowerError::exec(e.msg))?;
    Ok(exec.into_output())
}
