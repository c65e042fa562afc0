mod common;
use common::*;

use styx::interp::{Exec, Outcome};
use styx::lower_operation;
use styx::machine::MachineState;
use styx::tree::{ConstraintKind, TypeHint};

fn failing_call_exec() -> Exec {
    let op = call_op(
        ConstraintKind::Class,
        false,
        false,
        vec![awaited(helper("FailingAsync", vec![], TypeHint::Int))],
    );
    let program = lower_operation(&op).unwrap();
    Exec::new(program, moveable_runtime(), vec![item_object("1")]).unwrap()
}

#[test]
fn faulting_await_propagates_and_marks_the_machine() {
    let mut exec = failing_call_exec();
    assert_eq!(exec.start().unwrap(), Outcome::Suspended);
    exec.complete_pending();
    let err = exec.resume().unwrap_err();
    assert_eq!(err.msg, "awaited operation failed");
    assert_eq!(exec.machine_state(), Some(MachineState::Faulted));
    // The call after the await never ran.
    assert!(exec.output().is_empty());
}

#[test]
fn second_resumption_of_a_faulted_machine_is_rejected() {
    let mut exec = failing_call_exec();
    exec.start().unwrap();
    exec.complete_pending();
    exec.resume().unwrap_err();
    let err = exec.resume().unwrap_err();
    assert!(err.msg.contains("invalid machine transition"));
    assert_eq!(exec.machine_state(), Some(MachineState::Faulted));
}

#[test]
fn resumption_of_a_completed_machine_is_rejected() {
    let op = call_op(
        ConstraintKind::Class,
        false,
        false,
        vec![awaited(offset_call("GetOffsetAsync"))],
    );
    let program = lower_operation(&op).unwrap();
    let mut exec = Exec::new(program, moveable_runtime(), vec![item_object("1")]).unwrap();
    exec.run_to_completion().unwrap();
    assert_eq!(exec.machine_state(), Some(MachineState::Completed));
    let err = exec.resume().unwrap_err();
    assert!(err.msg.contains("invalid machine transition"));
    assert_eq!(exec.machine_state(), Some(MachineState::Completed));
}

#[test]
fn resumption_before_completion_faults_the_machine() {
    let op = call_op(
        ConstraintKind::Class,
        false,
        false,
        vec![awaited(offset_call("GetOffsetAsync"))],
    );
    let program = lower_operation(&op).unwrap();
    let mut exec = Exec::new(program, moveable_runtime(), vec![item_object("1")]).unwrap();
    assert_eq!(exec.start().unwrap(), Outcome::Suspended);
    let err = exec.resume().unwrap_err();
    assert!(err.msg.contains("before the awaited operation completed"));
    assert_eq!(exec.machine_state(), Some(MachineState::Faulted));
}

#[test]
fn helper_fault_propagates_from_synchronous_code() {
    let mut runtime = moveable_runtime();
    runtime.register_helper("Throwing", |_ctx| {
        Err(styx::value::Fault::new("helper exploded"))
    });
    let op = call_op(
        ConstraintKind::Struct,
        false,
        false,
        vec![helper("Throwing", vec![], TypeHint::Int)],
    );
    let program = lower_operation(&op).unwrap();
    let mut exec = Exec::new(program, runtime, vec![item_value("1")]).unwrap();
    let err = exec.run_to_completion().unwrap_err();
    assert_eq!(err.msg, "helper exploded");
}

#[test]
fn missing_member_is_a_loud_fault() {
    let op = styx::tree::BoundOperation::new(
        item_locals(),
        receiver(ConstraintKind::Struct, false),
        styx::tree::OperationKind::Call {
            member: "Vanish".into(),
            args: vec![],
            conditional: false,
        },
    );
    let err = styx::lower_and_run(&op, moveable_runtime(), vec![item_value("1")]).unwrap_err();
    assert!(err.to_string().contains("missing member Item::Vanish"));
}

#[test]
fn fault_leaves_no_partial_output_after_the_boundary() {
    // The get runs before the faulting await; the set after it must not.
    let op = position_compound_op(
        ConstraintKind::Struct,
        awaited(helper("FailingAsync", vec![], TypeHint::Int)),
    );
    let program = lower_operation(&op).unwrap();
    let mut exec = Exec::new(program, moveable_runtime(), vec![item_value("1")]).unwrap();
    assert_eq!(exec.start().unwrap(), Outcome::Suspended);
    exec.complete_pending();
    exec.resume().unwrap_err();
    assert_eq!(exec.output(), ["Position get for item '1'"]);
    assert_eq!(exec.machine_state(), Some(MachineState::Faulted));
}
