mod common;
use common::*;

use styx::interp::Exec;
use styx::lower_and_run;
use styx::lower_operation;
use styx::tree::ConstraintKind;
use styx::value::Value;

// ── Snapshot semantics: get and set share one captured receiver ──────

#[test]
fn struct_receiver_get_and_set_hit_the_frozen_copy() {
    let op = position_compound_op(ConstraintKind::Struct, offset_call("GetOffset"));
    let out = lower_and_run(&op, moveable_runtime(), vec![item_value("1")]).unwrap();
    // The rhs reassigns the variable to an item named '-1', but both
    // accessors run against the copy captured beforehand.
    assert_eq!(
        out,
        vec!["Position get for item '1'", "Position set for item '1'"]
    );
}

#[test]
fn unconstrained_receiver_behaves_like_struct_for_capture() {
    let op = position_compound_op(ConstraintKind::Unconstrained, offset_call("GetOffset"));
    let out = lower_and_run(&op, moveable_runtime(), vec![item_value("1")]).unwrap();
    assert_eq!(
        out,
        vec!["Position get for item '1'", "Position set for item '1'"]
    );
}

#[test]
fn class_receiver_snapshot_ignores_variable_reassignment() {
    let op = position_compound_op(ConstraintKind::Class, offset_call("GetOffset"));
    let out = lower_and_run(&op, moveable_runtime(), vec![item_object("1")]).unwrap();
    assert_eq!(
        out,
        vec!["Position get for item '1'", "Position set for item '1'"]
    );
}

#[test]
fn class_receiver_set_writes_through_the_shared_reference() {
    let op = position_compound_op(ConstraintKind::Class, int(5));
    let program = lower_operation(&op).unwrap();
    let handle = item_object("1");
    let mut exec = Exec::new(program, moveable_runtime(), vec![handle.clone()]).unwrap();
    exec.run_to_completion().unwrap();
    // The snapshot aliases the same instance, so the write is visible
    // through the original handle.
    let Value::Obj(obj) = handle else { panic!("class instance expected") };
    assert_eq!(obj.borrow().fields["Position"], Value::Int(15));
}

#[test]
fn struct_receiver_discards_the_frozen_copy() {
    let op = position_compound_op(ConstraintKind::Struct, int(5));
    let program = lower_operation(&op).unwrap();
    let mut exec = Exec::new(program, moveable_runtime(), vec![item_value("1")]).unwrap();
    exec.run_to_completion().unwrap();
    // The set mutated the captured copy; the variable keeps its value.
    let Value::Struct(sv) = exec.local_value(0) else { panic!("struct value expected") };
    assert_eq!(sv.fields["Position"], Value::Int(10));
}

// ── Evaluation order ─────────────────────────────────────────────────

#[test]
fn get_runs_before_the_rhs() {
    let op = position_compound_op(ConstraintKind::Struct, offset_call("LoggedOffset"));
    let out = lower_and_run(&op, moveable_runtime(), vec![item_value("1")]).unwrap();
    assert_eq!(
        out,
        vec![
            "Position get for item '1'",
            "GetOffset called",
            "Position set for item '1'",
        ]
    );
}

// ── Suspension in the rhs ────────────────────────────────────────────

#[test]
fn async_rhs_output_matches_sync_for_struct() {
    let sync_op = position_compound_op(ConstraintKind::Struct, offset_call("GetOffset"));
    let sync_out = lower_and_run(&sync_op, moveable_runtime(), vec![item_value("1")]).unwrap();

    let async_op =
        position_compound_op(ConstraintKind::Struct, awaited(offset_call("GetOffsetAsync")));
    let async_out = lower_and_run(&async_op, moveable_runtime(), vec![item_value("1")]).unwrap();

    assert_eq!(sync_out, async_out);
}

#[test]
fn async_rhs_output_matches_sync_for_class() {
    let sync_op = position_compound_op(ConstraintKind::Class, offset_call("GetOffset"));
    let sync_out = lower_and_run(&sync_op, moveable_runtime(), vec![item_object("1")]).unwrap();

    let async_op =
        position_compound_op(ConstraintKind::Class, awaited(offset_call("GetOffsetAsync")));
    let async_out = lower_and_run(&async_op, moveable_runtime(), vec![item_object("1")]).unwrap();

    assert_eq!(sync_out, async_out);
}

#[test]
fn async_rhs_spills_the_capture_and_the_get_result() {
    let op = position_compound_op(ConstraintKind::Struct, awaited(offset_call("GetOffsetAsync")));
    let program = lower_operation(&op).unwrap();
    let machine = program.machine.expect("suspending rhs needs a machine");
    assert_eq!(machine.states, 1);
    let names: Vec<&str> = machine.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["spill_recv", "spill_get"]);
}
