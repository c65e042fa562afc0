// Property tests for lowering invariants:
// 1. Determinism: the same bound tree always lowers to the same program
// 2. No panics across the shape space
// 3. A machine exists exactly when the operation suspends
// 4. Structural sanity: trailing ret, resolvable branch targets

use proptest::prelude::*;

use styx::lower_operation;
use styx::ops::Op;
use styx::span::Spanned;
use styx::tree::*;

fn constraint_from(index: u8) -> ConstraintKind {
    match index % 4 {
        0 => ConstraintKind::Unconstrained,
        1 => ConstraintKind::Class,
        2 => ConstraintKind::Struct,
        _ => ConstraintKind::Interface("IMoveable".into()),
    }
}

fn rhs_expr(awaited: bool, offset: i64) -> Spanned<Expr> {
    let call = Spanned::dummy(Expr::Helper {
        name: "GetOffset".into(),
        args: vec![
            Spanned::dummy(HelperArg::Ref(LocalId(0))),
            Spanned::dummy(HelperArg::Value(Spanned::dummy(Expr::Int(offset)))),
        ],
        ret: TypeHint::Int,
    });
    if awaited {
        Spanned::dummy(Expr::Await(Box::new(call)))
    } else {
        call
    }
}

fn build_operation(
    constraint_index: u8,
    by_ref: bool,
    shape: u8,
    awaited: bool,
    offset: i64,
) -> BoundOperation {
    let locals = vec![LocalDecl {
        name: "item".into(),
        ty: TypeHint::TypeParam,
        is_param: true,
    }];
    let receiver = ReceiverVar {
        local: LocalId(0),
        constraint: constraint_from(constraint_index),
        by_ref,
    };
    let kind = match shape % 5 {
        0 => OperationKind::Call {
            member: "GetName".into(),
            args: vec![rhs_expr(awaited, offset)],
            conditional: false,
        },
        1 => OperationKind::Call {
            member: "GetName".into(),
            args: vec![rhs_expr(awaited, offset)],
            conditional: true,
        },
        2 => OperationKind::PropertyCompound {
            property: "Position".into(),
            op: BinOp::Add,
            rhs: rhs_expr(awaited, offset),
        },
        3 => OperationKind::PropertyCoalesce {
            property: "Tag".into(),
            rhs: rhs_expr(awaited, offset),
        },
        _ => OperationKind::IndexerCompound {
            index: Spanned::dummy(Expr::Int(0)),
            op: BinOp::Add,
            rhs: rhs_expr(awaited, offset),
        },
    };
    BoundOperation::new(locals, receiver, kind)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn lowering_is_deterministic(
        constraint in 0u8..4,
        by_ref in any::<bool>(),
        shape in 0u8..5,
        awaited in any::<bool>(),
        offset in -100i64..100,
    ) {
        let op = build_operation(constraint, by_ref, shape, awaited, offset);
        let first = lower_operation(&op).unwrap();
        let second = lower_operation(&op).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn machine_exists_exactly_when_the_operation_suspends(
        constraint in 0u8..4,
        by_ref in any::<bool>(),
        shape in 0u8..5,
        awaited in any::<bool>(),
        offset in -100i64..100,
    ) {
        let op = build_operation(constraint, by_ref, shape, awaited, offset);
        let program = lower_operation(&op).unwrap();
        prop_assert_eq!(program.machine.is_some(), awaited);
        if let Some(machine) = &program.machine {
            prop_assert_eq!(machine.states, 1);
        }
    }

    #[test]
    fn programs_end_with_ret_and_branches_resolve(
        constraint in 0u8..4,
        by_ref in any::<bool>(),
        shape in 0u8..5,
        awaited in any::<bool>(),
        offset in -100i64..100,
    ) {
        let op = build_operation(constraint, by_ref, shape, awaited, offset);
        let program = lower_operation(&op).unwrap();
        prop_assert_eq!(program.ops.last(), Some(&Op::Ret));
        let labels: Vec<u32> = program.ops.iter().filter_map(|o| match o {
            Op::Label(l) => Some(l.0),
            _ => None,
        }).collect();
        for op in &program.ops {
            let target = match op {
                Op::BranchIfNull(l) | Op::Jump(l) => Some(l.0),
                _ => None,
            };
            if let Some(target) = target {
                prop_assert!(labels.contains(&target), "unresolved label L{}", target);
            }
        }
    }

    #[test]
    fn rendering_never_panics(
        constraint in 0u8..4,
        by_ref in any::<bool>(),
        shape in 0u8..5,
        awaited in any::<bool>(),
        offset in -100i64..100,
    ) {
        let op = build_operation(constraint, by_ref, shape, awaited, offset);
        prop_assert!(!op.rendered.is_empty());
        let program = lower_operation(&op).unwrap();
        prop_assert!(!program.to_string().is_empty());
    }
}
