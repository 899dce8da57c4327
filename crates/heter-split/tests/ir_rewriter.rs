mod common;

use std::collections::HashSet;

use common::{append, declare, op, op_types};
use heter_split::ir::{DType, IrError, OpDesc, Program, Variable};

fn chain() -> Program {
    let mut program = Program::new();
    declare(&mut program, &["a", "b", "c", "d"]);
    append(&mut program, op("relu", &["a"], &["b"], None));
    append(&mut program, op("tanh", &["b"], &["c"], None));
    append(&mut program, op("exp", &["c"], &["d"], None));
    program
}

#[test]
fn rewriter_tracks_positions_across_edits() {
    let mut program = chain();
    let ids: Vec<_> = program.global_block().ops.iter().map(|op| op.id).collect();
    let mut rw = program.rewriter(0).expect("rewriter");

    let scale = rw
        .insert_before(ids[1], op("scale", &["b"], &["b"], None))
        .expect("insert");
    assert_eq!(rw.position(scale), Some(1));
    assert_eq!(rw.position(ids[1]), Some(2));
    assert_eq!(rw.position(ids[2]), Some(3));
    assert!(rw.writers_of("b").contains(&scale));
    assert!(rw.verify());

    let removed = rw.erase(ids[0]).expect("erase");
    assert_eq!(removed.op_type, "relu");
    assert_eq!(rw.position(scale), Some(0));
    assert_eq!(rw.position(ids[2]), Some(2));
    assert!(rw.writers_of("b") == [scale]);
    assert!(rw.verify());
    assert_eq!(rw.ops_in_order(), vec![scale, ids[1], ids[2]]);
}

#[test]
fn erase_all_returns_ops_in_program_order() {
    let mut program = chain();
    let ids: Vec<_> = program.global_block().ops.iter().map(|op| op.id).collect();
    let mut rw = program.rewriter(0).expect("rewriter");
    let removed = rw.erase_all([ids[2], ids[0], ids[2]]).expect("erase");
    let types: Vec<_> = removed.iter().map(|op| op.op_type.as_str()).collect();
    assert_eq!(types, ["relu", "exp"]);
    assert_eq!(rw.len(), 1);
    assert!(rw.verify());

    let err = rw.erase(ids[0]).expect_err("already erased");
    assert_eq!(err, IrError::UnknownOperator(ids[0]));
}

#[test]
fn insert_past_end_is_rejected() {
    let mut program = chain();
    let err = program
        .insert_op(0, 7, OpDesc::new("noop"))
        .expect_err("out of range");
    assert_eq!(
        err,
        IrError::PositionOutOfRange {
            block: 0,
            index: 7,
            len: 3
        }
    );
    assert!(matches!(
        program.append_op(4, OpDesc::new("noop")),
        Err(IrError::UnknownBlock(4))
    ));
}

#[test]
fn remove_ops_by_id_removes_every_match() {
    let mut program = chain();
    let ids: HashSet<_> = program.global_block().ops[..2].iter().map(|op| op.id).collect();
    let removed = program.remove_ops_by_id(0, &ids).expect("remove");
    assert_eq!(removed, 2);
    assert_eq!(op_types(&program, 0), ["exp"]);
}

#[test]
fn remove_var_refuses_dangling_references() {
    let mut program = chain();
    let err = program.remove_var(0, "c").expect_err("still referenced");
    assert!(matches!(err, IrError::DanglingReference { ref var, .. } if var == "c"));

    program.remove_op(0, 2).expect("remove exp");
    program.remove_op(0, 1).expect("remove tanh");
    let removed = program.remove_var(0, "c").expect("now unreferenced");
    assert_eq!(removed.name, "c");
    assert!(matches!(
        program.remove_var(0, "c"),
        Err(IrError::UnknownVariable(_))
    ));
}

#[test]
fn clone_variable_is_idempotent() {
    let mut program = Program::new();
    let var = Variable::new("w", vec![8, 4], DType::F32).parameter();
    assert!(program.clone_variable(&var));
    let other = Variable::new("w", vec![1], DType::I64);
    assert!(!program.clone_variable(&other));
    assert_eq!(program.var("w"), Some(&var));
}

#[test]
fn foreign_ops_keep_ids_and_reserve_them() {
    let source = chain();
    let copied = source.global_block().ops[2].clone();

    let mut target = Program::new();
    let block = target.create_block(0).expect("block");
    assert_eq!(target.append_foreign_op(block, &copied), Ok(copied.id));
    assert_eq!(
        target.append_foreign_op(block, &copied),
        Err(IrError::DuplicateOp(copied.id))
    );
    let fresh = target.append_op(block, OpDesc::new("noop")).expect("append");
    assert!(fresh.0 > copied.id.0);

    let mut derived = Program::derived_from(&source);
    let id = derived.append_op(0, OpDesc::new("noop")).expect("append");
    assert!(source.global_block().ops.iter().all(|op| op.id != id));
}

#[test]
fn text_dump_and_json_round_trip() {
    let program = chain();
    let text = program.to_string();
    assert!(text.starts_with("program {"));
    assert!(text.contains("block 0 (parent -)"));
    assert!(text.contains("tanh(X=[b]) -> (Out=[c])"));
    assert!(text.contains("a : f32[-1, 4]"));

    let json = program.to_json().expect("serialize");
    let restored = Program::from_json(&json).expect("deserialize");
    assert_eq!(restored, program);
}
