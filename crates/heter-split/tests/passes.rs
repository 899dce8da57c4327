mod common;

use common::{append, declare, declare_param, declare_shaped, find_op, op, op_types, strategy, strs};
use heter_split::ir::{AttrValue, OpDesc, OpRole, Program, OP_NAMESCOPE, OP_ROLE, OP_ROLE_VAR};
use heter_split::lowering::STEP_COUNTER;
use heter_split::passes::{
    sweep_unreferenced_vars, AppendSendOpsPass, DeleteExtraOptimizesPass, DeleteOptimizerPass,
    FakeInitTablesPass, InitFromServerPass, PassContext, PassResult, ProgramPass,
    SparseLookupFusionPass,
};
use heter_split::{
    CommContext, DistributedMode, ErrorKind, PassConfig, RecvKind, RewriteError,
    StaticFleetStrategy, VarShard,
};

fn run_pass(
    pass: &dyn ProgramPass,
    program: &mut Program,
    fleet: &mut StaticFleetStrategy,
) -> heter_split::Result<PassResult> {
    let config = PassConfig::default();
    let mut cx = PassContext::new(&config, fleet);
    pass.run(program, &mut cx)
}

fn adam(param: &str, moment: &str, lr: &str) -> OpDesc {
    let grad = format!("{param}@GRAD");
    OpDesc::new("adam")
        .input("Param", [param])
        .input("Grad", [grad.as_str()])
        .input("Moment1", [moment])
        .input("LearningRate", [lr])
        .output("ParamOut", [param])
        .attr(OP_ROLE, OpRole::OPTIMIZE)
        .attr(OP_ROLE_VAR, vec![param.to_string(), grad])
}

#[test]
fn delete_optimizer_strips_updates_and_their_state() {
    let mut program = Program::new();
    declare(&mut program, &["x", "h", "h@GRAD", "step", "lr", "m1"]);
    declare_param(&mut program, "w", &[4, 4]);
    declare_shaped(&mut program, "w@GRAD", &[4, 4]);
    append(&mut program, op("mul", &["x", "w"], &["h"], None));
    append(
        &mut program,
        op("mul_grad", &["h@GRAD", "w"], &["w@GRAD"], None).attr(OP_ROLE, OpRole::BACKWARD),
    );
    let clip = append(
        &mut program,
        op("clip_by_norm", &["w@GRAD"], &["w@GRAD"], None)
            .attr(OP_ROLE, OpRole::OPTIMIZE)
            .attr(OP_NAMESCOPE, "/optimizer/@CLIP/"),
    );
    append(
        &mut program,
        op("scale", &["step"], &["lr"], None).attr(OP_ROLE, OpRole::LR_SCHED),
    );
    append(&mut program, adam("w", "m1", "lr"));

    let mut fleet = strategy(program.clone());
    let result = run_pass(&DeleteOptimizerPass, &mut program, &mut fleet).expect("pass");

    assert_eq!(op_types(&program, 0), ["mul", "mul_grad", "clip_by_norm"]);
    assert_eq!(
        program.global_block().op(clip).and_then(|op| op.role()),
        Some(OpRole::BACKWARD)
    );
    for gone in ["m1", "lr", "step"] {
        assert!(!program.has_var(gone), "{gone}");
    }
    assert!(program.has_var("w") && program.has_var("w@GRAD"));
    assert_eq!(
        result,
        PassResult {
            changed: true,
            inserted_ops: 0,
            erased_ops: 2,
            erased_vars: 3,
        }
    );
}

#[test]
fn delete_optimizer_keeps_state_still_read_elsewhere() {
    let mut program = Program::new();
    declare(&mut program, &["lr", "m1", "out"]);
    declare_param(&mut program, "w", &[4, 4]);
    append(&mut program, adam("w", "m1", "lr"));
    append(&mut program, op("print", &["lr"], &["out"], None));

    let mut fleet = strategy(program.clone());
    run_pass(&DeleteOptimizerPass, &mut program, &mut fleet).expect("pass");
    assert_eq!(op_types(&program, 0), ["print"]);
    assert!(program.has_var("lr"));
    assert!(!program.has_var("m1"));
}

fn lookup(ids: &str, out: &str) -> OpDesc {
    OpDesc::new("lookup_table")
        .input("Ids", [ids])
        .input("W", ["emb"])
        .output("Out", [out])
        .attr("remote_prefetch", true)
        .attr("is_distributed", false)
        .attr("padding_idx", 0i64)
}

fn sharded(fleet: StaticFleetStrategy) -> StaticFleetStrategy {
    let shard = |i: i64, endpoint: &str| VarShard {
        table: format!("emb.block{i}"),
        endpoint: endpoint.to_string(),
        begin: i * 60,
        end: (i + 1) * 60 - i * 20,
    };
    fleet.with_sparse_table("emb", vec![shard(0, "127.0.0.1:6000"), shard(1, "127.0.0.1:6001")])
}

#[test]
fn sparse_lookups_fuse_between_producers_and_consumers() {
    let mut program = Program::new();
    declare(&mut program, &["ids0", "ids1", "e0", "e1", "out"]);
    declare_param(&mut program, "emb", &[100, 4]);
    append(&mut program, op("data", &[], &["ids0"], None));
    append(&mut program, lookup("ids0", "e0"));
    append(&mut program, op("data", &[], &["ids1"], None));
    append(&mut program, lookup("ids1", "e1"));
    append(&mut program, op("sum", &["e0", "e1"], &["out"], None));

    let config = PassConfig::default();
    let mut fleet = sharded(strategy(program.clone()));
    let mut cx = PassContext::new(&config, &mut fleet);
    let result = SparseLookupFusionPass.run(&mut program, &mut cx).expect("fusion");

    assert_eq!(
        op_types(&program, 0),
        ["data", "data", "distributed_lookup_table", "sum"]
    );
    assert_eq!(result.inserted_ops, 1);
    assert_eq!(result.erased_ops, 2);

    let fused = find_op(&program, 0, "distributed_lookup_table");
    assert_eq!(fused.input("Ids"), ["ids0", "ids1"]);
    assert_eq!(fused.input("W"), ["emb"]);
    assert_eq!(fused.output("Outputs"), ["e0", "e1"]);
    assert_eq!(strs(fused.attr("table_names")), ["emb.block0", "emb.block1"]);
    assert_eq!(
        strs(fused.attr("endpoints")),
        ["127.0.0.1:6000", "127.0.0.1:6001"]
    );
    assert_eq!(
        fused.attr("sections").and_then(AttrValue::as_ints),
        Some(&[60i64, 40][..])
    );
    assert_eq!(fused.attr("padding_idx").and_then(AttrValue::as_int), Some(0));
    assert_eq!(fused.attr("pserver_num").and_then(AttrValue::as_int), Some(2));
    assert_eq!(fused.attr("is_distributed").and_then(AttrValue::as_bool), Some(false));

    let pulled = &cx.pull_sparse["emb"];
    assert_eq!(pulled.op, fused.id);
    assert_eq!(pulled.outputs, ["e0", "e1"]);
}

#[test]
fn lookups_without_remote_prefetch_are_left_alone() {
    let mut program = Program::new();
    declare(&mut program, &["ids", "e"]);
    append(
        &mut program,
        lookup("ids", "e").attr("remote_prefetch", false),
    );
    let before = program.clone();
    let mut fleet = strategy(program.clone());
    let result = run_pass(&SparseLookupFusionPass, &mut program, &mut fleet).expect("pass");
    assert!(!result.changed);
    assert_eq!(program, before);
}

#[test]
fn consumer_before_last_id_producer_is_degenerate() {
    let mut program = Program::new();
    declare(&mut program, &["ids0", "ids1", "e0", "e1", "u"]);
    append(&mut program, op("data", &[], &["ids0"], None));
    append(&mut program, lookup("ids0", "e0"));
    append(&mut program, op("relu", &["e0"], &["u"], None));
    append(&mut program, op("data", &[], &["ids1"], None));
    append(&mut program, lookup("ids1", "e1"));

    let mut fleet = sharded(strategy(program.clone()));
    let err = run_pass(&SparseLookupFusionPass, &mut program, &mut fleet)
        .expect_err("no valid insertion point");
    assert!(matches!(
        err,
        RewriteError::DegenerateLookupRange {
            insert_at: 3,
            first_consumer: 1,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

fn with_sends(fleet: StaticFleetStrategy) -> StaticFleetStrategy {
    fleet
        .with_send_context(CommContext::new("w@GRAD", ["w@GRAD"]))
        .with_send_context(CommContext::new(STEP_COUNTER, Vec::<String>::new()))
}

#[test]
fn async_sends_have_no_barrier() {
    let mut program = Program::new();
    let mut fleet = with_sends(strategy(Program::new()));
    let result = run_pass(&AppendSendOpsPass, &mut program, &mut fleet).expect("pass");

    assert_eq!(op_types(&program, 0), ["send", "send"]);
    assert_eq!(result.inserted_ops, 2);
    let ops = &program.global_block().ops;
    assert_eq!(ops[0].input("X"), ["w@GRAD"]);
    assert_eq!(strs(ops[0].attr("send_varnames")), ["w@GRAD"]);
    assert!(ops[1].input("X").is_empty());
    assert_eq!(strs(ops[1].attr("send_varnames")), [STEP_COUNTER]);
    assert!(ops.iter().all(|op| op.output("Out").is_empty()));
    assert!(ops.iter().all(|op| op.role() == Some(OpRole::RPC)));
}

#[test]
fn sync_sends_are_fenced_by_a_barrier() {
    let mut program = Program::new();
    let mut fleet = with_sends(strategy(Program::new()));
    fleet.mode = DistributedMode::Sync;
    run_pass(&AppendSendOpsPass, &mut program, &mut fleet).expect("pass");

    assert_eq!(op_types(&program, 0), ["send", "send", "send_barrier"]);
    let ops = &program.global_block().ops;
    assert_eq!(ops[0].output("Out"), ["__control_var@0"]);
    assert_eq!(ops[1].output("Out"), ["__control_var@1"]);
    assert_eq!(ops[2].input("X"), ["__control_var@0", "__control_var@1"]);
    assert_eq!(ops[2].attr("half_async").and_then(AttrValue::as_bool), Some(true));
    assert!(program.has_var("__control_var@1"));
}

#[test]
fn startup_pulls_dense_parameters() {
    let mut startup = Program::new();
    let mut fleet = strategy(Program::new())
        .with_recv_context(RecvKind::Dense, CommContext::new("fc", ["fc.w", "fc.b"]))
        .with_recv_context(RecvKind::Sparse, CommContext::new("emb", ["emb"]));
    run_pass(&InitFromServerPass, &mut startup, &mut fleet).expect("pass");

    assert_eq!(op_types(&startup, 0), ["recv", "fetch_barrier"]);
    let recv = find_op(&startup, 0, "recv");
    assert_eq!(strs(recv.attr("recv_varnames")), ["fc.w", "fc.b"]);
    let barrier = find_op(&startup, 0, "fetch_barrier");
    assert_eq!(barrier.output("Out"), ["__control_var@0"]);
    assert_eq!(
        strs(barrier.attr("endpoints")),
        ["127.0.0.1:6000", "127.0.0.1:6001"]
    );
}

fn sparse_origin() -> Program {
    let mut origin = Program::new();
    declare(&mut origin, &["ids", "e"]);
    declare_param(&mut origin, "emb", &[100, 8]);
    append(
        &mut origin,
        OpDesc::new("lookup_table")
            .input("Ids", ["ids"])
            .input("W", ["emb"])
            .output("Out", ["e"])
            .attr("is_sparse", true),
    );
    origin
}

fn initializer(out: &str, shape: Vec<i64>) -> OpDesc {
    OpDesc::new("uniform_random")
        .output("Out", [out])
        .attr("shape", shape)
}

#[test]
fn table_initializers_become_fake_init() {
    let mut startup = Program::new();
    declare_param(&mut startup, "emb", &[100, 8]);
    declare_param(&mut startup, "b", &[8]);
    append(&mut startup, initializer("emb", vec![100, 8]));
    append(&mut startup, initializer("b", vec![8]));

    let mut fleet = strategy(sparse_origin());
    let result = run_pass(&FakeInitTablesPass, &mut startup, &mut fleet).expect("pass");

    assert_eq!(op_types(&startup, 0), ["uniform_random", "fake_init"]);
    let fake = find_op(&startup, 0, "fake_init");
    assert_eq!(fake.output("Out"), ["emb"]);
    assert_eq!(
        fake.attr("shape").and_then(AttrValue::as_ints),
        Some(&[100i64, 8][..])
    );
    assert_eq!((result.inserted_ops, result.erased_ops), (1, 1));
}

#[test]
fn table_needs_exactly_one_initializer() {
    let mut fleet = strategy(sparse_origin());

    let mut twice = Program::new();
    append(&mut twice, initializer("emb", vec![100, 8]));
    append(&mut twice, initializer("emb", vec![100, 8]));
    let err = run_pass(&FakeInitTablesPass, &mut twice, &mut fleet).expect_err("two writers");
    assert!(matches!(
        err,
        RewriteError::TableInitializerCount { count: 2, ref table } if table == "emb"
    ));
    assert_eq!(err.kind(), ErrorKind::Invariant);

    let err = run_pass(&FakeInitTablesPass, &mut Program::new(), &mut fleet)
        .expect_err("no writer");
    assert!(matches!(err, RewriteError::TableInitializerCount { count: 0, .. }));
}

#[test]
fn startup_drops_optimizer_state() {
    let mut origin = Program::new();
    declare(&mut origin, &["lr", "m1"]);
    declare_param(&mut origin, "w", &[4, 4]);
    append(&mut origin, adam("w", "m1", "lr"));

    let mut startup = Program::new();
    declare(&mut startup, &["lr", "m1"]);
    declare_param(&mut startup, "w", &[4, 4]);
    append(&mut startup, initializer("w", vec![4, 4]));
    append(&mut startup, OpDesc::new("fill_constant").output("Out", ["m1"]));
    append(&mut startup, OpDesc::new("fill_constant").output("Out", ["lr"]));

    let mut fleet = strategy(origin);
    let result = run_pass(&DeleteExtraOptimizesPass, &mut startup, &mut fleet).expect("pass");

    assert_eq!(op_types(&startup, 0), ["uniform_random"]);
    assert!(startup.has_var("w"));
    assert!(!startup.has_var("m1") && !startup.has_var("lr"));
    assert_eq!((result.erased_ops, result.erased_vars), (2, 2));
}

#[test]
fn dead_variables_are_swept_across_blocks() {
    let mut program = Program::new();
    declare(&mut program, &["a", "b", "ghost", "inner"]);
    append(&mut program, op("relu", &["a"], &["b"], None));
    let block = program.create_block(0).expect("block");
    program
        .append_op(block, op("exp", &["inner"], &["inner"], None))
        .expect("append");

    let swept = sweep_unreferenced_vars(&mut program).expect("sweep");
    assert_eq!(swept, ["ghost"]);
    assert!(!program.has_var("ghost"));
    assert!(program.has_var("inner"));
}

#[test]
fn pass_results_merge() {
    let a = PassResult {
        changed: false,
        inserted_ops: 1,
        erased_ops: 0,
        erased_vars: 2,
    };
    let b = PassResult {
        changed: true,
        inserted_ops: 0,
        erased_ops: 3,
        erased_vars: 0,
    };
    assert_eq!(
        a.merge(b),
        PassResult {
            changed: true,
            inserted_ops: 1,
            erased_ops: 3,
            erased_vars: 2,
        }
    );
    assert_eq!(PassResult::default().merge(PassResult::default()), PassResult::default());
}
