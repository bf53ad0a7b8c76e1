//! Closure synthesis tests
//!
//! Tests cover:
//! - Closure class emission: fields, constructor, invoke method
//! - Read-only and shared-cell (reassigned) captures
//! - Extension receiver capture and its fixed field position
//! - Enclosing instance capture through this$0
//! - Private member access from closures via synthetic bridges

use vesta_codegen::{
    flags, FieldRef, Instr, InvokeKind, Lowering, MemberRef, MethodSig, PrimKind, Recorder,
    TargetType, rt,
};
use vesta_frontend::{names, BinOp, DeclId, ExprKind, Program, ProgramBuilder, SourceType, Visibility};

// =============================================================================
// HELPERS
// =============================================================================

fn lower(program: &Program, func: DeclId) -> Recorder {
    let mut rec = Recorder::new();
    Lowering::new(program)
        .lower_function(func, &mut rec)
        .expect("lowering failed");
    rec
}

fn int() -> SourceType {
    SourceType::class(names::INT)
}

fn t_int() -> TargetType {
    TargetType::Prim(PrimKind::Int)
}

fn fn0() -> SourceType {
    SourceType::class("vesta.Function0")
}

fn string() -> SourceType {
    SourceType::class(names::STRING)
}

fn t_str() -> TargetType {
    TargetType::object(names::STRING)
}

fn push_int(v: i64) -> Instr {
    Instr::PushInt {
        value: v,
        kind: PrimKind::Int,
    }
}

// =============================================================================
// CAPTURE BY VALUE
// =============================================================================

#[test]
fn test_closure_class_with_read_capture() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", fn0());
    let x = b.local(main, "x", int(), false, false);
    let cf = b.closure_fn(int());
    let one = b.int(1);
    let let_x = b.let_(x, one);
    let read = b.name(x, int());
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(read),
        },
        fn0(),
    );
    let body = b.block(vec![let_x, closure]);
    b.set_body(main, body);
    let program = b.finish();

    let rec = lower(&program, main);
    let cls = "vesta.Namespace$main$closure$0";

    // One field per capture, synthetic and final.
    let fields = rec.fields_of(cls);
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].name, "x");
    assert_eq!(fields[0].ty, t_int());
    assert_eq!(fields[0].flags, flags::FINAL | flags::SYNTHETIC);

    // Constructor stores each argument into its field.
    let ctor = rec.method("<init>").unwrap();
    assert_eq!(ctor.def.sig, MethodSig::new(vec![t_int()], TargetType::Void));
    assert_eq!(
        ctor.code,
        vec![
            Instr::LoadLocal(0),
            Instr::LoadLocal(1),
            Instr::PutField(FieldRef::new(cls, "x", t_int())),
            Instr::Return(TargetType::Void),
        ]
    );

    // The invoke body reads the capture through the closure instance.
    let invoke = rec.method("invoke").unwrap();
    assert_eq!(invoke.def.owner, cls);
    assert_eq!(
        invoke.code,
        vec![
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new(cls, "x", t_int())),
            Instr::Return(t_int()),
        ]
    );

    // The instantiation site passes the captured value.
    assert_eq!(
        rec.method("main").unwrap().code,
        vec![
            push_int(1),
            Instr::StoreLocal(0),
            Instr::New(cls.to_string()),
            Instr::Dup,
            Instr::LoadLocal(0),
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: MemberRef::new(cls, "<init>", MethodSig::new(vec![t_int()], TargetType::Void)),
            },
            Instr::CheckCast(TargetType::object("vesta.Function0")),
            Instr::Return(TargetType::object("vesta.Function0")),
        ]
    );
}

#[test]
fn test_closure_own_params_start_after_instance_slot() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", SourceType::Unit);
    let cf = b.closure_fn(int());
    let y = b.param(cf, "y", int());
    let read = b.name(y, int());
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(read),
        },
        fn0(),
    );
    let body = b.block(vec![closure]);
    b.set_body(main, body);
    let program = b.finish();

    let rec = lower(&program, main);
    let invoke = rec.method("invoke").unwrap();
    assert_eq!(invoke.def.sig, MethodSig::new(vec![t_int()], t_int()));
    // Slot 0 is the closure instance; the parameter lands in slot 1.
    assert_eq!(
        invoke.code,
        vec![Instr::LoadLocal(1), Instr::Return(t_int())]
    );
}

// =============================================================================
// SHARED-CELL CAPTURE
// =============================================================================

#[test]
fn test_reassigned_capture_goes_through_cell() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", SourceType::Unit);
    let x = b.local(main, "x", int(), true, false);
    let cf = b.closure_fn(SourceType::Unit);
    let one = b.int(1);
    let let_x = b.let_(x, one);
    let target = b.name(x, int());
    let two = b.int(2);
    let assign = b.assign(target, two);
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(assign),
        },
        fn0(),
    );
    let body = b.block(vec![let_x, closure]);
    b.set_body(main, body);
    let program = b.finish();

    let rec = lower(&program, main);
    let cls = "vesta.Namespace$main$closure$0";
    let cell = rt::cell_type(&t_int());

    // The capture field holds the cell, not the value.
    let fields = rec.fields_of(cls);
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].ty, cell);

    // The declaration site creates the cell and initializes through it,
    // then hands the cell itself to the constructor.
    assert_eq!(
        rec.method("main").unwrap().code,
        vec![
            Instr::New("vesta.rt.Ref$Int".to_string()),
            Instr::Dup,
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: rt::cell_ctor(&t_int()),
            },
            Instr::StoreLocal(0),
            Instr::LoadLocal(0),
            push_int(1),
            Instr::PutField(rt::cell_element(&t_int())),
            Instr::New(cls.to_string()),
            Instr::Dup,
            Instr::LoadLocal(0),
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: MemberRef::new(cls, "<init>", MethodSig::new(vec![cell.clone()], TargetType::Void)),
            },
            Instr::Pop,
            Instr::Return(TargetType::Void),
        ]
    );

    // The closure writes through the cell's element field.
    assert_eq!(
        rec.method("invoke").unwrap().code,
        vec![
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new(cls, "x", cell)),
            push_int(2),
            Instr::PutField(rt::cell_element(&t_int())),
            Instr::Return(TargetType::Void),
        ]
    );
}

#[test]
fn test_captured_reassigned_parameter_rebinds_into_cell() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", SourceType::Unit);
    let x = b.param(main, "x", int());
    let cf = b.closure_fn(SourceType::Unit);
    let target = b.name(x, int());
    let two = b.int(2);
    let assign = b.assign(target, two);
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(assign),
        },
        fn0(),
    );
    let body = b.block(vec![closure]);
    b.set_body(main, body);
    let program = b.finish();

    let rec = lower(&program, main);
    let code = &rec.method("main").unwrap().code;
    // Prologue: the incoming value in slot 0 moves into a fresh cell in
    // slot 1, and the closure receives the cell.
    assert_eq!(
        &code[..8],
        &[
            Instr::New("vesta.rt.Ref$Int".to_string()),
            Instr::Dup,
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: rt::cell_ctor(&t_int()),
            },
            Instr::Dup,
            Instr::LoadLocal(0),
            Instr::PutField(rt::cell_element(&t_int())),
            Instr::StoreLocal(1),
            Instr::New("vesta.Namespace$main$closure$0".to_string()),
        ]
    );
    assert!(code.contains(&Instr::LoadLocal(1)));
}

// =============================================================================
// EXTENSION RECEIVER
// =============================================================================

#[test]
fn test_receiver_capture_leads_the_field_layout() {
    let mut b = ProgramBuilder::new();
    let f = b.function("tag", fn0());
    let recv = b.param(f, "<receiver>", string());
    let prefix = b.param(f, "prefix", string());
    let cf = b.closure_fn(string());
    // The closure reads `prefix` before the receiver, so discovery order
    // alone would put the receiver field last.
    let lhs = b.name(prefix, string());
    let rhs = b.name(recv, string());
    let concat = b.expr(
        ExprKind::Binary {
            op: BinOp::Add,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        string(),
    );
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(concat),
        },
        fn0(),
    );
    let body = b.block(vec![closure]);
    b.set_body(f, body);
    let program = b.finish();

    let rec = lower(&program, f);
    let cls = "vesta.Namespace$tag$closure$0";

    // The receiver field comes first regardless of discovery order.
    let fields = rec.fields_of(cls);
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].name, "receiver$0");
    assert_eq!(fields[1].name, "prefix");

    // Constructor arguments follow the same order.
    assert_eq!(
        rec.method("tag").unwrap().code,
        vec![
            Instr::New(cls.to_string()),
            Instr::Dup,
            Instr::LoadLocal(0),
            Instr::LoadLocal(1),
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: MemberRef::new(
                    cls,
                    "<init>",
                    MethodSig::new(vec![t_str(), t_str()], TargetType::Void),
                ),
            },
            Instr::CheckCast(TargetType::object("vesta.Function0")),
            Instr::Return(TargetType::object("vesta.Function0")),
        ]
    );

    assert_eq!(
        rec.method("invoke").unwrap().code,
        vec![
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new(cls, "prefix", t_str())),
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new(cls, "receiver$0", t_str())),
            Instr::Invoke {
                kind: InvokeKind::Static,
                member: rt::string_concat(),
            },
            Instr::Return(t_str()),
        ]
    );
}

// =============================================================================
// ENCLOSING INSTANCE
// =============================================================================

#[test]
fn test_closure_captures_enclosing_instance() {
    let mut b = ProgramBuilder::new();
    let a = b.class("app.A", None);
    let p = b.property(Some(a), "count", int(), Visibility::Public, true);
    let m = b.method(a, "observe", Visibility::Public, SourceType::Unit);
    let cf = b.closure_fn(int());
    let read = b.expr(
        ExprKind::Member {
            receiver: None,
            member: p,
        },
        int(),
    );
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(read),
        },
        fn0(),
    );
    let body = b.block(vec![closure]);
    b.set_body(m, body);
    let program = b.finish();

    let rec = lower(&program, m);
    let cls = "app.A$observe$closure$0";
    let this_field = FieldRef::new(cls, "this$0", TargetType::object("app.A"));

    let fields = rec.fields_of(cls);
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].name, "this$0");

    // The invoke body steps through this$0 to the owner's field.
    assert_eq!(
        rec.method("invoke").unwrap().code,
        vec![
            Instr::LoadLocal(0),
            Instr::GetField(this_field),
            Instr::GetField(FieldRef::new("app.A", "count", t_int())),
            Instr::Return(t_int()),
        ]
    );

    // The instantiation passes the enclosing instance.
    let observe = rec.method("observe").unwrap();
    assert_eq!(observe.code[0], Instr::New(cls.to_string()));
    assert_eq!(observe.code[2], Instr::LoadLocal(0));
}

#[test]
fn test_private_property_from_closure_uses_bridge() {
    let mut b = ProgramBuilder::new();
    let a = b.class("app.A", None);
    let p = b.property(Some(a), "secret", int(), Visibility::Private, false);
    let m = b.method(a, "peek", Visibility::Public, SourceType::Unit);
    let cf = b.closure_fn(int());
    let read = b.expr(
        ExprKind::Member {
            receiver: None,
            member: p,
        },
        int(),
    );
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(read),
        },
        fn0(),
    );
    let body = b.block(vec![closure]);
    b.set_body(m, body);
    let program = b.finish();

    let rec = lower(&program, m);
    let cls = "app.A$peek$closure$0";
    let owner_ty = TargetType::object("app.A");

    // A static synthetic accessor is emitted on the owning class.
    let bridge = rec.method("access$0").unwrap();
    assert_eq!(bridge.def.owner, "app.A");
    assert_eq!(bridge.def.flags, flags::STATIC | flags::SYNTHETIC);
    assert_eq!(
        bridge.def.sig,
        MethodSig::new(vec![owner_ty.clone()], t_int())
    );
    assert_eq!(
        bridge.code,
        vec![
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new("app.A", "secret", t_int())),
            Instr::Return(t_int()),
        ]
    );

    // The closure body calls the bridge instead of touching the field.
    assert_eq!(
        rec.method("invoke").unwrap().code,
        vec![
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new(cls, "this$0", owner_ty.clone())),
            Instr::Invoke {
                kind: InvokeKind::Static,
                member: MemberRef::new("app.A", "access$0", MethodSig::new(vec![owner_ty], t_int())),
            },
            Instr::Return(t_int()),
        ]
    );
}

#[test]
fn test_private_method_from_closure_uses_call_bridge() {
    let mut b = ProgramBuilder::new();
    let a = b.class("app.A", None);
    let h = b.method(a, "helper", Visibility::Private, int());
    let m = b.method(a, "run", Visibility::Public, SourceType::Unit);
    let cf = b.closure_fn(int());
    let call = b.expr(
        ExprKind::Call {
            callee: h,
            receiver: None,
            args: Vec::new(),
            type_args: Vec::new(),
        },
        int(),
    );
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(call),
        },
        fn0(),
    );
    let body = b.block(vec![closure]);
    b.set_body(m, body);
    let program = b.finish();

    let rec = lower(&program, m);
    let owner_ty = TargetType::object("app.A");

    let bridge = rec.method("access$0").unwrap();
    assert_eq!(bridge.def.flags, flags::STATIC | flags::SYNTHETIC);
    assert_eq!(
        bridge.def.sig,
        MethodSig::new(vec![owner_ty.clone()], t_int())
    );
    // The bridge forwards to the private method non-virtually.
    assert_eq!(
        bridge.code,
        vec![
            Instr::LoadLocal(0),
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: MemberRef::new("app.A", "helper", MethodSig::new(Vec::new(), t_int())),
            },
            Instr::Return(t_int()),
        ]
    );

    let invoke = rec.method("invoke").unwrap();
    assert!(invoke.code.iter().any(|i| matches!(
        i,
        Instr::Invoke { kind: InvokeKind::Static, member } if member.name == "access$0"
    )));
}

#[test]
fn test_call_bridge_keeps_arguments_primitive() {
    let mut b = ProgramBuilder::new();
    let a = b.class("app.A", None);
    let h = b.method(a, "helper", Visibility::Private, int());
    let _n = b.param(h, "n", int());
    let m = b.method(a, "run", Visibility::Public, SourceType::Unit);
    let cf = b.closure_fn(int());
    let five = b.int(5);
    let call = b.expr(
        ExprKind::Call {
            callee: h,
            receiver: None,
            args: vec![five],
            type_args: Vec::new(),
        },
        int(),
    );
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(call),
        },
        fn0(),
    );
    let body = b.block(vec![closure]);
    b.set_body(m, body);
    let program = b.finish();

    let rec = lower(&program, m);
    let cls = "app.A$run$closure$0";
    let owner_ty = TargetType::object("app.A");
    let bridge_sig = MethodSig::new(vec![owner_ty.clone(), t_int()], t_int());

    // The bridge prepends the receiver to the target's own parameters.
    let bridge = rec.method("access$0").unwrap();
    assert_eq!(bridge.def.sig, bridge_sig);
    assert_eq!(
        bridge.code,
        vec![
            Instr::LoadLocal(0),
            Instr::LoadLocal(1),
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: MemberRef::new("app.A", "helper", MethodSig::new(vec![t_int()], t_int())),
            },
            Instr::Return(t_int()),
        ]
    );

    // The value argument is coerced against the method's own parameter,
    // not the bridge's leading receiver slot.
    assert_eq!(
        rec.method("invoke").unwrap().code,
        vec![
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new(cls, "this$0", owner_ty)),
            push_int(5),
            Instr::Invoke {
                kind: InvokeKind::Static,
                member: MemberRef::new("app.A", "access$0", bridge_sig),
            },
            Instr::Return(t_int()),
        ]
    );
}

// =============================================================================
// NESTED CLOSURES
// =============================================================================

#[test]
fn test_nested_closure_forwards_capture() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", SourceType::Unit);
    let x = b.local(main, "x", int(), false, false);
    let outer_fn = b.closure_fn(fn0());
    let inner_fn = b.closure_fn(int());
    let one = b.int(1);
    let let_x = b.let_(x, one);
    let read = b.name(x, int());
    let inner = b.expr(
        ExprKind::Closure {
            decl: inner_fn,
            body: Box::new(read),
        },
        fn0(),
    );
    let outer = b.expr(
        ExprKind::Closure {
            decl: outer_fn,
            body: Box::new(inner),
        },
        fn0(),
    );
    let body = b.block(vec![let_x, outer]);
    b.set_body(main, body);
    let program = b.finish();

    let rec = lower(&program, main);
    let outer_cls = "vesta.Namespace$main$closure$0";
    let inner_cls = "vesta.Namespace$main$closure$0$closure$1";

    // Both classes carry an x field; the outer forwards its own field to
    // the inner constructor.
    assert_eq!(rec.fields_of(outer_cls).len(), 1);
    assert_eq!(rec.fields_of(inner_cls).len(), 1);
    let outer_invoke = rec
        .methods_of(outer_cls)
        .into_iter()
        .find(|m| m.def.name == "invoke")
        .unwrap();
    assert_eq!(
        outer_invoke.code,
        vec![
            Instr::New(inner_cls.to_string()),
            Instr::Dup,
            Instr::LoadLocal(0),
            Instr::GetField(FieldRef::new(outer_cls, "x", t_int())),
            Instr::Invoke {
                kind: InvokeKind::Special,
                member: MemberRef::new(
                    inner_cls,
                    "<init>",
                    MethodSig::new(vec![t_int()], TargetType::Void),
                ),
            },
            Instr::CheckCast(TargetType::object("vesta.Function0")),
            Instr::Return(TargetType::object("vesta.Function0")),
        ]
    );
}

#[test]
fn test_closure_value_invocation() {
    let mut b = ProgramBuilder::new();
    let main = b.function("main", int());
    let cf = b.closure_fn(int());
    let lit = b.int(9);
    let closure = b.expr(
        ExprKind::Closure {
            decl: cf,
            body: Box::new(lit),
        },
        fn0(),
    );
    let call = b.expr(
        ExprKind::Call {
            callee: cf,
            receiver: Some(Box::new(closure)),
            args: Vec::new(),
            type_args: Vec::new(),
        },
        int(),
    );
    b.set_body(main, call);
    let program = b.finish();

    let rec = lower(&program, main);
    let code = &rec.method("main").unwrap().code;
    // Instantiate, then dispatch invoke virtually on the value.
    assert!(code.iter().any(|i| matches!(
        i,
        Instr::Invoke { kind: InvokeKind::Virtual, member } if member.name == "invoke"
    )));
    assert_eq!(code.last(), Some(&Instr::Return(t_int())));
}
