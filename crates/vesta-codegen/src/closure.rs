//! Closure Capture Analysis and Class Layout
//!
//! Closures lower to synthesized classes: one field per captured variable,
//! an optional `this$0` for the enclosing instance, a constructor wiring
//! them up, and an invoke method holding the lowered body. Captures are
//! found up front for the whole compilation unit so that a variable
//! reassigned under capture can be rebound to a shared-box cell before any
//! body is lowered. Capture is transitive: a variable a nested closure
//! reads is a capture of every closure between it and its frame.

use crate::error::{CodegenError, CodegenResult};
use crate::sink::{flags, FieldDef, Instr, InstructionSink, InvokeKind, MemberEmitter, MethodDef};
use crate::target::{rt, FieldRef, MemberRef, MethodSig, TargetType, TypeMapper};
use rustc_hash::{FxHashMap, FxHashSet};
use vesta_frontend::{Decl, DeclId, Expr, ExprKind, Program};

/// Conventional name the front end gives the extension receiver parameter.
pub const RECEIVER_PARAM: &str = "<receiver>";

/// One captured variable of a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub decl: DeclId,
    /// Reassigned under capture, so it must live in a shared-box cell.
    pub mutable: bool,
}

/// Everything one closure reaches outside its own frame, in discovery
/// order.
#[derive(Debug, Clone, Default)]
pub struct CaptureSet {
    pub captures: Vec<Capture>,
    pub uses_outer_instance: bool,
}

impl CaptureSet {
    fn add(&mut self, decl: DeclId, mutable: bool) {
        if let Some(existing) = self.captures.iter_mut().find(|c| c.decl == decl) {
            existing.mutable |= mutable;
        } else {
            self.captures.push(Capture { decl, mutable });
        }
    }
}

/// Capture analysis results for one compilation unit (one top-level
/// callable body and every closure inside it).
#[derive(Debug, Default)]
pub struct UnitAnalysis {
    sets: FxHashMap<DeclId, CaptureSet>,
    boxed: FxHashSet<DeclId>,
}

impl UnitAnalysis {
    /// The capture set of a closure's synthetic callable.
    pub fn capture_set(&self, closure: DeclId) -> Option<&CaptureSet> {
        self.sets.get(&closure)
    }

    /// Whether a local must live in a shared-box cell because it is both
    /// captured and reassigned somewhere in the unit.
    pub fn is_boxed(&self, decl: DeclId) -> bool {
        self.boxed.contains(&decl)
    }
}

/// Analyze every closure under `body` before lowering starts.
pub fn analyze_unit(program: &Program, body: &Expr) -> UnitAnalysis {
    let mut closures: Vec<(DeclId, &Expr)> = Vec::new();
    walk(body, &mut |e| {
        if let ExprKind::Closure { decl, body } = &e.kind {
            closures.push((*decl, body));
        }
    });

    let mut analysis = UnitAnalysis::default();
    for (decl, closure_body) in closures {
        let mut inside: FxHashSet<DeclId> = FxHashSet::default();
        inside.insert(decl);
        walk(closure_body, &mut |e| {
            if let ExprKind::Closure { decl, .. } = &e.kind {
                inside.insert(*decl);
            }
        });

        let mut set = CaptureSet::default();
        walk(closure_body, &mut |e| {
            collect(program, &inside, &mut set, e);
        });
        for capture in &set.captures {
            if capture.mutable {
                analysis.boxed.insert(capture.decl);
            }
        }
        analysis.sets.insert(decl, set);
    }
    analysis
}

fn collect(program: &Program, inside: &FxHashSet<DeclId>, set: &mut CaptureSet, e: &Expr) {
    match &e.kind {
        ExprKind::Name => {
            if let Some(decl) = program.resolution(e.id) {
                match program.decl(decl) {
                    Decl::Local(local) if !inside.contains(&local.owner) => {
                        set.add(decl, local.reassigned);
                    }
                    Decl::Property(p) if p.owner.is_some() => {
                        set.uses_outer_instance = true;
                    }
                    _ => {}
                }
            }
        }
        ExprKind::This => set.uses_outer_instance = true,
        ExprKind::Assign { target, .. } | ExprKind::Compound { target, .. } => {
            if let ExprKind::Name = target.kind {
                if let Some(decl) = program.resolution(target.id) {
                    if let Decl::Local(local) = program.decl(decl) {
                        if !inside.contains(&local.owner) {
                            set.add(decl, true);
                        }
                    }
                }
            }
        }
        ExprKind::Call { callee, receiver, .. } => {
            if receiver.is_none() {
                if let Decl::Function(f) = program.decl(*callee) {
                    if f.is_instance && f.owner.is_some() {
                        set.uses_outer_instance = true;
                    }
                }
            }
        }
        ExprKind::Member { receiver, member } => {
            if receiver.is_none() {
                if let Decl::Property(p) = program.decl(*member) {
                    if p.owner.is_some() {
                        set.uses_outer_instance = true;
                    }
                }
            }
        }
        _ => {}
    }
}

/// Visit `expr` and every descendant, closure bodies included.
pub fn walk<'a>(expr: &'a Expr, f: &mut dyn FnMut(&'a Expr)) {
    f(expr);
    match &expr.kind {
        ExprKind::IntLit(_)
        | ExprKind::FloatLit(_)
        | ExprKind::BoolLit(_)
        | ExprKind::CharLit(_)
        | ExprKind::StrLit(_)
        | ExprKind::NullLit
        | ExprKind::UnitLit
        | ExprKind::Name
        | ExprKind::This
        | ExprKind::Break { .. }
        | ExprKind::Continue { .. } => {}
        ExprKind::Block(exprs) | ExprKind::TupleLit(exprs) => {
            for e in exprs {
                walk(e, f);
            }
        }
        ExprKind::Let { init, .. } => {
            if let Some(init) = init {
                walk(init, f);
            }
        }
        ExprKind::Assign { target, value } | ExprKind::Compound { target, value, .. } => {
            walk(target, f);
            walk(value, f);
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            walk(lhs, f);
            walk(rhs, f);
        }
        ExprKind::Unary { operand, .. }
        | ExprKind::Throw(operand)
        | ExprKind::NotNull(operand)
        | ExprKind::TypeTest { operand, .. }
        | ExprKind::Cast { operand, .. } => walk(operand, f),
        ExprKind::Call { receiver, args, .. } => {
            if let Some(r) = receiver {
                walk(r, f);
            }
            for a in args {
                walk(a, f);
            }
        }
        ExprKind::Member { receiver, .. } => {
            if let Some(r) = receiver {
                walk(r, f);
            }
        }
        ExprKind::Index { array, index } => {
            walk(array, f);
            walk(index, f);
        }
        ExprKind::ArrayLit { elems, .. } => {
            for e in elems {
                walk(e, f);
            }
        }
        ExprKind::If { cond, then, els } => {
            walk(cond, f);
            walk(then, f);
            if let Some(els) = els {
                walk(els, f);
            }
        }
        ExprKind::While { cond, body, .. } => {
            walk(cond, f);
            walk(body, f);
        }
        ExprKind::DoWhile { body, cond, .. } => {
            walk(body, f);
            walk(cond, f);
        }
        ExprKind::When {
            subject,
            clauses,
            else_body,
        } => {
            if let Some(s) = subject {
                walk(s, f);
            }
            for clause in clauses {
                for c in &clause.conditions {
                    walk(c, f);
                }
                walk(&clause.body, f);
            }
            if let Some(e) = else_body {
                walk(e, f);
            }
        }
        ExprKind::Try {
            body,
            catches,
            finally,
        } => {
            walk(body, f);
            for c in catches {
                walk(&c.body, f);
            }
            if let Some(fin) = finally {
                walk(fin, f);
            }
        }
        ExprKind::Return { value } => {
            if let Some(v) = value {
                walk(v, f);
            }
        }
        ExprKind::Closure { body, .. } => walk(body, f),
    }
}

/// One capture field on a synthesized closure class. `field.ty` is the
/// cell type when the capture is boxed; `inner` is always the value type.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureField {
    pub decl: DeclId,
    pub field: FieldRef,
    pub boxed: bool,
    pub inner: TargetType,
}

/// Field layout of a synthesized closure class. Constructor parameter
/// order is `this$0` first (when present), the extension receiver next,
/// then the remaining capture fields in discovery order.
#[derive(Debug, Clone)]
pub struct ClosureLayout {
    pub class_name: String,
    pub this_field: Option<FieldRef>,
    pub receiver_field: Option<FieldRef>,
    pub fields: Vec<ClosureField>,
}

impl ClosureLayout {
    /// Build the layout for one closure from its capture set.
    pub fn build(
        program: &Program,
        mapper: &TypeMapper,
        class_name: String,
        set: &CaptureSet,
        analysis: &UnitAnalysis,
        enclosing_instance: Option<TargetType>,
    ) -> CodegenResult<ClosureLayout> {
        let this_field = if set.uses_outer_instance {
            let ty = enclosing_instance.ok_or_else(|| {
                CodegenError::internal("closure uses the enclosing instance in a static context")
            })?;
            Some(FieldRef::new(&class_name, "this$0", ty))
        } else {
            None
        };
        let mut receiver_field = None;
        let mut fields = Vec::with_capacity(set.captures.len());
        // The receiver capture takes the leading field position no matter
        // where discovery found it.
        let (receiver_caps, other_caps): (Vec<&Capture>, Vec<&Capture>) = set
            .captures
            .iter()
            .partition(|c| program.local(c.decl).name == RECEIVER_PARAM);
        for capture in receiver_caps.iter().chain(other_caps.iter()) {
            let local = program.local(capture.decl);
            let inner = mapper.map_type(&local.ty)?;
            let boxed = analysis.is_boxed(capture.decl);
            let stored = if boxed {
                rt::cell_type(&inner)
            } else {
                inner.clone()
            };
            let name = if local.name == RECEIVER_PARAM {
                "receiver$0".to_string()
            } else {
                local.name.clone()
            };
            let field = FieldRef::new(&class_name, &name, stored);
            if local.name == RECEIVER_PARAM {
                receiver_field = Some(field.clone());
            }
            fields.push(ClosureField {
                decl: capture.decl,
                field,
                boxed,
                inner,
            });
        }
        Ok(ClosureLayout {
            class_name,
            this_field,
            receiver_field,
            fields,
        })
    }

    /// The capture field backing `decl`, if captured.
    pub fn field_for(&self, decl: DeclId) -> Option<&ClosureField> {
        self.fields.iter().find(|f| f.decl == decl)
    }

    /// All fields in constructor parameter order.
    fn ctor_fields(&self) -> Vec<&FieldRef> {
        let mut out = Vec::new();
        if let Some(this) = &self.this_field {
            out.push(this);
        }
        out.extend(self.fields.iter().map(|f| &f.field));
        out
    }

    /// Emit the class's field shells and constructor; returns the
    /// constructor reference the instantiation site invokes.
    pub fn emit_shell(&self, emitter: &mut dyn MemberEmitter) -> CodegenResult<MemberRef> {
        let ctor_fields = self.ctor_fields();
        for field in &ctor_fields {
            emitter.emit_field(FieldDef {
                owner: self.class_name.clone(),
                name: field.name.clone(),
                ty: field.ty.clone(),
                flags: flags::FINAL | flags::SYNTHETIC,
            })?;
        }
        let params: Vec<TargetType> = ctor_fields.iter().map(|f| f.ty.clone()).collect();
        let sig = MethodSig::new(params, TargetType::Void);

        let mut code: Vec<Instr> = Vec::new();
        let mut slot: u16 = 1;
        for field in &ctor_fields {
            code.emit(Instr::LoadLocal(0));
            code.emit(Instr::LoadLocal(slot));
            slot += u16::from(field.ty.slots());
            code.emit(Instr::PutField((*field).clone()));
        }
        code.emit(Instr::Return(TargetType::Void));
        emitter.emit_method(
            MethodDef {
                owner: self.class_name.clone(),
                name: "<init>".to_string(),
                sig: sig.clone(),
                flags: flags::PUBLIC,
            },
            code,
        )?;
        Ok(MemberRef::new(&self.class_name, "<init>", sig))
    }
}

/// A ready-to-instantiate closure: its class name, constructor, and the
/// argument sources in constructor order.
#[derive(Debug, Clone)]
pub struct ClosureInstantiation {
    pub class_name: String,
    pub ctor: MemberRef,
    pub args: Vec<crate::value::ValueRef>,
}

/// Dispatch target of a closure's invoke method.
pub fn invoke_member(class_name: &str, sig: MethodSig) -> (InvokeKind, MemberRef) {
    (
        InvokeKind::Virtual,
        MemberRef::new(class_name, "invoke", sig),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Recorder;
    use crate::target::PrimKind;
    use vesta_frontend::{names, ProgramBuilder, SourceType, Visibility};

    fn int_ty() -> SourceType {
        SourceType::class(names::INT)
    }

    #[test]
    fn test_simple_capture() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", int_ty(), false, false);
        let cf = b.closure_fn(int_ty());
        let use_x = b.name(x, int_ty());
        let closure = b.expr(
            ExprKind::Closure {
                decl: cf,
                body: Box::new(use_x),
            },
            SourceType::class("vesta.Function0"),
        );
        let body = b.block(vec![closure]);
        let program = b.finish();

        let analysis = analyze_unit(&program, &body);
        let set = analysis.capture_set(cf).unwrap();
        assert_eq!(set.captures, vec![Capture { decl: x, mutable: false }]);
        assert!(!set.uses_outer_instance);
        assert!(!analysis.is_boxed(x));
    }

    #[test]
    fn test_assignment_marks_capture_mutable() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", int_ty(), true, false);
        let cf = b.closure_fn(SourceType::Unit);
        let target = b.name(x, int_ty());
        let one = b.int(1);
        let assign = b.assign(target, one);
        let closure = b.expr(
            ExprKind::Closure {
                decl: cf,
                body: Box::new(assign),
            },
            SourceType::class("vesta.Function0"),
        );
        let body = b.block(vec![closure]);
        let program = b.finish();

        let analysis = analyze_unit(&program, &body);
        assert!(analysis.is_boxed(x));
        assert_eq!(
            analysis.capture_set(cf).unwrap().captures,
            vec![Capture { decl: x, mutable: true }]
        );
    }

    #[test]
    fn test_reassigned_flag_forces_boxing() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        // Reassigned outside the closure, only read inside.
        let x = b.local(f, "x", int_ty(), true, true);
        let cf = b.closure_fn(int_ty());
        let use_x = b.name(x, int_ty());
        let closure = b.expr(
            ExprKind::Closure {
                decl: cf,
                body: Box::new(use_x),
            },
            SourceType::class("vesta.Function0"),
        );
        let body = b.block(vec![closure]);
        let program = b.finish();

        let analysis = analyze_unit(&program, &body);
        assert!(analysis.is_boxed(x));
    }

    #[test]
    fn test_transitive_capture_through_nested_closure() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", int_ty(), false, false);
        let outer_fn = b.closure_fn(SourceType::class("vesta.Function0"));
        let inner_fn = b.closure_fn(int_ty());
        let use_x = b.name(x, int_ty());
        let inner = b.expr(
            ExprKind::Closure {
                decl: inner_fn,
                body: Box::new(use_x),
            },
            SourceType::class("vesta.Function0"),
        );
        let outer = b.expr(
            ExprKind::Closure {
                decl: outer_fn,
                body: Box::new(inner),
            },
            SourceType::class("vesta.Function0"),
        );
        let body = b.block(vec![outer]);
        let program = b.finish();

        let analysis = analyze_unit(&program, &body);
        // Both levels capture x; the outer one forwards it inward.
        assert_eq!(
            analysis.capture_set(outer_fn).unwrap().captures,
            vec![Capture { decl: x, mutable: false }]
        );
        assert_eq!(
            analysis.capture_set(inner_fn).unwrap().captures,
            vec![Capture { decl: x, mutable: false }]
        );
    }

    #[test]
    fn test_closure_own_locals_are_not_captures() {
        let mut b = ProgramBuilder::new();
        let _f = b.function("main", SourceType::Unit);
        let cf = b.closure_fn(int_ty());
        let y = b.local(cf, "y", int_ty(), false, false);
        let init = b.int(3);
        let let_y = b.let_(y, init);
        let use_y = b.name(y, int_ty());
        let closure_body = b.block(vec![let_y, use_y]);
        let closure = b.expr(
            ExprKind::Closure {
                decl: cf,
                body: Box::new(closure_body),
            },
            SourceType::class("vesta.Function0"),
        );
        let body = b.block(vec![closure]);
        let program = b.finish();

        let analysis = analyze_unit(&program, &body);
        assert!(analysis.capture_set(cf).unwrap().captures.is_empty());
    }

    #[test]
    fn test_this_use_marks_outer_instance() {
        let mut b = ProgramBuilder::new();
        let a = b.class("app.A", None);
        let _m = b.method(a, "run", Visibility::Public, SourceType::Unit);
        let cf = b.closure_fn(SourceType::Unit);
        let this = b.this(SourceType::class("app.A"));
        let closure = b.expr(
            ExprKind::Closure {
                decl: cf,
                body: Box::new(this),
            },
            SourceType::class("vesta.Function0"),
        );
        let body = b.block(vec![closure]);
        let program = b.finish();

        let analysis = analyze_unit(&program, &body);
        assert!(analysis.capture_set(cf).unwrap().uses_outer_instance);
    }

    #[test]
    fn test_layout_and_shell() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", int_ty(), true, true);
        let s = b.local(f, "s", SourceType::class(names::STRING), false, false);
        let cf = b.closure_fn(SourceType::Unit);
        let program = b.finish();

        let mapper = TypeMapper::new();
        let mut analysis = UnitAnalysis::default();
        analysis.boxed.insert(x);
        let mut set = CaptureSet::default();
        set.add(x, true);
        set.add(s, false);
        analysis.sets.insert(cf, set);

        let layout = ClosureLayout::build(
            &program,
            &mapper,
            "main$closure$0".to_string(),
            analysis.capture_set(cf).unwrap(),
            &analysis,
            None,
        )
        .unwrap();
        assert!(layout.this_field.is_none());
        assert_eq!(layout.fields.len(), 2);
        assert!(layout.fields[0].boxed);
        assert_eq!(
            layout.fields[0].field.ty,
            rt::cell_type(&TargetType::Prim(PrimKind::Int))
        );
        assert_eq!(
            layout.fields[1].field.ty,
            TargetType::object(names::STRING)
        );

        let mut rec = Recorder::new();
        let ctor = layout.emit_shell(&mut rec).unwrap();
        assert_eq!(ctor.owner, "main$closure$0");
        assert_eq!(ctor.sig.params.len(), 2);
        assert_eq!(rec.fields.len(), 2);
        let init = rec.method("<init>").unwrap();
        // One load/load/store triple per field, then return.
        assert_eq!(init.code.len(), 7);
        assert_eq!(init.code.last(), Some(&Instr::Return(TargetType::Void)));
    }
}
