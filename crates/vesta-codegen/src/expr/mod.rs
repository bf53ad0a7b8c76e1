//! Expression Lowering
//!
//! The tree walker turning checked expressions into instructions. Each
//! `gen_*` produces a [`ValueRef`] describing where the result lives; the
//! caller decides whether to materialize it and at what type. Receivers of
//! assignable places are emitted once and duplicated for read-modify-write,
//! never re-evaluated. Control flow lives in the `control` submodule.

mod control;

use crate::closure::{invoke_member, ClosureInstantiation, ClosureLayout, UnitAnalysis};
use crate::error::{CodegenError, CodegenResult};
use crate::scope::{ScopeId, ScopeTree};
use crate::sink::{flags, Instr, InstructionSink, InvokeKind, Label, MemberEmitter, MethodDef};
use crate::target::{rt, MemberRef, MethodSig, PrimKind, TargetType, TypeMapper};
use crate::value::{ConstValue, ValueRef};
use vesta_frontend::{BinOp, Decl, DeclId, Expr, ExprKind, FnKind, Program, SourceType, UnOp};

/// An active loop during lowering, for `break`/`continue` targeting.
struct LoopFrame {
    break_label: Label,
    continue_label: Label,
    name: Option<String>,
    /// How deep the finally stack was when the loop was entered; exits
    /// replay everything pushed since.
    finally_depth: usize,
    /// How many protected regions were open when the loop was entered;
    /// exits deregister everything opened since.
    try_depth: usize,
}

/// Lowers one callable body.
pub struct ExpressionLowering<'a, 'p> {
    program: &'p Program,
    mapper: &'a TypeMapper,
    scopes: &'a mut ScopeTree<'p>,
    analysis: &'a UnitAnalysis,
    scope: ScopeId,
    function: DeclId,
    sink: &'a mut dyn InstructionSink,
    emitter: &'a mut dyn MemberEmitter,
    next_label: u32,
    loops: Vec<LoopFrame>,
    finallies: Vec<Expr>,
    open_tries: usize,
}

impl<'a, 'p> ExpressionLowering<'a, 'p> {
    /// Create a walker for the body of `function`, already positioned at
    /// its callable scope.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'p Program,
        mapper: &'a TypeMapper,
        scopes: &'a mut ScopeTree<'p>,
        analysis: &'a UnitAnalysis,
        scope: ScopeId,
        function: DeclId,
        sink: &'a mut dyn InstructionSink,
        emitter: &'a mut dyn MemberEmitter,
    ) -> Self {
        Self {
            program,
            mapper,
            scopes,
            analysis,
            scope,
            function,
            sink,
            emitter,
            next_label: 0,
            loops: Vec::new(),
            finallies: Vec::new(),
            open_tries: 0,
        }
    }

    fn fresh_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    fn owner_name(&self) -> String {
        self.program.function(self.function).name.clone()
    }

    fn expr_ty(&self, expr: &Expr) -> CodegenResult<TargetType> {
        let ty = self
            .program
            .expr_type(expr.id)
            .ok_or(CodegenError::MalformedProgram {
                message: format!("{} has no recorded type", expr.kind_name()),
                span: expr.span,
            })?;
        self.mapper.map_type(ty)
    }

    fn unsupported(&self, expr: &Expr) -> CodegenError {
        CodegenError::UnsupportedConstruct {
            construct: expr.kind_name().to_string(),
            owner: self.owner_name(),
            span: expr.span,
        }
    }

    fn resolved(&self, expr: &Expr) -> CodegenResult<DeclId> {
        self.program
            .resolution(expr.id)
            .ok_or(CodegenError::UnresolvedReference {
                name: expr.kind_name().to_string(),
                owner: self.owner_name(),
                span: expr.span,
            })
    }

    fn find_class(&self, name: &str) -> Option<DeclId> {
        (0..self.program.decl_count()).map(|i| DeclId::new(i as u32)).find(|&id| {
            matches!(self.program.decl(id), Decl::Class(c) if c.name == name)
        })
    }

    /// Bind the value parameters of `func` to their slots, rebinding any
    /// captured-and-reassigned parameter into a fresh shared-box cell.
    pub fn declare_params(&mut self, func: DeclId) -> CodegenResult<()> {
        let f = self.program.function(func);
        let params = f.params.clone();
        let mut incoming = Vec::with_capacity(params.len());
        for &p in &params {
            let ty = self.mapper.map_type(&self.program.local(p).ty)?;
            let boxed = self.analysis.is_boxed(p);
            let slot = if boxed {
                // The incoming slot keeps the raw value; the binding moves
                // into a cell below.
                self.scopes.alloc_temp(self.scope, &ty)?
            } else {
                self.scopes.declare_local(self.scope, p, ty.clone(), false)?
            };
            incoming.push((p, ty, boxed, slot));
        }
        for (p, ty, boxed, slot) in incoming {
            if !boxed {
                continue;
            }
            let cell_slot = self.scopes.declare_local(self.scope, p, ty.clone(), true)?;
            self.emit_cell_prologue(&ty, slot, cell_slot);
        }
        Ok(())
    }

    fn emit_cell_prologue(&mut self, inner: &TargetType, value_slot: u16, cell_slot: u16) {
        let cell = rt::cell_type(inner);
        self.sink.emit(Instr::New(match &cell {
            TargetType::Object(name) => name.clone(),
            _ => String::new(),
        }));
        self.sink.emit(Instr::Dup);
        self.sink.emit(Instr::Invoke {
            kind: InvokeKind::Special,
            member: rt::cell_ctor(inner),
        });
        self.sink.emit(Instr::Dup);
        self.sink.emit(Instr::LoadLocal(value_slot));
        if !matches!(inner, TargetType::Prim(_)) {
            crate::value::coerce(inner, &TargetType::any(), self.sink);
        }
        self.sink.emit(Instr::PutField(rt::cell_element(inner)));
        self.sink.emit(Instr::StoreLocal(cell_slot));
    }

    /// Bind an incoming value on the stack top (a catch parameter) to its
    /// declaration.
    fn bind_incoming(&mut self, decl: DeclId) -> CodegenResult<()> {
        let ty = self.mapper.map_type(&self.program.local(decl).ty)?;
        if self.analysis.is_boxed(decl) {
            let value_slot = self.scopes.alloc_temp(self.scope, &ty)?;
            self.sink.emit(Instr::StoreLocal(value_slot));
            let cell_slot = self.scopes.declare_local(self.scope, decl, ty.clone(), true)?;
            self.emit_cell_prologue(&ty, value_slot, cell_slot);
        } else {
            let slot = self.scopes.declare_local(self.scope, decl, ty, false)?;
            self.sink.emit(Instr::StoreLocal(slot));
        }
        Ok(())
    }

    /// Lower `expr` and materialize the result as `target`.
    pub fn gen_to(&mut self, expr: &Expr, target: &TargetType) -> CodegenResult<()> {
        let value = self.gen(expr)?;
        value.emit_load(target, self.sink)
    }

    /// Lower a callable body whose value becomes the return value. A body
    /// that never falls through (its type is the bottom type) is lowered
    /// for effect; no default value is conjured after it.
    pub fn gen_body(&mut self, body: &Expr, ret: &TargetType) -> CodegenResult<()> {
        match self.program.expr_type(body.id) {
            Some(SourceType::Never { nullable: false }) => self.gen_statement(body),
            _ => self.gen_to(body, ret),
        }
    }

    /// Lower `expr` for effect only.
    fn gen_statement(&mut self, expr: &Expr) -> CodegenResult<()> {
        self.gen_to(expr, &TargetType::Void)
    }

    /// Lower one expression, returning where its value lives.
    pub fn gen(&mut self, expr: &Expr) -> CodegenResult<ValueRef> {
        match &expr.kind {
            ExprKind::IntLit(v) => {
                Ok(ValueRef::constant(ConstValue::Int(*v), self.expr_ty(expr)?))
            }
            ExprKind::FloatLit(v) => {
                Ok(ValueRef::constant(ConstValue::Float(*v), self.expr_ty(expr)?))
            }
            ExprKind::BoolLit(v) => Ok(ValueRef::constant(
                ConstValue::Bool(*v),
                TargetType::Prim(PrimKind::Bool),
            )),
            ExprKind::CharLit(c) => Ok(ValueRef::constant(
                ConstValue::Char(*c),
                TargetType::Prim(PrimKind::Char),
            )),
            ExprKind::StrLit(s) => Ok(ValueRef::constant(
                ConstValue::Str(s.clone()),
                self.expr_ty(expr)?,
            )),
            ExprKind::NullLit => Ok(ValueRef::constant(ConstValue::Null, self.expr_ty(expr)?)),
            ExprKind::UnitLit => Ok(ValueRef::None),

            ExprKind::Name => self.gen_name(expr),
            ExprKind::This => {
                let target = self
                    .program
                    .expr_type(expr.id)
                    .and_then(|t| t.class_name())
                    .and_then(|n| self.find_class(n));
                self.scopes.outer_instance(self.scope, target)
            }

            ExprKind::Block(exprs) => {
                let (last, init) = match exprs.split_last() {
                    Some(split) => split,
                    None => return Ok(ValueRef::None),
                };
                for e in init {
                    self.gen_statement(e)?;
                }
                self.gen(last)
            }
            ExprKind::Let { decl, init } => self.gen_let(*decl, init.as_deref()),

            ExprKind::Assign { target, value } => {
                let place = self.gen_lvalue(target)?;
                place.emit_receiver(self.sink)?;
                self.gen_to(value, &place.ty())?;
                place.emit_store(self.sink)?;
                Ok(ValueRef::None)
            }
            ExprKind::Compound { op, target, value } => self.gen_compound(*op, target, value),

            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(expr, *op, lhs, rhs),
            ExprKind::Unary { op, operand } => self.gen_unary(expr, *op, operand),

            ExprKind::Call {
                callee,
                receiver,
                args,
                type_args,
            } => self.gen_call(expr, *callee, receiver.as_deref(), args, type_args),
            ExprKind::Member { receiver, member } => {
                self.gen_member(expr, receiver.as_deref(), *member)
            }
            ExprKind::Index { array, index } => self.gen_index(array, index),
            ExprKind::ArrayLit { elem_ty, elems } => self.gen_array_lit(elem_ty, elems),
            ExprKind::TupleLit(elems) => self.gen_tuple_lit(elems),

            ExprKind::If { cond, then, els } => self.gen_if(expr, cond, then, els.as_deref()),
            ExprKind::While { label, cond, body } => self.gen_while(label.as_deref(), cond, body),
            ExprKind::DoWhile { label, body, cond } => {
                self.gen_do_while(label.as_deref(), body, cond)
            }
            ExprKind::Break { label } => self.gen_break(expr, label.as_deref()),
            ExprKind::Continue { label } => self.gen_continue(expr, label.as_deref()),
            ExprKind::When {
                subject,
                clauses,
                else_body,
            } => self.gen_when(expr, subject.as_deref(), clauses, else_body.as_deref()),
            ExprKind::Try {
                body,
                catches,
                finally,
            } => self.gen_try(expr, body, catches, finally.as_deref()),
            ExprKind::Return { value } => self.gen_return(value.as_deref()),
            ExprKind::Throw(operand) => {
                let ty = self.expr_ty(operand)?;
                self.gen_to(operand, &ty)?;
                self.sink.emit(Instr::Throw);
                Ok(ValueRef::None)
            }

            ExprKind::NotNull(operand) => self.gen_not_null(operand),
            ExprKind::TypeTest {
                operand,
                ty,
                negated,
            } => self.gen_type_test(operand, ty, *negated),
            ExprKind::Cast { operand, ty } => self.gen_cast(operand, ty),

            ExprKind::Closure { decl, body } => self.gen_closure_value(*decl, body),
        }
    }

    fn gen_name(&mut self, expr: &Expr) -> CodegenResult<ValueRef> {
        let decl = self.resolved(expr)?;
        match self.program.decl(decl) {
            Decl::Local(local) => {
                self.scopes
                    .resolve(self.scope, decl)?
                    .ok_or_else(|| CodegenError::UnresolvedReference {
                        name: local.name.clone(),
                        owner: self.owner_name(),
                        span: expr.span,
                    })
            }
            Decl::Property(p) => {
                let owner = p.owner;
                let suffix = self.scopes.property_suffix(self.scope, decl, self.mapper)?;
                match (&suffix, owner) {
                    (ValueRef::StaticField(_), _) | (_, None) => Ok(suffix),
                    (_, Some(owner)) => {
                        let receiver = self.scopes.outer_instance(self.scope, Some(owner))?;
                        Ok(ValueRef::composed(receiver, suffix))
                    }
                }
            }
            _ => Err(self.unsupported(expr)),
        }
    }

    /// Lower an assignment target into a place ref. Receiver operands are
    /// emitted here, once; stores go through [`ValueRef::emit_store`].
    fn gen_lvalue(&mut self, expr: &Expr) -> CodegenResult<ValueRef> {
        match &expr.kind {
            ExprKind::Name => self.gen_name(expr),
            ExprKind::Member { receiver, member } => {
                self.gen_member(expr, receiver.as_deref(), *member)
            }
            ExprKind::Index { array, index } => self.gen_index(array, index),
            _ => Err(CodegenError::MalformedProgram {
                message: format!("{} is not assignable", expr.kind_name()),
                span: expr.span,
            }),
        }
    }

    fn gen_member(
        &mut self,
        expr: &Expr,
        receiver: Option<&Expr>,
        member: DeclId,
    ) -> CodegenResult<ValueRef> {
        let p = match self.program.decl(member) {
            Decl::Property(p) => p,
            _ => return Err(self.unsupported(expr)),
        };
        if p.owner.is_none() && p.name == "length" {
            if let Some(r) = receiver {
                let array_ty = self.expr_ty(r)?;
                if matches!(array_ty, TargetType::Array(_)) {
                    // Arrays keep their length in the reference itself;
                    // no field or accessor backs it.
                    self.gen_to(r, &array_ty)?;
                    self.sink.emit(Instr::ArrayLen);
                    return Ok(ValueRef::on_stack(TargetType::Prim(PrimKind::Int)));
                }
            }
        }
        let owner = p.owner;
        let suffix = self.scopes.property_suffix(self.scope, member, self.mapper)?;
        if let ValueRef::StaticField(_) = suffix {
            return Ok(suffix);
        }
        let prefix = match (receiver, owner) {
            (Some(r), _) => {
                let ty = self.expr_ty(r)?;
                let value = self.gen(r)?;
                value.emit_load(&ty, self.sink)?;
                ValueRef::on_stack(ty)
            }
            (None, Some(owner)) => self.scopes.outer_instance(self.scope, Some(owner))?,
            (None, None) => return Ok(suffix),
        };
        Ok(ValueRef::composed(prefix, suffix))
    }

    fn gen_index(&mut self, array: &Expr, index: &Expr) -> CodegenResult<ValueRef> {
        let array_ty = self.expr_ty(array)?;
        let elem = match &array_ty {
            TargetType::Array(elem) => (**elem).clone(),
            other => {
                return Err(CodegenError::type_mapping(format!(
                    "indexing a non-array type {}",
                    other
                )))
            }
        };
        self.gen_to(array, &array_ty)?;
        self.gen_to(index, &TargetType::Prim(PrimKind::Int))?;
        Ok(ValueRef::ArrayElement { elem })
    }

    fn gen_let(&mut self, decl: DeclId, init: Option<&Expr>) -> CodegenResult<ValueRef> {
        let ty = self.mapper.map_type(&self.program.local(decl).ty)?;
        let boxed = self.analysis.is_boxed(decl);
        let slot = self.scopes.declare_local(self.scope, decl, ty.clone(), boxed)?;
        if boxed {
            let cell = rt::cell_type(&ty);
            if let TargetType::Object(name) = &cell {
                self.sink.emit(Instr::New(name.clone()));
            }
            self.sink.emit(Instr::Dup);
            self.sink.emit(Instr::Invoke {
                kind: InvokeKind::Special,
                member: rt::cell_ctor(&ty),
            });
            self.sink.emit(Instr::StoreLocal(slot));
            if let Some(init) = init {
                let place = ValueRef::SharedBox { slot, inner: ty };
                place.emit_receiver(self.sink)?;
                self.gen_to(init, &place.ty())?;
                place.emit_store(self.sink)?;
            }
        } else if let Some(init) = init {
            self.gen_to(init, &ty)?;
            self.sink.emit(Instr::StoreLocal(slot));
        }
        Ok(ValueRef::None)
    }

    fn gen_compound(&mut self, op: BinOp, target: &Expr, value: &Expr) -> CodegenResult<ValueRef> {
        let place = self.gen_lvalue(target)?;
        let ty = place.ty();
        place.emit_receiver(self.sink)?;
        place.dup_receiver(self.sink);
        place.emit_load_raw(&ty, self.sink)?;
        if op == BinOp::Add && ty == TargetType::object(vesta_frontend::names::STRING) {
            self.gen_to(value, &ty)?;
            self.sink.emit(Instr::Invoke {
                kind: InvokeKind::Static,
                member: rt::string_concat(),
            });
        } else {
            let kind = ty.prim().ok_or_else(|| {
                CodegenError::type_mapping(format!("compound arithmetic on {}", ty))
            })?;
            self.gen_to(value, &ty)?;
            let arith = arith_op(op).ok_or_else(|| {
                CodegenError::internal("compound assignment with a non-arithmetic operator")
            })?;
            self.sink.emit(Instr::Arith { op: arith, kind });
        }
        place.emit_store(self.sink)?;
        Ok(ValueRef::None)
    }

    fn gen_binary(
        &mut self,
        expr: &Expr,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> CodegenResult<ValueRef> {
        match op {
            BinOp::And | BinOp::Or => return self.gen_short_circuit(op, lhs, rhs),
            _ => {}
        }
        let bool_ty = TargetType::Prim(PrimKind::Bool);
        if op.is_comparison() {
            let operand_ty = self.expr_ty(lhs)?;
            if let Some(kind) = operand_ty.prim() {
                self.gen_to(lhs, &operand_ty)?;
                self.gen_to(rhs, &operand_ty)?;
                let cmp = cmp_op(op)
                    .ok_or_else(|| CodegenError::internal("comparison operator expected"))?;
                self.sink.emit(Instr::Cmp { op: cmp, kind });
                return Ok(ValueRef::on_stack(bool_ty));
            }
            // Reference equality lowers to the universal equals; ordering
            // on references is not a thing this language has.
            match op {
                BinOp::Eq | BinOp::Ne => {
                    self.gen_to(lhs, &TargetType::any())?;
                    self.gen_to(rhs, &TargetType::any())?;
                    self.sink.emit(Instr::Invoke {
                        kind: InvokeKind::Virtual,
                        member: rt::any_equals(),
                    });
                    if op == BinOp::Ne {
                        self.sink.emit(Instr::Not);
                    }
                    return Ok(ValueRef::on_stack(bool_ty));
                }
                _ => return Err(self.unsupported(expr)),
            }
        }
        let result_ty = self.expr_ty(expr)?;
        if op == BinOp::Add && result_ty == TargetType::object(vesta_frontend::names::STRING) {
            self.gen_to(lhs, &result_ty)?;
            self.gen_to(rhs, &result_ty)?;
            self.sink.emit(Instr::Invoke {
                kind: InvokeKind::Static,
                member: rt::string_concat(),
            });
            return Ok(ValueRef::on_stack(result_ty));
        }
        let kind = result_ty
            .prim()
            .ok_or_else(|| CodegenError::type_mapping(format!("arithmetic on {}", result_ty)))?;
        self.gen_to(lhs, &result_ty)?;
        self.gen_to(rhs, &result_ty)?;
        let arith =
            arith_op(op).ok_or_else(|| CodegenError::internal("arithmetic operator expected"))?;
        self.sink.emit(Instr::Arith { op: arith, kind });
        Ok(ValueRef::on_stack(result_ty))
    }

    fn gen_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CodegenResult<ValueRef> {
        let bool_ty = TargetType::Prim(PrimKind::Bool);
        let short = self.fresh_label();
        let end = self.fresh_label();
        self.gen_to(lhs, &bool_ty)?;
        match op {
            BinOp::And => self.sink.emit(Instr::JumpIfFalse(short)),
            _ => self.sink.emit(Instr::JumpIfTrue(short)),
        }
        self.gen_to(rhs, &bool_ty)?;
        self.sink.emit(Instr::Jump(end));
        self.sink.emit(Instr::Mark(short));
        self.sink.emit(Instr::PushBool(op == BinOp::Or));
        self.sink.emit(Instr::Mark(end));
        Ok(ValueRef::on_stack(bool_ty))
    }

    fn gen_unary(&mut self, expr: &Expr, op: UnOp, operand: &Expr) -> CodegenResult<ValueRef> {
        match op {
            UnOp::Not => {
                let bool_ty = TargetType::Prim(PrimKind::Bool);
                self.gen_to(operand, &bool_ty)?;
                self.sink.emit(Instr::Not);
                Ok(ValueRef::on_stack(bool_ty))
            }
            UnOp::Neg => {
                let ty = self.expr_ty(expr)?;
                let kind = ty
                    .prim()
                    .ok_or_else(|| CodegenError::type_mapping(format!("negation on {}", ty)))?;
                self.gen_to(operand, &ty)?;
                self.sink.emit(Instr::Neg(kind));
                Ok(ValueRef::on_stack(ty))
            }
        }
    }

    fn gen_call(
        &mut self,
        expr: &Expr,
        callee: DeclId,
        receiver: Option<&Expr>,
        args: &[Expr],
        type_args: &[SourceType],
    ) -> CodegenResult<ValueRef> {
        let f = self.program.function(callee).clone();
        match f.kind {
            FnKind::Constructor => return self.gen_new(callee, &f, args, type_args),
            FnKind::Closure => {
                let recv = receiver.ok_or_else(|| self.unsupported(expr))?;
                let recv_ty = self.expr_ty(recv)?;
                let class_name = match &recv_ty {
                    TargetType::Object(name) => name.clone(),
                    other => {
                        return Err(CodegenError::type_mapping(format!(
                            "invoking a non-object closure value of type {}",
                            other
                        )))
                    }
                };
                self.gen_to(recv, &recv_ty)?;
                let sig = self.mapper.map_signature(self.program, callee)?;
                self.gen_args(&f.params, &sig.params, args)?;
                let ret = sig.ret.clone();
                let (kind, member) = invoke_member(&class_name, sig);
                self.sink.emit(Instr::Invoke { kind, member });
                return Ok(Self::call_result(ret));
            }
            _ => {}
        }

        let (kind, member) = self.scopes.callable_ref(self.scope, callee, self.mapper)?;
        if f.is_instance {
            match receiver {
                Some(r) => {
                    let ty = TargetType::object(&member.owner);
                    self.gen_to(r, &ty)?;
                }
                None => {
                    let owner = f
                        .owner
                        .ok_or_else(|| CodegenError::internal("instance method without an owner"))?;
                    let this = self.scopes.outer_instance(self.scope, Some(owner))?;
                    this.emit_load(&TargetType::object(&member.owner), self.sink)?;
                }
            }
        } else if let (Some(recv_ty), Some(r)) = (&f.receiver, receiver) {
            // Extension receiver travels as the leading value argument.
            let ty = self.mapper.map_type(recv_ty)?;
            self.gen_to(r, &ty)?;
        }

        // A call bridge carries the receiver as its leading static
        // parameter; value arguments line up after it.
        let bridged = f.is_instance && kind == InvokeKind::Static;
        let skip = usize::from(f.receiver.is_some()) + usize::from(bridged);
        self.gen_args(&f.params, &member.sig.params[skip..], args)?;
        self.gen_type_descs(&f.type_params, type_args);
        let ret = member.sig.ret.clone();
        self.sink.emit(Instr::Invoke { kind, member });
        Ok(Self::call_result(ret))
    }

    fn call_result(ret: TargetType) -> ValueRef {
        if ret == TargetType::Void {
            ValueRef::None
        } else {
            ValueRef::on_stack(ret)
        }
    }

    fn gen_args(
        &mut self,
        params: &[DeclId],
        param_tys: &[TargetType],
        args: &[Expr],
    ) -> CodegenResult<()> {
        if params.len() != args.len() {
            return Err(CodegenError::internal(format!(
                "call arity mismatch: {} parameters, {} arguments",
                params.len(),
                args.len()
            )));
        }
        for (arg, ty) in args.iter().zip(param_tys) {
            self.gen_to(arg, ty)?;
        }
        Ok(())
    }

    fn gen_type_descs(
        &mut self,
        type_params: &[vesta_frontend::TypeParamDecl],
        type_args: &[SourceType],
    ) {
        for (tp, ta) in type_params.iter().zip(type_args) {
            if tp.reified {
                let idx = self.scopes.type_desc_index(ta);
                self.sink.emit(Instr::PushTypeDesc(idx));
            }
        }
    }

    fn gen_new(
        &mut self,
        callee: DeclId,
        f: &vesta_frontend::FunctionDecl,
        args: &[Expr],
        type_args: &[SourceType],
    ) -> CodegenResult<ValueRef> {
        let owner = f
            .owner
            .ok_or_else(|| CodegenError::internal("constructor without an owning class"))?;
        let class = self.program.class(owner).clone();
        let sig = self.mapper.map_signature(self.program, callee)?;
        self.sink.emit(Instr::New(class.name.clone()));
        self.sink.emit(Instr::Dup);
        // Inner classes receive their enclosing instance as a leading
        // synthetic constructor argument.
        let mut params = Vec::with_capacity(sig.params.len() + 1);
        if class.is_inner {
            let outer = class
                .outer
                .ok_or_else(|| CodegenError::internal("inner class without an outer class"))?;
            let outer_ty = TargetType::object(&self.program.class(outer).name);
            let this = self.scopes.outer_instance(self.scope, Some(outer))?;
            this.emit_load(&outer_ty, self.sink)?;
            params.push(outer_ty);
        }
        params.extend(sig.params.iter().cloned());
        self.gen_args(&f.params, &params[usize::from(class.is_inner)..], args)?;
        self.gen_type_descs(&f.type_params, type_args);
        self.sink.emit(Instr::Invoke {
            kind: InvokeKind::Special,
            member: MemberRef::new(&class.name, "<init>", MethodSig::new(params, TargetType::Void)),
        });
        Ok(ValueRef::on_stack(TargetType::object(&class.name)))
    }

    fn gen_array_lit(&mut self, elem_ty: &SourceType, elems: &[Expr]) -> CodegenResult<ValueRef> {
        let array_ty = self.mapper.map_type(&SourceType::array(elem_ty.clone()))?;
        let elem = match &array_ty {
            TargetType::Array(elem) => (**elem).clone(),
            _ => return Err(CodegenError::internal("array literal mapped to a non-array")),
        };
        self.sink.emit(Instr::PushInt {
            value: elems.len() as i64,
            kind: PrimKind::Int,
        });
        self.sink.emit(Instr::NewArray(elem.clone()));
        for (i, e) in elems.iter().enumerate() {
            self.sink.emit(Instr::Dup);
            self.sink.emit(Instr::PushInt {
                value: i as i64,
                kind: PrimKind::Int,
            });
            self.gen_to(e, &elem)?;
            self.sink.emit(Instr::StoreElem(elem.clone()));
        }
        Ok(ValueRef::on_stack(array_ty))
    }

    fn gen_tuple_lit(&mut self, elems: &[Expr]) -> CodegenResult<ValueRef> {
        let name = rt::tuple_name(elems.len());
        self.sink.emit(Instr::New(name.clone()));
        self.sink.emit(Instr::Dup);
        for e in elems {
            self.gen_to(e, &TargetType::any())?;
        }
        let params = vec![TargetType::any(); elems.len()];
        self.sink.emit(Instr::Invoke {
            kind: InvokeKind::Special,
            member: MemberRef::new(&name, "<init>", MethodSig::new(params, TargetType::Void)),
        });
        Ok(ValueRef::on_stack(TargetType::object(&name)))
    }

    fn gen_not_null(&mut self, operand: &Expr) -> CodegenResult<ValueRef> {
        let ty = self.expr_ty(operand)?;
        self.gen_to(operand, &ty)?;
        let ok = self.fresh_label();
        self.sink.emit(Instr::Dup);
        self.sink.emit(Instr::JumpIfNonNull(ok));
        self.sink.emit(Instr::New(rt::NULL_ASSERTION.to_string()));
        self.sink.emit(Instr::Dup);
        self.sink.emit(Instr::Invoke {
            kind: InvokeKind::Special,
            member: rt::fault_ctor(rt::NULL_ASSERTION),
        });
        self.sink.emit(Instr::Throw);
        self.sink.emit(Instr::Mark(ok));
        Ok(ValueRef::on_stack(ty))
    }

    fn gen_type_test(
        &mut self,
        operand: &Expr,
        ty: &SourceType,
        negated: bool,
    ) -> CodegenResult<ValueRef> {
        self.gen_to(operand, &TargetType::any())?;
        let mapped = self.mapper.map_type(ty)?;
        let tested = match mapped.prim() {
            Some(kind) => TargetType::object(crate::target::boxed_name(kind)),
            None => mapped,
        };
        self.sink.emit(Instr::InstanceOf(tested));
        if negated {
            self.sink.emit(Instr::Not);
        }
        Ok(ValueRef::on_stack(TargetType::Prim(PrimKind::Bool)))
    }

    fn gen_cast(&mut self, operand: &Expr, ty: &SourceType) -> CodegenResult<ValueRef> {
        let from = self.expr_ty(operand)?;
        self.gen_to(operand, &from)?;
        let to = self.mapper.map_type(ty)?;
        match &to {
            TargetType::Prim(_) => crate::value::coerce(&from, &to, self.sink),
            _ => {
                if from != to {
                    self.sink.emit(Instr::CheckCast(to.clone()));
                }
            }
        }
        Ok(ValueRef::on_stack(to))
    }

    fn gen_closure_value(&mut self, decl: DeclId, body: &Expr) -> CodegenResult<ValueRef> {
        let inst = self.lower_closure(decl, body)?;
        self.sink.emit(Instr::New(inst.class_name.clone()));
        self.sink.emit(Instr::Dup);
        for (arg, ty) in inst.args.iter().zip(&inst.ctor.sig.params) {
            arg.emit_load(ty, self.sink)?;
        }
        self.sink.emit(Instr::Invoke {
            kind: InvokeKind::Special,
            member: inst.ctor.clone(),
        });
        Ok(ValueRef::on_stack(TargetType::object(&inst.class_name)))
    }

    /// Synthesize the class behind one closure literal and lower its body
    /// into the invoke method. Returns what the instantiation site needs.
    fn lower_closure(&mut self, decl: DeclId, body: &Expr) -> CodegenResult<ClosureInstantiation> {
        let set = self
            .analysis
            .capture_set(decl)
            .ok_or_else(|| CodegenError::internal("closure literal missing from capture analysis"))?
            .clone();

        let hint = self.scopes.closure_hint(self.scope)?;
        let class_name = self.scopes.closure_class_name(&hint);

        let outer_this = if set.uses_outer_instance {
            Some(self.scopes.outer_instance(self.scope, None)?)
        } else {
            None
        };
        let layout = ClosureLayout::build(
            self.program,
            self.mapper,
            class_name.clone(),
            &set,
            self.analysis,
            outer_this.as_ref().map(|t| t.ty()),
        )?;
        let ctor = layout.emit_shell(self.emitter)?;

        // Constructor arguments follow the field layout, which may reorder
        // the captures relative to discovery.
        let mut args = Vec::with_capacity(layout.fields.len() + 1);
        if let Some(this) = outer_this {
            args.push(this);
        }
        for field in &layout.fields {
            args.push(self.scopes.capture_source(self.scope, field.decl)?);
        }

        let sig = self.mapper.map_signature(self.program, decl)?;
        let ret = sig.ret.clone();
        let closure_scope = self.scopes.enter_closure(self.scope, decl, layout);
        let mut code: Vec<Instr> = Vec::new();
        {
            let mut inner = ExpressionLowering::new(
                self.program,
                self.mapper,
                &mut *self.scopes,
                self.analysis,
                closure_scope,
                decl,
                &mut code,
                &mut *self.emitter,
            );
            inner.declare_params(decl)?;
            inner.gen_body(body, &ret)?;
        }
        code.push(Instr::Return(ret));
        self.emitter.emit_method(
            MethodDef {
                owner: class_name.clone(),
                name: "invoke".to_string(),
                sig,
                flags: flags::PUBLIC,
            },
            code,
        )?;

        Ok(ClosureInstantiation {
            class_name,
            ctor,
            args,
        })
    }
}

fn arith_op(op: BinOp) -> Option<crate::sink::ArithOp> {
    use crate::sink::ArithOp;
    match op {
        BinOp::Add => Some(ArithOp::Add),
        BinOp::Sub => Some(ArithOp::Sub),
        BinOp::Mul => Some(ArithOp::Mul),
        BinOp::Div => Some(ArithOp::Div),
        BinOp::Rem => Some(ArithOp::Rem),
        _ => None,
    }
}

fn cmp_op(op: BinOp) -> Option<crate::sink::CmpOp> {
    use crate::sink::CmpOp;
    match op {
        BinOp::Eq => Some(CmpOp::Eq),
        BinOp::Ne => Some(CmpOp::Ne),
        BinOp::Lt => Some(CmpOp::Lt),
        BinOp::Le => Some(CmpOp::Le),
        BinOp::Gt => Some(CmpOp::Gt),
        BinOp::Ge => Some(CmpOp::Ge),
        _ => None,
    }
}
