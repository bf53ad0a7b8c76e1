//! Control-flow lowering: branches, loops, branch tables, faults, and the
//! finally discipline. Every exit edge that leaves a protected region
//! replays the pending finally blocks innermost-first before it jumps.

use super::{ExpressionLowering, LoopFrame};
use crate::error::{CodegenError, CodegenResult};
use crate::sink::{Instr, InvokeKind};
use crate::target::{rt, PrimKind, TargetType};
use crate::value::ValueRef;
use vesta_frontend::{CatchClause, Expr, WhenClause};

impl<'a, 'p> ExpressionLowering<'a, 'p> {
    pub(super) fn gen_if(
        &mut self,
        expr: &Expr,
        cond: &Expr,
        then: &Expr,
        els: Option<&Expr>,
    ) -> CodegenResult<ValueRef> {
        let els = match els {
            Some(els) => els,
            None => {
                // One-armed form is a statement; the then branch's value is
                // discarded.
                let end = self.fresh_label();
                let c = self.gen(cond)?;
                c.emit_branch_if_false(end, self.sink)?;
                self.gen_statement(then)?;
                self.sink.emit(Instr::Mark(end));
                return Ok(ValueRef::None);
            }
        };
        let ty = self.expr_ty(expr)?;
        let else_label = self.fresh_label();
        let end = self.fresh_label();
        let c = self.gen(cond)?;
        c.emit_branch_if_false(else_label, self.sink)?;
        self.gen_to(then, &ty)?;
        self.sink.emit(Instr::Jump(end));
        self.sink.emit(Instr::Mark(else_label));
        self.gen_to(els, &ty)?;
        self.sink.emit(Instr::Mark(end));
        Ok(Self::call_result(ty))
    }

    pub(super) fn gen_while(
        &mut self,
        label: Option<&str>,
        cond: &Expr,
        body: &Expr,
    ) -> CodegenResult<ValueRef> {
        let start = self.fresh_label();
        let end = self.fresh_label();
        self.sink.emit(Instr::Mark(start));
        let c = self.gen(cond)?;
        c.emit_branch_if_false(end, self.sink)?;
        self.loops.push(LoopFrame {
            break_label: end,
            continue_label: start,
            name: label.map(str::to_string),
            finally_depth: self.finallies.len(),
            try_depth: self.open_tries,
        });
        let result = self.gen_statement(body);
        self.loops.pop();
        result?;
        self.sink.emit(Instr::Jump(start));
        self.sink.emit(Instr::Mark(end));
        Ok(ValueRef::None)
    }

    pub(super) fn gen_do_while(
        &mut self,
        label: Option<&str>,
        body: &Expr,
        cond: &Expr,
    ) -> CodegenResult<ValueRef> {
        let start = self.fresh_label();
        let check = self.fresh_label();
        let end = self.fresh_label();
        self.sink.emit(Instr::Mark(start));
        self.loops.push(LoopFrame {
            break_label: end,
            continue_label: check,
            name: label.map(str::to_string),
            finally_depth: self.finallies.len(),
            try_depth: self.open_tries,
        });
        let result = self.gen_statement(body);
        self.loops.pop();
        result?;
        self.sink.emit(Instr::Mark(check));
        self.gen_to(cond, &TargetType::Prim(PrimKind::Bool))?;
        self.sink.emit(Instr::JumpIfTrue(start));
        self.sink.emit(Instr::Mark(end));
        Ok(ValueRef::None)
    }

    fn find_loop(&self, expr: &Expr, label: Option<&str>) -> CodegenResult<usize> {
        let found = match label {
            None => self.loops.len().checked_sub(1),
            Some(name) => self
                .loops
                .iter()
                .rposition(|frame| frame.name.as_deref() == Some(name)),
        };
        found.ok_or(CodegenError::MalformedProgram {
            message: match label {
                None => format!("{} outside a loop", expr.kind_name()),
                Some(name) => format!("{} targets unknown label `{}`", expr.kind_name(), name),
            },
            span: expr.span,
        })
    }

    pub(super) fn gen_break(&mut self, expr: &Expr, label: Option<&str>) -> CodegenResult<ValueRef> {
        let idx = self.find_loop(expr, label)?;
        let depth = self.loops[idx].finally_depth;
        let target = self.loops[idx].break_label;
        self.end_open_tries(self.loops[idx].try_depth);
        self.replay_finallies_from(depth)?;
        self.sink.emit(Instr::Jump(target));
        Ok(ValueRef::None)
    }

    pub(super) fn gen_continue(
        &mut self,
        expr: &Expr,
        label: Option<&str>,
    ) -> CodegenResult<ValueRef> {
        let idx = self.find_loop(expr, label)?;
        let depth = self.loops[idx].finally_depth;
        let target = self.loops[idx].continue_label;
        self.end_open_tries(self.loops[idx].try_depth);
        self.replay_finallies_from(depth)?;
        self.sink.emit(Instr::Jump(target));
        Ok(ValueRef::None)
    }

    pub(super) fn gen_return(&mut self, value: Option<&Expr>) -> CodegenResult<ValueRef> {
        let ret = self
            .mapper
            .map_type(&self.program.function(self.function).ret)?;
        match value {
            Some(value) if ret != TargetType::Void => {
                if self.finallies.is_empty() {
                    self.gen_to(value, &ret)?;
                    self.end_open_tries(0);
                } else {
                    // The return value is computed before the finally blocks
                    // run and parked in a slot across them.
                    let slot = self.scopes.alloc_temp(self.scope, &ret)?;
                    self.gen_to(value, &ret)?;
                    self.sink.emit(Instr::StoreLocal(slot));
                    self.end_open_tries(0);
                    self.replay_finallies_from(0)?;
                    self.sink.emit(Instr::LoadLocal(slot));
                }
            }
            Some(value) => {
                self.gen_statement(value)?;
                self.end_open_tries(0);
                self.replay_finallies_from(0)?;
            }
            None => {
                self.end_open_tries(0);
                self.replay_finallies_from(0)?;
            }
        }
        self.sink.emit(Instr::Return(ret));
        Ok(ValueRef::None)
    }

    /// Deregister every protected region opened above `depth`. Abrupt exits
    /// leave those regions, so their handlers must not stay live past the
    /// jump.
    pub(super) fn end_open_tries(&mut self, depth: usize) {
        for _ in depth..self.open_tries {
            self.sink.emit(Instr::EndTry);
        }
    }

    /// Replay every pending finally block from `depth` outward, as this
    /// exit edge leaves their protected regions. The blocks replayed are
    /// taken off the stack while their code is generated so a jump inside
    /// a finally cannot replay itself.
    pub(super) fn replay_finallies_from(&mut self, depth: usize) -> CodegenResult<()> {
        let tail: Vec<Expr> = self.finallies.split_off(depth);
        let mut result = Ok(());
        for fin in tail.iter().rev() {
            result = self.gen_statement(fin);
            if result.is_err() {
                break;
            }
        }
        self.finallies.extend(tail);
        result
    }

    pub(super) fn gen_when(
        &mut self,
        expr: &Expr,
        subject: Option<&Expr>,
        clauses: &[WhenClause],
        else_body: Option<&Expr>,
    ) -> CodegenResult<ValueRef> {
        let ty = self.expr_ty(expr)?;
        let end = self.fresh_label();

        let subject_slot = match subject {
            Some(s) => {
                let sty = self.expr_ty(s)?;
                let slot = self.scopes.alloc_temp(self.scope, &sty)?;
                self.gen_to(s, &sty)?;
                self.sink.emit(Instr::StoreLocal(slot));
                Some((slot, sty))
            }
            None => None,
        };

        let clause_labels: Vec<_> = clauses.iter().map(|_| self.fresh_label()).collect();
        for (clause, &label) in clauses.iter().zip(&clause_labels) {
            for condition in &clause.conditions {
                match &subject_slot {
                    Some((slot, sty)) => {
                        self.sink.emit(Instr::LoadLocal(*slot));
                        match sty.prim() {
                            Some(kind) => {
                                self.gen_to(condition, sty)?;
                                self.sink.emit(Instr::Cmp {
                                    op: crate::sink::CmpOp::Eq,
                                    kind,
                                });
                            }
                            None => {
                                self.gen_to(condition, &TargetType::any())?;
                                self.sink.emit(Instr::Invoke {
                                    kind: InvokeKind::Virtual,
                                    member: rt::any_equals(),
                                });
                            }
                        }
                    }
                    None => self.gen_to(condition, &TargetType::Prim(PrimKind::Bool))?,
                }
                self.sink.emit(Instr::JumpIfTrue(label));
            }
        }

        match else_body {
            Some(els) => {
                self.gen_to(els, &ty)?;
                self.sink.emit(Instr::Jump(end));
            }
            None => {
                // Exhaustiveness is a runtime obligation: no clause taken
                // raises the dedicated fault.
                self.sink.emit(Instr::New(rt::NO_WHEN_BRANCH.to_string()));
                self.sink.emit(Instr::Dup);
                self.sink.emit(Instr::Invoke {
                    kind: InvokeKind::Special,
                    member: rt::fault_ctor(rt::NO_WHEN_BRANCH),
                });
                self.sink.emit(Instr::Throw);
            }
        }

        for (clause, &label) in clauses.iter().zip(&clause_labels) {
            self.sink.emit(Instr::Mark(label));
            self.gen_to(&clause.body, &ty)?;
            self.sink.emit(Instr::Jump(end));
        }
        self.sink.emit(Instr::Mark(end));
        Ok(Self::call_result(ty))
    }

    pub(super) fn gen_try(
        &mut self,
        expr: &Expr,
        body: &Expr,
        catches: &[CatchClause],
        finally: Option<&Expr>,
    ) -> CodegenResult<ValueRef> {
        let ty = self.expr_ty(expr)?;
        let handler = self.fresh_label();
        let end = self.fresh_label();
        let result_slot = if ty != TargetType::Void {
            Some(self.scopes.alloc_temp(self.scope, &ty)?)
        } else {
            None
        };

        if let Some(fin) = finally {
            self.finallies.push(fin.clone());
        }

        self.sink.emit(Instr::SetupTry { handler });
        self.open_tries += 1;
        self.gen_to(body, &ty)?;
        if let Some(slot) = result_slot {
            self.sink.emit(Instr::StoreLocal(slot));
        }
        self.open_tries -= 1;
        self.sink.emit(Instr::EndTry);
        if finally.is_some() {
            self.replay_finallies_from(self.finallies.len() - 1)?;
        }
        self.sink.emit(Instr::Jump(end));

        // Handler entry: the raised value is on the stack.
        self.sink.emit(Instr::Mark(handler));
        let catch_labels: Vec<_> = catches.iter().map(|_| self.fresh_label()).collect();
        let mut catch_tys = Vec::with_capacity(catches.len());
        for (clause, &label) in catches.iter().zip(&catch_labels) {
            let param_ty = self
                .mapper
                .map_type(&self.program.local(clause.param).ty)?;
            self.sink.emit(Instr::Dup);
            self.sink.emit(Instr::InstanceOf(param_ty.clone()));
            self.sink.emit(Instr::JumpIfTrue(label));
            catch_tys.push(param_ty);
        }
        // No handler matched: run the finally and rethrow.
        if finally.is_some() {
            self.replay_finallies_from(self.finallies.len() - 1)?;
        }
        self.sink.emit(Instr::Throw);

        for ((clause, &label), param_ty) in catches.iter().zip(&catch_labels).zip(&catch_tys) {
            self.sink.emit(Instr::Mark(label));
            self.sink.emit(Instr::CheckCast(param_ty.clone()));
            self.bind_incoming(clause.param)?;
            self.gen_to(&clause.body, &ty)?;
            if let Some(slot) = result_slot {
                self.sink.emit(Instr::StoreLocal(slot));
            }
            if finally.is_some() {
                self.replay_finallies_from(self.finallies.len() - 1)?;
            }
            self.sink.emit(Instr::Jump(end));
        }

        if finally.is_some() {
            self.finallies.pop();
        }
        self.sink.emit(Instr::Mark(end));
        match result_slot {
            Some(slot) => {
                self.sink.emit(Instr::LoadLocal(slot));
                Ok(ValueRef::on_stack(ty))
            }
            None => Ok(ValueRef::None),
        }
    }
}
