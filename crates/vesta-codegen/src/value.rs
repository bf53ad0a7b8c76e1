//! Deferred Values
//!
//! A [`ValueRef`] describes where a value lives without materializing it:
//! a local slot, a field behind a receiver, an array element, a property
//! behind accessors, a shared-box cell. The lowering walker produces refs,
//! decides when to load or store through them, and coerces between target
//! types at the boundary. Receivers are emitted exactly once per access;
//! compound assignment duplicates them instead of re-evaluating.

use crate::error::{CodegenError, CodegenResult};
use crate::sink::{Instr, InstructionSink, InvokeKind, Label};
use crate::target::{boxed_name, rt, FieldRef, MemberRef, PrimKind, TargetType};

/// A compile-time constant value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Null,
    Unit,
}

/// A value that has not been materialized on the operand stack yet.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef {
    /// No value; statements and `Unit`-typed constructs produce this.
    None,
    /// Already sitting on top of the stack.
    OnStack { ty: TargetType },
    /// A constant, loadable without side effects.
    Constant { value: ConstValue, ty: TargetType },
    /// A local variable slot.
    Local { slot: u16, ty: TargetType },
    /// A static field.
    StaticField(FieldRef),
    /// An instance field; the receiver is emitted separately.
    InstanceField(FieldRef),
    /// A property accessed through accessor methods.
    Property {
        getter: Option<MemberRef>,
        setter: Option<MemberRef>,
        invoke: InvokeKind,
        is_instance: bool,
        ty: TargetType,
    },
    /// An array element; receiver is the array reference plus the index.
    ArrayElement { elem: TargetType },
    /// A shared-box cell held in a local slot; loads and stores go through
    /// the cell's `element` field.
    SharedBox { slot: u16, inner: TargetType },
    /// The `element` field of a cell whose reference some prefix already
    /// puts on the stack.
    BoxedElement { inner: TargetType },
    /// An arbitrary recorded instruction sequence producing the value.
    Computed { code: Vec<Instr>, ty: TargetType },
    /// A receiver-producing prefix composed with a member suffix. The
    /// prefix is loaded once; the suffix reads or writes through it.
    Composed {
        prefix: Box<ValueRef>,
        suffix: Box<ValueRef>,
    },
}

impl ValueRef {
    /// A value already on the stack.
    pub fn on_stack(ty: TargetType) -> Self {
        ValueRef::OnStack { ty }
    }

    /// A constant of the given target type.
    pub fn constant(value: ConstValue, ty: TargetType) -> Self {
        ValueRef::Constant { value, ty }
    }

    /// A local slot.
    pub fn local(slot: u16, ty: TargetType) -> Self {
        ValueRef::Local { slot, ty }
    }

    /// Compose a receiver prefix with a member suffix.
    pub fn composed(prefix: ValueRef, suffix: ValueRef) -> Self {
        ValueRef::Composed {
            prefix: Box::new(prefix),
            suffix: Box::new(suffix),
        }
    }

    /// The natural target type of the referenced value.
    pub fn ty(&self) -> TargetType {
        match self {
            ValueRef::None => TargetType::Void,
            ValueRef::OnStack { ty } => ty.clone(),
            ValueRef::Constant { ty, .. } => ty.clone(),
            ValueRef::Local { ty, .. } => ty.clone(),
            ValueRef::StaticField(field) => field.ty.clone(),
            ValueRef::InstanceField(field) => field.ty.clone(),
            ValueRef::Property { ty, .. } => ty.clone(),
            ValueRef::ArrayElement { elem } => elem.clone(),
            ValueRef::SharedBox { inner, .. } => inner.clone(),
            ValueRef::BoxedElement { inner } => inner.clone(),
            ValueRef::Computed { ty, .. } => ty.clone(),
            ValueRef::Composed { suffix, .. } => suffix.ty(),
        }
    }

    /// Stack slots the receiver of this value occupies once emitted.
    pub fn receiver_slots(&self) -> u8 {
        match self {
            ValueRef::InstanceField(_) => 1,
            ValueRef::Property { is_instance, .. } => {
                if *is_instance {
                    1
                } else {
                    0
                }
            }
            ValueRef::ArrayElement { .. } => 2,
            ValueRef::SharedBox { .. } => 1,
            ValueRef::BoxedElement { .. } => 1,
            ValueRef::Composed { suffix, .. } => suffix.receiver_slots(),
            _ => 0,
        }
    }

    /// Emit the receiver this value reads and writes through, if it owns
    /// one. Field and element refs produced by the walker have their
    /// receivers emitted at creation, so only self-contained forms emit
    /// anything here.
    pub fn emit_receiver(&self, sink: &mut dyn InstructionSink) -> CodegenResult<()> {
        match self {
            ValueRef::SharedBox { slot, .. } => {
                sink.emit(Instr::LoadLocal(*slot));
                Ok(())
            }
            ValueRef::Composed { prefix, .. } => {
                let ty = prefix.ty();
                prefix.emit_load(&ty, sink)
            }
            _ => Ok(()),
        }
    }

    /// Duplicate the already-emitted receiver for a read-modify-write.
    pub fn dup_receiver(&self, sink: &mut dyn InstructionSink) {
        match self.receiver_slots() {
            0 => {}
            1 => sink.emit(Instr::Dup),
            _ => sink.emit(Instr::DupPair),
        }
    }

    /// Load the value assuming its receiver (if any) is already on the
    /// stack, coercing to `target`.
    pub(crate) fn emit_load_raw(
        &self,
        target: &TargetType,
        sink: &mut dyn InstructionSink,
    ) -> CodegenResult<()> {
        match self {
            ValueRef::None => {}
            ValueRef::OnStack { .. } => {}
            ValueRef::Constant { value, ty } => emit_const(value, ty, sink),
            ValueRef::Local { slot, .. } => sink.emit(Instr::LoadLocal(*slot)),
            ValueRef::StaticField(field) => sink.emit(Instr::GetStatic(field.clone())),
            ValueRef::InstanceField(field) => sink.emit(Instr::GetField(field.clone())),
            ValueRef::Property { getter, invoke, .. } => {
                let getter = getter.clone().ok_or_else(|| {
                    CodegenError::internal("load through a property with no getter")
                })?;
                sink.emit(Instr::Invoke {
                    kind: *invoke,
                    member: getter,
                });
            }
            ValueRef::ArrayElement { elem } => sink.emit(Instr::LoadElem(elem.clone())),
            ValueRef::SharedBox { inner, .. } | ValueRef::BoxedElement { inner } => {
                sink.emit(Instr::GetField(rt::cell_element(inner)));
                if let TargetType::Object(_) | TargetType::Array(_) = inner {
                    if *inner != TargetType::any() {
                        sink.emit(Instr::CheckCast(inner.clone()));
                    }
                }
            }
            ValueRef::Computed { code, .. } => {
                for instr in code {
                    sink.emit(instr.clone());
                }
            }
            ValueRef::Composed { suffix, .. } => {
                let ty = suffix.ty();
                suffix.emit_load_raw(&ty, sink)?;
            }
        }
        coerce(&self.ty(), target, sink);
        Ok(())
    }

    /// Materialize the value on the stack, coerced to `target`.
    pub fn emit_load(
        &self,
        target: &TargetType,
        sink: &mut dyn InstructionSink,
    ) -> CodegenResult<()> {
        self.emit_receiver(sink)?;
        self.emit_load_raw(target, sink)
    }

    /// Store the top of stack into the referenced location. The receiver
    /// (if any) must already sit below the value.
    pub fn emit_store(&self, sink: &mut dyn InstructionSink) -> CodegenResult<()> {
        match self {
            ValueRef::Local { slot, .. } => sink.emit(Instr::StoreLocal(*slot)),
            ValueRef::StaticField(field) => sink.emit(Instr::PutStatic(field.clone())),
            ValueRef::InstanceField(field) => sink.emit(Instr::PutField(field.clone())),
            ValueRef::Property { setter, invoke, .. } => {
                let setter = setter.clone().ok_or_else(|| {
                    CodegenError::internal("store through a property with no setter")
                })?;
                sink.emit(Instr::Invoke {
                    kind: *invoke,
                    member: setter,
                });
            }
            ValueRef::ArrayElement { elem } => sink.emit(Instr::StoreElem(elem.clone())),
            ValueRef::SharedBox { inner, .. } | ValueRef::BoxedElement { inner } => {
                if !matches!(inner, TargetType::Prim(_)) {
                    coerce(inner, &TargetType::any(), sink);
                }
                sink.emit(Instr::PutField(rt::cell_element(inner)));
            }
            ValueRef::Composed { suffix, .. } => suffix.emit_store(sink)?,
            other => {
                return Err(CodegenError::internal(format!(
                    "store into a non-assignable value ({:?})",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Load as a boolean condition and jump to `target` when false.
    pub fn emit_branch_if_false(
        &self,
        target: Label,
        sink: &mut dyn InstructionSink,
    ) -> CodegenResult<()> {
        self.emit_load(&TargetType::Prim(PrimKind::Bool), sink)?;
        sink.emit(Instr::JumpIfFalse(target));
        Ok(())
    }
}

fn emit_const(value: &ConstValue, ty: &TargetType, sink: &mut dyn InstructionSink) {
    match value {
        ConstValue::Int(v) => sink.emit(Instr::PushInt {
            value: *v,
            kind: ty.prim().unwrap_or(PrimKind::Int),
        }),
        ConstValue::Float(v) => sink.emit(Instr::PushFloat {
            value: *v,
            kind: ty.prim().unwrap_or(PrimKind::Double),
        }),
        ConstValue::Bool(v) => sink.emit(Instr::PushBool(*v)),
        ConstValue::Char(c) => sink.emit(Instr::PushInt {
            value: *c as i64,
            kind: PrimKind::Char,
        }),
        ConstValue::Str(s) => sink.emit(Instr::PushStr(s.clone())),
        ConstValue::Null => sink.emit(Instr::PushNull),
        // The unit value only materializes when coerced into an object
        // position; by itself it occupies no stack slots.
        ConstValue::Unit => {}
    }
}

/// Adapt a value of type `from` on the stack top to type `to`.
///
/// Covers discard (`to` void), materialization of void into a default
/// value, primitive conversions, boxing and unboxing, and reference
/// narrowing. Equal types are a no-op.
pub fn coerce(from: &TargetType, to: &TargetType, sink: &mut dyn InstructionSink) {
    if from == to {
        return;
    }
    match (from, to) {
        (_, TargetType::Void) => {
            for _ in 0..from.slots() {
                sink.emit(Instr::Pop);
            }
        }
        (TargetType::Void, TargetType::Prim(k)) => match k {
            PrimKind::Float | PrimKind::Double => sink.emit(Instr::PushFloat {
                value: 0.0,
                kind: *k,
            }),
            PrimKind::Bool => sink.emit(Instr::PushBool(false)),
            _ => sink.emit(Instr::PushInt { value: 0, kind: *k }),
        },
        (TargetType::Void, _) => {
            sink.emit(Instr::GetStatic(rt::unit_instance()));
            if *to != TargetType::object(vesta_frontend::names::UNIT) && *to != TargetType::any() {
                sink.emit(Instr::CheckCast(to.clone()));
            }
        }
        (TargetType::Prim(a), TargetType::Prim(b)) => {
            sink.emit(Instr::Convert { from: *a, to: *b })
        }
        (TargetType::Prim(k), _) => {
            sink.emit(Instr::Box(*k));
            let boxed = TargetType::object(boxed_name(*k));
            if *to != boxed && *to != TargetType::any() {
                sink.emit(Instr::CheckCast(to.clone()));
            }
        }
        (_, TargetType::Prim(k)) => {
            let boxed = TargetType::object(boxed_name(*k));
            if *from != boxed {
                sink.emit(Instr::CheckCast(boxed));
            }
            sink.emit(Instr::Unbox(*k));
        }
        _ => {
            if *to != TargetType::any() {
                sink.emit(Instr::CheckCast(to.clone()));
            }
        }
    }
}
