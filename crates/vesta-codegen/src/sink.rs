//! Instruction Sink and Member Emission
//!
//! The external collaborators the core talks to: a sink receiving symbolic
//! instructions one at a time, and an emitter receiving synthesized field
//! and method shells. The core never writes a binary container itself. A
//! `Recorder` implementation backs the test suites.

use crate::error::CodegenResult;
use crate::target::{FieldRef, MemberRef, MethodSig, PrimKind, TargetType};
use serde::{Deserialize, Serialize};

/// A branch target within one method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Dispatch kind of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeKind {
    Static,
    Virtual,
    /// Non-virtual instance dispatch (constructors).
    Special,
}

/// Arithmetic operations on primitive operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Comparison operations pushing a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// The symbolic instruction set the core emits.
///
/// Stack effects follow the usual conventions: field stores pop the value
/// then the receiver, element stores pop value, index, array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    LoadLocal(u16),
    StoreLocal(u16),

    PushInt { value: i64, kind: PrimKind },
    PushFloat { value: f64, kind: PrimKind },
    PushBool(bool),
    PushStr(String),
    PushNull,
    /// Load a runtime type descriptor by constant index.
    PushTypeDesc(u16),

    GetStatic(FieldRef),
    PutStatic(FieldRef),
    GetField(FieldRef),
    PutField(FieldRef),

    Invoke { kind: InvokeKind, member: MemberRef },
    New(String),

    NewArray(TargetType),
    LoadElem(TargetType),
    StoreElem(TargetType),
    ArrayLen,

    Dup,
    /// Duplicate the top two single-slot values (array reference + index).
    DupPair,
    Pop,
    Swap,

    Mark(Label),
    Jump(Label),
    JumpIfFalse(Label),
    JumpIfTrue(Label),
    JumpIfNull(Label),
    JumpIfNonNull(Label),

    Box(PrimKind),
    Unbox(PrimKind),
    Convert { from: PrimKind, to: PrimKind },
    CheckCast(TargetType),
    InstanceOf(TargetType),

    Arith { op: ArithOp, kind: PrimKind },
    Cmp { op: CmpOp, kind: PrimKind },
    Neg(PrimKind),
    /// Boolean negation of the top of stack.
    Not,

    /// Register the exception handler for the following protected region.
    SetupTry { handler: Label },
    /// Deregister the innermost exception handler.
    EndTry,

    Throw,
    Return(TargetType),
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instr::LoadLocal(s) => write!(f, "load.local {}", s),
            Instr::StoreLocal(s) => write!(f, "store.local {}", s),
            Instr::PushInt { value, kind } => write!(f, "push.{} {}", kind, value),
            Instr::PushFloat { value, kind } => write!(f, "push.{} {}", kind, value),
            Instr::PushBool(b) => write!(f, "push.bool {}", b),
            Instr::PushStr(s) => write!(f, "push.str {:?}", s),
            Instr::PushNull => write!(f, "push.null"),
            Instr::PushTypeDesc(i) => write!(f, "push.typedesc #{}", i),
            Instr::GetStatic(field) => write!(f, "get.static {}.{}", field.owner, field.name),
            Instr::PutStatic(field) => write!(f, "put.static {}.{}", field.owner, field.name),
            Instr::GetField(field) => write!(f, "get.field {}.{}", field.owner, field.name),
            Instr::PutField(field) => write!(f, "put.field {}.{}", field.owner, field.name),
            Instr::Invoke { kind, member } => {
                let k = match kind {
                    InvokeKind::Static => "static",
                    InvokeKind::Virtual => "virtual",
                    InvokeKind::Special => "special",
                };
                write!(f, "invoke.{} {}.{}{}", k, member.owner, member.name, member.sig)
            }
            Instr::New(name) => write!(f, "new {}", name),
            Instr::NewArray(ty) => write!(f, "new.array {}", ty),
            Instr::LoadElem(ty) => write!(f, "load.elem {}", ty),
            Instr::StoreElem(ty) => write!(f, "store.elem {}", ty),
            Instr::ArrayLen => write!(f, "array.len"),
            Instr::Dup => write!(f, "dup"),
            Instr::DupPair => write!(f, "dup.pair"),
            Instr::Pop => write!(f, "pop"),
            Instr::Swap => write!(f, "swap"),
            Instr::Mark(l) => write!(f, "{}:", l),
            Instr::Jump(l) => write!(f, "jump {}", l),
            Instr::JumpIfFalse(l) => write!(f, "jump.iffalse {}", l),
            Instr::JumpIfTrue(l) => write!(f, "jump.iftrue {}", l),
            Instr::JumpIfNull(l) => write!(f, "jump.ifnull {}", l),
            Instr::JumpIfNonNull(l) => write!(f, "jump.ifnonnull {}", l),
            Instr::Box(k) => write!(f, "box.{}", k),
            Instr::Unbox(k) => write!(f, "unbox.{}", k),
            Instr::Convert { from, to } => write!(f, "convert.{}.{}", from, to),
            Instr::CheckCast(ty) => write!(f, "checkcast {}", ty),
            Instr::InstanceOf(ty) => write!(f, "instanceof {}", ty),
            Instr::Arith { op, kind } => {
                let o = match op {
                    ArithOp::Add => "add",
                    ArithOp::Sub => "sub",
                    ArithOp::Mul => "mul",
                    ArithOp::Div => "div",
                    ArithOp::Rem => "rem",
                };
                write!(f, "{}.{}", o, kind)
            }
            Instr::Cmp { op, kind } => {
                let o = match op {
                    CmpOp::Eq => "eq",
                    CmpOp::Ne => "ne",
                    CmpOp::Lt => "lt",
                    CmpOp::Le => "le",
                    CmpOp::Gt => "gt",
                    CmpOp::Ge => "ge",
                };
                write!(f, "cmp.{}.{}", o, kind)
            }
            Instr::Neg(k) => write!(f, "neg.{}", k),
            Instr::Not => write!(f, "not"),
            Instr::SetupTry { handler } => write!(f, "try.setup {}", handler),
            Instr::EndTry => write!(f, "try.end"),
            Instr::Throw => write!(f, "throw"),
            Instr::Return(ty) => write!(f, "return.{}", ty),
        }
    }
}

/// Receives the instruction stream for one method body.
pub trait InstructionSink {
    /// Append one instruction.
    fn emit(&mut self, instr: Instr);
}

impl InstructionSink for Vec<Instr> {
    fn emit(&mut self, instr: Instr) {
        self.push(instr);
    }
}

/// Member modifier flags.
pub mod flags {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SYNTHETIC: u16 = 0x1000;
}

/// A synthesized field shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub owner: String,
    pub name: String,
    pub ty: TargetType,
    pub flags: u16,
}

/// A synthesized method shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub owner: String,
    pub name: String,
    pub sig: MethodSig,
    pub flags: u16,
}

/// Receives synthesized members (closure classes, bridge accessors) along
/// with their lowered bodies.
pub trait MemberEmitter {
    /// Declare a field.
    fn emit_field(&mut self, field: FieldDef) -> CodegenResult<()>;
    /// Declare a method with its full instruction stream.
    fn emit_method(&mut self, def: MethodDef, code: Vec<Instr>) -> CodegenResult<()>;
}

/// A method captured by the [`Recorder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedMethod {
    pub def: MethodDef,
    pub code: Vec<Instr>,
}

/// Member emitter that records everything, for tests and snapshots.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Recorder {
    pub fields: Vec<FieldDef>,
    pub methods: Vec<EmittedMethod>,
}

impl Recorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// First recorded method with the given name, on any owner.
    pub fn method(&self, name: &str) -> Option<&EmittedMethod> {
        self.methods.iter().find(|m| m.def.name == name)
    }

    /// All recorded methods on the given owner.
    pub fn methods_of(&self, owner: &str) -> Vec<&EmittedMethod> {
        self.methods.iter().filter(|m| m.def.owner == owner).collect()
    }

    /// All recorded fields on the given owner.
    pub fn fields_of(&self, owner: &str) -> Vec<&FieldDef> {
        self.fields.iter().filter(|f| f.owner == owner).collect()
    }
}

impl MemberEmitter for Recorder {
    fn emit_field(&mut self, field: FieldDef) -> CodegenResult<()> {
        self.fields.push(field);
        Ok(())
    }

    fn emit_method(&mut self, def: MethodDef, code: Vec<Instr>) -> CodegenResult<()> {
        self.methods.push(EmittedMethod { def, code });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_sink_appends() {
        let mut code: Vec<Instr> = Vec::new();
        code.emit(Instr::PushBool(true));
        code.emit(Instr::Pop);
        assert_eq!(code, vec![Instr::PushBool(true), Instr::Pop]);
    }

    #[test]
    fn test_instr_display() {
        let i = Instr::Arith {
            op: ArithOp::Add,
            kind: PrimKind::Int,
        };
        assert_eq!(format!("{}", i), "add.int");
        assert_eq!(format!("{}", Instr::Mark(Label(3))), "L3:");
    }

    #[test]
    fn test_instruction_stream_serializes() {
        let code = vec![
            Instr::PushInt {
                value: 1,
                kind: PrimKind::Int,
            },
            Instr::Return(TargetType::Prim(PrimKind::Int)),
        ];
        let json = serde_json::to_string(&code).unwrap();
        let back: Vec<Instr> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn test_recorder_lookup() {
        let mut rec = Recorder::new();
        rec.emit_method(
            MethodDef {
                owner: "app.C".to_string(),
                name: "run".to_string(),
                sig: MethodSig::new(vec![], TargetType::Void),
                flags: flags::PUBLIC,
            },
            vec![Instr::Return(TargetType::Void)],
        )
        .unwrap();
        assert!(rec.method("run").is_some());
        assert_eq!(rec.methods_of("app.C").len(), 1);
    }
}
