//! Vesta Backend Lowering Core
//!
//! Turns checked programs from `vesta-frontend` into symbolic instruction
//! streams for the Vesta stack machine. The pieces: `target` maps source
//! types onto the erased machine types, `value` defers materialization of
//! values until a consumer picks a type, `scope` resolves declarations
//! through the lexical chain and mints accessor bridges, `closure`
//! analyzes captures and lays out synthesized closure classes, and `expr`
//! walks expression trees into code. `codegen` drives it per callable.
//!
//! The crate emits through the [`InstructionSink`] and [`MemberEmitter`]
//! traits and never touches a binary container itself.

pub mod closure;
pub mod codegen;
pub mod error;
pub mod expr;
pub mod scope;
pub mod sink;
pub mod target;
pub mod value;

pub use closure::{analyze_unit, Capture, CaptureSet, ClosureLayout, UnitAnalysis};
pub use codegen::Lowering;
pub use error::{CodegenError, CodegenResult};
pub use expr::ExpressionLowering;
pub use scope::{AccessorKind, ScopeId, ScopeTree};
pub use sink::{
    flags, ArithOp, CmpOp, EmittedMethod, FieldDef, Instr, InstructionSink, InvokeKind, Label,
    MemberEmitter, MethodDef, Recorder,
};
pub use target::{
    boxed_name, boxed_prim, rt, FieldRef, MemberRef, MethodSig, PrimKind, TargetType, TypeMapper,
};
pub use value::{coerce, ConstValue, ValueRef};
