//! Vesta Front-End Output Model
//!
//! The data the front end hands to the backend: source types, the typed AST,
//! and the symbol resolution results. The backend treats all of it as
//! read-only. Parsing, name resolution and type inference live in the
//! front end itself and are not part of this crate; the `build` module
//! offers a programmatic way to assemble checked programs, used mainly by
//! the backend test suites.

pub mod ast;
pub mod build;
pub mod symbols;
pub mod types;

pub use ast::{BinOp, CatchClause, Expr, ExprKind, NodeId, Span, UnOp, WhenClause};
pub use build::ProgramBuilder;
pub use symbols::{
    ClassDecl, ClassKind, Decl, DeclId, FnKind, FunctionDecl, LocalDecl, Program, PropertyDecl,
    TypeParamDecl, Visibility,
};
pub use types::{names, SourceType};
