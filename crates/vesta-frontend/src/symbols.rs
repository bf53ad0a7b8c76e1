//! Symbol Resolution Results
//!
//! Declarations and the maps tying AST nodes to them. The front end builds a
//! `Program` once per compilation session; the backend reads it and never
//! writes.

use crate::ast::{Expr, NodeId};
use crate::types::SourceType;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Identity of a declaration within one checked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeclId(pub u32);

impl DeclId {
    /// Create a new declaration ID.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Declared visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// Class-like declaration kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassKind {
    Class,
    /// Stateless declaration whose default bodies live in a separate
    /// implementation carrier type.
    Trait,
}

/// Callable kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FnKind {
    /// Free function at namespace level.
    Function,
    Method,
    Constructor,
    /// Synthetic callable created for a closure literal.
    Closure,
}

/// A generic type parameter declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeParamDecl {
    pub name: String,
    /// Upper bound; `vesta.Any?` when unconstrained.
    pub upper: SourceType,
    /// Reified parameters receive a runtime type descriptor argument.
    pub reified: bool,
}

/// A class or trait declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDecl {
    /// Fully qualified name.
    pub name: String,
    pub kind: ClassKind,
    /// Superclass, if any.
    pub parent: Option<DeclId>,
    /// Lexically enclosing class, if nested.
    pub outer: Option<DeclId>,
    /// Whether instances carry a reference to the enclosing instance.
    pub is_inner: bool,
    pub type_params: Vec<TypeParamDecl>,
}

/// A callable declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub kind: FnKind,
    /// Owning class for methods and constructors; `None` for free functions
    /// and closures.
    pub owner: Option<DeclId>,
    pub visibility: Visibility,
    /// Whether the callable dispatches on an instance.
    pub is_instance: bool,
    /// Extension receiver type, if the callable is an extension.
    pub receiver: Option<SourceType>,
    /// Value parameters, in order. Each is a `LocalDecl` with `is_param` set.
    pub params: Vec<DeclId>,
    pub type_params: Vec<TypeParamDecl>,
    pub ret: SourceType,
}

/// A property declaration with an implicit backing field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDecl {
    pub name: String,
    /// Owning class; `None` for namespace-level properties.
    pub owner: Option<DeclId>,
    pub visibility: Visibility,
    pub ty: SourceType,
    /// Whether the property is reassignable (`var`).
    pub mutable: bool,
    /// Whether access goes through a declared getter rather than the field.
    pub has_getter: bool,
    /// Whether stores go through a declared setter rather than the field.
    pub has_setter: bool,
}

/// A local variable or parameter declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDecl {
    pub name: String,
    /// Owning callable.
    pub owner: DeclId,
    pub ty: SourceType,
    /// Whether the local is declared reassignable (`var`).
    pub mutable: bool,
    /// Whether the front end observed a reassignment after initialization.
    /// Captured locals with this flag set need shared-box storage.
    pub reassigned: bool,
    /// Whether this is a value parameter rather than a body-level local.
    pub is_param: bool,
}

/// Any declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Decl {
    Class(ClassDecl),
    Function(FunctionDecl),
    Property(PropertyDecl),
    Local(LocalDecl),
}

impl Decl {
    /// The declared simple name.
    pub fn name(&self) -> &str {
        match self {
            Decl::Class(c) => &c.name,
            Decl::Function(f) => &f.name,
            Decl::Property(p) => &p.name,
            Decl::Local(l) => &l.name,
        }
    }
}

/// The checked program: declarations, per-node resolutions and types, and
/// callable bodies.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Program {
    decls: Vec<Decl>,
    /// Name/member node -> declaration it refers to.
    pub resolutions: FxHashMap<NodeId, DeclId>,
    /// Expression node -> inferred source type.
    pub expr_types: FxHashMap<NodeId, SourceType>,
    /// Callable -> body expression. Closure bodies are carried inline in the
    /// AST instead.
    pub bodies: FxHashMap<DeclId, Expr>,
}

impl Program {
    /// Create an empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a declaration, returning its ID.
    pub fn add_decl(&mut self, decl: Decl) -> DeclId {
        let id = DeclId::new(self.decls.len() as u32);
        self.decls.push(decl);
        id
    }

    /// Look up a declaration.
    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.0 as usize]
    }

    pub(crate) fn decl_mut(&mut self, id: DeclId) -> &mut Decl {
        &mut self.decls[id.0 as usize]
    }

    /// Look up a declaration, expecting a class.
    pub fn class(&self, id: DeclId) -> &ClassDecl {
        match self.decl(id) {
            Decl::Class(c) => c,
            other => panic!("declaration {} is not a class", other.name()),
        }
    }

    /// Look up a declaration, expecting a callable.
    pub fn function(&self, id: DeclId) -> &FunctionDecl {
        match self.decl(id) {
            Decl::Function(f) => f,
            other => panic!("declaration {} is not a function", other.name()),
        }
    }

    /// Look up a declaration, expecting a property.
    pub fn property(&self, id: DeclId) -> &PropertyDecl {
        match self.decl(id) {
            Decl::Property(p) => p,
            other => panic!("declaration {} is not a property", other.name()),
        }
    }

    /// Look up a declaration, expecting a local or parameter.
    pub fn local(&self, id: DeclId) -> &LocalDecl {
        match self.decl(id) {
            Decl::Local(l) => l,
            other => panic!("declaration {} is not a local", other.name()),
        }
    }

    /// The declaration a name/member node resolved to.
    pub fn resolution(&self, node: NodeId) -> Option<DeclId> {
        self.resolutions.get(&node).copied()
    }

    /// The inferred type of an expression node.
    pub fn expr_type(&self, node: NodeId) -> Option<&SourceType> {
        self.expr_types.get(&node)
    }

    /// The body of a callable, if one was recorded.
    pub fn body(&self, decl: DeclId) -> Option<&Expr> {
        self.bodies.get(&decl)
    }

    /// Number of declarations.
    pub fn decl_count(&self) -> usize {
        self.decls.len()
    }

    /// Whether `sub` is `sup` or a transitive subclass of it.
    pub fn is_subclass_of(&self, sub: DeclId, sup: DeclId) -> bool {
        let mut cur = Some(sub);
        while let Some(id) = cur {
            if id == sup {
                return true;
            }
            cur = self.class(id).parent;
        }
        false
    }

    /// The non-null class type of a class declaration, with its own type
    /// parameters as arguments left open (erased by the backend anyway).
    pub fn class_type(&self, id: DeclId) -> SourceType {
        SourceType::class(&self.class(id).name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, parent: Option<DeclId>) -> Decl {
        Decl::Class(ClassDecl {
            name: name.to_string(),
            kind: ClassKind::Class,
            parent,
            outer: None,
            is_inner: false,
            type_params: Vec::new(),
        })
    }

    #[test]
    fn test_subclass_chain() {
        let mut program = Program::new();
        let a = program.add_decl(class("A", None));
        let b = program.add_decl(class("B", Some(a)));
        let c = program.add_decl(class("C", Some(b)));
        assert!(program.is_subclass_of(c, a));
        assert!(program.is_subclass_of(b, b));
        assert!(!program.is_subclass_of(a, c));
    }
}
