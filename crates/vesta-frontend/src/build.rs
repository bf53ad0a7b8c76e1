//! Programmatic Program Construction
//!
//! A small builder over [`Program`] that hands out node IDs, records
//! expression types and name resolutions, and wires parameters into their
//! callables. The backend test suites use it in place of a real front end.

use crate::ast::{Expr, ExprKind, NodeId, Span};
use crate::symbols::{
    ClassDecl, ClassKind, Decl, DeclId, FnKind, FunctionDecl, LocalDecl, Program, PropertyDecl,
    TypeParamDecl, Visibility,
};
use crate::types::{names, SourceType};

/// Builder for checked programs.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    next_node: u32,
}

impl ProgramBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish building and return the program.
    pub fn finish(self) -> Program {
        self.program
    }

    /// Read access to the program under construction.
    pub fn program(&self) -> &Program {
        &self.program
    }

    fn next_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        id
    }

    // ---- declarations ----

    /// Declare a top-level class.
    pub fn class(&mut self, name: &str, parent: Option<DeclId>) -> DeclId {
        self.program.add_decl(Decl::Class(ClassDecl {
            name: name.to_string(),
            kind: ClassKind::Class,
            parent,
            outer: None,
            is_inner: false,
            type_params: Vec::new(),
        }))
    }

    /// Declare a nested class carrying a reference to its enclosing instance.
    pub fn inner_class(&mut self, name: &str, outer: DeclId) -> DeclId {
        self.program.add_decl(Decl::Class(ClassDecl {
            name: name.to_string(),
            kind: ClassKind::Class,
            parent: None,
            outer: Some(outer),
            is_inner: true,
            type_params: Vec::new(),
        }))
    }

    /// Declare a trait.
    pub fn trait_decl(&mut self, name: &str) -> DeclId {
        self.program.add_decl(Decl::Class(ClassDecl {
            name: name.to_string(),
            kind: ClassKind::Trait,
            parent: None,
            outer: None,
            is_inner: false,
            type_params: Vec::new(),
        }))
    }

    /// Declare a free function.
    pub fn function(&mut self, name: &str, ret: SourceType) -> DeclId {
        self.program.add_decl(Decl::Function(FunctionDecl {
            name: name.to_string(),
            kind: FnKind::Function,
            owner: None,
            visibility: Visibility::Public,
            is_instance: false,
            receiver: None,
            params: Vec::new(),
            type_params: Vec::new(),
            ret,
        }))
    }

    /// Declare an instance method.
    pub fn method(
        &mut self,
        owner: DeclId,
        name: &str,
        visibility: Visibility,
        ret: SourceType,
    ) -> DeclId {
        self.program.add_decl(Decl::Function(FunctionDecl {
            name: name.to_string(),
            kind: FnKind::Method,
            owner: Some(owner),
            visibility,
            is_instance: true,
            receiver: None,
            params: Vec::new(),
            type_params: Vec::new(),
            ret,
        }))
    }

    /// Declare a constructor.
    pub fn constructor(&mut self, owner: DeclId) -> DeclId {
        self.program.add_decl(Decl::Function(FunctionDecl {
            name: "<init>".to_string(),
            kind: FnKind::Constructor,
            owner: Some(owner),
            visibility: Visibility::Public,
            is_instance: true,
            receiver: None,
            params: Vec::new(),
            type_params: Vec::new(),
            ret: SourceType::Unit,
        }))
    }

    /// Declare the synthetic callable behind a closure literal.
    pub fn closure_fn(&mut self, ret: SourceType) -> DeclId {
        self.program.add_decl(Decl::Function(FunctionDecl {
            name: "<closure>".to_string(),
            kind: FnKind::Closure,
            owner: None,
            visibility: Visibility::Public,
            is_instance: true,
            receiver: None,
            params: Vec::new(),
            type_params: Vec::new(),
            ret,
        }))
    }

    /// Declare a value parameter of `func`.
    pub fn param(&mut self, func: DeclId, name: &str, ty: SourceType) -> DeclId {
        let id = self.program.add_decl(Decl::Local(LocalDecl {
            name: name.to_string(),
            owner: func,
            ty,
            mutable: false,
            reassigned: false,
            is_param: true,
        }));
        match self.program.decl_mut(func) {
            Decl::Function(f) => f.params.push(id),
            other => panic!("declaration {} is not a function", other.name()),
        }
        id
    }

    /// Add a generic type parameter to a callable.
    pub fn type_param(&mut self, func: DeclId, name: &str, upper: SourceType, reified: bool) {
        match self.program.decl_mut(func) {
            Decl::Function(f) => f.type_params.push(TypeParamDecl {
                name: name.to_string(),
                upper,
                reified,
            }),
            other => panic!("declaration {} is not a function", other.name()),
        }
    }

    /// Declare a body-level local of `func`.
    pub fn local(
        &mut self,
        func: DeclId,
        name: &str,
        ty: SourceType,
        mutable: bool,
        reassigned: bool,
    ) -> DeclId {
        self.program.add_decl(Decl::Local(LocalDecl {
            name: name.to_string(),
            owner: func,
            ty,
            mutable,
            reassigned,
            is_param: false,
        }))
    }

    /// Declare a property with an implicit backing field.
    pub fn property(
        &mut self,
        owner: Option<DeclId>,
        name: &str,
        ty: SourceType,
        visibility: Visibility,
        mutable: bool,
    ) -> DeclId {
        self.program.add_decl(Decl::Property(PropertyDecl {
            name: name.to_string(),
            owner,
            visibility,
            ty,
            mutable,
            has_getter: false,
            has_setter: false,
        }))
    }

    /// Record the body of a callable.
    pub fn set_body(&mut self, func: DeclId, body: Expr) {
        self.program.bodies.insert(func, body);
    }

    // ---- expressions ----

    /// Create an expression node with a fresh ID and the given recorded type.
    pub fn expr(&mut self, kind: ExprKind, ty: SourceType) -> Expr {
        let id = self.next_id();
        self.program.expr_types.insert(id, ty);
        Expr::new(id, kind, Span::default())
    }

    /// Create a name node resolving to `decl`.
    pub fn name(&mut self, decl: DeclId, ty: SourceType) -> Expr {
        let expr = self.expr(ExprKind::Name, ty);
        self.program.resolutions.insert(expr.id, decl);
        expr
    }

    /// Create a `this` node of the given class type.
    pub fn this(&mut self, ty: SourceType) -> Expr {
        self.expr(ExprKind::This, ty)
    }

    /// Create an `vesta.Int` literal.
    pub fn int(&mut self, value: i64) -> Expr {
        self.expr(ExprKind::IntLit(value), SourceType::class(names::INT))
    }

    /// Create a `vesta.Boolean` literal.
    pub fn bool(&mut self, value: bool) -> Expr {
        self.expr(ExprKind::BoolLit(value), SourceType::class(names::BOOLEAN))
    }

    /// Create a `vesta.String` literal.
    pub fn str(&mut self, value: &str) -> Expr {
        self.expr(
            ExprKind::StrLit(value.to_string()),
            SourceType::class(names::STRING),
        )
    }

    /// Create a unit literal.
    pub fn unit(&mut self) -> Expr {
        self.expr(ExprKind::UnitLit, SourceType::Unit)
    }

    /// Create a block; its type is the last expression's type or unit.
    pub fn block(&mut self, exprs: Vec<Expr>) -> Expr {
        let ty = exprs
            .last()
            .and_then(|e| self.program.expr_type(e.id).cloned())
            .unwrap_or(SourceType::Unit);
        self.expr(ExprKind::Block(exprs), ty)
    }

    /// Create a `Let` node for an already-declared local.
    pub fn let_(&mut self, decl: DeclId, init: Expr) -> Expr {
        self.expr(
            ExprKind::Let {
                decl,
                init: Some(Box::new(init)),
            },
            SourceType::Unit,
        )
    }

    /// Create an assignment node.
    pub fn assign(&mut self, target: Expr, value: Expr) -> Expr {
        self.expr(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            SourceType::Unit,
        )
    }
}
