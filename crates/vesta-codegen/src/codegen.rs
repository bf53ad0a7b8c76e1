//! Unit Lowering Driver
//!
//! Ties the pieces together for one callable at a time: build the scope
//! chain down to the callable, run capture analysis over its body, walk the
//! body through [`ExpressionLowering`], then flush any accessor bridges the
//! walk minted. The driver owns the type mapper for the session.

use crate::closure::analyze_unit;
use crate::error::{CodegenError, CodegenResult};
use crate::expr::ExpressionLowering;
use crate::scope::ScopeTree;
use crate::sink::{flags, Instr, InstructionSink, MemberEmitter, MethodDef};
use crate::target::{rt, TypeMapper};
use vesta_frontend::{Decl, DeclId, FnKind, Program, Visibility};

/// Lowers callables of one checked program.
pub struct Lowering<'p> {
    program: &'p Program,
    mapper: TypeMapper,
}

impl<'p> Lowering<'p> {
    /// Create a lowering session over `program`.
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            mapper: TypeMapper::new(),
        }
    }

    /// The session's type mapper.
    pub fn mapper(&self) -> &TypeMapper {
        &self.mapper
    }

    /// Lower every callable with a recorded body, in declaration order.
    /// Closure callables are skipped here; their bodies lower inline at
    /// the literal that creates them.
    pub fn lower_program(&self, emitter: &mut dyn MemberEmitter) -> CodegenResult<()> {
        for i in 0..self.program.decl_count() {
            let id = DeclId::new(i as u32);
            if let Decl::Function(f) = self.program.decl(id) {
                if f.kind != FnKind::Closure && self.program.body(id).is_some() {
                    self.lower_function(id, emitter)?;
                }
            }
        }
        Ok(())
    }

    /// Lower one callable body and emit the finished method.
    pub fn lower_function(&self, func: DeclId, emitter: &mut dyn MemberEmitter) -> CodegenResult<()> {
        let f = self.program.function(func);
        let body = self.program.body(func).ok_or_else(|| {
            CodegenError::internal(format!("callable `{}` has no recorded body", f.name))
        })?;

        let mut scopes = ScopeTree::new(self.program);
        let mut scope = scopes.enter_root();
        let mut class_chain = Vec::new();
        let mut cur = f.owner;
        while let Some(class) = cur {
            class_chain.push(class);
            cur = self.program.class(class).outer;
        }
        for &class in class_chain.iter().rev() {
            scope = scopes.enter_class(scope, class);
        }
        scope = match f.kind {
            FnKind::Constructor => scopes.enter_constructor(scope, func),
            _ => scopes.enter_method(scope, func),
        };

        let analysis = analyze_unit(self.program, body);
        let ret = self.mapper.map_type(&f.ret)?;
        let mut code: Vec<Instr> = Vec::new();
        {
            let mut lowering = ExpressionLowering::new(
                self.program,
                &self.mapper,
                &mut scopes,
                &analysis,
                scope,
                func,
                &mut code,
                emitter,
            );
            lowering.declare_params(func)?;
            lowering.gen_body(body, &ret)?;
        }
        code.emit(Instr::Return(ret));
        scopes.emit_pending_bridges(emitter)?;

        let owner = match f.owner {
            Some(class) => self.program.class(class).name.clone(),
            None => rt::NAMESPACE_OWNER.to_string(),
        };
        let mut method_flags = match f.visibility {
            Visibility::Public => flags::PUBLIC,
            Visibility::Protected => flags::PROTECTED,
            Visibility::Private => flags::PRIVATE,
        };
        if !f.is_instance {
            method_flags |= flags::STATIC;
        }
        emitter.emit_method(
            MethodDef {
                owner,
                name: f.name.clone(),
                sig: self.mapper.map_signature(self.program, func)?,
                flags: method_flags,
            },
            code,
        )
    }
}
