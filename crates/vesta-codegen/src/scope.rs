//! Scope Contexts
//!
//! Lowering walks declarations through a chain of scope nodes mirroring the
//! lexical nesting of the unit: namespace, classes, callables, closures.
//! The chain answers the two questions the expression walker keeps asking:
//! where does this declaration live relative to here (a [`ValueRef`]), and
//! how do I reach the enclosing instance of some outer class. It also owns
//! the synthetic accessor bridges that private members need once an access
//! crosses a closure boundary, and the per-unit type descriptor table.

use crate::closure::ClosureLayout;
use crate::error::{CodegenError, CodegenResult};
use crate::sink::{flags, Instr, InstructionSink, InvokeKind, MemberEmitter, MethodDef};
use crate::target::{rt, FieldRef, MemberRef, MethodSig, TargetType, TypeMapper};
use crate::value::ValueRef;
use rustc_hash::FxHashMap;
use vesta_frontend::{Decl, DeclId, Program, SourceType, Visibility};

/// Index of a scope node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u32);

impl ScopeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What kind of lexical region a scope node covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Namespace,
    Class,
    Method,
    Constructor,
    Closure,
}

/// A local bound to a slot. `ty` is the declared value type even when the
/// slot actually holds a shared-box cell.
#[derive(Debug, Clone)]
pub struct LocalBinding {
    pub slot: u16,
    pub ty: TargetType,
    pub boxed: bool,
}

/// Slot assignment for the locals of one callable frame.
#[derive(Debug, Default)]
pub struct LocalTable {
    slots: FxHashMap<DeclId, LocalBinding>,
    next_slot: u16,
}

impl LocalTable {
    fn starting_at(first: u16) -> Self {
        Self {
            slots: FxHashMap::default(),
            next_slot: first,
        }
    }

    fn declare(&mut self, decl: DeclId, ty: TargetType, boxed: bool) -> u16 {
        let slot = self.next_slot;
        // A boxed local holds the cell reference, one slot wide.
        self.next_slot += if boxed { 1 } else { u16::from(ty.slots()) };
        self.slots.insert(decl, LocalBinding { slot, ty, boxed });
        slot
    }

    fn temp(&mut self, ty: &TargetType) -> u16 {
        let slot = self.next_slot;
        self.next_slot += u16::from(ty.slots());
        slot
    }

    fn get(&self, decl: DeclId) -> Option<&LocalBinding> {
        self.slots.get(&decl)
    }
}

#[derive(Debug)]
enum ScopePayload {
    None,
    Locals(LocalTable),
    Closure {
        layout: ClosureLayout,
        locals: LocalTable,
    },
}

#[derive(Debug)]
struct ScopeNode {
    decl: Option<DeclId>,
    kind: ScopeKind,
    parent: Option<ScopeId>,
    /// How to step from an instance of this class to its enclosing
    /// instance. Only inner class nodes carry one.
    outer_access: Option<ValueRef>,
    payload: ScopePayload,
}

/// Which face of a member a synthetic bridge exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorKind {
    Get,
    Set,
    Call,
}

#[derive(Debug)]
enum BridgeBody {
    FieldGet(FieldRef),
    FieldSet(FieldRef),
    Call(MemberRef),
}

#[derive(Debug)]
struct BridgeRecord {
    bridge: MemberRef,
    body: BridgeBody,
}

/// The scope chain for one compilation unit.
pub struct ScopeTree<'p> {
    program: &'p Program,
    nodes: Vec<ScopeNode>,
    bridges: FxHashMap<(DeclId, AccessorKind), MemberRef>,
    pending_bridges: Vec<BridgeRecord>,
    type_desc_order: Vec<SourceType>,
    type_desc_slots: FxHashMap<SourceType, u16>,
    next_bridge: u32,
    next_closure: u32,
}

impl<'p> ScopeTree<'p> {
    /// Create an empty tree over `program`.
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            nodes: Vec::new(),
            bridges: FxHashMap::default(),
            pending_bridges: Vec::new(),
            type_desc_order: Vec::new(),
            type_desc_slots: FxHashMap::default(),
            next_bridge: 0,
            next_closure: 0,
        }
    }

    fn push(&mut self, node: ScopeNode) -> ScopeId {
        let id = ScopeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn node(&self, id: ScopeId) -> &ScopeNode {
        &self.nodes[id.index()]
    }

    /// The namespace scope at the root of the chain.
    pub fn enter_root(&mut self) -> ScopeId {
        self.push(ScopeNode {
            decl: None,
            kind: ScopeKind::Namespace,
            parent: None,
            outer_access: None,
            payload: ScopePayload::None,
        })
    }

    /// Enter a class scope. Inner classes record the step to their
    /// enclosing instance.
    pub fn enter_class(&mut self, parent: ScopeId, class: DeclId) -> ScopeId {
        let c = self.program.class(class);
        let outer_access = match (c.is_inner, c.outer) {
            (true, Some(outer)) => {
                let outer_name = &self.program.class(outer).name;
                Some(ValueRef::InstanceField(FieldRef::new(
                    &c.name,
                    "this$0",
                    TargetType::object(outer_name),
                )))
            }
            _ => None,
        };
        self.push(ScopeNode {
            decl: Some(class),
            kind: ScopeKind::Class,
            parent: Some(parent),
            outer_access,
            payload: ScopePayload::None,
        })
    }

    /// Enter a method or free-function scope. Instance callables reserve
    /// slot 0 for the receiver.
    pub fn enter_method(&mut self, parent: ScopeId, func: DeclId) -> ScopeId {
        let first = if self.program.function(func).is_instance {
            1
        } else {
            0
        };
        self.push(ScopeNode {
            decl: Some(func),
            kind: ScopeKind::Method,
            parent: Some(parent),
            outer_access: None,
            payload: ScopePayload::Locals(LocalTable::starting_at(first)),
        })
    }

    /// Enter a constructor scope.
    pub fn enter_constructor(&mut self, parent: ScopeId, func: DeclId) -> ScopeId {
        self.push(ScopeNode {
            decl: Some(func),
            kind: ScopeKind::Constructor,
            parent: Some(parent),
            outer_access: None,
            payload: ScopePayload::Locals(LocalTable::starting_at(1)),
        })
    }

    /// Enter the invoke-method scope of a synthesized closure class. Slot 0
    /// holds the closure instance itself.
    pub fn enter_closure(&mut self, parent: ScopeId, func: DeclId, layout: ClosureLayout) -> ScopeId {
        self.push(ScopeNode {
            decl: Some(func),
            kind: ScopeKind::Closure,
            parent: Some(parent),
            outer_access: None,
            payload: ScopePayload::Closure {
                layout,
                locals: LocalTable::starting_at(1),
            },
        })
    }

    fn locals_mut(&mut self, scope: ScopeId) -> CodegenResult<&mut LocalTable> {
        match &mut self.nodes[scope.index()].payload {
            ScopePayload::Locals(table) => Ok(table),
            ScopePayload::Closure { locals, .. } => Ok(locals),
            ScopePayload::None => Err(CodegenError::internal(
                "local declared outside a callable scope",
            )),
        }
    }

    /// Bind a local declaration to a fresh slot.
    pub fn declare_local(
        &mut self,
        scope: ScopeId,
        decl: DeclId,
        ty: TargetType,
        boxed: bool,
    ) -> CodegenResult<u16> {
        Ok(self.locals_mut(scope)?.declare(decl, ty, boxed))
    }

    /// Reserve an anonymous slot for a lowering temporary.
    pub fn alloc_temp(&mut self, scope: ScopeId, ty: &TargetType) -> CodegenResult<u16> {
        Ok(self.locals_mut(scope)?.temp(ty))
    }

    /// A fresh name for a synthesized closure class of `hint`'s member.
    pub fn closure_class_name(&mut self, hint: &str) -> String {
        let n = self.next_closure;
        self.next_closure += 1;
        format!("{}$closure${}", hint, n)
    }

    /// Name stem for closure classes synthesized while lowering from
    /// `from`: the enclosing member, or the enclosing closure class when
    /// the literal is itself nested inside one.
    pub fn closure_hint(&self, from: ScopeId) -> CodegenResult<String> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            let node = self.node(id);
            match &node.payload {
                ScopePayload::Closure { layout, .. } => return Ok(layout.class_name.clone()),
                ScopePayload::Locals(_) => {
                    let func = node.decl.ok_or_else(|| {
                        CodegenError::internal("callable scope without a declaration")
                    })?;
                    let f = self.program.function(func);
                    return Ok(match f.owner {
                        Some(owner) => {
                            format!("{}${}", self.program.class(owner).name, f.name)
                        }
                        None => format!("{}${}", rt::NAMESPACE_OWNER, f.name),
                    });
                }
                ScopePayload::None => {}
            }
            cur = node.parent;
        }
        Err(CodegenError::internal("closure outside a callable scope"))
    }

    /// Constant-table index of a reified type descriptor, deduplicated per
    /// unit in first-use order.
    pub fn type_desc_index(&mut self, ty: &SourceType) -> u16 {
        if let Some(&idx) = self.type_desc_slots.get(ty) {
            return idx;
        }
        let idx = self.type_desc_order.len() as u16;
        self.type_desc_order.push(ty.clone());
        self.type_desc_slots.insert(ty.clone(), idx);
        idx
    }

    /// The accumulated type descriptor table, in index order.
    pub fn type_desc_table(&self) -> &[SourceType] {
        &self.type_desc_order
    }

    fn local_ref(binding: &LocalBinding) -> ValueRef {
        if binding.boxed {
            ValueRef::SharedBox {
                slot: binding.slot,
                inner: binding.ty.clone(),
            }
        } else {
            ValueRef::local(binding.slot, binding.ty.clone())
        }
    }

    /// Resolve a local declaration visible from `from`.
    ///
    /// Returns `None` for declarations that are not frame-bound (the caller
    /// resolves those statically). Finding a local on the far side of a
    /// closure boundary without a recorded capture is a fatal inconsistency
    /// in the capture analysis, not a fallback path.
    pub fn resolve(&self, from: ScopeId, decl: DeclId) -> CodegenResult<Option<ValueRef>> {
        let mut crossed = false;
        let mut cur = Some(from);
        while let Some(id) = cur {
            let node = self.node(id);
            match &node.payload {
                ScopePayload::Locals(table) => {
                    if let Some(binding) = table.get(decl) {
                        if crossed {
                            return Err(self.missing_capture(decl));
                        }
                        return Ok(Some(Self::local_ref(binding)));
                    }
                }
                ScopePayload::Closure { layout, locals } => {
                    if let Some(binding) = locals.get(decl) {
                        if crossed {
                            return Err(self.missing_capture(decl));
                        }
                        return Ok(Some(Self::local_ref(binding)));
                    }
                    if let Some(field) = layout.field_for(decl) {
                        if crossed {
                            return Err(self.missing_capture(decl));
                        }
                        let closure_ty = TargetType::object(&layout.class_name);
                        let base = ValueRef::composed(
                            ValueRef::local(0, closure_ty),
                            ValueRef::InstanceField(field.field.clone()),
                        );
                        let r = if field.boxed {
                            ValueRef::composed(
                                base,
                                ValueRef::BoxedElement {
                                    inner: field.inner.clone(),
                                },
                            )
                        } else {
                            base
                        };
                        return Ok(Some(r));
                    }
                    crossed = true;
                }
                ScopePayload::None => {}
            }
            cur = node.parent;
        }
        match self.program.decl(decl) {
            Decl::Local(local) => Err(CodegenError::UnresolvedReference {
                name: local.name.clone(),
                owner: self.program.function(local.owner).name.clone(),
                span: Default::default(),
            }),
            _ => Ok(None),
        }
    }

    /// Resolve a capture's source in the enclosing scope for a closure
    /// constructor argument. Boxed locals yield the cell itself, never its
    /// contents, so the closure shares the cell.
    pub fn capture_source(&self, enclosing: ScopeId, decl: DeclId) -> CodegenResult<ValueRef> {
        let mut cur = Some(enclosing);
        while let Some(id) = cur {
            let node = self.node(id);
            match &node.payload {
                ScopePayload::Locals(table) | ScopePayload::Closure { locals: table, .. } => {
                    if let Some(binding) = table.get(decl) {
                        return Ok(if binding.boxed {
                            ValueRef::local(binding.slot, rt::cell_type(&binding.ty))
                        } else {
                            Self::local_ref(binding)
                        });
                    }
                    if let ScopePayload::Closure { layout, .. } = &node.payload {
                        if let Some(field) = layout.field_for(decl) {
                            // Forward the outer closure's field as-is; a
                            // cell stays a cell.
                            let closure_ty = TargetType::object(&layout.class_name);
                            return Ok(ValueRef::composed(
                                ValueRef::local(0, closure_ty),
                                ValueRef::InstanceField(field.field.clone()),
                            ));
                        }
                    }
                }
                ScopePayload::None => {}
            }
            cur = node.parent;
        }
        Err(self.missing_capture(decl))
    }

    fn missing_capture(&self, decl: DeclId) -> CodegenError {
        CodegenError::internal(format!(
            "local `{}` crosses a closure boundary without a recorded capture",
            self.program.decl(decl).name()
        ))
    }

    /// Reach the instance of `target` (or the innermost enclosing class
    /// when `None`) from `from`, stepping through captured and synthesized
    /// enclosing-instance fields as needed.
    pub fn outer_instance(
        &self,
        from: ScopeId,
        target: Option<DeclId>,
    ) -> CodegenResult<ValueRef> {
        let mut base: Option<ValueRef> = None;
        let mut class_scope: Option<ScopeId> = None;
        let mut cur = Some(from);
        while let Some(id) = cur {
            let node = self.node(id);
            match node.kind {
                ScopeKind::Method | ScopeKind::Constructor => {
                    let func = node
                        .decl
                        .ok_or_else(|| CodegenError::internal("callable scope without a declaration"))?;
                    if !self.program.function(func).is_instance {
                        return Err(CodegenError::internal(
                            "no enclosing instance in a static context",
                        ));
                    }
                    let parent = node
                        .parent
                        .ok_or_else(|| CodegenError::internal("method scope without a parent"))?;
                    let class = self.node(parent).decl.ok_or_else(|| {
                        CodegenError::internal("instance method outside a class scope")
                    })?;
                    base = Some(ValueRef::local(
                        0,
                        TargetType::object(&self.program.class(class).name),
                    ));
                    class_scope = Some(parent);
                    break;
                }
                ScopeKind::Closure => {
                    let layout = match &node.payload {
                        ScopePayload::Closure { layout, .. } => layout,
                        _ => {
                            return Err(CodegenError::internal(
                                "closure scope without a capture layout",
                            ))
                        }
                    };
                    let this_field = layout.this_field.clone().ok_or_else(|| {
                        CodegenError::internal(
                            "enclosing instance used but not captured by the closure",
                        )
                    })?;
                    base = Some(ValueRef::composed(
                        ValueRef::local(0, TargetType::object(&layout.class_name)),
                        ValueRef::InstanceField(this_field),
                    ));
                    let mut up = node.parent;
                    while let Some(uid) = up {
                        if self.node(uid).kind == ScopeKind::Class {
                            class_scope = Some(uid);
                            break;
                        }
                        up = self.node(uid).parent;
                    }
                    break;
                }
                _ => {}
            }
            cur = node.parent;
        }
        let mut reached = base
            .ok_or_else(|| CodegenError::internal("no enclosing instance in scope"))?;
        let mut scope = class_scope
            .ok_or_else(|| CodegenError::internal("no enclosing class in scope"))?;
        loop {
            let node = self.node(scope);
            let class = node
                .decl
                .ok_or_else(|| CodegenError::internal("class scope without a declaration"))?;
            let done = match target {
                None => true,
                Some(t) => t == class || self.program.is_subclass_of(class, t),
            };
            if done {
                return Ok(reached);
            }
            let step = node.outer_access.clone().ok_or_else(|| {
                CodegenError::internal("enclosing instance chain exhausted before target class")
            })?;
            reached = ValueRef::composed(reached, step);
            let mut up = node.parent;
            scope = loop {
                match up {
                    Some(uid) if self.node(uid).kind == ScopeKind::Class => break uid,
                    Some(uid) => up = self.node(uid).parent,
                    None => {
                        return Err(CodegenError::internal(
                            "enclosing instance chain exhausted before target class",
                        ))
                    }
                }
            };
        }
    }

    /// Whether reaching `owner`'s class scope from `from` steps through a
    /// closure boundary.
    fn crosses_closure(&self, from: ScopeId, owner: DeclId) -> bool {
        let mut crossed = false;
        let mut cur = Some(from);
        while let Some(id) = cur {
            let node = self.node(id);
            if node.kind == ScopeKind::Class && node.decl == Some(owner) {
                return crossed;
            }
            if node.kind == ScopeKind::Closure {
                crossed = true;
            }
            cur = node.parent;
        }
        crossed
    }

    fn next_bridge_name(&mut self) -> String {
        let n = self.next_bridge;
        self.next_bridge += 1;
        format!("access${}", n)
    }

    fn field_bridge(
        &mut self,
        prop: DeclId,
        kind: AccessorKind,
        owner_name: &str,
        field: FieldRef,
    ) -> MemberRef {
        if let Some(existing) = self.bridges.get(&(prop, kind)) {
            return existing.clone();
        }
        let owner_ty = TargetType::object(owner_name);
        let (sig, body) = match kind {
            AccessorKind::Get => (
                MethodSig::new(vec![owner_ty], field.ty.clone()),
                BridgeBody::FieldGet(field),
            ),
            _ => (
                MethodSig::new(vec![owner_ty, field.ty.clone()], TargetType::Void),
                BridgeBody::FieldSet(field),
            ),
        };
        let bridge = MemberRef::new(owner_name, &self.next_bridge_name(), sig);
        self.bridges.insert((prop, kind), bridge.clone());
        self.pending_bridges.push(BridgeRecord {
            bridge: bridge.clone(),
            body,
        });
        bridge
    }

    /// A ref for accessing property `prop` relative to `from`, without its
    /// receiver. Private properties reached from inside a closure go
    /// through synthetic static accessors on the owning class.
    pub fn property_suffix(
        &mut self,
        from: ScopeId,
        prop: DeclId,
        mapper: &TypeMapper,
    ) -> CodegenResult<ValueRef> {
        let p = self.program.property(prop);
        let ty = mapper.map_type(&p.ty)?;
        let owner = match p.owner {
            None => {
                return Ok(ValueRef::StaticField(FieldRef::new(
                    rt::NAMESPACE_OWNER,
                    &p.name,
                    ty,
                )))
            }
            Some(owner) => owner,
        };
        let owner_name = self.program.class(owner).name.clone();
        let field = FieldRef::new(&owner_name, &p.name, ty.clone());
        if p.visibility == Visibility::Private && self.crosses_closure(from, owner) {
            let getter = self.field_bridge(prop, AccessorKind::Get, &owner_name, field.clone());
            let setter = if p.mutable {
                Some(self.field_bridge(prop, AccessorKind::Set, &owner_name, field))
            } else {
                None
            };
            return Ok(ValueRef::Property {
                getter: Some(getter),
                setter,
                // The receiver on the stack becomes the bridge's first
                // static argument.
                invoke: InvokeKind::Static,
                is_instance: true,
                ty,
            });
        }
        if p.has_getter || p.has_setter {
            let cap = capitalize(&p.name);
            let getter = MemberRef::new(
                &owner_name,
                &format!("get{}", cap),
                MethodSig::new(Vec::new(), ty.clone()),
            );
            let setter = if p.mutable {
                Some(MemberRef::new(
                    &owner_name,
                    &format!("set{}", cap),
                    MethodSig::new(vec![ty.clone()], TargetType::Void),
                ))
            } else {
                None
            };
            return Ok(ValueRef::Property {
                getter: Some(getter),
                setter,
                invoke: InvokeKind::Virtual,
                is_instance: true,
                ty,
            });
        }
        Ok(ValueRef::InstanceField(field))
    }

    /// The invocation target for calling `func` from `from`. Private
    /// instance methods reached across a closure boundary go through a
    /// synthetic static call bridge.
    pub fn callable_ref(
        &mut self,
        from: ScopeId,
        func: DeclId,
        mapper: &TypeMapper,
    ) -> CodegenResult<(InvokeKind, MemberRef)> {
        let f = self.program.function(func);
        let sig = mapper.map_signature(self.program, func)?;
        let owner = match f.owner {
            None => return Ok((InvokeKind::Static, MemberRef::new(rt::NAMESPACE_OWNER, &f.name, sig))),
            Some(owner) => owner,
        };
        let owner_name = self.program.class(owner).name.clone();
        if !f.is_instance {
            return Ok((InvokeKind::Static, MemberRef::new(&owner_name, &f.name, sig)));
        }
        if f.visibility == Visibility::Private && self.crosses_closure(from, owner) {
            if let Some(existing) = self.bridges.get(&(func, AccessorKind::Call)) {
                return Ok((InvokeKind::Static, existing.clone()));
            }
            let target = MemberRef::new(&owner_name, &f.name, sig.clone());
            let mut params = vec![TargetType::object(&owner_name)];
            params.extend(sig.params.iter().cloned());
            let bridge = MemberRef::new(
                &owner_name,
                &self.next_bridge_name(),
                MethodSig::new(params, sig.ret.clone()),
            );
            self.bridges
                .insert((func, AccessorKind::Call), bridge.clone());
            self.pending_bridges.push(BridgeRecord {
                bridge: bridge.clone(),
                body: BridgeBody::Call(target),
            });
            return Ok((InvokeKind::Static, bridge));
        }
        let kind = if f.visibility == Visibility::Private {
            InvokeKind::Special
        } else {
            InvokeKind::Virtual
        };
        Ok((kind, MemberRef::new(&owner_name, &f.name, sig)))
    }

    /// Emit the bodies of every bridge minted so far. Called once per unit
    /// after all its callables are lowered; each bridge is emitted exactly
    /// once regardless of how many uses requested it.
    pub fn emit_pending_bridges(&mut self, emitter: &mut dyn MemberEmitter) -> CodegenResult<()> {
        for record in std::mem::take(&mut self.pending_bridges) {
            let mut code: Vec<Instr> = Vec::new();
            let mut slot: u16 = 0;
            for param in &record.bridge.sig.params {
                code.emit(Instr::LoadLocal(slot));
                slot += u16::from(param.slots());
            }
            match &record.body {
                BridgeBody::FieldGet(field) => code.emit(Instr::GetField(field.clone())),
                BridgeBody::FieldSet(field) => code.emit(Instr::PutField(field.clone())),
                BridgeBody::Call(target) => code.emit(Instr::Invoke {
                    kind: InvokeKind::Special,
                    member: target.clone(),
                }),
            }
            code.emit(Instr::Return(record.bridge.sig.ret.clone()));
            emitter.emit_method(
                MethodDef {
                    owner: record.bridge.owner.clone(),
                    name: record.bridge.name.clone(),
                    sig: record.bridge.sig.clone(),
                    flags: flags::STATIC | flags::SYNTHETIC,
                },
                code,
            )?;
        }
        Ok(())
    }

    /// Read access to the program the tree was built over.
    pub fn program(&self) -> &'p Program {
        self.program
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::ClosureField;
    use crate::sink::Recorder;
    use crate::target::PrimKind;
    use vesta_frontend::{names, ProgramBuilder, SourceType};

    fn int() -> TargetType {
        TargetType::Prim(PrimKind::Int)
    }

    #[test]
    fn test_local_resolution_and_slots() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", SourceType::class(names::INT), false, false);
        let y = b.local(f, "y", SourceType::class(names::LONG), false, false);
        let z = b.local(f, "z", SourceType::class(names::INT), false, false);
        let program = b.finish();

        let mut tree = ScopeTree::new(&program);
        let root = tree.enter_root();
        let scope = tree.enter_method(root, f);
        tree.declare_local(scope, x, int(), false).unwrap();
        tree.declare_local(scope, y, TargetType::Prim(PrimKind::Long), false)
            .unwrap();
        tree.declare_local(scope, z, int(), false).unwrap();

        assert_eq!(tree.resolve(scope, x).unwrap(), Some(ValueRef::local(0, int())));
        // Longs are two slots wide.
        assert_eq!(tree.resolve(scope, z).unwrap(), Some(ValueRef::local(3, int())));
    }

    #[test]
    fn test_boxed_local_resolves_to_shared_box() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", SourceType::class(names::INT), true, true);
        let program = b.finish();

        let mut tree = ScopeTree::new(&program);
        let root = tree.enter_root();
        let scope = tree.enter_method(root, f);
        tree.declare_local(scope, x, int(), true).unwrap();

        assert_eq!(
            tree.resolve(scope, x).unwrap(),
            Some(ValueRef::SharedBox { slot: 0, inner: int() })
        );
        // The constructor argument forwards the cell, not its contents.
        assert_eq!(
            tree.capture_source(scope, x).unwrap(),
            ValueRef::local(0, rt::cell_type(&int()))
        );
    }

    #[test]
    fn test_capture_resolves_through_layout() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", SourceType::class(names::INT), false, false);
        let cf = b.closure_fn(SourceType::class(names::INT));
        let program = b.finish();

        let mut tree = ScopeTree::new(&program);
        let root = tree.enter_root();
        let outer = tree.enter_method(root, f);
        tree.declare_local(outer, x, int(), false).unwrap();

        let field = FieldRef::new("main$closure$0", "x", int());
        let layout = ClosureLayout {
            class_name: "main$closure$0".to_string(),
            this_field: None,
            receiver_field: None,
            fields: vec![ClosureField {
                decl: x,
                field: field.clone(),
                boxed: false,
                inner: int(),
            }],
        };
        let inner = tree.enter_closure(outer, cf, layout);

        let resolved = tree.resolve(inner, x).unwrap().unwrap();
        assert_eq!(
            resolved,
            ValueRef::composed(
                ValueRef::local(0, TargetType::object("main$closure$0")),
                ValueRef::InstanceField(field),
            )
        );
    }

    #[test]
    fn test_unrecorded_capture_is_fatal() {
        let mut b = ProgramBuilder::new();
        let f = b.function("main", SourceType::Unit);
        let x = b.local(f, "x", SourceType::class(names::INT), false, false);
        let cf = b.closure_fn(SourceType::Unit);
        let program = b.finish();

        let mut tree = ScopeTree::new(&program);
        let root = tree.enter_root();
        let outer = tree.enter_method(root, f);
        tree.declare_local(outer, x, int(), false).unwrap();
        let layout = ClosureLayout {
            class_name: "main$closure$0".to_string(),
            this_field: None,
            receiver_field: None,
            fields: Vec::new(),
        };
        let inner = tree.enter_closure(outer, cf, layout);

        assert!(matches!(
            tree.resolve(inner, x),
            Err(CodegenError::Internal { .. })
        ));
    }

    #[test]
    fn test_outer_instance_chain() {
        let mut b = ProgramBuilder::new();
        let a = b.class("app.A", None);
        let bc = b.inner_class("app.B", a);
        let m = b.method(bc, "run", Visibility::Public, SourceType::Unit);
        let program = b.finish();

        let mut tree = ScopeTree::new(&program);
        let root = tree.enter_root();
        let sa = tree.enter_class(root, a);
        let sb = tree.enter_class(sa, bc);
        let sm = tree.enter_method(sb, m);

        // `this` of B.
        assert_eq!(
            tree.outer_instance(sm, Some(bc)).unwrap(),
            ValueRef::local(0, TargetType::object("app.B"))
        );
        // A reached through this$0.
        assert_eq!(
            tree.outer_instance(sm, Some(a)).unwrap(),
            ValueRef::composed(
                ValueRef::local(0, TargetType::object("app.B")),
                ValueRef::InstanceField(FieldRef::new(
                    "app.B",
                    "this$0",
                    TargetType::object("app.A")
                )),
            )
        );
    }

    #[test]
    fn test_private_bridge_minted_once() {
        let mut b = ProgramBuilder::new();
        let a = b.class("app.A", None);
        let p = b.property(
            Some(a),
            "count",
            SourceType::class(names::INT),
            Visibility::Private,
            true,
        );
        let m = b.method(a, "run", Visibility::Public, SourceType::Unit);
        let cf = b.closure_fn(SourceType::Unit);
        let program = b.finish();

        let mapper = TypeMapper::new();
        let mut tree = ScopeTree::new(&program);
        let root = tree.enter_root();
        let sa = tree.enter_class(root, a);
        let sm = tree.enter_method(sa, m);
        let layout = ClosureLayout {
            class_name: "app.A$run$closure$0".to_string(),
            this_field: Some(FieldRef::new(
                "app.A$run$closure$0",
                "this$0",
                TargetType::object("app.A"),
            )),
            receiver_field: None,
            fields: Vec::new(),
        };
        let sc = tree.enter_closure(sm, cf, layout);

        let first = tree.property_suffix(sc, p, &mapper).unwrap();
        let second = tree.property_suffix(sc, p, &mapper).unwrap();
        assert_eq!(first, second);
        match &first {
            ValueRef::Property { getter, setter, invoke, .. } => {
                assert_eq!(*invoke, InvokeKind::Static);
                assert_eq!(getter.as_ref().map(|g| g.name.as_str()), Some("access$0"));
                assert_eq!(setter.as_ref().map(|s| s.name.as_str()), Some("access$1"));
            }
            other => panic!("expected a bridged property, got {:?}", other),
        }

        let mut rec = Recorder::new();
        tree.emit_pending_bridges(&mut rec).unwrap();
        assert_eq!(rec.methods.len(), 2);
        assert!(rec.methods.iter().all(|m| m.def.flags & flags::SYNTHETIC != 0));

        // Re-requesting after emission mints nothing new.
        tree.property_suffix(sc, p, &mapper).unwrap();
        let mut rec2 = Recorder::new();
        tree.emit_pending_bridges(&mut rec2).unwrap();
        assert!(rec2.methods.is_empty());
    }

    #[test]
    fn test_same_class_access_stays_direct() {
        let mut b = ProgramBuilder::new();
        let a = b.class("app.A", None);
        let p = b.property(
            Some(a),
            "count",
            SourceType::class(names::INT),
            Visibility::Private,
            false,
        );
        let m = b.method(a, "run", Visibility::Public, SourceType::Unit);
        let program = b.finish();

        let mapper = TypeMapper::new();
        let mut tree = ScopeTree::new(&program);
        let root = tree.enter_root();
        let sa = tree.enter_class(root, a);
        let sm = tree.enter_method(sa, m);

        assert_eq!(
            tree.property_suffix(sm, p, &mapper).unwrap(),
            ValueRef::InstanceField(FieldRef::new("app.A", "count", int()))
        );
    }

    #[test]
    fn test_type_desc_dedup() {
        let b = ProgramBuilder::new();
        let program = b.finish();
        let mut tree = ScopeTree::new(&program);
        let a = SourceType::class(names::STRING);
        let bty = SourceType::class(names::INT);
        assert_eq!(tree.type_desc_index(&a), 0);
        assert_eq!(tree.type_desc_index(&bty), 1);
        assert_eq!(tree.type_desc_index(&a), 0);
        assert_eq!(tree.type_desc_table().len(), 2);
    }
}
