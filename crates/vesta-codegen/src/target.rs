//! Target Machine Types
//!
//! The erased type system of the target instruction set, and the mapper from
//! source types onto it. The mapping is a pure function; results for closed
//! nominal types are memoized per compilation session.

use crate::error::{CodegenError, CodegenResult};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use vesta_frontend::{names, DeclId, Program, SourceType};

/// Primitive kinds of the target machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimKind {
    Int,
    Long,
    Float,
    Double,
    Bool,
    Char,
    Byte,
    Short,
}

impl PrimKind {
    /// Operand stack slots the kind occupies.
    pub fn slots(&self) -> u8 {
        match self {
            PrimKind::Long | PrimKind::Double => 2,
            _ => 1,
        }
    }

    /// The primitive kind backing a source class name, if any.
    pub fn for_class(name: &str) -> Option<PrimKind> {
        match name {
            names::INT => Some(PrimKind::Int),
            names::LONG => Some(PrimKind::Long),
            names::FLOAT => Some(PrimKind::Float),
            names::DOUBLE => Some(PrimKind::Double),
            names::BOOLEAN => Some(PrimKind::Bool),
            names::CHAR => Some(PrimKind::Char),
            names::BYTE => Some(PrimKind::Byte),
            names::SHORT => Some(PrimKind::Short),
            _ => None,
        }
    }

    /// Whether the kind is an integral or floating numeric.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, PrimKind::Bool)
    }
}

impl std::fmt::Display for PrimKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrimKind::Int => "int",
            PrimKind::Long => "long",
            PrimKind::Float => "float",
            PrimKind::Double => "double",
            PrimKind::Bool => "bool",
            PrimKind::Char => "char",
            PrimKind::Byte => "byte",
            PrimKind::Short => "short",
        };
        write!(f, "{}", s)
    }
}

/// A machine-level type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    Void,
    Prim(PrimKind),
    /// Nominal object type, by qualified name.
    Object(String),
    Array(Box<TargetType>),
}

impl TargetType {
    /// Object type from a qualified name.
    pub fn object(name: &str) -> Self {
        TargetType::Object(name.to_string())
    }

    /// The universal top object type.
    pub fn any() -> Self {
        TargetType::object(names::ANY)
    }

    /// Operand stack slots a value of this type occupies.
    pub fn slots(&self) -> u8 {
        match self {
            TargetType::Void => 0,
            TargetType::Prim(k) => k.slots(),
            TargetType::Object(_) | TargetType::Array(_) => 1,
        }
    }

    /// Whether this is an object or array reference type.
    pub fn is_reference(&self) -> bool {
        matches!(self, TargetType::Object(_) | TargetType::Array(_))
    }

    /// Primitive kind, if this is a primitive type.
    pub fn prim(&self) -> Option<PrimKind> {
        match self {
            TargetType::Prim(k) => Some(*k),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetType::Void => write!(f, "void"),
            TargetType::Prim(k) => write!(f, "{}", k),
            TargetType::Object(name) => write!(f, "{}", name),
            TargetType::Array(elem) => write!(f, "{}[]", elem),
        }
    }
}

/// A method signature at the target level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSig {
    pub params: Vec<TargetType>,
    pub ret: TargetType,
}

impl MethodSig {
    /// Create a signature.
    pub fn new(params: Vec<TargetType>, ret: TargetType) -> Self {
        Self { params, ret }
    }
}

impl std::fmt::Display for MethodSig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// A named field on a target class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub ty: TargetType,
}

impl FieldRef {
    /// Create a field reference.
    pub fn new(owner: &str, name: &str, ty: TargetType) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            ty,
        }
    }
}

/// A named method on a target class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub sig: MethodSig,
}

impl MemberRef {
    /// Create a member reference.
    pub fn new(owner: &str, name: &str, sig: MethodSig) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            sig,
        }
    }
}

/// Boxed counterpart class name for a primitive kind.
pub fn boxed_name(kind: PrimKind) -> &'static str {
    match kind {
        PrimKind::Int => "vesta.boxed.Int",
        PrimKind::Long => "vesta.boxed.Long",
        PrimKind::Float => "vesta.boxed.Float",
        PrimKind::Double => "vesta.boxed.Double",
        PrimKind::Bool => "vesta.boxed.Boolean",
        PrimKind::Char => "vesta.boxed.Char",
        PrimKind::Byte => "vesta.boxed.Byte",
        PrimKind::Short => "vesta.boxed.Short",
    }
}

/// Primitive kind for a boxed class name, if it is one.
pub fn boxed_prim(name: &str) -> Option<PrimKind> {
    match name {
        "vesta.boxed.Int" => Some(PrimKind::Int),
        "vesta.boxed.Long" => Some(PrimKind::Long),
        "vesta.boxed.Float" => Some(PrimKind::Float),
        "vesta.boxed.Double" => Some(PrimKind::Double),
        "vesta.boxed.Boolean" => Some(PrimKind::Bool),
        "vesta.boxed.Char" => Some(PrimKind::Char),
        "vesta.boxed.Byte" => Some(PrimKind::Byte),
        "vesta.boxed.Short" => Some(PrimKind::Short),
        _ => None,
    }
}

/// Well-known runtime support types and members.
pub mod rt {
    use super::{FieldRef, MemberRef, MethodSig, PrimKind, TargetType};
    use vesta_frontend::names;

    /// Owner class of namespace-level functions and properties.
    pub const NAMESPACE_OWNER: &str = "vesta.Namespace";
    /// Injected runtime type descriptor parameter type.
    pub const TYPE_DESC: &str = "vesta.rt.TypeDesc";
    /// Fault raised when an exhaustive branch construct matches no clause.
    pub const NO_WHEN_BRANCH: &str = "vesta.rt.NoWhenBranchError";
    /// Fault raised by a failed not-null assertion.
    pub const NULL_ASSERTION: &str = "vesta.rt.NullAssertionError";
    /// Field holding the payload of a shared-box cell.
    pub const REF_ELEMENT: &str = "element";

    /// Shared-box cell class for a captured, reassigned local.
    pub fn cell_name(kind: Option<PrimKind>) -> &'static str {
        match kind {
            Some(PrimKind::Int) => "vesta.rt.Ref$Int",
            Some(PrimKind::Long) => "vesta.rt.Ref$Long",
            Some(PrimKind::Float) => "vesta.rt.Ref$Float",
            Some(PrimKind::Double) => "vesta.rt.Ref$Double",
            Some(PrimKind::Bool) => "vesta.rt.Ref$Boolean",
            Some(PrimKind::Char) => "vesta.rt.Ref$Char",
            Some(PrimKind::Byte) => "vesta.rt.Ref$Byte",
            Some(PrimKind::Short) => "vesta.rt.Ref$Short",
            None => "vesta.rt.Ref$Object",
        }
    }

    /// The cell type wrapping a captured value of `inner` type.
    pub fn cell_type(inner: &TargetType) -> TargetType {
        TargetType::object(cell_name(inner.prim()))
    }

    /// The `element` field of the cell wrapping `inner`.
    pub fn cell_element(inner: &TargetType) -> FieldRef {
        let stored = match inner {
            TargetType::Prim(_) => inner.clone(),
            _ => TargetType::any(),
        };
        FieldRef::new(cell_name(inner.prim()), REF_ELEMENT, stored)
    }

    /// No-argument constructor of the cell wrapping `inner`.
    pub fn cell_ctor(inner: &TargetType) -> MemberRef {
        MemberRef::new(
            cell_name(inner.prim()),
            "<init>",
            MethodSig::new(Vec::new(), TargetType::Void),
        )
    }

    /// The unit singleton field.
    pub fn unit_instance() -> FieldRef {
        FieldRef::new(names::UNIT, "INSTANCE", TargetType::object(names::UNIT))
    }

    /// Static string concatenation helper.
    pub fn string_concat() -> MemberRef {
        let string = TargetType::object(names::STRING);
        MemberRef::new(
            names::STRING,
            "concat",
            MethodSig::new(vec![string.clone(), string.clone()], string),
        )
    }

    /// Universal structural equality.
    pub fn any_equals() -> MemberRef {
        MemberRef::new(
            names::ANY,
            "equals",
            MethodSig::new(vec![TargetType::any()], TargetType::Prim(PrimKind::Bool)),
        )
    }

    /// No-argument fault constructor.
    pub fn fault_ctor(owner: &str) -> MemberRef {
        MemberRef::new(owner, "<init>", MethodSig::new(Vec::new(), TargetType::Void))
    }

    /// Tuple carrier class for the given arity.
    pub fn tuple_name(arity: usize) -> String {
        format!("vesta.Tuple{}", arity)
    }
}

/// Maps source types and signatures onto the target type system.
///
/// One mapper exists per compilation session and is passed explicitly to the
/// components that need it; there is no global table. Memoization is
/// interior because mapping is logically a pure lookup.
#[derive(Debug, Default)]
pub struct TypeMapper {
    memo: RefCell<FxHashMap<SourceType, TargetType>>,
}

impl TypeMapper {
    /// Create a mapper with an empty memo table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a source type to its target type.
    ///
    /// The front end guarantees every type it produces has a mapping; a miss
    /// here is a fatal inconsistency, never a guess.
    pub fn map_type(&self, ty: &SourceType) -> CodegenResult<TargetType> {
        if let Some(hit) = self.memo.borrow().get(ty) {
            return Ok(hit.clone());
        }
        let mapped = self.map_type_uncached(ty)?;
        if !ty.has_open_params() {
            self.memo.borrow_mut().insert(ty.clone(), mapped.clone());
        }
        Ok(mapped)
    }

    fn map_type_uncached(&self, ty: &SourceType) -> CodegenResult<TargetType> {
        match ty {
            SourceType::Unit => Ok(TargetType::Void),
            SourceType::Never { nullable: false } => Ok(TargetType::Void),
            SourceType::Never { nullable: true } => Ok(TargetType::any()),
            SourceType::Class {
                name,
                nullable,
                args,
            } => self.map_class(name, *nullable, args),
            SourceType::Param { upper, .. } => {
                // Type parameters erase to their upper bound; generic values
                // are always carried boxed.
                let mapped = self.map_type(upper)?;
                match mapped {
                    TargetType::Prim(k) => Ok(TargetType::object(boxed_name(k))),
                    TargetType::Void => Ok(TargetType::any()),
                    other => Ok(other),
                }
            }
        }
    }

    fn map_class(
        &self,
        name: &str,
        nullable: bool,
        args: &[SourceType],
    ) -> CodegenResult<TargetType> {
        if let Some(kind) = PrimKind::for_class(name) {
            return Ok(if nullable {
                TargetType::object(boxed_name(kind))
            } else {
                TargetType::Prim(kind)
            });
        }
        if name == names::ARRAY {
            let elem = args.first().ok_or_else(|| {
                CodegenError::type_mapping("array type with no element argument")
            })?;
            let prim_elem = match elem {
                SourceType::Class {
                    name: elem_name,
                    nullable: false,
                    ..
                } => PrimKind::for_class(elem_name),
                _ => None,
            };
            let mapped = match (prim_elem, elem) {
                (Some(kind), _) => TargetType::Prim(kind),
                (None, SourceType::Param { .. }) => TargetType::any(),
                (None, other) => match self.map_type(other)? {
                    TargetType::Prim(k) => TargetType::object(boxed_name(k)),
                    TargetType::Void => TargetType::any(),
                    mapped => mapped,
                },
            };
            return Ok(TargetType::Array(Box::new(mapped)));
        }
        if name.is_empty() {
            return Err(CodegenError::type_mapping("class type with empty name"));
        }
        Ok(TargetType::object(name))
    }

    /// The alternate nominal type carrying default bodies of a stateless
    /// declaration (trait).
    pub fn map_default_impl_carrier(&self, trait_name: &str) -> TargetType {
        TargetType::Object(format!("{}$defaults", trait_name))
    }

    /// Map a callable's signature: receiver becomes a leading parameter,
    /// reified type parameters append trailing type-descriptor parameters.
    pub fn map_signature(&self, program: &Program, func: DeclId) -> CodegenResult<MethodSig> {
        let f = program.function(func);
        let mut params = Vec::new();
        if let Some(recv) = &f.receiver {
            params.push(self.map_type(recv)?);
        }
        for &p in &f.params {
            params.push(self.map_type(&program.local(p).ty)?);
        }
        for tp in &f.type_params {
            if tp.reified {
                params.push(TargetType::object(rt::TYPE_DESC));
            }
        }
        let ret = self.map_type(&f.ret)?;
        Ok(MethodSig::new(params, ret))
    }

    /// Boxed object counterpart of a primitive target type.
    pub fn box_type(&self, ty: &TargetType) -> CodegenResult<TargetType> {
        match ty {
            TargetType::Prim(k) => Ok(TargetType::object(boxed_name(*k))),
            other => Err(CodegenError::type_mapping(format!(
                "cannot box non-primitive type {}",
                other
            ))),
        }
    }

    /// Primitive counterpart of a boxed object type.
    pub fn unbox_type(&self, ty: &TargetType) -> CodegenResult<TargetType> {
        match ty {
            TargetType::Object(name) => boxed_prim(name)
                .map(TargetType::Prim)
                .ok_or_else(|| {
                    CodegenError::type_mapping(format!("cannot unbox non-boxed type {}", name))
                }),
            other => Err(CodegenError::type_mapping(format!(
                "cannot unbox non-object type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesta_frontend::SourceType;

    #[test]
    fn test_primitive_mapping() {
        let mapper = TypeMapper::new();
        let int = SourceType::class(names::INT);
        assert_eq!(mapper.map_type(&int).unwrap(), TargetType::Prim(PrimKind::Int));
        assert_eq!(
            mapper.map_type(&int.nullable()).unwrap(),
            TargetType::object("vesta.boxed.Int")
        );
    }

    #[test]
    fn test_unit_and_bottom() {
        let mapper = TypeMapper::new();
        assert_eq!(mapper.map_type(&SourceType::Unit).unwrap(), TargetType::Void);
        assert_eq!(
            mapper.map_type(&SourceType::Never { nullable: false }).unwrap(),
            TargetType::Void
        );
        assert_eq!(
            mapper.map_type(&SourceType::Never { nullable: true }).unwrap(),
            TargetType::any()
        );
    }

    #[test]
    fn test_array_mapping() {
        let mapper = TypeMapper::new();
        let ints = SourceType::array(SourceType::class(names::INT));
        assert_eq!(
            mapper.map_type(&ints).unwrap(),
            TargetType::Array(Box::new(TargetType::Prim(PrimKind::Int)))
        );
        let nullable_ints = SourceType::array(SourceType::class(names::INT).nullable());
        assert_eq!(
            mapper.map_type(&nullable_ints).unwrap(),
            TargetType::Array(Box::new(TargetType::object("vesta.boxed.Int")))
        );
        let generic = SourceType::array(SourceType::param(
            "T",
            SourceType::class(names::ANY).nullable(),
        ));
        assert_eq!(
            mapper.map_type(&generic).unwrap(),
            TargetType::Array(Box::new(TargetType::any()))
        );
    }

    #[test]
    fn test_param_erasure() {
        let mapper = TypeMapper::new();
        let t = SourceType::param("T", SourceType::class(names::INT));
        // Primitive upper bounds still erase to the boxed carrier.
        assert_eq!(
            mapper.map_type(&t).unwrap(),
            TargetType::object("vesta.boxed.Int")
        );
    }

    #[test]
    fn test_box_unbox_inverse() {
        let mapper = TypeMapper::new();
        for kind in [
            PrimKind::Int,
            PrimKind::Long,
            PrimKind::Float,
            PrimKind::Double,
            PrimKind::Bool,
            PrimKind::Char,
            PrimKind::Byte,
            PrimKind::Short,
        ] {
            let prim = TargetType::Prim(kind);
            let boxed = mapper.box_type(&prim).unwrap();
            assert_eq!(mapper.unbox_type(&boxed).unwrap(), prim);
            assert_eq!(
                mapper.box_type(&mapper.unbox_type(&boxed).unwrap()).unwrap(),
                boxed
            );
        }
    }

    #[test]
    fn test_unbox_non_boxed_fails() {
        let mapper = TypeMapper::new();
        assert!(mapper.unbox_type(&TargetType::object(names::STRING)).is_err());
        assert!(mapper.unbox_type(&TargetType::Prim(PrimKind::Int)).is_err());
    }

    #[test]
    fn test_memoization_returns_equal_results() {
        let mapper = TypeMapper::new();
        let ty = SourceType::generic("vesta.List", vec![SourceType::class(names::INT)]);
        let first = mapper.map_type(&ty).unwrap();
        let second = mapper.map_type(&ty).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_default_impl_carrier() {
        let mapper = TypeMapper::new();
        assert_eq!(
            mapper.map_default_impl_carrier("app.Greeter"),
            TargetType::object("app.Greeter$defaults")
        );
    }
}
