//! Source-Level Types
//!
//! The checked program's view of types: nominal classes with nullability and
//! generic arguments, type parameters with an upper bound, the unit type and
//! the bottom type. The backend only reads these; construction and inference
//! belong to the front end.

use serde::{Deserialize, Serialize};

/// Well-known qualified names of core library classes.
pub mod names {
    /// Universal top type.
    pub const ANY: &str = "vesta.Any";
    /// The "no value" unit class.
    pub const UNIT: &str = "vesta.Unit";
    /// Immutable string class.
    pub const STRING: &str = "vesta.String";
    /// Generic array class; element type is the single generic argument.
    pub const ARRAY: &str = "vesta.Array";
    /// Root of the throwable hierarchy.
    pub const THROWABLE: &str = "vesta.Throwable";

    /// 32-bit signed integer.
    pub const INT: &str = "vesta.Int";
    /// 64-bit signed integer.
    pub const LONG: &str = "vesta.Long";
    /// 32-bit float.
    pub const FLOAT: &str = "vesta.Float";
    /// 64-bit float.
    pub const DOUBLE: &str = "vesta.Double";
    /// Boolean.
    pub const BOOLEAN: &str = "vesta.Boolean";
    /// UTF-16 code unit.
    pub const CHAR: &str = "vesta.Char";
    /// 8-bit signed integer.
    pub const BYTE: &str = "vesta.Byte";
    /// 16-bit signed integer.
    pub const SHORT: &str = "vesta.Short";

    /// All primitive-backed class names.
    pub const PRIMITIVES: [&str; 8] = [INT, LONG, FLOAT, DOUBLE, BOOLEAN, CHAR, BYTE, SHORT];
}

/// A type as seen by the checked program.
///
/// Immutable and owned by the front end. `Class` covers every nominal type
/// including the primitive-backed ones (identified by qualified name) and
/// arrays (`vesta.Array<T>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    /// The "no value" type of statements and unit-returning calls.
    Unit,
    /// The bottom type; `nullable` bottom is the type of a bare `null`.
    Never {
        /// Whether the type admits `null`.
        nullable: bool,
    },
    /// A nominal class reference.
    Class {
        /// Fully qualified class name.
        name: String,
        /// Whether the type admits `null`.
        nullable: bool,
        /// Ordered generic arguments.
        args: Vec<SourceType>,
    },
    /// A reference to a type parameter in scope.
    Param {
        /// Declared parameter name.
        name: String,
        /// Upper bound; `vesta.Any?` when unconstrained.
        upper: Box<SourceType>,
        /// Whether the use site admits `null`.
        nullable: bool,
    },
}

impl SourceType {
    /// Non-null class type without generic arguments.
    pub fn class(name: &str) -> Self {
        SourceType::Class {
            name: name.to_string(),
            nullable: false,
            args: Vec::new(),
        }
    }

    /// Non-null class type with generic arguments.
    pub fn generic(name: &str, args: Vec<SourceType>) -> Self {
        SourceType::Class {
            name: name.to_string(),
            nullable: false,
            args,
        }
    }

    /// `vesta.Array<elem>`.
    pub fn array(elem: SourceType) -> Self {
        SourceType::generic(names::ARRAY, vec![elem])
    }

    /// Type parameter reference with the given upper bound.
    pub fn param(name: &str, upper: SourceType) -> Self {
        SourceType::Param {
            name: name.to_string(),
            upper: Box::new(upper),
            nullable: false,
        }
    }

    /// The same type with nullability set.
    pub fn nullable(self) -> Self {
        match self {
            SourceType::Unit => SourceType::Unit,
            SourceType::Never { .. } => SourceType::Never { nullable: true },
            SourceType::Class { name, args, .. } => SourceType::Class {
                name,
                nullable: true,
                args,
            },
            SourceType::Param { name, upper, .. } => SourceType::Param {
                name,
                upper,
                nullable: true,
            },
        }
    }

    /// Whether the type admits `null`.
    pub fn is_nullable(&self) -> bool {
        match self {
            SourceType::Unit => false,
            SourceType::Never { nullable } => *nullable,
            SourceType::Class { nullable, .. } => *nullable,
            SourceType::Param { nullable, .. } => *nullable,
        }
    }

    /// Whether this is a class type with the given qualified name.
    pub fn is_class(&self, qualified: &str) -> bool {
        matches!(self, SourceType::Class { name, .. } if name == qualified)
    }

    /// Whether this is one of the primitive-backed class types (any nullability).
    pub fn is_primitive_backed(&self) -> bool {
        match self {
            SourceType::Class { name, .. } => names::PRIMITIVES.contains(&name.as_str()),
            _ => false,
        }
    }

    /// Whether the type mentions an open type parameter anywhere.
    ///
    /// Mapping results for such types are not memoized because the same
    /// spelling can map differently under different bounds.
    pub fn has_open_params(&self) -> bool {
        match self {
            SourceType::Unit | SourceType::Never { .. } => false,
            SourceType::Param { .. } => true,
            SourceType::Class { args, .. } => args.iter().any(SourceType::has_open_params),
        }
    }

    /// Qualified class name, if this is a class type.
    pub fn class_name(&self) -> Option<&str> {
        match self {
            SourceType::Class { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Element type, if this is `vesta.Array<T>`.
    pub fn array_element(&self) -> Option<&SourceType> {
        match self {
            SourceType::Class { name, args, .. } if name == names::ARRAY => args.first(),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Unit => write!(f, "Unit"),
            SourceType::Never { nullable: false } => write!(f, "Never"),
            SourceType::Never { nullable: true } => write!(f, "Never?"),
            SourceType::Class {
                name,
                nullable,
                args,
            } => {
                write!(f, "{}", name)?;
                if !args.is_empty() {
                    write!(f, "<")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", arg)?;
                    }
                    write!(f, ">")?;
                }
                if *nullable {
                    write!(f, "?")?;
                }
                Ok(())
            }
            SourceType::Param { name, nullable, .. } => {
                write!(f, "{}{}", name, if *nullable { "?" } else { "" })
            }
        }
    }
}
