use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Flat memory cost charged for every active call frame.
pub const CALL_FRAME_MEMUSE: i32 = 64;

/// Memory charged per character of string or key content.
pub const STRING_LEN_TO_MEMUSE: i32 = 2;

/// Static script types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    Void,
    Bool,
    Integer,
    Float,
    String,
    Key,
    List,
    Vector,
    Rotation,
    Array,
    Object,
}

impl Type {
    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Key => "key",
            Self::List => "list",
            Self::Vector => "vector",
            Self::Rotation => "rotation",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Fixed accounting cost of one variable of this type.
    pub fn static_size(self) -> i32 {
        match self {
            Self::Void => 0,
            Self::Bool | Self::Integer | Self::Float => 8,
            Self::String | Self::Key => 40,
            Self::Object => 32,
            Self::Vector => 72,
            Self::Rotation => 80,
            Self::List | Self::Array => 96,
        }
    }

    /// Whether values of this type contribute a content-dependent size.
    pub fn has_dynamic_size(self) -> bool {
        matches!(self, Self::String | Self::Key | Self::List)
    }

    /// Types accepted wherever a condition or `&&`/`||` operand is expected.
    pub fn is_truth_convertible(self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Integer | Self::Float | Self::Key | Self::List | Self::String
        )
    }

    /// Type named by a keyword token, if any.
    pub fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "integer" => Self::Integer,
            "float" => Self::Float,
            "string" => Self::String,
            "key" => Self::Key,
            "list" => Self::List,
            "vector" => Self::Vector,
            "rotation" => Self::Rotation,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => return None,
        })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Cast tables ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    /// Applied silently on assignment, argument passing and return.
    Implicit,
    /// Only permitted through a `(type)` cast expression.
    Explicit,
}

const IMPLICIT_CASTS: &[(Type, Type)] = &[
    (Type::Array, Type::Object),
    (Type::Bool, Type::Float),
    (Type::Bool, Type::Integer),
    (Type::Float, Type::Bool),
    (Type::Float, Type::Integer),
    (Type::Float, Type::Object),
    (Type::Integer, Type::Bool),
    (Type::Integer, Type::Float),
    (Type::Integer, Type::Object),
    (Type::Key, Type::Bool),
    (Type::Key, Type::Object),
    (Type::Key, Type::String),
    (Type::List, Type::Object),
    (Type::Object, Type::Array),
    (Type::Object, Type::Float),
    (Type::Object, Type::Integer),
    (Type::Object, Type::Key),
    (Type::Object, Type::List),
    (Type::Object, Type::Rotation),
    (Type::Object, Type::String),
    (Type::Object, Type::Vector),
    (Type::Rotation, Type::Object),
    (Type::String, Type::Bool),
    (Type::String, Type::Key),
    (Type::String, Type::Object),
    (Type::String, Type::Vector),
    (Type::Vector, Type::Object),
];

const EXPLICIT_CASTS: &[(Type, Type)] = &[
    (Type::Bool, Type::String),
    (Type::Float, Type::String),
    (Type::Integer, Type::String),
    (Type::List, Type::String),
    (Type::Rotation, Type::String),
    (Type::Vector, Type::String),
    (Type::String, Type::Float),
    (Type::String, Type::Integer),
    (Type::String, Type::Rotation),
    (Type::String, Type::List),
    (Type::Key, Type::List),
    (Type::Float, Type::List),
    (Type::Integer, Type::List),
    (Type::Rotation, Type::List),
    (Type::Vector, Type::List),
];

static CAST_TABLE: LazyLock<HashMap<(Type, Type), CastKind>> = LazyLock::new(|| {
    let mut table = HashMap::new();
    for &pair in IMPLICIT_CASTS {
        table.insert(pair, CastKind::Implicit);
    }
    for &pair in EXPLICIT_CASTS {
        table.entry(pair).or_insert(CastKind::Explicit);
    }
    table
});

/// Look up how `from` converts to `to`. Identity casts are always implicit.
pub fn cast_kind(from: Type, to: Type) -> Option<CastKind> {
    if from == to {
        return Some(CastKind::Implicit);
    }
    CAST_TABLE.get(&(from, to)).copied()
}

/// Whether a value of `from` may be converted to `to`.
pub fn can_cast(from: Type, to: Type, explicit: bool) -> bool {
    match cast_kind(from, to) {
        Some(CastKind::Implicit) => true,
        Some(CastKind::Explicit) => explicit,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_sizes_match_accounting_costs() {
        assert_eq!(Type::List.static_size(), 96);
        assert_eq!(Type::Rotation.static_size(), 80);
        assert_eq!(Type::Vector.static_size(), 72);
        assert_eq!(Type::String.static_size(), 40);
        assert_eq!(Type::Key.static_size(), 40);
        assert_eq!(Type::Integer.static_size(), 8);
        assert_eq!(Type::Void.static_size(), 0);
    }

    #[test]
    fn identity_cast_is_implicit() {
        assert_eq!(cast_kind(Type::Vector, Type::Vector), Some(CastKind::Implicit));
    }

    #[test]
    fn explicit_table_is_strict_superset() {
        for &(from, to) in IMPLICIT_CASTS {
            assert!(can_cast(from, to, true), "{from} -> {to}");
        }
        assert!(!can_cast(Type::Integer, Type::String, false));
        assert!(can_cast(Type::Integer, Type::String, true));
    }

    #[test]
    fn unrelated_types_do_not_cast() {
        assert!(!can_cast(Type::Vector, Type::Rotation, true));
        assert!(!can_cast(Type::List, Type::Integer, true));
    }
}
