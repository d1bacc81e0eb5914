use std::fmt;

use indexmap::IndexMap;

use super::error::RuntimeFault;
use crate::lsl::types::{Type, STRING_LEN_TO_MEMUSE};

pub const NULL_KEY: &str = "00000000-0000-0000-0000-000000000000";

/// A runtime value. Every stack slot, local and global holds one.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Missing array element, or an `object` with nothing in it.
    #[default]
    Undef,
    Bool(bool),
    Integer(i32),
    Float(f64),
    String(String),
    Key(String),
    List(Vec<Value>),
    Vector([f64; 3]),
    Rotation([f64; 4]),
    Array(ScriptArray),
}

impl Value {
    /// Initial value of a freshly declared variable.
    pub fn default_for(ty: Type) -> Self {
        match ty {
            Type::Bool => Self::Bool(false),
            Type::Integer => Self::Integer(0),
            Type::Float => Self::Float(0.0),
            Type::String => Self::String(String::new()),
            Type::Key => Self::Key(String::new()),
            Type::List => Self::List(Vec::new()),
            Type::Vector => Self::Vector([0.0; 3]),
            Type::Rotation => Self::Rotation([0.0, 0.0, 0.0, 1.0]),
            Type::Array => Self::Array(ScriptArray::default()),
            Type::Object | Type::Void => Self::Undef,
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Self::Undef => Type::Object,
            Self::Bool(_) => Type::Bool,
            Self::Integer(_) => Type::Integer,
            Self::Float(_) => Type::Float,
            Self::String(_) => Type::String,
            Self::Key(_) => Type::Key,
            Self::List(_) => Type::List,
            Self::Vector(_) => Type::Vector,
            Self::Rotation(_) => Type::Rotation,
            Self::Array(_) => Type::Array,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undef => false,
            Self::Bool(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::Key(k) => is_valid_key(k) && k != NULL_KEY,
            Self::List(l) => !l.is_empty(),
            Self::Vector(v) => v.iter().any(|c| *c != 0.0),
            Self::Rotation(r) => *r != [0.0, 0.0, 0.0, 1.0],
            Self::Array(a) => !a.is_empty(),
        }
    }

    /// Content-dependent part of the memory charge.
    pub fn dyn_size(&self) -> i32 {
        match self {
            Self::String(s) | Self::Key(s) => {
                i32::try_from(s.chars().count()).map_or(i32::MAX, |n| n.saturating_mul(STRING_LEN_TO_MEMUSE))
            }
            Self::List(items) => items.iter().fold(0i32, |acc, v| {
                acc.saturating_add(v.ty().static_size()).saturating_add(v.dyn_size())
            }),
            _ => 0,
        }
    }

    pub fn as_int(&self) -> i32 {
        match self {
            Self::Integer(i) => *i,
            Self::Bool(b) => i32::from(*b),
            Self::Float(f) => float_to_int(*f),
            _ => 0,
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            Self::Float(f) => *f,
            Self::Integer(i) => f64::from(*i),
            Self::Bool(b) => f64::from(u8::from(*b)),
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::String(s) | Self::Key(s) => s,
            _ => "",
        }
    }

    /// Convert to `to`. The compiler only emits conversions the cast tables
    /// allow, so a failure here means an `object` held the wrong thing.
    pub fn cast_to(&self, to: Type) -> Result<Value, RuntimeFault> {
        if self.ty() == to && !matches!(self, Self::Undef) {
            return Ok(self.clone());
        }
        let bad = || RuntimeFault::BadCast {
            from: self.type_name(),
            to,
        };
        Ok(match (self, to) {
            (_, Type::Object) => self.clone(),
            (Self::Undef, _) => return Err(bad()),

            (_, Type::Bool) => match self {
                Self::Vector(_) | Self::Rotation(_) | Self::Array(_) => return Err(bad()),
                _ => Self::Bool(self.truthy()),
            },
            (Self::Bool(_) | Self::Float(_), Type::Integer) => Self::Integer(self.as_int()),
            (Self::Bool(_) | Self::Integer(_), Type::Float) => Self::Float(self.as_float()),
            (Self::String(s), Type::Integer) => Self::Integer(parse_int_prefix(s)),
            (Self::String(s), Type::Float) => Self::Float(parse_float_prefix(s)),

            (_, Type::String) => Self::String(self.render()),
            (Self::String(s), Type::Key) => Self::Key(s.clone()),
            (Self::String(s), Type::Vector) => {
                Self::Vector(parse_components::<3>(s).unwrap_or([0.0; 3]))
            }
            (Self::String(s), Type::Rotation) => {
                Self::Rotation(parse_components::<4>(s).unwrap_or([0.0, 0.0, 0.0, 1.0]))
            }
            (Self::Bool(b), Type::List) => Self::List(vec![Self::Integer(i32::from(*b))]),
            (
                Self::Integer(_) | Self::Float(_) | Self::String(_) | Self::Key(_) | Self::Vector(_) | Self::Rotation(_),
                Type::List,
            ) => Self::List(vec![self.clone()]),
            _ => return Err(bad()),
        })
    }

    fn type_name(&self) -> String {
        match self {
            Self::Undef => "undef".into(),
            other => other.ty().to_string(),
        }
    }

    /// String form used by `(string)` casts and list rendering.
    pub fn render(&self) -> String {
        match self {
            Self::Undef => String::new(),
            Self::Bool(b) => i32::from(*b).to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => format!("{f:.6}"),
            Self::String(s) | Self::Key(s) => s.clone(),
            Self::List(items) => items.iter().map(Value::render).collect(),
            Self::Vector([x, y, z]) => format!("<{x:.5}, {y:.5}, {z:.5}>"),
            Self::Rotation([x, y, z, s]) => format!("<{x:.5}, {y:.5}, {z:.5}, {s:.5}>"),
            Self::Array(a) => format!("[array of {}]", a.len()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Key(k) => write!(f, "key({k})"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Undef => f.write_str("undef"),
            other => f.write_str(&other.render()),
        }
    }
}

/// Truncate toward zero; anything out of range becomes `i32::MIN`.
pub fn float_to_int(f: f64) -> i32 {
    if f.is_finite() && f > f64::from(i32::MIN) - 1.0 && f < f64::from(i32::MAX) + 1.0 {
        #[allow(clippy::cast_possible_truncation)]
        let i = f.trunc() as i32;
        i
    } else {
        i32::MIN
    }
}

fn is_valid_key(k: &str) -> bool {
    let bytes = k.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

/// Leading decimal or `0x` integer, ignoring what follows. Wraps modulo 2^32.
fn parse_int_prefix(s: &str) -> i32 {
    let t = s.trim_start();
    let (neg, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    let (radix, digits) = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(rest) => (16, rest),
        None => (10, t),
    };
    let mut value: u32 = 0;
    for c in digits.chars() {
        let Some(d) = c.to_digit(radix) else { break };
        value = value.wrapping_mul(radix).wrapping_add(d);
    }
    #[allow(clippy::cast_possible_wrap)]
    let v = value as i32;
    if neg {
        v.wrapping_neg()
    } else {
        v
    }
}

/// Longest prefix that parses as a float, or 0.
fn parse_float_prefix(s: &str) -> f64 {
    let t = s.trim_start();
    let mut best = 0.0;
    for (i, c) in t.char_indices() {
        if !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')) {
            break;
        }
        if let Some(Ok(v)) = t.get(..i + c.len_utf8()).map(str::parse::<f64>) {
            best = v;
        }
    }
    best
}

/// `<a, b, c>` style text, as produced by `render`.
fn parse_components<const N: usize>(s: &str) -> Option<[f64; N]> {
    let inner = s.trim().strip_prefix('<')?.strip_suffix('>')?;
    let mut out = [0.0; N];
    let mut parts = inner.split(',');
    for slot in &mut out {
        *slot = parts.next()?.trim().parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

// ── Arrays ───────────────────────────────────────────────────────

/// Hashable form of an array subscript.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    Integer(i32),
    Float(u64),
    String(String),
    Key(String),
    Vector([u64; 3]),
    Rotation([u64; 4]),
}

impl ArrayKey {
    pub fn from_value(value: &Value) -> Result<Self, RuntimeFault> {
        Ok(match value {
            Value::Integer(i) => Self::Integer(*i),
            Value::Bool(b) => Self::Integer(i32::from(*b)),
            Value::Float(f) => Self::Float(f.to_bits()),
            Value::String(s) => Self::String(s.clone()),
            Value::Key(k) => Self::Key(k.clone()),
            Value::Vector(v) => Self::Vector(v.map(f64::to_bits)),
            Value::Rotation(r) => Self::Rotation(r.map(f64::to_bits)),
            other => {
                return Err(RuntimeFault::BadCast {
                    from: other.type_name(),
                    to: Type::Object,
                })
            }
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Integer(i) => Value::Integer(*i),
            Self::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Self::String(s) => Value::String(s.clone()),
            Self::Key(k) => Value::Key(k.clone()),
            Self::Vector(v) => Value::Vector(v.map(f64::from_bits)),
            Self::Rotation(r) => Value::Rotation(r.map(f64::from_bits)),
        }
    }
}

/// Insertion-ordered associative array. Assigning `undef` removes an entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptArray {
    entries: IndexMap<ArrayKey, Value>,
}

impl ScriptArray {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Result<Value, RuntimeFault> {
        let key = ArrayKey::from_value(key)?;
        Ok(self.entries.get(&key).cloned().unwrap_or_default())
    }

    pub fn set(&mut self, key: &Value, value: Value) -> Result<(), RuntimeFault> {
        let key = ArrayKey::from_value(key)?;
        if matches!(value, Value::Undef) {
            self.entries.shift_remove(&key);
        } else {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    /// Key at enumeration position `n`, or `undef` past the end.
    pub fn key_at(&self, n: i32) -> Value {
        usize::try_from(n)
            .ok()
            .and_then(|n| self.entries.get_index(n))
            .map_or(Value::Undef, |(k, _)| k.to_value())
    }

    pub fn value_at(&self, n: i32) -> Value {
        usize::try_from(n)
            .ok()
            .and_then(|n| self.entries.get_index(n))
            .map_or(Value::Undef, |(_, v)| v.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k.to_value(), v))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_sizes() {
        assert_eq!(Value::String("abc".into()).dyn_size(), 6);
        assert_eq!(Value::List(vec![]).dyn_size(), 0);
        let list = Value::List(vec![Value::Integer(1), Value::String("ab".into())]);
        assert_eq!(list.dyn_size(), 8 + 40 + 4);
        assert_eq!(Value::Vector([1.0, 2.0, 3.0]).dyn_size(), 0);
    }

    #[test]
    fn float_and_vector_rendering() {
        assert_eq!(Value::Float(1.5).cast_to(Type::String).unwrap(), Value::String("1.500000".into()));
        assert_eq!(
            Value::Vector([1.0, 2.0, 3.0]).render(),
            "<1.00000, 2.00000, 3.00000>"
        );
        let list = Value::List(vec![Value::Integer(1), Value::Float(0.5), Value::String("x".into())]);
        assert_eq!(list.render(), "10.500000x");
    }

    #[test]
    fn string_conversions() {
        assert_eq!(Value::String("42abc".into()).cast_to(Type::Integer).unwrap(), Value::Integer(42));
        assert_eq!(Value::String("0x1F".into()).cast_to(Type::Integer).unwrap(), Value::Integer(31));
        assert_eq!(Value::String("-7".into()).cast_to(Type::Integer).unwrap(), Value::Integer(-7));
        assert_eq!(Value::String("2.5e1z".into()).cast_to(Type::Float).unwrap(), Value::Float(25.0));
        assert_eq!(
            Value::String("<1, 2, 3>".into()).cast_to(Type::Vector).unwrap(),
            Value::Vector([1.0, 2.0, 3.0])
        );
        assert_eq!(
            Value::String("junk".into()).cast_to(Type::Rotation).unwrap(),
            Value::Rotation([0.0, 0.0, 0.0, 1.0])
        );
    }

    #[test]
    fn float_to_int_truncates_and_saturates_low() {
        assert_eq!(float_to_int(-2.9), -2);
        assert_eq!(float_to_int(1e20), i32::MIN);
        assert_eq!(float_to_int(f64::NAN), i32::MIN);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Key(NULL_KEY.into()).truthy());
        assert!(!Value::Key("not-a-key".into()).truthy());
        assert!(Value::Key("a2e76fcd-9360-4f6d-a924-000000000003".into()).truthy());
        assert!(!Value::Rotation([0.0, 0.0, 0.0, 1.0]).truthy());
        assert!(Value::List(vec![Value::Integer(0)]).truthy());
    }

    #[test]
    fn undef_object_cannot_be_cast() {
        assert!(matches!(Value::Undef.cast_to(Type::Integer), Err(RuntimeFault::BadCast { .. })));
        assert_eq!(Value::Integer(3).cast_to(Type::Object).unwrap(), Value::Integer(3));
        assert_eq!(Value::Integer(3).cast_to(Type::Float).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn arrays_keep_insertion_order_and_remove_on_undef() {
        let mut a = ScriptArray::default();
        a.set(&Value::String("b".into()), Value::Integer(1)).unwrap();
        a.set(&Value::Integer(7), Value::Integer(2)).unwrap();
        a.set(&Value::Float(0.5), Value::Integer(3)).unwrap();
        assert_eq!(a.key_at(1), Value::Integer(7));
        a.set(&Value::Integer(7), Value::Undef).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a.key_at(1), Value::Float(0.5));
        assert_eq!(a.get(&Value::Integer(7)).unwrap(), Value::Undef);
        assert_eq!(a.value_at(5), Value::Undef);
        assert!(a.set(&Value::List(vec![]), Value::Integer(1)).is_err());
    }
}
