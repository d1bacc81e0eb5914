use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use super::ast::BinOp;
use super::types::Type;

/// Binding strength of `,` in argument and `for` clause lists.
pub const COMMA_PRECEDENCE: u32 = 30;
/// Binding strength of `=` and the compound assignments.
pub const ASSIGN_PRECEDENCE: u32 = 50;

static PRECEDENCE: LazyLock<HashMap<&'static str, u32>> = LazyLock::new(|| {
    let mut table = HashMap::new();
    table.insert(",", COMMA_PRECEDENCE);
    for op in ["=", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "<<=", ">>="] {
        table.insert(op, ASSIGN_PRECEDENCE);
    }
    let levels: &[(&[&str], u32)] = &[
        (&["||"], 100),
        (&["&&"], 120),
        (&["|"], 140),
        (&["^"], 160),
        (&["&"], 180),
        (&["==", "!="], 200),
        (&["<", "<=", ">", ">="], 240),
        (&["<<", ">>"], 260),
        (&["+", "-"], 280),
        (&["*", "/", "%"], 320),
    ];
    for &(ops, prec) in levels {
        for &op in ops {
            table.insert(op, prec);
        }
    }
    table
});

/// Binding strength of an operator spelling. Higher binds tighter.
pub fn precedence(symbol: &str) -> Option<u32> {
    PRECEDENCE.get(symbol).copied()
}

/// Concrete evaluation selected for a `(left, op, right)` triple.
///
/// Operands are already coerced to the entry's operand types when these run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinEval {
    // Truthiness; both operands are always evaluated.
    LogicalAnd,
    LogicalOr,

    BoolAnd,
    BoolOr,
    BoolXor,
    BoolEq,
    BoolNe,

    IntAdd,
    IntSub,
    IntMul,
    IntDiv,
    IntMod,
    IntAnd,
    IntOr,
    IntXor,
    IntShl,
    IntShr,
    IntEq,
    IntNe,
    IntLt,
    IntLe,
    IntGt,
    IntGe,

    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
    FloatMod,
    FloatEq,
    FloatNe,
    FloatLt,
    FloatLe,
    FloatGt,
    FloatGe,

    StrConcat,
    StrEq,
    StrNe,
    StrLt,
    StrLe,
    StrGt,
    StrGe,

    /// `list + x`: concatenates lists, appends anything else.
    ListAppend,
    /// `x + list`.
    ListPrepend,
    /// Lists compare by length only.
    ListEq,
    ListNe,

    VecAdd,
    VecSub,
    VecEq,
    VecNe,
    VecDot,
    VecCross,
    VecScale,
    ScaleVec,
    VecDivScalar,
    VecRotate,
    VecUnrotate,

    RotAdd,
    RotSub,
    RotMul,
    RotDiv,
    RotEq,
    RotNe,
}

/// One row of the binary operator table.
#[derive(Debug, Clone, Copy)]
pub struct BinOpEntry {
    pub result: Type,
    /// Type the left operand is coerced to before evaluation.
    pub left: Type,
    /// Type the right operand is coerced to before evaluation.
    pub right: Type,
    pub eval: BinEval,
    /// Usable as `left op= right`.
    pub assignable: bool,
}

struct TableBuilder(HashMap<(Type, BinOp, Type), BinOpEntry>);

impl TableBuilder {
    fn insert(&mut self, key: (Type, BinOp, Type), operands: (Type, Type), result: Type, eval: BinEval, assignable: bool) {
        self.0.insert(
            key,
            BinOpEntry {
                result,
                left: operands.0,
                right: operands.1,
                eval,
                assignable,
            },
        );
    }

    fn add(&mut self, key: (Type, BinOp, Type), operands: (Type, Type), result: Type, eval: BinEval) {
        self.insert(key, operands, result, eval, false);
    }

    /// Also valid as `left op= right`.
    fn add_rmw(&mut self, key: (Type, BinOp, Type), operands: (Type, Type), result: Type, eval: BinEval) {
        self.insert(key, operands, result, eval, true);
    }

    /// Operands used as-is.
    fn same(&mut self, l: Type, op: BinOp, r: Type, result: Type, eval: BinEval) {
        self.add((l, op, r), (l, r), result, eval);
    }

    fn same_rmw(&mut self, l: Type, op: BinOp, r: Type, result: Type, eval: BinEval) {
        self.add_rmw((l, op, r), (l, r), result, eval);
    }
}

const TRUTHY: &[Type] = &[Type::Bool, Type::Float, Type::Integer, Type::Key, Type::List, Type::String];
const NUMERIC: &[Type] = &[Type::Float, Type::Integer];

static BINOPS: LazyLock<HashMap<(Type, BinOp, Type), BinOpEntry>> = LazyLock::new(|| {
    use BinEval as E;
    use BinOp as O;
    use Type as T;

    let mut t = TableBuilder(HashMap::new());

    // ── Logical ──
    for &l in TRUTHY {
        for &r in TRUTHY {
            t.same(l, O::And, r, T::Bool, E::LogicalAnd);
            t.same(l, O::Or, r, T::Bool, E::LogicalOr);
        }
    }

    // ── Bool with anything truth-convertible ──
    let bool_ops = [
        (O::BitOr, E::BoolOr),
        (O::BitXor, E::BoolXor),
        (O::BitAnd, E::BoolAnd),
        (O::Eq, E::BoolEq),
        (O::Ne, E::BoolNe),
    ];
    for &x in TRUTHY {
        for (op, eval) in bool_ops {
            t.add((T::Bool, op, x), (T::Bool, T::Bool), T::Bool, eval);
            t.add((x, op, T::Bool), (T::Bool, T::Bool), T::Bool, eval);
        }
    }

    // ── Numeric ──
    let float_cmp = [
        (O::Eq, E::FloatEq),
        (O::Ne, E::FloatNe),
        (O::Lt, E::FloatLt),
        (O::Le, E::FloatLe),
        (O::Gt, E::FloatGt),
        (O::Ge, E::FloatGe),
    ];
    let float_arith = [
        (O::Add, E::FloatAdd),
        (O::Sub, E::FloatSub),
        (O::Mul, E::FloatMul),
        (O::Div, E::FloatDiv),
        (O::Mod, E::FloatMod),
    ];
    for (l, r) in [(T::Float, T::Float), (T::Float, T::Integer), (T::Integer, T::Float)] {
        for (op, eval) in float_cmp {
            t.add((l, op, r), (T::Float, T::Float), T::Bool, eval);
        }
        for (op, eval) in float_arith {
            t.add_rmw((l, op, r), (T::Float, T::Float), T::Float, eval);
        }
    }

    let int_cmp = [
        (O::Eq, E::IntEq),
        (O::Ne, E::IntNe),
        (O::Lt, E::IntLt),
        (O::Le, E::IntLe),
        (O::Gt, E::IntGt),
        (O::Ge, E::IntGe),
    ];
    for (op, eval) in int_cmp {
        t.same(T::Integer, op, T::Integer, T::Bool, eval);
    }
    let int_arith = [
        (O::BitOr, E::IntOr),
        (O::BitXor, E::IntXor),
        (O::BitAnd, E::IntAnd),
        (O::Add, E::IntAdd),
        (O::Sub, E::IntSub),
        (O::Mul, E::IntMul),
        (O::Div, E::IntDiv),
        (O::Mod, E::IntMod),
        (O::Shl, E::IntShl),
        (O::Shr, E::IntShr),
    ];
    for (op, eval) in int_arith {
        t.same_rmw(T::Integer, op, T::Integer, T::Integer, eval);
    }

    // ── Keys and strings ──
    for (l, r) in [(T::Key, T::Key), (T::Key, T::String), (T::String, T::Key)] {
        t.add((l, O::Eq, r), (T::String, T::String), T::Bool, E::StrEq);
        t.add((l, O::Ne, r), (T::String, T::String), T::Bool, E::StrNe);
    }
    let str_cmp = [
        (O::Eq, E::StrEq),
        (O::Ne, E::StrNe),
        (O::Lt, E::StrLt),
        (O::Le, E::StrLe),
        (O::Gt, E::StrGt),
        (O::Ge, E::StrGe),
    ];
    for (op, eval) in str_cmp {
        t.same(T::String, op, T::String, T::Bool, eval);
    }
    t.same_rmw(T::String, O::Add, T::String, T::String, E::StrConcat);
    for x in [T::Bool, T::Float, T::Integer] {
        t.add((x, O::Add, T::String), (T::String, T::String), T::String, E::StrConcat);
        t.add((T::String, O::Add, x), (T::String, T::String), T::String, E::StrConcat);
    }

    // ── Lists ──
    for x in [T::Float, T::Integer, T::Key, T::List, T::Rotation, T::String, T::Vector] {
        t.same_rmw(T::List, O::Add, x, T::List, E::ListAppend);
        if x != T::List {
            t.same(x, O::Add, T::List, T::List, E::ListPrepend);
        }
    }
    t.same(T::List, O::Eq, T::List, T::Bool, E::ListEq);
    t.same(T::List, O::Ne, T::List, T::Bool, E::ListNe);

    // ── Rotations ──
    t.same(T::Rotation, O::Eq, T::Rotation, T::Bool, E::RotEq);
    t.same(T::Rotation, O::Ne, T::Rotation, T::Bool, E::RotNe);
    t.same_rmw(T::Rotation, O::Add, T::Rotation, T::Rotation, E::RotAdd);
    t.same_rmw(T::Rotation, O::Sub, T::Rotation, T::Rotation, E::RotSub);
    t.same_rmw(T::Rotation, O::Mul, T::Rotation, T::Rotation, E::RotMul);
    t.same_rmw(T::Rotation, O::Div, T::Rotation, T::Rotation, E::RotDiv);

    // ── Vectors ──
    t.same(T::Vector, O::Eq, T::Vector, T::Bool, E::VecEq);
    t.same(T::Vector, O::Ne, T::Vector, T::Bool, E::VecNe);
    t.same_rmw(T::Vector, O::Add, T::Vector, T::Vector, E::VecAdd);
    t.same_rmw(T::Vector, O::Sub, T::Vector, T::Vector, E::VecSub);
    t.same(T::Vector, O::Mul, T::Vector, T::Float, E::VecDot);
    t.same_rmw(T::Vector, O::Mod, T::Vector, T::Vector, E::VecCross);
    for &n in NUMERIC {
        t.add_rmw((T::Vector, O::Mul, n), (T::Vector, T::Float), T::Vector, E::VecScale);
        t.add_rmw((T::Vector, O::Div, n), (T::Vector, T::Float), T::Vector, E::VecDivScalar);
        t.add((n, O::Mul, T::Vector), (T::Float, T::Vector), T::Vector, E::ScaleVec);
    }
    t.same_rmw(T::Vector, O::Mul, T::Rotation, T::Vector, E::VecRotate);
    t.same_rmw(T::Vector, O::Div, T::Rotation, T::Vector, E::VecUnrotate);

    t.0
});

/// Find the table entry for `left op right`.
///
/// A `bool` operand with no direct entry is retried as `integer`, so
/// comparison results can take part in arithmetic.
pub fn lookup(left: Type, op: BinOp, right: Type) -> Option<&'static BinOpEntry> {
    let table: &'static HashMap<_, _> = &BINOPS;
    if let Some(entry) = table.get(&(left, op, right)) {
        return Some(entry);
    }
    let widen = |t: Type| if t == Type::Bool { Type::Integer } else { t };
    let (l, r) = (widen(left), widen(right));
    if (l, r) == (left, right) {
        return None;
    }
    table.get(&(l, op, r))
}
