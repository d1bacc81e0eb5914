use super::error::RuntimeFault;
use super::value::Value;
use crate::lsl::operators::BinEval;

type Vec3 = [f64; 3];
type Quat = [f64; 4];

/// Evaluate a binary operator on operands already coerced to the table's types.
pub fn binary(eval: BinEval, left: Value, right: Value) -> Result<Value, RuntimeFault> {
    use BinEval as E;

    Ok(match eval {
        E::LogicalAnd => Value::Bool(left.truthy() && right.truthy()),
        E::LogicalOr => Value::Bool(left.truthy() || right.truthy()),
        E::BoolAnd => Value::Bool(left.truthy() & right.truthy()),
        E::BoolOr => Value::Bool(left.truthy() | right.truthy()),
        E::BoolXor => Value::Bool(left.truthy() ^ right.truthy()),
        E::BoolEq => Value::Bool(left.truthy() == right.truthy()),
        E::BoolNe => Value::Bool(left.truthy() != right.truthy()),

        E::IntAdd
        | E::IntSub
        | E::IntMul
        | E::IntDiv
        | E::IntMod
        | E::IntAnd
        | E::IntOr
        | E::IntXor
        | E::IntShl
        | E::IntShr => Value::Integer(int_arith(eval, left.as_int(), right.as_int())?),
        E::IntEq => Value::Bool(left.as_int() == right.as_int()),
        E::IntNe => Value::Bool(left.as_int() != right.as_int()),
        E::IntLt => Value::Bool(left.as_int() < right.as_int()),
        E::IntLe => Value::Bool(left.as_int() <= right.as_int()),
        E::IntGt => Value::Bool(left.as_int() > right.as_int()),
        E::IntGe => Value::Bool(left.as_int() >= right.as_int()),

        E::FloatAdd => Value::Float(left.as_float() + right.as_float()),
        E::FloatSub => Value::Float(left.as_float() - right.as_float()),
        E::FloatMul => Value::Float(left.as_float() * right.as_float()),
        E::FloatDiv | E::FloatMod => {
            let r = right.as_float();
            if r == 0.0 {
                return Err(RuntimeFault::Math("division by zero"));
            }
            if eval == E::FloatDiv {
                Value::Float(left.as_float() / r)
            } else {
                Value::Float(left.as_float() % r)
            }
        }
        E::FloatEq => Value::Bool(left.as_float() == right.as_float()),
        E::FloatNe => Value::Bool(left.as_float() != right.as_float()),
        E::FloatLt => Value::Bool(left.as_float() < right.as_float()),
        E::FloatLe => Value::Bool(left.as_float() <= right.as_float()),
        E::FloatGt => Value::Bool(left.as_float() > right.as_float()),
        E::FloatGe => Value::Bool(left.as_float() >= right.as_float()),

        E::StrConcat => {
            let mut s = into_string(left);
            s.push_str(right.as_str());
            Value::String(s)
        }
        E::StrEq => Value::Bool(left.as_str() == right.as_str()),
        E::StrNe => Value::Bool(left.as_str() != right.as_str()),
        E::StrLt => Value::Bool(left.as_str() < right.as_str()),
        E::StrLe => Value::Bool(left.as_str() <= right.as_str()),
        E::StrGt => Value::Bool(left.as_str() > right.as_str()),
        E::StrGe => Value::Bool(left.as_str() >= right.as_str()),

        E::ListAppend => {
            let mut items = into_list(left);
            match right {
                Value::List(more) => items.extend(more),
                other => items.push(other),
            }
            Value::List(items)
        }
        E::ListPrepend => {
            let mut items = vec![left];
            items.extend(into_list(right));
            Value::List(items)
        }
        E::ListEq => Value::Bool(list_len(&left) == list_len(&right)),
        E::ListNe => Value::Bool(list_len(&left) != list_len(&right)),

        E::VecAdd => Value::Vector(zip3(vec3(&left), vec3(&right), |a, b| a + b)),
        E::VecSub => Value::Vector(zip3(vec3(&left), vec3(&right), |a, b| a - b)),
        E::VecEq => Value::Bool(vec3(&left) == vec3(&right)),
        E::VecNe => Value::Bool(vec3(&left) != vec3(&right)),
        E::VecDot => {
            let (a, b) = (vec3(&left), vec3(&right));
            Value::Float(a[0] * b[0] + a[1] * b[1] + a[2] * b[2])
        }
        E::VecCross => Value::Vector(cross(vec3(&left), vec3(&right))),
        E::VecScale => {
            let k = right.as_float();
            Value::Vector(vec3(&left).map(|c| c * k))
        }
        E::ScaleVec => {
            let k = left.as_float();
            Value::Vector(vec3(&right).map(|c| c * k))
        }
        E::VecDivScalar => {
            let k = right.as_float();
            if k == 0.0 {
                return Err(RuntimeFault::Math("division by zero"));
            }
            Value::Vector(vec3(&left).map(|c| c / k))
        }
        E::VecRotate => Value::Vector(rotate(vec3(&left), quat(&right))),
        E::VecUnrotate => Value::Vector(rotate(vec3(&left), conjugate(quat(&right)))),

        E::RotAdd => Value::Rotation(zip4(quat(&left), quat(&right), |a, b| a + b)),
        E::RotSub => Value::Rotation(zip4(quat(&left), quat(&right), |a, b| a - b)),
        // `a * b` applies `a` first, then `b`.
        E::RotMul => Value::Rotation(quat_mul(quat(&right), quat(&left))),
        E::RotDiv => Value::Rotation(quat_mul(conjugate(quat(&right)), quat(&left))),
        E::RotEq => Value::Bool(quat(&left) == quat(&right)),
        E::RotNe => Value::Bool(quat(&left) != quat(&right)),
    })
}

/// Wrapping 32-bit arithmetic; shift counts use only their low five bits.
fn int_arith(eval: BinEval, l: i32, r: i32) -> Result<i32, RuntimeFault> {
    use BinEval as E;

    Ok(match eval {
        E::IntAdd => l.wrapping_add(r),
        E::IntSub => l.wrapping_sub(r),
        E::IntMul => l.wrapping_mul(r),
        E::IntDiv | E::IntMod if r == 0 => return Err(RuntimeFault::Math("division by zero")),
        E::IntDiv => l.wrapping_div(r),
        E::IntMod => l.wrapping_rem(r),
        E::IntAnd => l & r,
        E::IntOr => l | r,
        E::IntXor => l ^ r,
        #[allow(clippy::cast_sign_loss)]
        E::IntShl => l.wrapping_shl(r as u32),
        #[allow(clippy::cast_sign_loss)]
        E::IntShr => l.wrapping_shr(r as u32),
        _ => return Err(RuntimeFault::CorruptBytecode(format!("{eval:?} is not integer arithmetic"))),
    })
}

pub fn negate(value: Value) -> Result<Value, RuntimeFault> {
    Ok(match value {
        Value::Integer(i) => Value::Integer(i.wrapping_neg()),
        Value::Float(f) => Value::Float(-f),
        Value::Vector(v) => Value::Vector(v.map(|c| -c)),
        Value::Rotation(r) => Value::Rotation(r.map(|c| -c)),
        other => {
            return Err(RuntimeFault::CorruptBytecode(format!(
                "cannot negate {}",
                other.ty()
            )))
        }
    })
}

fn into_string(value: Value) -> String {
    match value {
        Value::String(s) | Value::Key(s) => s,
        other => other.render(),
    }
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::List(items) => items,
        other => vec![other],
    }
}

fn list_len(value: &Value) -> usize {
    match value {
        Value::List(items) => items.len(),
        _ => 0,
    }
}

fn vec3(value: &Value) -> Vec3 {
    match value {
        Value::Vector(v) => *v,
        _ => [0.0; 3],
    }
}

fn quat(value: &Value) -> Quat {
    match value {
        Value::Rotation(r) => *r,
        _ => [0.0, 0.0, 0.0, 1.0],
    }
}

fn zip3(a: Vec3, b: Vec3, f: impl Fn(f64, f64) -> f64) -> Vec3 {
    [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2])]
}

fn zip4(a: Quat, b: Quat, f: impl Fn(f64, f64) -> f64) -> Quat {
    [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])]
}

fn cross([ax, ay, az]: Vec3, [bx, by, bz]: Vec3) -> Vec3 {
    [ay * bz - az * by, az * bx - ax * bz, ax * by - ay * bx]
}

fn conjugate([x, y, z, s]: Quat) -> Quat {
    [-x, -y, -z, s]
}

/// Hamilton product, `<x, y, z, s>` layout.
fn quat_mul([ax, ay, az, as_]: Quat, [bx, by, bz, bs]: Quat) -> Quat {
    [
        as_ * bx + ax * bs + ay * bz - az * by,
        as_ * by + ay * bs + az * bx - ax * bz,
        as_ * bz + az * bs + ax * by - ay * bx,
        as_ * bs - ax * bx - ay * by - az * bz,
    ]
}

fn rotate([x, y, z]: Vec3, r: Quat) -> Vec3 {
    let v = [x, y, z, 0.0];
    let out = quat_mul(quat_mul(r, v), conjugate(r));
    [out[0], out[1], out[2]]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn ints(eval: BinEval, l: i32, r: i32) -> Result<Value, RuntimeFault> {
        binary(eval, Value::Integer(l), Value::Integer(r))
    }

    fn close(a: Vec3, b: Vec3) -> bool {
        a.iter().zip(b).all(|(p, q)| (p - q).abs() < 1e-9)
    }

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(ints(BinEval::IntAdd, i32::MAX, 1).unwrap(), Value::Integer(i32::MIN));
        assert_eq!(ints(BinEval::IntDiv, i32::MIN, -1).unwrap(), Value::Integer(i32::MIN));
        assert_eq!(ints(BinEval::IntShl, 1, 33).unwrap(), Value::Integer(2));
        assert_eq!(ints(BinEval::IntShr, -8, 1).unwrap(), Value::Integer(-4));
        assert_eq!(ints(BinEval::IntMod, -7, 3).unwrap(), Value::Integer(-1));
    }

    #[test]
    fn division_by_zero_is_a_math_error() {
        assert_eq!(ints(BinEval::IntDiv, 1, 0), Err(RuntimeFault::Math("division by zero")));
        assert!(binary(BinEval::FloatDiv, Value::Float(1.0), Value::Float(0.0)).is_err());
        assert!(binary(BinEval::VecDivScalar, Value::Vector([1.0; 3]), Value::Float(0.0)).is_err());
    }

    #[test]
    fn list_equality_compares_length() {
        let a = Value::List(vec![Value::Integer(1), Value::Integer(2)]);
        let b = Value::List(vec![Value::String("x".into()), Value::Float(9.0)]);
        assert_eq!(binary(BinEval::ListEq, a.clone(), b).unwrap(), Value::Bool(true));
        assert_eq!(binary(BinEval::ListNe, a, Value::List(vec![])).unwrap(), Value::Bool(true));
    }

    #[test]
    fn list_append_and_prepend() {
        let list = Value::List(vec![Value::Integer(1)]);
        let appended = binary(BinEval::ListAppend, list.clone(), Value::Integer(2)).unwrap();
        assert_eq!(appended, Value::List(vec![Value::Integer(1), Value::Integer(2)]));
        let joined = binary(BinEval::ListAppend, list.clone(), list.clone()).unwrap();
        assert_eq!(joined, Value::List(vec![Value::Integer(1), Value::Integer(1)]));
        let prepended = binary(BinEval::ListPrepend, Value::String("a".into()), list).unwrap();
        assert_eq!(prepended, Value::List(vec![Value::String("a".into()), Value::Integer(1)]));
    }

    #[test]
    fn concatenation_of_keys_and_strings() {
        let out = binary(BinEval::StrConcat, Value::Key("k".into()), Value::String("s".into())).unwrap();
        assert_eq!(out, Value::String("ks".into()));
    }

    #[test]
    fn vector_products() {
        let x = Value::Vector([1.0, 0.0, 0.0]);
        let y = Value::Vector([0.0, 1.0, 0.0]);
        assert_eq!(binary(BinEval::VecCross, x.clone(), y.clone()).unwrap(), Value::Vector([0.0, 0.0, 1.0]));
        assert_eq!(binary(BinEval::VecDot, x, y).unwrap(), Value::Float(0.0));
    }

    #[test]
    fn rotation_round_trip() {
        let half = std::f64::consts::FRAC_PI_4;
        // 90 degrees about z.
        let rot = [0.0, 0.0, half.sin(), half.cos()];
        let v = [1.0, 0.0, 0.0];
        let turned = rotate(v, rot);
        assert!(close(turned, [0.0, 1.0, 0.0]), "{turned:?}");
        assert!(close(rotate(turned, conjugate(rot)), v));
    }

    #[test]
    fn rotation_products_apply_left_first() {
        let half = std::f64::consts::FRAC_PI_4;
        let about_z = Value::Rotation([0.0, 0.0, half.sin(), half.cos()]);
        let about_x = Value::Rotation([half.sin(), 0.0, 0.0, half.cos()]);
        let both = binary(BinEval::RotMul, about_z.clone(), about_x.clone()).unwrap();
        let v = Value::Vector([1.0, 0.0, 0.0]);
        let stepwise = binary(
            BinEval::VecRotate,
            binary(BinEval::VecRotate, v.clone(), about_z).unwrap(),
            about_x,
        )
        .unwrap();
        let direct = binary(BinEval::VecRotate, v, both).unwrap();
        let (Value::Vector(a), Value::Vector(b)) = (stepwise, direct) else {
            panic!("expected vectors");
        };
        assert!(close(a, b), "{a:?} vs {b:?}");
        assert!(close(a, [0.0, 0.0, 1.0]), "{a:?}");
    }
}
