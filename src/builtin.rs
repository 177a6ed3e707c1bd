//! Module providing built-in operator methods for the primitive shapes.
//!
//! The standard library proper is external and registers its own methods,
//! but the core operators the parser lowers to method calls (`+`, `-`,
//! `<`, `##`, `join`, ...) must work on primitive values for the language
//! to function at all.  Method dispatch consults this table after the
//! receiver's own properties.

use crate::error::EvalError;
use crate::{known, Symbol, SymbolTable, Value};
use num_traits::ToPrimitive;

type BuiltinResult = Option<Result<Value, Box<EvalError>>>;

fn err(message: impl Into<String>) -> BuiltinResult {
    Some(Err(EvalError::raise(known::NATIVE_METHOD_ERROR, message)))
}

fn ok(value: Value) -> BuiltinResult {
    Some(Ok(value))
}

/// Integer values promoted to a common width for arithmetic.
enum Promoted {
    Int(i128, IntWidth),
    Float(f64, bool),
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum IntWidth {
    Byte,
    Int16,
    Int32,
    Int64,
    Int128,
}

fn promote(value: &Value) -> Option<(i128, IntWidth)> {
    match value {
        Value::Byte(n) => n.to_i128().map(|n| (n, IntWidth::Byte)),
        Value::Int16(n) => n.to_i128().map(|n| (n, IntWidth::Int16)),
        Value::Int32(n) => n.to_i128().map(|n| (n, IntWidth::Int32)),
        Value::Int64(n) => n.to_i128().map(|n| (n, IntWidth::Int64)),
        Value::Int128(n) => Some((*n, IntWidth::Int128)),
        _ => None,
    }
}

fn promote_float(value: &Value) -> Option<(f64, bool)> {
    match value {
        Value::Float32(n) => Some((*n as f64, true)),
        Value::Float64(n) => Some((*n, false)),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<Promoted> {
    if let Some((n, width)) = promote(value) {
        return Some(Promoted::Int(n, width));
    }
    promote_float(value).map(|(n, single)| Promoted::Float(n, single))
}

fn demote(value: i128, width: IntWidth) -> BuiltinResult {
    match width {
        IntWidth::Byte => match value.to_u8() {
            Some(n) => ok(Value::Byte(n)),
            None => err("Byte arithmetic overflowed"),
        },
        IntWidth::Int16 => match value.to_i16() {
            Some(n) => ok(Value::Int16(n)),
            None => err("Integer16 arithmetic overflowed"),
        },
        IntWidth::Int32 => match value.to_i32() {
            Some(n) => ok(Value::Int32(n)),
            None => err("Integer32 arithmetic overflowed"),
        },
        IntWidth::Int64 => match value.to_i64() {
            Some(n) => ok(Value::Int64(n)),
            None => err("Integer64 arithmetic overflowed"),
        },
        IntWidth::Int128 => ok(Value::Int128(value)),
    }
}

fn refloat(value: f64, single: bool) -> Value {
    if single {
        Value::Float32(value as f32)
    } else {
        Value::Float64(value)
    }
}

/// Look up a built-in binary method.  Returns [`None`] when there is no
/// built-in for this operator/receiver combination.
pub(crate) fn binary_op(
    op: Symbol,
    lhs: &Value,
    rhs: &Value,
    symbols: &SymbolTable,
) -> BuiltinResult {
    // The cons operator works on every pair of values.
    if op == known::CONS_OP {
        return ok(Value::cons(lhs.clone(), rhs.clone()));
    }

    // Equality works on every pair of values.
    if op == known::EQUALS {
        return ok(Value::Bool(values_equal(lhs, rhs)));
    }
    if op == known::NOT_EQUALS {
        return ok(Value::Bool(!values_equal(lhs, rhs)));
    }

    // String operators.
    if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
        return match op {
            known::PLUS => {
                let mut text = String::with_capacity(a.len() + b.len());
                text.push_str(a);
                text.push_str(b);
                ok(Value::Str(text.into()))
            }
            known::LT => ok(Value::Bool(a < b)),
            known::GT => ok(Value::Bool(a > b)),
            known::LE => ok(Value::Bool(a <= b)),
            known::GE => ok(Value::Bool(a >= b)),
            _ => None,
        };
    }

    // Numeric operators, promoting to the wider operand.
    match (numeric(lhs), numeric(rhs)) {
        (Some(Promoted::Int(a, wa)), Some(Promoted::Int(b, wb))) => {
            let width = if wa >= wb { wa } else { wb };
            match op {
                known::PLUS => match a.checked_add(b) {
                    Some(n) => demote(n, width),
                    None => err("Integer arithmetic overflowed"),
                },
                known::MINUS => match a.checked_sub(b) {
                    Some(n) => demote(n, width),
                    None => err("Integer arithmetic overflowed"),
                },
                known::STAR => match a.checked_mul(b) {
                    Some(n) => demote(n, width),
                    None => err("Integer arithmetic overflowed"),
                },
                known::SLASH => {
                    if b == 0 {
                        err("Division by zero")
                    } else {
                        demote(a / b, width)
                    }
                }
                known::LT => ok(Value::Bool(a < b)),
                known::GT => ok(Value::Bool(a > b)),
                known::LE => ok(Value::Bool(a <= b)),
                known::GE => ok(Value::Bool(a >= b)),
                known::RANGE => range_list(a, b),
                _ => None,
            }
        }
        (Some(Promoted::Float(a, sa)), Some(Promoted::Float(b, sb))) => {
            let single = sa && sb;
            match op {
                known::PLUS => ok(refloat(a + b, single)),
                known::MINUS => ok(refloat(a - b, single)),
                known::STAR => ok(refloat(a * b, single)),
                known::SLASH => {
                    if b == 0.0 {
                        err("Division by zero")
                    } else {
                        ok(refloat(a / b, single))
                    }
                }
                known::LT => ok(Value::Bool(a < b)),
                known::GT => ok(Value::Bool(a > b)),
                known::LE => ok(Value::Bool(a <= b)),
                known::GE => ok(Value::Bool(a >= b)),
                _ => None,
            }
        }
        (Some(_), Some(_)) => err(format!(
            "Cannot mix integer and floating-point operands of '{}'",
            symbols.name(op)
        )),
        _ => None,
    }
}

/// `a..b` builds the inclusive list of integers from a to b.
fn range_list(a: i128, b: i128) -> BuiltinResult {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    if high - low > 1_000_000 {
        return err("Range is too large");
    }
    let mut items: Vec<Value> = (low..=high).map(|n| Value::Int64(n as i64)).collect();
    if a > b {
        items.reverse();
    }
    ok(Value::list(items))
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    // Numeric equality ignores width; everything else is structural.
    match (numeric(lhs), numeric(rhs)) {
        (Some(Promoted::Int(a, _)), Some(Promoted::Int(b, _))) => a == b,
        (Some(Promoted::Float(a, _)), Some(Promoted::Float(b, _))) => a == b,
        (Some(Promoted::Int(a, _)), Some(Promoted::Float(b, _))) => (a as f64) == b,
        (Some(Promoted::Float(a, _)), Some(Promoted::Int(b, _))) => a == (b as f64),
        _ => lhs == rhs,
    }
}

/// Look up a built-in unary method (a prefix operator applied as a
/// zero-argument method call).
pub(crate) fn unary_op(op: Symbol, operand: &Value, symbols: &SymbolTable) -> BuiltinResult {
    match op {
        known::MINUS => match operand {
            Value::Byte(_) => err("Cannot negate a byte"),
            Value::Int16(n) => ok(Value::Int16(-n)),
            Value::Int32(n) => ok(Value::Int32(-n)),
            Value::Int64(n) => ok(Value::Int64(-n)),
            Value::Int128(n) => ok(Value::Int128(-n)),
            Value::Float32(n) => ok(Value::Float32(-n)),
            Value::Float64(n) => ok(Value::Float64(-n)),
            _ => None,
        },
        known::PLUS => match operand {
            Value::Byte(_)
            | Value::Int16(_)
            | Value::Int32(_)
            | Value::Int64(_)
            | Value::Int128(_)
            | Value::Float32(_)
            | Value::Float64(_) => ok(operand.clone()),
            _ => None,
        },
        known::JOIN => match operand {
            // Joining a list renders each element and concatenates.
            Value::Null => ok(Value::Str("".into())),
            Value::List(_) => {
                let mut text = String::new();
                for element in operand.iter_list() {
                    text.push_str(&element.to_display(symbols));
                }
                ok(Value::Str(text.into()))
            }
            _ => None,
        },
        known::LENGTH | known::COUNT => match operand {
            Value::Str(s) => ok(Value::Int64(s.len() as i64)),
            Value::Null => ok(Value::Int64(0)),
            Value::List(_) => match operand.list_len() {
                Some(n) => ok(Value::Int64(n as i64)),
                None => err("Cannot take the length of an improper list"),
            },
            _ => None,
        },
        _ => None,
    }
}
