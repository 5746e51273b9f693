//! The tagged `Value` union: nil, bool, int, float, interned string, and
//! native pointer, plus equality/print/numeric-coercion rules.

use std::fmt;

use crate::error::RuntimeError;
use crate::module::Module;

/// A handle to a native callable registered with a [`crate::vm::Context`].
/// Equality and printing only ever look at the pointer identity of the
/// function; the userdata payload is opaque to the VM.
#[derive(Clone, Copy)]
pub struct NativeHandle {
    pub ptr: usize,
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native@{:#x}>", self.ptr)
    }
}

impl PartialEq for NativeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

/// A tagged value on the VM's stack, in a global slot, or returned from a
/// native. `Str` holds a pool index rather than owned bytes: strings are
/// value-copied into the module's pool at load/assemble time, and a `Str`
/// value is only ever meaningful for as long as the module that produced it
/// is attached (see the execution-context lifecycle in the crate's design
/// notes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(u32),
    Native(NativeHandle),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Native(_) => "native",
        }
    }

    /// False iff `Nil`, `Bool(false)`, `Int(0)`, or `Float(0.0)`; true
    /// otherwise. Reserved for opcodes that may be added later (no
    /// mandatory opcode currently observes this).
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(_) | Value::Native(_) => true,
        }
    }

    pub fn as_int(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Ok(*f as i64),
            other => Err(RuntimeError::TypeMismatch {
                reason: format!("expected int-coercible value, found {}", other.type_name()),
            }),
        }
    }

    pub fn as_float(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(RuntimeError::TypeMismatch {
                reason: format!("expected float-coercible value, found {}", other.type_name()),
            }),
        }
    }

    /// Structural equality, with numeric promotion across `Int`/`Float` and
    /// content comparison for equal-index or equal-bytes strings. Any other
    /// cross-tag pair is unequal.
    pub fn value_eq(&self, other: &Value, module: &Module) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => {
                a == b
                    || match (module.string(*a), module.string(*b)) {
                        (Some(sa), Some(sb)) => sa.as_bytes() == sb.as_bytes(),
                        _ => false,
                    }
            }
            (Value::Native(a), Value::Native(b)) => a == b,
            _ => false,
        }
    }

    /// Deterministic textual rendering: `Nil -> "nil"`, booleans as
    /// `true`/`false`, ints as decimal, floats as `%.17g`-equivalent
    /// round-trip precision, strings as their raw (lossy-UTF8) bytes,
    /// natives as `<native@ptr>`.
    pub fn render(&self, module: &Module) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(idx) => module
                .string(*idx)
                .map(|s| s.to_display().into_owned())
                .unwrap_or_default(),
            Value::Native(h) => format!("{h:?}"),
        }
    }
}

/// Significant digits carried by `%.17g`.
const G_PRECISION: i32 = 17;

/// `%.17g` rendering: 17 significant decimal digits, `%e` style when the
/// decimal exponent is `< -4` or `>= 17` and `%f` style otherwise, with
/// trailing fractional zeros (and a bare trailing `.`) stripped exactly as
/// C's `%g` family does without the `#` flag.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0".to_string() } else { "0".to_string() };
    }

    let negative = f.is_sign_negative();
    let abs = f.abs();

    // 17 significant digits in scientific notation, e.g. "1.2345...e-5".
    let sci = format!("{:.*e}", (G_PRECISION - 1) as usize, abs);
    let (mantissa, exp_str) = sci.split_once('e').expect("LowerExp always emits an exponent");
    let exponent: i32 = exp_str.parse().expect("exponent is always a valid integer");
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    let body = if exponent < -4 || exponent >= G_PRECISION {
        let (lead, frac) = digits.split_at(1);
        let frac = frac.trim_end_matches('0');
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        let exp_abs = exponent.unsigned_abs();
        if frac.is_empty() {
            format!("{lead}e{exp_sign}{exp_abs:02}")
        } else {
            format!("{lead}.{frac}e{exp_sign}{exp_abs:02}")
        }
    } else if exponent >= 0 {
        let (int_part, frac_part) = digits.split_at((exponent + 1) as usize);
        let frac_part = frac_part.trim_end_matches('0');
        if frac_part.is_empty() {
            int_part.to_string()
        } else {
            format!("{int_part}.{frac_part}")
        }
    } else {
        let leading_zeros = "0".repeat((-exponent - 1) as usize);
        let frac_part = format!("{leading_zeros}{digits}");
        let frac_part = frac_part.trim_end_matches('0');
        if frac_part.is_empty() {
            "0".to_string()
        } else {
            format!("0.{frac_part}")
        }
    };

    if negative { format!("-{body}") } else { body }
}

/// Numeric promotion rule for binary arithmetic/comparison: widen to float
/// if either operand is a float, otherwise use integer arithmetic. `Bool`
/// and `Nil` are never valid arithmetic operands.
#[derive(Debug, Clone, Copy)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

pub fn coerce_pair(a: Value, b: Value) -> Result<(Numeric, Numeric), RuntimeError> {
    let needs_float = matches!(a, Value::Float(_)) || matches!(b, Value::Float(_));
    if needs_float {
        Ok((Numeric::Float(a.as_float()?), Numeric::Float(b.as_float()?)))
    } else {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok((Numeric::Int(x), Numeric::Int(y))),
            _ => Err(RuntimeError::TypeMismatch {
                reason: format!(
                    "arithmetic requires numeric operands, found {} and {}",
                    a.type_name(),
                    b.type_name()
                ),
            }),
        }
    }
}
