//! `conv.*`, `conv.ovf.*` and `ckfinite`.

use crate::{ArithmeticError, PrimitiveKind, StackValue};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Check {
    Unchecked,
    /// `conv.ovf.<to>`: source read as signed
    Checked,
    /// `conv.ovf.<to>.un`: source read as unsigned
    CheckedUnsigned,
}

#[derive(Copy, Clone)]
enum Source {
    Integer(i128),
    Float(f64),
}

fn source(value: StackValue, unsigned: bool) -> Result<Source, ArithmeticError> {
    Ok(match value {
        StackValue::Int32(v) if unsigned => Source::Integer(v as u32 as i128),
        StackValue::Int32(v) => Source::Integer(v as i128),
        StackValue::Int64(v) if unsigned => Source::Integer(v as u64 as i128),
        StackValue::Int64(v) => Source::Integer(v as i128),
        StackValue::NativeInt(v) if unsigned => Source::Integer(v as usize as i128),
        StackValue::NativeInt(v) => Source::Integer(v as i128),
        StackValue::ByRef(p) => Source::Integer(p as usize as i128),
        StackValue::Object(o) => Source::Integer(o.address() as i128),
        StackValue::Double(v) => Source::Float(v),
        StackValue::ValueType(..) => return Err(ArithmeticError::InvalidOperands),
    })
}

macro_rules! narrow {
    ($source:expr, $check:expr, $ty:ty) => {
        match ($source, $check) {
            (Source::Integer(v), Check::Unchecked) => Ok(v as $ty),
            (Source::Float(v), Check::Unchecked) => Ok(v as $ty),
            (Source::Integer(v), _) => {
                <$ty>::try_from(v).map_err(|_| ArithmeticError::Overflow)
            }
            (Source::Float(v), _) => {
                if !v.is_finite() {
                    return Err(ArithmeticError::Overflow);
                }
                <$ty>::try_from(v.trunc() as i128).map_err(|_| ArithmeticError::Overflow)
            }
        }
    };
}

/// Converts `value` to the primitive `target`, widening the result back to
/// its evaluation-stack kind. Unchecked float to integer conversions
/// saturate.
pub fn convert(
    value: StackValue,
    target: PrimitiveKind,
    check: Check,
) -> Result<StackValue, ArithmeticError> {
    // int32 zero-extends into the unsigned 64-bit and native targets
    let zero_extend =
        check == Check::Unchecked && matches!(target, PrimitiveKind::U8 | PrimitiveKind::U);
    let from = source(value, zero_extend || check == Check::CheckedUnsigned)?;
    Ok(match target {
        PrimitiveKind::I1 => StackValue::Int32(narrow!(from, check, i8)? as i32),
        PrimitiveKind::U1 | PrimitiveKind::Boolean => {
            StackValue::Int32(narrow!(from, check, u8)? as i32)
        }
        PrimitiveKind::I2 => StackValue::Int32(narrow!(from, check, i16)? as i32),
        PrimitiveKind::U2 | PrimitiveKind::Char => {
            StackValue::Int32(narrow!(from, check, u16)? as i32)
        }
        PrimitiveKind::I4 => StackValue::Int32(narrow!(from, check, i32)?),
        PrimitiveKind::U4 => StackValue::Int32(narrow!(from, check, u32)? as i32),
        PrimitiveKind::I8 => StackValue::Int64(narrow!(from, check, i64)?),
        PrimitiveKind::U8 => StackValue::Int64(narrow!(from, check, u64)? as i64),
        PrimitiveKind::I => StackValue::NativeInt(narrow!(from, check, isize)?),
        PrimitiveKind::U => StackValue::NativeInt(narrow!(from, check, usize)? as isize),
        PrimitiveKind::R4 => StackValue::Double(match from {
            Source::Integer(v) => v as f32 as f64,
            Source::Float(v) => v as f32 as f64,
        }),
        PrimitiveKind::R8 => StackValue::Double(match from {
            Source::Integer(v) => v as f64,
            Source::Float(v) => v,
        }),
    })
}

/// `conv.r.un`: integer read as unsigned, to float.
pub fn to_float_unsigned(value: StackValue) -> Result<StackValue, ArithmeticError> {
    match source(value, true)? {
        Source::Integer(v) => Ok(StackValue::Double(v as f64)),
        Source::Float(v) => Ok(StackValue::Double(v)),
    }
}

pub fn check_finite(value: StackValue) -> Result<StackValue, ArithmeticError> {
    match value {
        StackValue::Double(v) if v.is_finite() => Ok(value),
        StackValue::Double(_) => Err(ArithmeticError::NotFinite),
        _ => Err(ArithmeticError::InvalidOperands),
    }
}
