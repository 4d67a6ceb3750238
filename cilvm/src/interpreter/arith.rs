//! Numeric semantics of the arithmetic, bitwise, shift and comparison
//! instructions. The operand kinds alone select the operation: the wider
//! integer kind wins, managed pointers combine with integers into managed
//! pointers.

use crate::{ArithmeticError, StackValue};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
}

/// Overflow checking of `add`, `sub` and `mul`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Overflow {
    Wrap,
    Signed,
    Unsigned,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    ShrUn,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gt,
    /// greater, or unordered for floats
    GtUn,
    Lt,
    /// less, or unordered for floats
    LtUn,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Operands {
    Int32(i32, i32),
    Int64(i64, i64),
    Native(isize, isize),
    Float(f64, f64),
}

fn integer_rank(value: &StackValue) -> Option<u8> {
    match value {
        StackValue::Int32(_) => Some(0),
        StackValue::NativeInt(_) => Some(1),
        StackValue::Int64(_) => Some(2),
        _ => None,
    }
}

fn integer_as_f64(value: StackValue) -> Option<f64> {
    match value {
        StackValue::Int32(v) => Some(v as f64),
        StackValue::Int64(v) => Some(v as f64),
        StackValue::NativeInt(v) => Some(v as f64),
        _ => None,
    }
}

fn promote(a: StackValue, b: StackValue) -> Result<Operands, ArithmeticError> {
    use StackValue::*;
    let invalid = ArithmeticError::InvalidOperands;
    match (a, b) {
        (Double(x), Double(y)) => return Ok(Operands::Float(x, y)),
        (Double(x), other) => {
            return integer_as_f64(other).map(|y| Operands::Float(x, y)).ok_or(invalid);
        }
        (other, Double(y)) => {
            return integer_as_f64(other).map(|x| Operands::Float(x, y)).ok_or(invalid);
        }
        _ => {}
    }
    let rank = integer_rank(&a).zip(integer_rank(&b)).ok_or(invalid)?;
    let (x, y) = (a.as_i64().map_err(|_| invalid)?, b.as_i64().map_err(|_| invalid)?);
    Ok(match rank.0.max(rank.1) {
        0 => Operands::Int32(x as i32, y as i32),
        1 => Operands::Native(x as isize, y as isize),
        _ => Operands::Int64(x, y),
    })
}

/// Address of a managed pointer or object reference.
fn address(value: StackValue) -> Option<usize> {
    match value {
        StackValue::ByRef(pointer) => Some(pointer as usize),
        StackValue::Object(object) => Some(object.address()),
        _ => None,
    }
}

fn offset(value: StackValue) -> Option<isize> {
    match value {
        StackValue::Int32(v) => Some(v as isize),
        StackValue::NativeInt(v) => Some(v),
        _ => None,
    }
}

fn pointer_arithmetic(
    op: BinaryOp,
    a: StackValue,
    b: StackValue,
) -> Option<Result<StackValue, ArithmeticError>> {
    let moved = match (address(a), address(b), op) {
        (None, None, _) => return None,
        (Some(p), Some(q), BinaryOp::Sub) => {
            return Some(Ok(StackValue::NativeInt(p.wrapping_sub(q) as isize)));
        }
        (Some(p), None, BinaryOp::Add) => offset(b).map(|n| p.wrapping_add_signed(n)),
        (None, Some(p), BinaryOp::Add) => offset(a).map(|n| p.wrapping_add_signed(n)),
        (Some(p), None, BinaryOp::Sub) => {
            offset(b).map(|n| p.wrapping_add_signed(n.wrapping_neg()))
        }
        _ => None,
    };
    Some(
        moved
            .map(|p| StackValue::ByRef(p as *mut u8))
            .ok_or(ArithmeticError::InvalidOperands),
    )
}

macro_rules! integer_binary {
    ($op:expr, $overflow:expr, $a:expr, $b:expr, $unsigned:ty) => {{
        let (a, b) = ($a, $b);
        let (ua, ub) = (a as $unsigned, b as $unsigned);
        let overflow = ArithmeticError::Overflow;
        let divide_by_zero = ArithmeticError::DivideByZero;
        match ($op, $overflow) {
            (BinaryOp::Add, Overflow::Wrap) => Ok(a.wrapping_add(b)),
            (BinaryOp::Add, Overflow::Signed) => a.checked_add(b).ok_or(overflow),
            (BinaryOp::Add, Overflow::Unsigned) => {
                ua.checked_add(ub).map(|v| v as _).ok_or(overflow)
            }
            (BinaryOp::Sub, Overflow::Wrap) => Ok(a.wrapping_sub(b)),
            (BinaryOp::Sub, Overflow::Signed) => a.checked_sub(b).ok_or(overflow),
            (BinaryOp::Sub, Overflow::Unsigned) => {
                ua.checked_sub(ub).map(|v| v as _).ok_or(overflow)
            }
            (BinaryOp::Mul, Overflow::Wrap) => Ok(a.wrapping_mul(b)),
            (BinaryOp::Mul, Overflow::Signed) => a.checked_mul(b).ok_or(overflow),
            (BinaryOp::Mul, Overflow::Unsigned) => {
                ua.checked_mul(ub).map(|v| v as _).ok_or(overflow)
            }
            (BinaryOp::Div, _) if b == 0 => Err(divide_by_zero),
            (BinaryOp::Div, _) => a.checked_div(b).ok_or(overflow),
            (BinaryOp::DivUn, _) if b == 0 => Err(divide_by_zero),
            (BinaryOp::DivUn, _) => Ok((ua / ub) as _),
            (BinaryOp::Rem, _) if b == 0 => Err(divide_by_zero),
            (BinaryOp::Rem, _) => a.checked_rem(b).ok_or(overflow),
            (BinaryOp::RemUn, _) if b == 0 => Err(divide_by_zero),
            (BinaryOp::RemUn, _) => Ok((ua % ub) as _),
            (BinaryOp::And, _) => Ok(a & b),
            (BinaryOp::Or, _) => Ok(a | b),
            (BinaryOp::Xor, _) => Ok(a ^ b),
        }
    }};
}

pub fn binary(
    op: BinaryOp,
    a: StackValue,
    b: StackValue,
    overflow: Overflow,
) -> Result<StackValue, ArithmeticError> {
    if let Some(result) = pointer_arithmetic(op, a, b) {
        return result;
    }
    match promote(a, b)? {
        Operands::Int32(x, y) => {
            integer_binary!(op, overflow, x, y, u32).map(StackValue::Int32)
        }
        Operands::Int64(x, y) => {
            integer_binary!(op, overflow, x, y, u64).map(StackValue::Int64)
        }
        Operands::Native(x, y) => {
            integer_binary!(op, overflow, x, y, usize).map(StackValue::NativeInt)
        }
        Operands::Float(x, y) => {
            let result = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Rem => x % y,
                _ => return Err(ArithmeticError::InvalidOperands),
            };
            Ok(StackValue::Double(result))
        }
    }
}

pub fn negate(value: StackValue) -> Result<StackValue, ArithmeticError> {
    Ok(match value {
        StackValue::Int32(v) => StackValue::Int32(v.wrapping_neg()),
        StackValue::Int64(v) => StackValue::Int64(v.wrapping_neg()),
        StackValue::NativeInt(v) => StackValue::NativeInt(v.wrapping_neg()),
        StackValue::Double(v) => StackValue::Double(-v),
        _ => return Err(ArithmeticError::InvalidOperands),
    })
}

pub fn not(value: StackValue) -> Result<StackValue, ArithmeticError> {
    Ok(match value {
        StackValue::Int32(v) => StackValue::Int32(!v),
        StackValue::Int64(v) => StackValue::Int64(!v),
        StackValue::NativeInt(v) => StackValue::NativeInt(!v),
        _ => return Err(ArithmeticError::InvalidOperands),
    })
}

/// Shifts `value` by `amount` masked to the width of `value`.
pub fn shift(
    op: ShiftOp,
    value: StackValue,
    amount: StackValue,
) -> Result<StackValue, ArithmeticError> {
    let amount = offset(amount).ok_or(ArithmeticError::InvalidOperands)? as u32;
    Ok(match value {
        StackValue::Int32(v) => StackValue::Int32(match op {
            ShiftOp::Shl => v.wrapping_shl(amount),
            ShiftOp::Shr => v.wrapping_shr(amount),
            ShiftOp::ShrUn => (v as u32).wrapping_shr(amount) as i32,
        }),
        StackValue::Int64(v) => StackValue::Int64(match op {
            ShiftOp::Shl => v.wrapping_shl(amount),
            ShiftOp::Shr => v.wrapping_shr(amount),
            ShiftOp::ShrUn => (v as u64).wrapping_shr(amount) as i64,
        }),
        StackValue::NativeInt(v) => StackValue::NativeInt(match op {
            ShiftOp::Shl => v.wrapping_shl(amount),
            ShiftOp::Shr => v.wrapping_shr(amount),
            ShiftOp::ShrUn => (v as usize).wrapping_shr(amount) as isize,
        }),
        _ => return Err(ArithmeticError::InvalidOperands),
    })
}

fn integer_compare(cmp: Comparison, signed: (i64, i64), unsigned: (u64, u64)) -> bool {
    match cmp {
        Comparison::Eq => signed.0 == signed.1,
        Comparison::Gt => signed.0 > signed.1,
        Comparison::Lt => signed.0 < signed.1,
        Comparison::GtUn => unsigned.0 > unsigned.1,
        Comparison::LtUn => unsigned.0 < unsigned.1,
    }
}

/// Evaluates `a cmp b`. References compare by address, so `cgt.un` of an
/// object against null tests for non-null.
pub fn compare(
    cmp: Comparison,
    a: StackValue,
    b: StackValue,
) -> Result<bool, ArithmeticError> {
    let is_reference =
        |v: &StackValue| matches!(v, StackValue::Object(_) | StackValue::ByRef(_));
    if is_reference(&a) || is_reference(&b) {
        let as_address = |v: StackValue| address(v).or_else(|| offset(v).map(|n| n as usize));
        let (Some(x), Some(y)) = (as_address(a), as_address(b)) else {
            return Err(ArithmeticError::InvalidOperands);
        };
        return Ok(match cmp {
            Comparison::Eq => x == y,
            Comparison::Gt | Comparison::GtUn => x > y,
            Comparison::Lt | Comparison::LtUn => x < y,
        });
    }
    Ok(match promote(a, b)? {
        Operands::Int32(x, y) => integer_compare(
            cmp,
            (x as i64, y as i64),
            (x as u32 as u64, y as u32 as u64),
        ),
        Operands::Int64(x, y) => integer_compare(cmp, (x, y), (x as u64, y as u64)),
        Operands::Native(x, y) => integer_compare(
            cmp,
            (x as i64, y as i64),
            (x as usize as u64, y as usize as u64),
        ),
        Operands::Float(x, y) => {
            let unordered = x.is_nan() || y.is_nan();
            match cmp {
                Comparison::Eq => x == y,
                Comparison::Gt => x > y,
                Comparison::Lt => x < y,
                Comparison::GtUn => unordered || x > y,
                Comparison::LtUn => unordered || x < y,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Allocator, Heap, ObjectRef, TypeId};

    use StackValue::{Double, Int32, Int64, NativeInt};

    fn add(a: StackValue, b: StackValue, overflow: Overflow) -> Result<StackValue, ArithmeticError> {
        binary(BinaryOp::Add, a, b, overflow)
    }

    #[test]
    fn wider_kind_governs_promotion() {
        assert_eq!(add(Int32(2), Int32(3), Overflow::Wrap), Ok(Int32(5)));
        assert_eq!(add(Int32(2), NativeInt(3), Overflow::Wrap), Ok(NativeInt(5)));
        assert_eq!(add(NativeInt(-2), Int64(3), Overflow::Wrap), Ok(Int64(1)));
        assert_eq!(add(Double(0.5), Double(2.0), Overflow::Wrap), Ok(Double(2.5)));
        assert_eq!(
            add(Int32(1), StackValue::NULL, Overflow::Wrap),
            Err(ArithmeticError::InvalidOperands)
        );
    }

    #[test]
    fn checked_operations_raise_exactly_on_overflow() {
        assert_eq!(add(Int32(i32::MAX), Int32(1), Overflow::Wrap), Ok(Int32(i32::MIN)));
        assert_eq!(
            add(Int32(i32::MAX), Int32(1), Overflow::Signed),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(add(Int32(i32::MAX - 1), Int32(1), Overflow::Signed), Ok(Int32(i32::MAX)));
        // -1 is u32::MAX when both operands are unsigned
        assert_eq!(add(Int32(-1), Int32(1), Overflow::Unsigned), Err(ArithmeticError::Overflow));
        assert_eq!(
            binary(BinaryOp::Sub, Int32(0), Int32(1), Overflow::Unsigned),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            binary(BinaryOp::Mul, Int64(i64::MAX / 2 + 1), Int64(2), Overflow::Signed),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            binary(BinaryOp::Mul, Int64(1 << 31), Int64(1 << 31), Overflow::Signed),
            Ok(Int64(1 << 62))
        );
    }

    #[test]
    fn division_by_zero_raises_for_every_integer_kind() {
        for op in [BinaryOp::Div, BinaryOp::DivUn, BinaryOp::Rem, BinaryOp::RemUn] {
            for (a, b) in [(Int32(7), Int32(0)), (Int64(7), Int64(0)), (NativeInt(7), NativeInt(0))] {
                assert_eq!(
                    binary(op, a, b, Overflow::Wrap),
                    Err(ArithmeticError::DivideByZero),
                    "{op:?} {a:?}"
                );
            }
        }
        assert_eq!(
            binary(BinaryOp::Div, Double(1.0), Double(0.0), Overflow::Wrap),
            Ok(Double(f64::INFINITY))
        );
    }

    #[test]
    fn min_divided_by_minus_one_overflows() {
        assert_eq!(
            binary(BinaryOp::Div, Int32(i32::MIN), Int32(-1), Overflow::Wrap),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            binary(BinaryOp::Rem, Int64(i64::MIN), Int64(-1), Overflow::Wrap),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            binary(BinaryOp::DivUn, Int32(-2), Int32(2), Overflow::Wrap),
            Ok(Int32(i32::MAX))
        );
        assert_eq!(
            binary(BinaryOp::Rem, Int32(-7), Int32(3), Overflow::Wrap),
            Ok(Int32(-1))
        );
    }

    #[test]
    fn shifts_mask_their_amount() {
        assert_eq!(shift(ShiftOp::Shl, Int32(1), Int32(33)), Ok(Int32(2)));
        assert_eq!(shift(ShiftOp::Shr, Int32(-8), Int32(1)), Ok(Int32(-4)));
        assert_eq!(shift(ShiftOp::ShrUn, Int32(-8), Int32(28)), Ok(Int32(0xF)));
        assert_eq!(shift(ShiftOp::Shl, Int64(1), Int32(63)), Ok(Int64(i64::MIN)));
        assert_eq!(
            shift(ShiftOp::Shl, Double(1.0), Int32(1)),
            Err(ArithmeticError::InvalidOperands)
        );
    }

    #[test]
    fn unsigned_comparisons_are_true_when_unordered() {
        let nan = Double(f64::NAN);
        assert_eq!(compare(Comparison::Gt, nan, Double(1.0)), Ok(false));
        assert_eq!(compare(Comparison::GtUn, nan, Double(1.0)), Ok(true));
        assert_eq!(compare(Comparison::LtUn, Double(1.0), nan), Ok(true));
        assert_eq!(compare(Comparison::Eq, nan, nan), Ok(false));
        assert_eq!(compare(Comparison::Lt, Int32(-1), Int32(0)), Ok(true));
        assert_eq!(compare(Comparison::LtUn, Int32(-1), Int32(0)), Ok(false));
        assert_eq!(compare(Comparison::Gt, Int64(5), Int32(4)), Ok(true));
    }

    #[test]
    fn references_compare_by_address() {
        let mut heap = Heap::new(1 << 12);
        let object = heap.allocate(TypeId(0), 16).expect("object");
        let value = StackValue::Object(object);
        assert_eq!(compare(Comparison::GtUn, value, StackValue::NULL), Ok(true));
        assert_eq!(
            compare(Comparison::GtUn, StackValue::NULL, StackValue::NULL),
            Ok(false)
        );
        assert_eq!(compare(Comparison::Eq, value, value), Ok(true));
        assert_eq!(
            compare(Comparison::Eq, value, StackValue::Object(ObjectRef::NULL)),
            Ok(false)
        );
    }

    #[test]
    fn pointer_arithmetic_yields_managed_pointers() {
        let mut buffer = [0u8; 16];
        let base = buffer.as_mut_ptr();
        let moved = add(StackValue::ByRef(base), Int32(4), Overflow::Wrap).expect("add");
        assert_eq!(moved, StackValue::ByRef(base.wrapping_add(4)));
        assert_eq!(
            binary(BinaryOp::Sub, moved, StackValue::ByRef(base), Overflow::Wrap),
            Ok(NativeInt(4))
        );
        assert_eq!(
            binary(BinaryOp::Mul, moved, Int32(2), Overflow::Wrap),
            Err(ArithmeticError::InvalidOperands)
        );
    }
}
