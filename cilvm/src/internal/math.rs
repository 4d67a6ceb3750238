use crate::{CallContext, RuntimeFailure, StackValue, VmError};

pub fn sqrt(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let value = context.arg_f64(0)?;
    context.ret(StackValue::Double(value.sqrt()))
}

/// Overflows for `int.MinValue`, which has no positive counterpart.
pub fn abs_i32(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let value = context.arg_i32(0)?;
    match value.checked_abs() {
        Some(abs) => context.ret(StackValue::Int32(abs)),
        None => Err(context.raise(RuntimeFailure::Overflow)),
    }
}

pub fn abs_f64(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let value = context.arg_f64(0)?;
    context.ret(StackValue::Double(value.abs()))
}

pub fn max(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let (a, b) = (context.arg_i32(0)?, context.arg_i32(1)?);
    context.ret(StackValue::Int32(a.max(b)))
}

pub fn min(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let (a, b) = (context.arg_i32(0)?, context.arg_i32(1)?);
    context.ret(StackValue::Int32(a.min(b)))
}
