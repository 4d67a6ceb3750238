//! `System.String`. Strings are immutable sequences of UTF-16 code units;
//! the constructors are pseudo-constructors that return the new object.

use crate::{
    CallContext, ObjectRef, RuntimeFailure, StackValue, VmError,
    internal::display_value,
    object::{
        array_length, elements_ptr, new_string_from_units, string_units,
    },
};

/// Copies the code units of `string`, `None` for null.
fn units(string: ObjectRef) -> Option<Vec<u16>> {
    if string.is_null() {
        return None;
    }
    // SAFETY: non-null strings stay alive for the runtime's lifetime
    Some(unsafe { string_units(string) }.to_vec())
}

fn ret_units(context: &mut CallContext<'_>, units: &[u16]) -> Result<(), VmError> {
    let rt = &mut *context.rt;
    let string = new_string_from_units(&mut rt.heap, &rt.types, units)?;
    context.ret(StackValue::Object(string))
}

pub fn from_chars(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let chars = context.arg_object(0)?;
    if chars.is_null() {
        return ret_units(context, &[]);
    }
    let length = context.rt.check(array_length(chars))?;
    // SAFETY: a char[] holds `length` code units
    let units = unsafe {
        std::slice::from_raw_parts(elements_ptr(chars).cast::<u16>(), length)
    }
    .to_vec();
    ret_units(context, &units)
}

pub fn repeat_char(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let unit = context.arg_i32(0)? as u16;
    let count = context.arg_i32(1)?;
    let Ok(count) = usize::try_from(count) else {
        return Err(context.throw_new("ArgumentException", "count is negative"));
    };
    ret_units(context, &vec![unit; count])
}

pub fn length(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let length = context.rt.check(crate::object::string_length(this))?;
    context.ret(StackValue::Int32(length as i32))
}

pub fn char_at(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let index = context.arg_i32(1)?;
    let unit = usize::try_from(index)
        .ok()
        .and_then(|index| units(this)?.get(index).copied());
    match unit {
        Some(unit) => context.ret(StackValue::Int32(unit as i32)),
        None => Err(context.raise(RuntimeFailure::IndexOutOfRange)),
    }
}

/// Concatenation of every string argument, null counting as empty.
pub fn concat(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let mut joined = Vec::new();
    for index in 0..context.argument_count() {
        if let Some(part) = units(context.arg_object(index)?) {
            joined.extend_from_slice(&part);
        }
    }
    ret_units(context, &joined)
}

pub fn concat_objects(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let mut joined = String::new();
    for index in 0..context.argument_count() {
        let value = context.arg(index)?;
        joined.push_str(&display_value(context.rt, value)?);
    }
    context.ret_string(&joined)
}

pub fn op_equality(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let a = units(context.arg_object(0)?);
    let b = units(context.arg_object(1)?);
    context.ret_bool(a == b)
}

pub fn is_null_or_empty(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let string = context.arg_object(0)?;
    let empty = units(string).is_none_or(|units| units.is_empty());
    context.ret_bool(empty)
}

pub fn equals(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let other = context.arg_object(1)?;
    let string = context.rt.types.well_known.string;
    let equal = other.type_id() == Some(string) && units(this) == units(other);
    context.ret_bool(equal)
}

/// FNV-1a over the code units, stable across runs.
pub fn hash_code(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let hash = units(this)
        .unwrap_or_default()
        .iter()
        .fold(0x811c_9dc5u32, |hash, &unit| {
            (hash ^ unit as u32).wrapping_mul(0x0100_0193)
        });
    context.ret(StackValue::Int32(hash as i32))
}

pub fn to_string(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    context.ret(StackValue::Object(this))
}
