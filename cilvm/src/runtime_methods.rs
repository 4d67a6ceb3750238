//! Methods whose bodies the runtime supplies: delegate construction and
//! invocation, and the accessors of multi-dimensional arrays.

use log::trace;

use crate::{
    MethodCallData, MethodId, ObjectRef, Runtime, RuntimeFailure, StackValue,
    TypeId, VmError,
    object::{self, field_address, md_element_address},
    value::{dispose, read_value, write_value},
};

pub fn invoke(
    rt: &mut Runtime,
    method: MethodId,
    data: &mut MethodCallData,
) -> Result<(), VmError> {
    let desc = rt.types.method(method);
    let owner = desc.owner;
    let name = desc.name.clone();
    if rt.types.ty(owner).is_array() {
        return match name.as_str() {
            ".ctor" => construct_array(rt, owner, data),
            "Get" => array_get(rt, data),
            "Set" => array_set(rt, data),
            "Address" => array_address(rt, data),
            _ => Err(VmError::Unimplemented("array runtime method")),
        };
    }
    if rt.types.is_subclass_of(owner, rt.types.well_known.delegate) {
        return match name.as_str() {
            ".ctor" => bind_delegate(rt, data),
            "Invoke" => invoke_delegate(rt, data),
            _ => Err(VmError::Unimplemented("asynchronous delegate invocation")),
        };
    }
    Err(VmError::invalid(format!(
        "{} has no runtime implementation",
        rt.types.method_name(method)
    )))
}

fn delegate_fields(rt: &Runtime) -> Result<(crate::FieldId, crate::FieldId), VmError> {
    let wk = &rt.types.well_known;
    wk.delegate_target
        .zip(wk.delegate_method)
        .ok_or_else(|| VmError::invalid("System.Delegate is missing its fields"))
}

/// `.ctor(object target, native int method)`
fn bind_delegate(rt: &mut Runtime, data: &mut MethodCallData) -> Result<(), VmError> {
    let this = data.get_argument(&rt.types, &mut rt.structs, 0)?.as_object()?;
    let target = data.get_argument(&rt.types, &mut rt.structs, 1)?;
    let pointer = data.get_argument(&rt.types, &mut rt.structs, 2)?.as_native()?;
    let (target_field, method_field) = delegate_fields(rt)?;
    let target_address = rt.check(field_address(&rt.types, this, target_field))?;
    let method_address = rt.check(field_address(&rt.types, this, method_field))?;
    // SAFETY: `_target` is a reference field, `_methodPtr` a native int
    unsafe {
        write_value(
            &rt.types,
            &rt.structs,
            target_address,
            rt.types.field(target_field).ty,
            target,
        )?;
        method_address.cast::<isize>().write_unaligned(pointer);
    }
    Ok(())
}

/// Forwards the arguments to the bound method, prepending the target for
/// instance methods.
fn invoke_delegate(rt: &mut Runtime, data: &mut MethodCallData) -> Result<(), VmError> {
    let this = data.get_argument(&rt.types, &mut rt.structs, 0)?.as_object()?;
    let (target_field, method_field) = delegate_fields(rt)?;
    let target_address = rt.check(field_address(&rt.types, this, target_field))?;
    let method_address = rt.check(field_address(&rt.types, this, method_field))?;
    // SAFETY: delegate fields written by `bind_delegate`
    let (target, pointer) = unsafe {
        (
            target_address.cast::<ObjectRef>().read_unaligned(),
            method_address.cast::<isize>().read_unaligned(),
        )
    };
    let callee = MethodId(pointer as u32);
    if callee.index() >= rt.types.method_count() {
        return Err(VmError::invalid(format!("delegate bound to bad method {pointer}")));
    }
    trace!("delegate invokes {}", rt.types.method_name(callee));

    let mut args = Vec::with_capacity(data.argument_count());
    if !rt.types.method(callee).is_static() {
        if target.is_null() {
            return Err(rt.raise(RuntimeFailure::NullReference));
        }
        args.push(StackValue::Object(target));
    }
    for index in 1..data.argument_count() {
        args.push(data.get_argument(&rt.types, &mut rt.structs, index)?);
    }
    let result = rt.call(callee, &args);
    for arg in args {
        dispose(&mut rt.structs, arg);
    }
    if let Some(value) = result? {
        let stored = data.set_return(&rt.types, &rt.structs, value);
        dispose(&mut rt.structs, value);
        stored?;
    }
    Ok(())
}

fn indices(
    rt: &mut Runtime,
    data: &MethodCallData,
    range: std::ops::Range<usize>,
) -> Result<Vec<i32>, VmError> {
    range
        .map(|index| data.get_argument(&rt.types, &mut rt.structs, index)?.as_i32())
        .collect()
}

fn construct_array(
    rt: &mut Runtime,
    ty: TypeId,
    data: &mut MethodCallData,
) -> Result<(), VmError> {
    let lengths = indices(rt, data, 0..data.argument_count())?;
    let array = object::new_md_array(&mut rt.heap, &rt.types, ty, &lengths)?;
    let array = rt.check(array)?;
    data.set_return(&rt.types, &rt.structs, StackValue::Object(array))
}

/// Element address from the receiver and the indices that follow it.
fn element(
    rt: &mut Runtime,
    data: &MethodCallData,
) -> Result<(*mut u8, TypeId), VmError> {
    let array = data.get_argument(&rt.types, &mut rt.structs, 0)?.as_object()?;
    let element_type = rt.check(object::array_element_type(&rt.types, array))?;
    let rank = rt.check(object::array_rank(array))?;
    let at = indices(rt, data, 1..rank + 1)?;
    let address = rt.check(md_element_address(&rt.types, array, &at))?;
    Ok((address, element_type))
}

fn array_get(rt: &mut Runtime, data: &mut MethodCallData) -> Result<(), VmError> {
    let (address, ty) = element(rt, data)?;
    // SAFETY: in-bounds element of type `ty`
    let value = unsafe { read_value(&rt.types, &mut rt.structs, address, ty) };
    let stored = data.set_return(&rt.types, &rt.structs, value);
    dispose(&mut rt.structs, value);
    stored
}

fn array_set(rt: &mut Runtime, data: &mut MethodCallData) -> Result<(), VmError> {
    let (address, ty) = element(rt, data)?;
    let value = data.get_argument(&rt.types, &mut rt.structs, data.argument_count() - 1)?;
    // SAFETY: in-bounds element of type `ty`
    let stored = unsafe { write_value(&rt.types, &rt.structs, address, ty, value) };
    dispose(&mut rt.structs, value);
    stored
}

fn array_address(rt: &mut Runtime, data: &mut MethodCallData) -> Result<(), VmError> {
    let (address, _) = element(rt, data)?;
    data.set_return(&rt.types, &rt.structs, StackValue::ByRef(address))
}
