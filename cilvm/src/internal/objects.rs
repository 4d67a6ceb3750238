use crate::{
    CallContext, RuntimeFailure, StackValue, StructPayload, TypeId, VmError,
    internal::{format_primitive, read_receiver},
    object::clone_object,
};

pub fn to_string(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let Some(ty) = this.type_id() else {
        return Err(context.raise(RuntimeFailure::NullReference));
    };
    let name = context.rt.types.full_name(ty);
    context.ret_string(&name)
}

/// Reference equality, or bitwise equality of two boxes of the same value
/// type.
pub fn equals(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let other = context.arg_object(1)?;
    if this == other {
        return context.ret_bool(true);
    }
    let (Some(a), Some(b)) = (this.type_id(), other.type_id()) else {
        return context.ret_bool(false);
    };
    let types = &context.rt.types;
    let equal = a == b && types.is_value_type(a) && {
        let size = types.ty(a).instance_size;
        // SAFETY: both boxes hold one value of the same type
        unsafe {
            std::slice::from_raw_parts(this.data_ptr(), size)
                == std::slice::from_raw_parts(other.data_ptr(), size)
        }
    };
    context.ret_bool(equal)
}

pub fn hash_code(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    context.ret(StackValue::Int32((this.address() >> 3) as i32))
}

pub fn memberwise_clone(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let rt = &mut *context.rt;
    let copy = clone_object(&mut rt.heap, &rt.types, this)?;
    let copy = rt.check(copy)?;
    context.ret(StackValue::Object(copy))
}

pub fn reference_equals(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let a = context.arg_object(0)?;
    let b = context.arg_object(1)?;
    context.ret_bool(a == b)
}

pub fn get_type(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let Some(ty) = this.type_id() else {
        return Err(context.raise(RuntimeFailure::NullReference));
    };
    let object = context.rt.type_object(ty)?;
    context.ret(StackValue::Object(object))
}

/// `ToString` of the primitive the receiver points at.
pub fn primitive_to_string(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let owner = context.rt.types.method(context.method).owner;
    let Some(kind) = context.rt.types.ty(owner).primitive_kind() else {
        return Err(VmError::invalid(format!(
            "{} is not a primitive",
            context.rt.types.full_name(owner)
        )));
    };
    let value = read_receiver(context, kind)?;
    let text = format_primitive(kind, value)?;
    context.ret_string(&text)
}

pub fn type_from_handle(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let ty = match context.arg(0)? {
        StackValue::ValueType(_, StructPayload::Inline(bits)) => TypeId(bits as u32),
        other => {
            return Err(VmError::StackTypeMismatch {
                expected: "System.RuntimeTypeHandle",
                found: other.kind(),
            });
        }
    };
    if ty.index() >= context.rt.types.type_count() {
        return Err(VmError::invalid(format!("type handle {} is unknown", ty.0)));
    }
    let object = context.rt.type_object(ty)?;
    context.ret(StackValue::Object(object))
}

fn described_type(context: &mut CallContext<'_>) -> Result<TypeId, VmError> {
    let this = context.this_object()?;
    context
        .rt
        .type_of_type_object(this)
        .ok_or_else(|| VmError::invalid("receiver is not a runtime type"))
}

pub fn type_name(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let ty = described_type(context)?;
    let name = context.rt.types.ty(ty).name.clone();
    context.ret_string(&name)
}

pub fn type_full_name(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let ty = described_type(context)?;
    let name = context.rt.types.full_name(ty);
    context.ret_string(&name)
}
