use crate::{
    CallContext, ObjectRef, RuntimeFailure, StackValue, VmError,
    object::{
        array_dimensions, array_element_type, array_length, array_rank,
        elements_ptr, is_instance_of,
    },
};

pub fn length(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let length = context.rt.check(array_length(this))?;
    context.ret(StackValue::Int32(length as i32))
}

pub fn rank(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let rank = context.rt.check(array_rank(this))?;
    context.ret(StackValue::Int32(rank as i32))
}

pub fn dimension_length(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let this = context.this_object()?;
    let dimension = context.arg_i32(1)?;
    let dims = context.rt.check(array_dimensions(this))?;
    match usize::try_from(dimension).ok().and_then(|d| dims.get(d)) {
        Some(&length) => context.ret(StackValue::Int32(length as i32)),
        None => Err(context.raise(RuntimeFailure::IndexOutOfRange)),
    }
}

/// `Array.Copy(source, destination, length)`. Arrays of the same element
/// type are copied as raw memory, reference arrays of differing types
/// element by element with a store check.
pub fn copy(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let source = context.arg_object(0)?;
    let destination = context.arg_object(1)?;
    let length = context.arg_i32(2)?;
    let rt = &mut *context.rt;
    let result = copy_elements(rt, source, destination, length);
    rt.check(result)
}

fn copy_elements(
    rt: &crate::Runtime,
    source: ObjectRef,
    destination: ObjectRef,
    length: i32,
) -> Result<(), RuntimeFailure> {
    let source_length = array_length(source)?;
    let destination_length = array_length(destination)?;
    let count = usize::try_from(length)
        .ok()
        .filter(|&n| n <= source_length && n <= destination_length)
        .ok_or(RuntimeFailure::IndexOutOfRange)?;

    let types = &rt.types;
    let from = array_element_type(types, source)?;
    let to = array_element_type(types, destination)?;
    let (src, dst) = (elements_ptr(source), elements_ptr(destination));
    if from == to {
        let bytes = count * types.value_size(from);
        // SAFETY: both ranges lie within their arrays; they may overlap
        unsafe { std::ptr::copy(src, dst, bytes) };
        return Ok(());
    }
    if !(types.is_reference_type(from) && types.is_reference_type(to)) {
        return Err(RuntimeFailure::ArrayTypeMismatch);
    }
    let (src, dst) = (src.cast::<ObjectRef>(), dst.cast::<ObjectRef>());
    for index in 0..count {
        // SAFETY: index < count, within both arrays
        let element = unsafe { src.add(index).read() };
        if !is_instance_of(types, element, to, false)? && !element.is_null() {
            return Err(RuntimeFailure::ArrayTypeMismatch);
        }
        // SAFETY: as above
        unsafe { dst.add(index).write(element) };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        Allocator, ObjectRef, Runtime, RuntimeCreateInfo, StackValue,
        TypeRegistry, VmError, object::elements_ptr,
    };

    fn runtime() -> Runtime {
        let info = RuntimeCreateInfo {
            echo_console: Some(false),
            stack_size: Some(64 * 1024),
            ..Default::default()
        };
        Runtime::new(TypeRegistry::new(), info).expect("runtime")
    }

    #[test]
    fn copy_moves_primitive_elements() {
        let mut rt = runtime();
        let wk = rt.types.well_known.clone();
        let ints = rt.types.sz_array_of(wk.int32);
        let copy = rt
            .types
            .find_method_with_params(wk.array, "Copy", &[wk.array, wk.array, wk.int32])
            .expect("Copy");
        let source = rt.heap.allocate_sz_array(&rt.types, ints, 4).expect("array");
        let target = rt.heap.allocate_sz_array(&rt.types, ints, 3).expect("array");
        let values = elements_ptr(source).cast::<i32>();
        for i in 0..4 {
            // SAFETY: four element array
            unsafe { values.add(i).write(i as i32 + 10) };
        }

        let args = |n| [StackValue::Object(source), StackValue::Object(target), StackValue::Int32(n)];
        rt.call(copy, &args(2)).expect("copy");
        let copied = elements_ptr(target).cast::<i32>();
        // SAFETY: three element array
        unsafe {
            assert_eq!((copied.read(), copied.add(1).read(), copied.add(2).read()), (10, 11, 0));
        }
        assert!(matches!(rt.call(copy, &args(4)), Err(VmError::Exception(_))));
        assert!(matches!(rt.call(copy, &args(-1)), Err(VmError::Exception(_))));
    }

    #[test]
    fn copy_checks_reference_elements() {
        let mut rt = runtime();
        let wk = rt.types.well_known.clone();
        let objects = rt.types.sz_array_of(wk.object);
        let strings = rt.types.sz_array_of(wk.string);
        let copy = rt
            .types
            .find_method_with_params(wk.array, "Copy", &[wk.array, wk.array, wk.int32])
            .expect("Copy");
        let source = rt.heap.allocate_sz_array(&rt.types, objects, 2).expect("array");
        let target = rt.heap.allocate_sz_array(&rt.types, strings, 2).expect("array");
        let text = rt.new_string("ok").expect("string");
        let slots = elements_ptr(source).cast::<ObjectRef>();
        // SAFETY: two element array
        unsafe { slots.write(text) };

        let args = [StackValue::Object(source), StackValue::Object(target), StackValue::Int32(2)];
        rt.call(copy, &args).expect("strings and nulls fit");
        // SAFETY: two element array
        assert_eq!(unsafe { elements_ptr(target).cast::<ObjectRef>().read() }, text);

        let plain = rt.heap.allocate_object(&rt.types, wk.object).expect("object");
        // SAFETY: two element array
        unsafe { slots.add(1).write(plain) };
        assert!(matches!(rt.call(copy, &args), Err(VmError::Exception(_))));
    }

    #[test]
    fn dimension_lengths() {
        let mut rt = runtime();
        let wk = rt.types.well_known.clone();
        let grid = rt.types.md_array_of(wk.int32, 2);
        let array = crate::object::new_md_array(&mut rt.heap, &rt.types, grid, &[2, 5])
            .expect("allocate")
            .expect("valid lengths");
        let get_length = rt
            .types
            .find_method_with_params(wk.array, "GetLength", &[wk.int32])
            .expect("GetLength");
        let rank = rt.types.find_method(wk.array, "get_Rank").expect("get_Rank");
        let this = StackValue::Object(array);
        assert_eq!(rt.call(rank, &[this]).expect("rank"), Some(StackValue::Int32(2)));
        assert_eq!(
            rt.call(get_length, &[this, StackValue::Int32(1)]).expect("length"),
            Some(StackValue::Int32(5))
        );
        assert!(matches!(
            rt.call(get_length, &[this, StackValue::Int32(2)]),
            Err(VmError::Exception(_))
        ));
    }
}
