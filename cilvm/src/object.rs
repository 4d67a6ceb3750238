use crate::{
    Allocator, FieldId, MethodId, ObjectRef, RuntimeFailure, StackValue,
    StructStack, TypeCategory, TypeId, TypeRegistry, TypeShape, VmError,
    heap::{
        ArrayHeader, OBJECT_HEADER_SIZE, StringHeader, array_elements_offset,
    },
    value::write_value,
};

/// Body that runs when `method` is called on an instance of `runtime_type`.
pub fn resolve_virtual(
    types: &TypeRegistry,
    method: MethodId,
    runtime_type: TypeId,
) -> Result<MethodId, VmError> {
    types
        .ty(runtime_type)
        .method_table
        .get(&method)
        .copied()
        .ok_or_else(|| {
            VmError::invalid(format!(
                "{} has no implementation of {}",
                types.full_name(runtime_type),
                types.method_name(method)
            ))
        })
}

/// Whether a value of type `from` can be stored where `to` is expected.
pub fn is_assignable_to(types: &TypeRegistry, from: TypeId, to: TypeId) -> bool {
    if from == to {
        return true;
    }
    let (source, target) = (types.ty(from), types.ty(to));
    if source.is_array() && target.is_array() {
        if source.shape != target.shape {
            return false;
        }
        let (Some(from_element), Some(to_element)) =
            (source.element, target.element)
        else {
            return false;
        };
        // reference elements are covariant, everything else must match
        return if types.is_reference_type(from_element)
            && types.is_reference_type(to_element)
        {
            is_assignable_to(types, from_element, to_element)
        } else {
            from_element == to_element
        };
    }
    if target.is_interface() {
        return types.implements(from, to);
    }
    types.is_subclass_of(from, to)
}

/// Type check behind `castclass` and `isinst`. Null passes a cast but fails
/// an instance query.
pub fn is_instance_of(
    types: &TypeRegistry,
    object: ObjectRef,
    ty: TypeId,
    raise_on_failure: bool,
) -> Result<bool, RuntimeFailure> {
    let Some(actual) = object.type_id() else {
        return Ok(raise_on_failure);
    };
    if is_assignable_to(types, actual, ty) {
        Ok(true)
    } else if raise_on_failure {
        Err(RuntimeFailure::InvalidCast)
    } else {
        Ok(false)
    }
}

/// Copies a value-type value into a fresh heap object. Reference values are
/// already boxed and pass through unchanged.
pub fn box_value(
    heap: &mut impl Allocator,
    types: &TypeRegistry,
    structs: &StructStack,
    ty: TypeId,
    value: StackValue,
) -> Result<ObjectRef, VmError> {
    if !types.is_value_type(ty) {
        return value.as_object();
    }
    let object = heap.allocate_object(types, ty)?;
    // SAFETY: the object's data area is sized for one value of `ty`
    unsafe { write_value(types, structs, object.data_ptr(), ty, value)? };
    Ok(object)
}

/// Address of the payload of a boxed `ty`.
pub fn unbox(
    types: &TypeRegistry,
    object: ObjectRef,
    ty: TypeId,
) -> Result<*mut u8, RuntimeFailure> {
    let actual = object.type_id().ok_or(RuntimeFailure::NullReference)?;
    let compatible = actual == ty
        || matches!(
            (types.ty(actual).primitive_kind(), types.ty(ty).primitive_kind()),
            (Some(a), Some(b)) if a == b
        );
    if compatible {
        Ok(object.data_ptr())
    } else {
        Err(RuntimeFailure::InvalidCast)
    }
}

/// Address of an instance field, null-checked.
pub fn field_address(
    types: &TypeRegistry,
    object: ObjectRef,
    field: FieldId,
) -> Result<*mut u8, RuntimeFailure> {
    if object.is_null() {
        return Err(RuntimeFailure::NullReference);
    }
    // SAFETY: the field belongs to the object's type or one of its bases
    Ok(unsafe { object.data_ptr().add(types.field(field).offset) })
}

/// # Safety
/// `array` must be a non-null array object.
unsafe fn array_header<'a>(array: ObjectRef) -> &'a ArrayHeader {
    // SAFETY: by contract
    unsafe { &*array.as_ptr().cast::<ArrayHeader>() }
}

pub fn is_array(types: &TypeRegistry, object: ObjectRef) -> bool {
    object.type_id().is_some_and(|ty| types.ty(ty).is_array())
}

/// Total element count across all dimensions.
pub fn array_length(array: ObjectRef) -> Result<usize, RuntimeFailure> {
    if array.is_null() {
        return Err(RuntimeFailure::NullReference);
    }
    // SAFETY: non-null, callers pass arrays
    Ok(unsafe { array_header(array) }.length)
}

pub fn array_rank(array: ObjectRef) -> Result<usize, RuntimeFailure> {
    if array.is_null() {
        return Err(RuntimeFailure::NullReference);
    }
    // SAFETY: non-null, callers pass arrays
    Ok(unsafe { array_header(array) }.rank as usize)
}

fn is_vector(array: ObjectRef) -> bool {
    // SAFETY: callers checked for null
    unsafe { array_header(array) }.is_vector != 0
}

/// Per-dimension lengths of a multi-dimensional array, stored after the
/// header.
pub fn dimensions_ptr(array: ObjectRef) -> *mut u32 {
    // SAFETY: the dimension block directly follows the array header
    unsafe { array.byte_ptr().add(size_of::<ArrayHeader>()).cast() }
}

pub fn array_dimensions(array: ObjectRef) -> Result<Vec<usize>, RuntimeFailure> {
    let rank = array_rank(array)?;
    if is_vector(array) {
        return Ok(vec![array_length(array)?]);
    }
    let dims = dimensions_ptr(array);
    // SAFETY: md arrays carry `rank` dimension lengths
    Ok((0..rank)
        .map(|i| unsafe { dims.add(i).read() } as usize)
        .collect())
}

pub fn elements_ptr(array: ObjectRef) -> *mut u8 {
    // SAFETY: callers checked for null
    let header = unsafe { array_header(array) };
    let offset =
        array_elements_offset(header.rank as usize, header.is_vector != 0);
    // SAFETY: elements follow the headers
    unsafe { array.byte_ptr().add(offset) }
}

pub fn array_element_type(
    types: &TypeRegistry,
    array: ObjectRef,
) -> Result<TypeId, RuntimeFailure> {
    let ty = array.type_id().ok_or(RuntimeFailure::NullReference)?;
    types.ty(ty).element.ok_or(RuntimeFailure::InvalidCast)
}

/// Address of element `index` of a single-dimensional array, null- and
/// bounds-checked.
pub fn element_address(
    types: &TypeRegistry,
    array: ObjectRef,
    index: isize,
) -> Result<*mut u8, RuntimeFailure> {
    let length = array_length(array)?;
    if index < 0 || index as usize >= length {
        return Err(RuntimeFailure::IndexOutOfRange);
    }
    let element = types.value_size(array_element_type(types, array)?);
    // SAFETY: in bounds
    Ok(unsafe { elements_ptr(array).add(index as usize * element) })
}

/// Address of an element of a multi-dimensional array, every index checked
/// against its own dimension.
pub fn md_element_address(
    types: &TypeRegistry,
    array: ObjectRef,
    indices: &[i32],
) -> Result<*mut u8, RuntimeFailure> {
    let dims = array_dimensions(array)?;
    if dims.len() != indices.len() {
        return Err(RuntimeFailure::IndexOutOfRange);
    }
    let mut flat = 0usize;
    for (&index, &dim) in indices.iter().zip(&dims) {
        if index < 0 || index as usize >= dim {
            return Err(RuntimeFailure::IndexOutOfRange);
        }
        flat = flat * dim + index as usize;
    }
    let element = types.value_size(array_element_type(types, array)?);
    // SAFETY: in bounds
    Ok(unsafe { elements_ptr(array).add(flat * element) })
}

pub fn new_md_array(
    heap: &mut impl Allocator,
    types: &TypeRegistry,
    ty: TypeId,
    lengths: &[i32],
) -> Result<Result<ObjectRef, RuntimeFailure>, VmError> {
    let mut total = 1usize;
    for &length in lengths {
        let Ok(length) = usize::try_from(length) else {
            return Ok(Err(RuntimeFailure::Overflow));
        };
        let Some(product) = total.checked_mul(length) else {
            return Ok(Err(RuntimeFailure::Overflow));
        };
        total = product;
    }
    debug_assert!(matches!(types.ty(ty).shape, TypeShape::MdArray { .. }));
    let array = heap.allocate_md_array(types, ty, total)?;
    let dims = dimensions_ptr(array);
    for (i, &length) in lengths.iter().enumerate() {
        // SAFETY: room for `rank` dimensions was allocated
        unsafe { dims.add(i).write(length as u32) };
    }
    Ok(Ok(array))
}

pub fn string_length(string: ObjectRef) -> Result<usize, RuntimeFailure> {
    if string.is_null() {
        return Err(RuntimeFailure::NullReference);
    }
    // SAFETY: callers pass strings
    Ok(unsafe { (*string.as_ptr().cast::<StringHeader>()).length } as usize)
}

pub fn string_chars_ptr(string: ObjectRef) -> *mut u16 {
    // SAFETY: code units follow the string header
    unsafe { string.byte_ptr().add(size_of::<StringHeader>()).cast() }
}

/// Code units of a managed string.
///
/// # Safety
/// `string` must be a non-null string object that outlives the slice.
pub unsafe fn string_units<'a>(string: ObjectRef) -> &'a [u16] {
    let length = string_length(string).unwrap_or(0);
    // SAFETY: by contract
    unsafe { std::slice::from_raw_parts(string_chars_ptr(string), length) }
}

/// Lossy conversion of a managed string, `None` for null.
pub fn string_to_rust(string: ObjectRef) -> Option<String> {
    if string.is_null() {
        return None;
    }
    // SAFETY: non-null strings live as long as the heap
    Some(String::from_utf16_lossy(unsafe { string_units(string) }))
}

pub fn new_string_from_units(
    heap: &mut impl Allocator,
    types: &TypeRegistry,
    units: &[u16],
) -> Result<ObjectRef, VmError> {
    let string = heap.allocate_string(types, units.len())?;
    // SAFETY: allocated with room for `units.len()` code units
    unsafe {
        std::ptr::copy_nonoverlapping(
            units.as_ptr(),
            string_chars_ptr(string),
            units.len(),
        );
    }
    Ok(string)
}

pub fn new_string(
    heap: &mut impl Allocator,
    types: &TypeRegistry,
    text: &str,
) -> Result<ObjectRef, VmError> {
    let units = text.encode_utf16().collect::<Vec<_>>();
    new_string_from_units(heap, types, &units)
}

/// Bytes an existing object occupies, header included.
pub fn object_size(types: &TypeRegistry, object: ObjectRef) -> usize {
    let Some(ty) = object.type_id() else {
        return 0;
    };
    let desc = types.ty(ty);
    if ty == types.well_known.string {
        return size_of::<StringHeader>()
            + 2 * string_length(object).unwrap_or(0);
    }
    if desc.category == TypeCategory::Array {
        // SAFETY: array typed objects carry an array header
        let header = unsafe { array_header(object) };
        let element = desc.element.map_or(0, |e| types.value_size(e));
        return array_elements_offset(
            header.rank as usize,
            header.is_vector != 0,
        ) + header.length * element;
    }
    OBJECT_HEADER_SIZE + desc.instance_size
}

/// Shallow copy. Arrays keep their length, rank and dimension block.
pub fn clone_object(
    heap: &mut impl Allocator,
    types: &TypeRegistry,
    object: ObjectRef,
) -> Result<Result<ObjectRef, RuntimeFailure>, VmError> {
    let Some(ty) = object.type_id() else {
        return Ok(Err(RuntimeFailure::NullReference));
    };
    let size = object_size(types, object);
    let copy = heap.allocate(ty, size)?;
    // SAFETY: both objects are `size` bytes, only the data after the header
    // is copied
    unsafe {
        std::ptr::copy_nonoverlapping(
            object.data_ptr(),
            copy.data_ptr(),
            size - OBJECT_HEADER_SIZE,
        );
    }
    Ok(Ok(copy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldAttributes, Heap, TypeAttributes, layout, value::read_value};

    struct Fixture {
        types: TypeRegistry,
        heap: Heap,
        structs: StructStack,
    }

    fn fixture(define: impl FnOnce(&mut TypeRegistry)) -> Fixture {
        let mut types = TypeRegistry::new();
        define(&mut types);
        layout::prepare(&mut types).expect("prepare");
        Fixture {
            types,
            heap: Heap::new(1 << 20),
            structs: StructStack::new(64),
        }
    }

    #[test]
    fn reference_arrays_are_covariant() {
        let mut f = fixture(|types| {
            let object = types.well_known.object;
            types.define_type("T", "Attribute", Some(object), TypeAttributes::empty());
        });
        let attribute = f.types.lookup("T", "Attribute").expect("Attribute");
        let attributes = f.types.sz_array_of(attribute);
        let objects = f.types.sz_array_of(f.types.well_known.object);
        let array = f.heap.allocate_sz_array(&f.types, attributes, 2).expect("array");

        assert_eq!(is_instance_of(&f.types, array, objects, true), Ok(true));
        assert_eq!(is_instance_of(&f.types, array, attributes, false), Ok(true));
        assert_eq!(
            is_instance_of(&f.types, array, f.types.well_known.array, false),
            Ok(true)
        );
    }

    #[test]
    fn primitive_arrays_need_exact_elements_and_rank() {
        let mut f = fixture(|_| {});
        let wk = f.types.well_known.clone();
        let ints = f.types.sz_array_of(wk.int32);
        let uints = f.types.sz_array_of(wk.uint32);
        let grid = f.types.md_array_of(wk.int32, 2);
        let objects = f.types.sz_array_of(wk.object);
        let array = f.heap.allocate_sz_array(&f.types, ints, 1).expect("array");

        assert_eq!(is_instance_of(&f.types, array, uints, false), Ok(false));
        assert_eq!(is_instance_of(&f.types, array, grid, false), Ok(false));
        assert_eq!(is_instance_of(&f.types, array, objects, false), Ok(false));
        assert_eq!(
            is_instance_of(&f.types, array, objects, true),
            Err(RuntimeFailure::InvalidCast)
        );
    }

    #[test]
    fn null_passes_casts_but_fails_queries() {
        let f = fixture(|_| {});
        let string = f.types.well_known.string;
        assert_eq!(is_instance_of(&f.types, ObjectRef::NULL, string, true), Ok(true));
        assert_eq!(is_instance_of(&f.types, ObjectRef::NULL, string, false), Ok(false));
    }

    #[test]
    fn boxing_round_trips_the_payload() {
        let mut f = fixture(|types| {
            let wk = types.well_known.clone();
            let pair = types.define_type("T", "Pair", Some(wk.value_type), TypeAttributes::SEALED);
            types.define_field(pair, "a", wk.int32, FieldAttributes::empty());
            types.define_field(pair, "b", wk.int16, FieldAttributes::empty());
        });
        let pair = f.types.lookup("T", "Pair").expect("Pair");
        let bits = 0x0000_7FFF_DEAD_BEEFu64;
        let value = StackValue::ValueType(pair, crate::StructPayload::Inline(bits));
        let boxed = box_value(&mut f.heap, &f.types, &f.structs, pair, value).expect("box");
        assert_eq!(boxed.type_id(), Some(pair));

        let payload = unbox(&f.types, boxed, pair).expect("unbox");
        // SAFETY: payload points at a boxed Pair
        let back = unsafe { read_value(&f.types, &mut f.structs, payload, pair) };
        assert_eq!(back, value);
        assert_eq!(
            unbox(&f.types, boxed, f.types.well_known.int32),
            Err(RuntimeFailure::InvalidCast)
        );
        assert_eq!(
            unbox(&f.types, ObjectRef::NULL, pair),
            Err(RuntimeFailure::NullReference)
        );
    }

    #[test]
    fn boxing_a_reference_is_a_no_op() {
        let mut f = fixture(|_| {});
        let text = new_string(&mut f.heap, &f.types, "hi").expect("string");
        let string = f.types.well_known.string;
        let boxed = box_value(&mut f.heap, &f.types, &f.structs, string, StackValue::Object(text))
            .expect("box");
        assert_eq!(boxed, text);
    }

    #[test]
    fn enums_unbox_as_their_underlying_type() {
        let f = fixture(|types| {
            let wk = types.well_known.clone();
            let e = types.define_type("T", "Mode", Some(wk.enum_), TypeAttributes::SEALED);
            types.define_field(e, "value__", wk.int32, FieldAttributes::empty());
        });
        let mut heap = f.heap;
        let mode = f.types.lookup("T", "Mode").expect("Mode");
        let boxed = box_value(&mut heap, &f.types, &f.structs, mode, StackValue::Int32(3))
            .expect("box");
        assert!(unbox(&f.types, boxed, f.types.well_known.int32).is_ok());
    }

    #[test]
    fn clone_copies_fields_into_a_new_instance() {
        let mut f = fixture(|types| {
            let wk = types.well_known.clone();
            let point = types.define_type("T", "Point", Some(wk.object), TypeAttributes::empty());
            types.define_field(point, "x", wk.int64, FieldAttributes::empty());
            types.define_field(point, "y", wk.int64, FieldAttributes::empty());
        });
        let point = f.types.lookup("T", "Point").expect("Point");
        let original = f.heap.allocate_object(&f.types, point).expect("object");
        // SAFETY: Point has two int64 fields
        unsafe {
            original.data_ptr().cast::<[i64; 2]>().write([7, -9]);
        }
        let copy = clone_object(&mut f.heap, &f.types, original)
            .expect("alloc")
            .expect("clone");
        assert_ne!(copy, original);
        // SAFETY: same layout
        unsafe {
            assert_eq!(copy.data_ptr().cast::<[i64; 2]>().read(), [7, -9]);
        }
    }

    #[test]
    fn clone_keeps_md_array_dimensions() {
        let mut f = fixture(|_| {});
        let grid = f.types.md_array_of(f.types.well_known.int32, 2);
        let array = new_md_array(&mut f.heap, &f.types, grid, &[2, 3])
            .expect("alloc")
            .expect("array");
        let cell = md_element_address(&f.types, array, &[1, 2]).expect("cell");
        // SAFETY: int32 element
        unsafe { cell.cast::<i32>().write(42) };

        let copy = clone_object(&mut f.heap, &f.types, array)
            .expect("alloc")
            .expect("clone");
        assert_eq!(array_dimensions(copy), Ok(vec![2, 3]));
        let cell = md_element_address(&f.types, copy, &[1, 2]).expect("cell");
        // SAFETY: int32 element
        assert_eq!(unsafe { cell.cast::<i32>().read() }, 42);
        assert_eq!(
            md_element_address(&f.types, copy, &[2, 0]),
            Err(RuntimeFailure::IndexOutOfRange)
        );
    }

    #[test]
    fn vector_bounds_are_checked() {
        let mut f = fixture(|_| {});
        let ints = f.types.sz_array_of(f.types.well_known.int32);
        let array = f.heap.allocate_sz_array(&f.types, ints, 3).expect("array");
        assert!(element_address(&f.types, array, 2).is_ok());
        assert_eq!(
            element_address(&f.types, array, 3),
            Err(RuntimeFailure::IndexOutOfRange)
        );
        assert_eq!(
            element_address(&f.types, array, -1),
            Err(RuntimeFailure::IndexOutOfRange)
        );
        assert_eq!(
            element_address(&f.types, ObjectRef::NULL, 0),
            Err(RuntimeFailure::NullReference)
        );
    }

    #[test]
    fn strings_round_trip() {
        let mut f = fixture(|_| {});
        let text = new_string(&mut f.heap, &f.types, "héllo").expect("string");
        assert_eq!(string_length(text), Ok(5));
        assert_eq!(string_to_rust(text).as_deref(), Some("héllo"));
        assert_eq!(string_to_rust(ObjectRef::NULL), None);
    }
}
