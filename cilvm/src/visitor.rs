use crate::{
    ObjectRef, TypeCategory, TypeId, TypeRegistry,
    heap::ObjectFlags,
    object::{array_length, elements_ptr},
};

/// Callbacks a collector receives for every root a frame or the runtime
/// holds. References are passed mutably so a moving collector could update
/// them in place.
pub trait RootVisitor {
    fn visit_object(&mut self, object: &mut ObjectRef);

    fn visit_by_ref(&mut self, pointer: *mut u8) {
        let _ = pointer;
    }

    /// A value-type instance embedded in a frame, side-stack slot or heap
    /// object. The default walks its reference fields.
    fn visit_struct(&mut self, types: &TypeRegistry, ty: TypeId, data: *mut u8)
    where
        Self: Sized,
    {
        visit_struct_fields(types, ty, data, self);
    }
}

/// Hands every reference stored in the value at `data` to `visitor`.
pub fn visit_value(
    types: &TypeRegistry,
    ty: TypeId,
    data: *mut u8,
    visitor: &mut impl RootVisitor,
) {
    match types.ty(ty).category {
        TypeCategory::Primitive(_)
        | TypeCategory::Enum(_)
        | TypeCategory::Pointer => {}
        TypeCategory::Struct => visitor.visit_struct(types, ty, data),
        TypeCategory::ByRef => {
            // SAFETY: by-ref slots hold one pointer
            let pointer = unsafe { data.cast::<*mut u8>().read_unaligned() };
            visitor.visit_by_ref(pointer);
        }
        _ => {
            // SAFETY: reference slots hold one object reference
            let slot = data.cast::<ObjectRef>();
            let mut object = unsafe { slot.read_unaligned() };
            visitor.visit_object(&mut object);
            // SAFETY: same slot
            unsafe { slot.write_unaligned(object) };
        }
    }
}

/// Visits the instance fields of a value type laid out at `data`.
pub fn visit_struct_fields(
    types: &TypeRegistry,
    ty: TypeId,
    data: *mut u8,
    visitor: &mut impl RootVisitor,
) {
    for &field in &types.ty(ty).fields {
        let field = types.field(field);
        if field.is_static() || field.is_literal() {
            continue;
        }
        // SAFETY: field offsets lie within the struct
        visit_value(types, field.ty, unsafe { data.add(field.offset) }, visitor);
    }
}

/// Visits the references held by a heap object: instance fields along the
/// base chain, or the elements of an array.
pub fn visit_object_edges(
    types: &TypeRegistry,
    object: ObjectRef,
    visitor: &mut impl RootVisitor,
) {
    let Some(ty) = object.type_id() else {
        return;
    };
    let desc = types.ty(ty);
    if desc.category == TypeCategory::Array {
        let Some(element) = desc.element else {
            return;
        };
        if !types.is_reference_type(element)
            && types.ty(element).category != TypeCategory::Struct
        {
            return;
        }
        let size = types.value_size(element);
        let base = elements_ptr(object);
        for index in 0..array_length(object).unwrap_or(0) {
            // SAFETY: index is below the array length
            visit_value(types, element, unsafe { base.add(index * size) }, visitor);
        }
        return;
    }

    let mut current = Some(ty);
    while let Some(id) = current {
        let desc = types.ty(id);
        for &field in &desc.fields {
            let field = types.field(field);
            if field.is_static() || field.is_literal() {
                continue;
            }
            // SAFETY: inherited fields lie within the instance data
            let data = unsafe { object.data_ptr().add(field.offset) };
            visit_value(types, field.ty, data, visitor);
        }
        current = desc.base;
    }
}

/// Marks every object reachable from the roots it is shown. Marking stops at
/// objects already carrying the mark bit.
#[derive(Debug, Default)]
pub struct MarkVisitor {
    worklist: Vec<ObjectRef>,
    marked: usize,
}

impl MarkVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Traces everything reachable from the roots visited so far and returns
    /// the number of objects marked.
    pub fn finish(mut self, types: &TypeRegistry) -> usize {
        while let Some(object) = self.worklist.pop() {
            visit_object_edges(types, object, &mut self);
        }
        self.marked
    }
}

impl RootVisitor for MarkVisitor {
    fn visit_object(&mut self, object: &mut ObjectRef) {
        if object.is_null() {
            return;
        }
        // SAFETY: non-null references point at live objects
        let header = unsafe { object.header() };
        if header.flags().contains(ObjectFlags::MARK) {
            return;
        }
        header.set_flags(header.flags() | ObjectFlags::MARK);
        self.marked += 1;
        self.worklist.push(*object);
    }
}
