use std::{alloc::Layout, ptr::NonNull};

use bitflags::bitflags;
use log::debug;

use crate::{TypeCategory, TypeId, TypeRegistry, VmError, layout::align_up};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        const MARK = 1 << 0;
    }
}

/// Prefix of every heap object. The layout is shared with the interpreter
/// and any collector walking the heap.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    pub ty: TypeId,
    flags: u32,
    /// previously allocated object, forms the enumeration list
    pub next: *mut ObjectHeader,
}

impl ObjectHeader {
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags)
    }

    pub fn set_flags(&mut self, flags: ObjectFlags) {
        self.flags = flags.bits();
    }
}

/// Header of both single- and multi-dimensional arrays. Multi-dimensional
/// arrays follow it with one `u32` length per dimension, padded to 8 bytes.
#[repr(C)]
#[derive(Debug)]
pub struct ArrayHeader {
    pub object: ObjectHeader,
    pub length: usize,
    pub rank: u32,
    /// 1 for single-dimensional zero-based arrays
    pub is_vector: u32,
}

/// Strings are immutable UTF-16 code unit sequences.
#[repr(C)]
#[derive(Debug)]
pub struct StringHeader {
    pub object: ObjectHeader,
    pub length: u32,
    _pad: u32,
}

pub const OBJECT_HEADER_SIZE: usize = size_of::<ObjectHeader>();
pub const ARRAY_DATA_SIZE: usize = size_of::<ArrayHeader>() - OBJECT_HEADER_SIZE;
pub const STRING_DATA_SIZE: usize =
    size_of::<StringHeader>() - OBJECT_HEADER_SIZE;

/// Offset of the first element relative to the start of an array object.
pub const fn array_elements_offset(rank: usize, is_vector: bool) -> usize {
    if is_vector {
        size_of::<ArrayHeader>()
    } else {
        size_of::<ArrayHeader>() + align_up(rank * 4, 8)
    }
}

/// Reference to a heap object, or null.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(*mut ObjectHeader);

impl ObjectRef {
    pub const NULL: Self = Self(std::ptr::null_mut());

    /// # Safety
    /// `ptr` must be null or point at a live object header.
    pub unsafe fn from_raw(ptr: *mut ObjectHeader) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    #[inline]
    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.0
    }

    #[inline]
    pub fn address(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn byte_ptr(self) -> *mut u8 {
        self.0.cast()
    }

    /// Instance data following the header.
    #[inline]
    pub fn data_ptr(self) -> *mut u8 {
        debug_assert!(!self.is_null());
        // SAFETY: objects are at least header sized
        unsafe { self.byte_ptr().add(OBJECT_HEADER_SIZE) }
    }

    /// Runtime type of the object, `None` for null.
    #[inline]
    pub fn type_id(self) -> Option<TypeId> {
        if self.is_null() {
            return None;
        }
        // SAFETY: non-null references always point at live objects, the heap
        // releases memory only when dropped
        Some(unsafe { (*self.0).ty })
    }

    /// # Safety
    /// must be non-null
    pub unsafe fn header<'a>(self) -> &'a mut ObjectHeader {
        // SAFETY: by contract
        unsafe { &mut *self.0 }
    }
}

pub trait Allocator {
    /// Hands out `size` zeroed bytes with the header initialized for `ty`.
    fn allocate(&mut self, ty: TypeId, size: usize) -> Result<ObjectRef, VmError>;

    /// Every live object, most recently allocated first.
    fn for_each_object(&self, f: &mut dyn FnMut(ObjectRef));

    fn allocate_object(
        &mut self,
        types: &TypeRegistry,
        ty: TypeId,
    ) -> Result<ObjectRef, VmError> {
        let size = OBJECT_HEADER_SIZE + types.ty(ty).instance_size;
        self.allocate(ty, size)
    }

    fn allocate_sz_array(
        &mut self,
        types: &TypeRegistry,
        ty: TypeId,
        length: usize,
    ) -> Result<ObjectRef, VmError> {
        let element = element_size(types, ty);
        let size = length
            .checked_mul(element)
            .and_then(|bytes| bytes.checked_add(array_elements_offset(1, true)))
            .ok_or(VmError::OutOfMemory { requested: usize::MAX })?;
        let array = self.allocate(ty, size)?;
        // SAFETY: freshly allocated with room for the array header
        unsafe {
            let header = &mut *array.as_ptr().cast::<ArrayHeader>();
            header.length = length;
            header.rank = 1;
            header.is_vector = 1;
        }
        Ok(array)
    }

    /// Allocates a multi-dimensional array. Dimension lengths are written by
    /// the caller into the space following the header.
    fn allocate_md_array(
        &mut self,
        types: &TypeRegistry,
        ty: TypeId,
        total_length: usize,
    ) -> Result<ObjectRef, VmError> {
        let rank = types.ty(ty).rank();
        let element = element_size(types, ty);
        let size = total_length
            .checked_mul(element)
            .and_then(|bytes| {
                bytes.checked_add(array_elements_offset(rank, false))
            })
            .ok_or(VmError::OutOfMemory { requested: usize::MAX })?;
        let array = self.allocate(ty, size)?;
        // SAFETY: freshly allocated with room for the array header
        unsafe {
            let header = &mut *array.as_ptr().cast::<ArrayHeader>();
            header.length = total_length;
            header.rank = rank as u32;
            header.is_vector = 0;
        }
        Ok(array)
    }

    fn allocate_string(
        &mut self,
        types: &TypeRegistry,
        length: usize,
    ) -> Result<ObjectRef, VmError> {
        let size = size_of::<StringHeader>() + length * 2;
        let string = self.allocate(types.well_known.string, size)?;
        // SAFETY: freshly allocated with room for the string header
        unsafe {
            (*string.as_ptr().cast::<StringHeader>()).length = length as u32;
        }
        Ok(string)
    }
}

fn element_size(types: &TypeRegistry, array: TypeId) -> usize {
    let desc = types.ty(array);
    debug_assert_eq!(desc.category, TypeCategory::Array);
    desc.element.map_or(0, |element| types.value_size(element))
}

/// Non-moving arena heap. Objects live until the heap is dropped; the
/// allocation list doubles as the object enumeration a collector needs.
#[derive(Debug)]
pub struct Heap {
    head: *mut ObjectHeader,
    allocations: Vec<(NonNull<u8>, Layout)>,
    bytes_allocated: usize,
    limit: usize,
}

impl Heap {
    pub fn new(limit: usize) -> Self {
        Self {
            head: std::ptr::null_mut(),
            allocations: Vec::new(),
            bytes_allocated: 0,
            limit,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.allocations.len()
    }

    /// Clears the mark bit of every object.
    pub fn clear_marks(&mut self) {
        self.for_each_object(&mut |object| {
            // SAFETY: enumerated objects are live
            let header = unsafe { object.header() };
            header.set_flags(header.flags() - ObjectFlags::MARK);
        });
    }
}

impl Allocator for Heap {
    fn allocate(&mut self, ty: TypeId, size: usize) -> Result<ObjectRef, VmError> {
        let size = align_up(size.max(OBJECT_HEADER_SIZE), 8);
        if self.bytes_allocated + size > self.limit {
            debug!(
                "heap limit reached: {} + {size} > {}",
                self.bytes_allocated, self.limit
            );
            return Err(VmError::OutOfMemory { requested: size });
        }
        let layout = Layout::from_size_align(size, 8)
            .map_err(|_| VmError::OutOfMemory { requested: size })?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let raw = NonNull::new(raw)
            .ok_or(VmError::OutOfMemory { requested: size })?;
        let header = raw.as_ptr().cast::<ObjectHeader>();
        // SAFETY: freshly allocated, large enough and aligned for a header
        unsafe {
            header.write(ObjectHeader {
                ty,
                flags: 0,
                next: self.head,
            });
        }
        self.head = header;
        self.allocations.push((raw, layout));
        self.bytes_allocated += size;
        // SAFETY: header was just initialized
        Ok(unsafe { ObjectRef::from_raw(header) })
    }

    fn for_each_object(&self, f: &mut dyn FnMut(ObjectRef)) {
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: the list only links live objects
            let (object, next) =
                unsafe { (ObjectRef::from_raw(current), (*current).next) };
            current = next;
            f(object);
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for (ptr, layout) in self.allocations.drain(..) {
            // SAFETY: allocated by `alloc_zeroed` with this layout
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}
