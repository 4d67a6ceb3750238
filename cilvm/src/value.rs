use crate::{
    LargeSlot, ObjectRef, PrimitiveKind, StructStack, TypeCategory, TypeId,
    TypeRegistry, VmError,
};

/// Kind tag of a value on the operand stack. Arithmetic, comparison and
/// conversion semantics are selected from this tag alone.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StackItemKind {
    Int32,
    Int64,
    NativeInt,
    Double,
    Object,
    ByRef,
    ValueType,
}

/// Kind plus the concrete type for object, by-ref and value-type kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RuntimeType {
    pub kind: StackItemKind,
    pub ty: Option<TypeId>,
}

impl RuntimeType {
    pub const fn new(kind: StackItemKind, ty: Option<TypeId>) -> Self {
        Self { kind, ty }
    }

    /// The runtime type a value of declared type `ty` carries on the stack.
    pub fn of(types: &TypeRegistry, ty: TypeId) -> Self {
        let desc = types.ty(ty);
        let kind = match desc.category {
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                return Self::new(primitive_stack_kind(kind), None);
            }
            TypeCategory::Struct => StackItemKind::ValueType,
            TypeCategory::ByRef => {
                return Self::new(StackItemKind::ByRef, desc.element);
            }
            TypeCategory::Pointer => StackItemKind::NativeInt,
            _ => StackItemKind::Object,
        };
        Self::new(kind, Some(ty))
    }
}

pub const fn primitive_stack_kind(kind: PrimitiveKind) -> StackItemKind {
    match kind {
        PrimitiveKind::I8 | PrimitiveKind::U8 => StackItemKind::Int64,
        PrimitiveKind::R4 | PrimitiveKind::R8 => StackItemKind::Double,
        PrimitiveKind::I | PrimitiveKind::U => StackItemKind::NativeInt,
        _ => StackItemKind::Int32,
    }
}

/// Bits of a value-type instance on the stack. Small structs travel inline,
/// larger ones own a slot of the struct side-stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StructPayload {
    Inline(u64),
    Large(LargeSlot),
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum StackValue {
    Int32(i32),
    Int64(i64),
    NativeInt(isize),
    Double(f64),
    Object(ObjectRef),
    ByRef(*mut u8),
    ValueType(TypeId, StructPayload),
}

impl StackValue {
    pub const NULL: Self = Self::Object(ObjectRef::NULL);

    pub fn kind(&self) -> StackItemKind {
        match self {
            Self::Int32(_) => StackItemKind::Int32,
            Self::Int64(_) => StackItemKind::Int64,
            Self::NativeInt(_) => StackItemKind::NativeInt,
            Self::Double(_) => StackItemKind::Double,
            Self::Object(_) => StackItemKind::Object,
            Self::ByRef(_) => StackItemKind::ByRef,
            Self::ValueType(..) => StackItemKind::ValueType,
        }
    }

    #[inline]
    pub fn from_bool(value: bool) -> Self {
        Self::Int32(value as i32)
    }

    fn mismatch(&self, expected: &'static str) -> VmError {
        VmError::StackTypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    pub fn as_i32(&self) -> Result<i32, VmError> {
        match *self {
            Self::Int32(v) => Ok(v),
            Self::NativeInt(v) => Ok(v as i32),
            _ => Err(self.mismatch("int32")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, VmError> {
        match *self {
            Self::Int32(v) => Ok(v as i64),
            Self::Int64(v) => Ok(v),
            Self::NativeInt(v) => Ok(v as i64),
            _ => Err(self.mismatch("int64")),
        }
    }

    pub fn as_f64(&self) -> Result<f64, VmError> {
        match *self {
            Self::Double(v) => Ok(v),
            _ => Err(self.mismatch("float")),
        }
    }

    /// Integer, native int or pointer as a native-width integer.
    pub fn as_native(&self) -> Result<isize, VmError> {
        match *self {
            Self::Int32(v) => Ok(v as isize),
            Self::NativeInt(v) => Ok(v),
            Self::Int64(v) => Ok(v as isize),
            Self::ByRef(p) => Ok(p as isize),
            _ => Err(self.mismatch("native int")),
        }
    }

    pub fn as_object(&self) -> Result<ObjectRef, VmError> {
        match *self {
            Self::Object(o) => Ok(o),
            _ => Err(self.mismatch("object reference")),
        }
    }

    /// Managed or unmanaged pointer.
    pub fn as_pointer(&self) -> Result<*mut u8, VmError> {
        match *self {
            Self::ByRef(p) => Ok(p),
            Self::NativeInt(v) => Ok(v as *mut u8),
            _ => Err(self.mismatch("pointer")),
        }
    }

    /// Truthiness used by `brtrue`/`brfalse`.
    pub fn is_true(&self) -> Result<bool, VmError> {
        match *self {
            Self::Int32(v) => Ok(v != 0),
            Self::Int64(v) => Ok(v != 0),
            Self::NativeInt(v) => Ok(v != 0),
            Self::Object(o) => Ok(!o.is_null()),
            Self::ByRef(p) => Ok(!p.is_null()),
            _ => Err(self.mismatch("integer or reference")),
        }
    }

    pub fn large_slot(&self) -> Option<LargeSlot> {
        match *self {
            Self::ValueType(_, StructPayload::Large(slot)) => Some(slot),
            _ => None,
        }
    }
}

/// Releases the side-stack slot owned by a popped large-struct value.
#[inline]
pub fn dispose(structs: &mut StructStack, value: StackValue) {
    if let Some(slot) = value.large_slot() {
        structs.free(slot);
    }
}

/// Copies the raw bytes of a value-type payload.
pub fn payload_bytes(
    structs: &StructStack,
    payload: StructPayload,
    size: usize,
) -> Result<Vec<u8>, VmError> {
    match payload {
        StructPayload::Inline(bits) => Ok(bits.to_le_bytes()[..size.min(8)].to_vec()),
        StructPayload::Large(slot) => structs
            .bytes(slot)
            .get(..size)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| VmError::invalid(format!("struct payload shorter than {size} bytes"))),
    }
}

/// Builds a value-type stack value from raw bytes.
pub fn payload_from_bytes(
    types: &TypeRegistry,
    structs: &mut StructStack,
    ty: TypeId,
    bytes: &[u8],
) -> StackValue {
    if types.ty(ty).is_large_struct() {
        StackValue::ValueType(ty, StructPayload::Large(structs.push_bytes(bytes)))
    } else {
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        StackValue::ValueType(ty, StructPayload::Inline(u64::from_le_bytes(buf)))
    }
}

/// Reads a value of declared type `ty` stored at `ptr`, widening it to its
/// stack representation.
///
/// # Safety
/// `ptr` must be valid for reads of `types.value_size(ty)` bytes.
pub unsafe fn read_value(
    types: &TypeRegistry,
    structs: &mut StructStack,
    ptr: *const u8,
    ty: TypeId,
) -> StackValue {
    let desc = types.ty(ty);
    // SAFETY: caller guarantees `ptr` covers the value
    unsafe {
        match desc.category {
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                read_primitive(ptr, kind)
            }
            TypeCategory::Struct => {
                let size = desc.instance_size;
                let bytes = std::slice::from_raw_parts(ptr, size);
                payload_from_bytes(types, structs, ty, bytes)
            }
            TypeCategory::ByRef => {
                StackValue::ByRef(ptr.cast::<*mut u8>().read_unaligned())
            }
            TypeCategory::Pointer => {
                StackValue::NativeInt(ptr.cast::<isize>().read_unaligned())
            }
            _ => StackValue::Object(ptr.cast::<ObjectRef>().read_unaligned()),
        }
    }
}

/// # Safety
/// `ptr` must be valid for reads of `kind.size()` bytes.
pub unsafe fn read_primitive(ptr: *const u8, kind: PrimitiveKind) -> StackValue {
    // SAFETY: by contract
    unsafe {
        match kind {
            PrimitiveKind::Boolean | PrimitiveKind::U1 => {
                StackValue::Int32(ptr.read() as i32)
            }
            PrimitiveKind::I1 => StackValue::Int32(ptr.cast::<i8>().read() as i32),
            PrimitiveKind::Char | PrimitiveKind::U2 => {
                StackValue::Int32(ptr.cast::<u16>().read_unaligned() as i32)
            }
            PrimitiveKind::I2 => {
                StackValue::Int32(ptr.cast::<i16>().read_unaligned() as i32)
            }
            PrimitiveKind::I4 | PrimitiveKind::U4 => {
                StackValue::Int32(ptr.cast::<i32>().read_unaligned())
            }
            PrimitiveKind::I8 | PrimitiveKind::U8 => {
                StackValue::Int64(ptr.cast::<i64>().read_unaligned())
            }
            PrimitiveKind::R4 => {
                StackValue::Double(ptr.cast::<f32>().read_unaligned() as f64)
            }
            PrimitiveKind::R8 => {
                StackValue::Double(ptr.cast::<f64>().read_unaligned())
            }
            PrimitiveKind::I | PrimitiveKind::U => {
                StackValue::NativeInt(ptr.cast::<isize>().read_unaligned())
            }
        }
    }
}

/// Stores `value` at `ptr` as declared type `ty`, narrowing integers and
/// floats to the storage width. Large struct slots are left untouched, the
/// caller disposes of them.
///
/// # Safety
/// `ptr` must be valid for writes of `types.value_size(ty)` bytes.
pub unsafe fn write_value(
    types: &TypeRegistry,
    structs: &StructStack,
    ptr: *mut u8,
    ty: TypeId,
    value: StackValue,
) -> Result<(), VmError> {
    let desc = types.ty(ty);
    // SAFETY: caller guarantees `ptr` covers the value
    unsafe {
        match desc.category {
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                write_primitive(ptr, kind, value)
            }
            TypeCategory::Struct => {
                let StackValue::ValueType(_, payload) = value else {
                    return Err(value.mismatch("value type"));
                };
                let size = desc.instance_size;
                let bytes = payload_bytes(structs, payload, size)?;
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                Ok(())
            }
            TypeCategory::ByRef | TypeCategory::Pointer => {
                let pointer = value.as_pointer()?;
                ptr.cast::<*mut u8>().write_unaligned(pointer);
                Ok(())
            }
            _ => {
                let object = value.as_object()?;
                ptr.cast::<ObjectRef>().write_unaligned(object);
                Ok(())
            }
        }
    }
}

/// # Safety
/// `ptr` must be valid for writes of `kind.size()` bytes.
pub unsafe fn write_primitive(
    ptr: *mut u8,
    kind: PrimitiveKind,
    value: StackValue,
) -> Result<(), VmError> {
    // SAFETY: by contract
    unsafe {
        match kind {
            PrimitiveKind::Boolean
            | PrimitiveKind::I1
            | PrimitiveKind::U1 => ptr.write(value.as_native()? as u8),
            PrimitiveKind::Char | PrimitiveKind::I2 | PrimitiveKind::U2 => {
                ptr.cast::<u16>().write_unaligned(value.as_native()? as u16)
            }
            PrimitiveKind::I4 | PrimitiveKind::U4 => {
                ptr.cast::<i32>().write_unaligned(value.as_native()? as i32)
            }
            PrimitiveKind::I8 | PrimitiveKind::U8 => {
                ptr.cast::<i64>().write_unaligned(value.as_i64()?)
            }
            PrimitiveKind::R4 => {
                ptr.cast::<f32>().write_unaligned(value.as_f64()? as f32)
            }
            PrimitiveKind::R8 => {
                ptr.cast::<f64>().write_unaligned(value.as_f64()?)
            }
            PrimitiveKind::I | PrimitiveKind::U => {
                ptr.cast::<isize>().write_unaligned(value.as_native()?)
            }
        }
    }
    Ok(())
}

/// Re-widens a value stored through a narrower primitive, the way a load
/// from memory of that width would.
pub fn canonicalize(kind: PrimitiveKind, value: StackValue) -> StackValue {
    let Ok(bits) = value.as_native() else {
        return value;
    };
    match kind {
        PrimitiveKind::Boolean => StackValue::Int32((bits as u8 != 0) as i32),
        PrimitiveKind::I1 => StackValue::Int32(bits as i8 as i32),
        PrimitiveKind::U1 => StackValue::Int32(bits as u8 as i32),
        PrimitiveKind::I2 => StackValue::Int32(bits as i16 as i32),
        PrimitiveKind::Char | PrimitiveKind::U2 => {
            StackValue::Int32(bits as u16 as i32)
        }
        _ => value,
    }
}
