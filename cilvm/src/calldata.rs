//! Calling-convention marshaling.
//!
//! Every argument occupies one 8-byte slot. Large value types are copied
//! into a backing region appended to the buffer and the slot holds its
//! address, so taking the address of such an argument yields the region.

use crate::{
    MethodId, PrimitiveKind, RuntimeType, StackAllocator, StackItemKind,
    StackReservation, StackValue, StructStack, TypeCategory, TypeId,
    TypeRegistry, VmError,
    layout::align_up,
    value::{canonicalize, read_value, write_value},
};

const SLOT_SIZE: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArgumentSlot {
    pub offset: usize,
    /// declared type, `None` for a by-ref receiver of a value-type method
    pub ty: Option<TypeId>,
    pub runtime: RuntimeType,
    /// backing region of a large value type
    pub large: Option<usize>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallConvention {
    Standard,
    /// String and multi-dimensional array constructors allocate the object
    /// themselves and hand it back through the return slot.
    PseudoConstructor(TypeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentLayout {
    pub slots: Vec<ArgumentSlot>,
    pub ret: Option<ArgumentSlot>,
    pub total_size: usize,
}

/// Describes the slots a call to `method` needs.
///
/// The receiver's type comes from the object actually on the stack when one
/// is supplied, otherwise from the declaring type: a null reference carries
/// no runtime type.
pub fn prepare_arguments(
    types: &TypeRegistry,
    method: MethodId,
    this_from_stack: Option<&StackValue>,
    convention: CallConvention,
) -> ArgumentLayout {
    let desc = types.method(method);
    let mut declared = Vec::with_capacity(desc.signature.argument_count());

    if desc.signature.has_this
        && convention == CallConvention::Standard
    {
        let owner = desc.owner;
        let receiver = match this_from_stack {
            // value-type methods see a boxed receiver through its payload
            _ if types.is_value_type(owner) => {
                (None, RuntimeType::new(StackItemKind::ByRef, Some(owner)))
            }
            Some(StackValue::Object(object)) if !object.is_null() => {
                let ty = object.type_id().unwrap_or(owner);
                (Some(ty), RuntimeType::new(StackItemKind::Object, Some(ty)))
            }
            _ => (
                Some(owner),
                RuntimeType::new(StackItemKind::Object, Some(owner)),
            ),
        };
        declared.push(receiver);
    }
    for &param in &desc.signature.params {
        declared.push((Some(param), RuntimeType::of(types, param)));
    }

    let ret = match convention {
        CallConvention::PseudoConstructor(ty) => Some(ty),
        CallConvention::Standard => desc.signature.ret,
    };

    let mut offset = 0;
    let mut large_regions = Vec::new();
    let mut slots = Vec::with_capacity(declared.len());
    for (ty, runtime) in declared {
        if let Some(ty) = ty.filter(|&ty| types.ty(ty).is_large_struct()) {
            large_regions.push((slots.len(), types.value_size(ty)));
        }
        slots.push(ArgumentSlot {
            offset,
            ty,
            runtime,
            large: None,
        });
        offset += SLOT_SIZE;
    }

    let mut ret_slot = ret.map(|ty| {
        let slot = ArgumentSlot {
            offset,
            ty: Some(ty),
            runtime: RuntimeType::of(types, ty),
            large: None,
        };
        offset += SLOT_SIZE;
        slot
    });

    for (index, size) in large_regions {
        slots[index].large = Some(offset);
        offset = align_up(offset + size, 8);
    }
    if let Some(slot) = ret_slot.as_mut() {
        if let Some(ty) = slot.ty.filter(|&ty| types.ty(ty).is_large_struct()) {
            slot.large = Some(offset);
            offset = align_up(offset + types.value_size(ty), 8);
        }
    }

    ArgumentLayout {
        slots,
        ret: ret_slot,
        total_size: offset,
    }
}

/// Marshaled arguments and return value of one call activation. The buffer
/// lives on the stack allocator and must be released on every exit path.
#[derive(Debug)]
#[must_use]
pub struct MethodCallData {
    method: MethodId,
    reservation: StackReservation,
    base: *mut u8,
    layout: ArgumentLayout,
}

impl MethodCallData {
    pub fn new(
        stack: &mut StackAllocator,
        method: MethodId,
        layout: ArgumentLayout,
    ) -> Result<Self, VmError> {
        let reservation = stack.reserve(layout.total_size)?;
        let base = stack.ptr(&reservation);
        for slot in layout.slots.iter().chain(layout.ret.iter()) {
            if let Some(region) = slot.large {
                // SAFETY: slot and region both lie within the reservation
                unsafe {
                    base.add(slot.offset)
                        .cast::<*mut u8>()
                        .write(base.add(region));
                }
            }
        }
        Ok(Self {
            method,
            reservation,
            base,
            layout,
        })
    }

    pub fn prepare(
        types: &TypeRegistry,
        stack: &mut StackAllocator,
        method: MethodId,
        this_from_stack: Option<&StackValue>,
        convention: CallConvention,
    ) -> Result<Self, VmError> {
        let layout =
            prepare_arguments(types, method, this_from_stack, convention);
        Self::new(stack, method, layout)
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn argument_count(&self) -> usize {
        self.layout.slots.len()
    }

    pub fn slot(&self, index: usize) -> Result<&ArgumentSlot, VmError> {
        self.layout.slots.get(index).ok_or_else(|| {
            VmError::invalid(format!("argument {index} out of range"))
        })
    }

    fn storage(&self, slot: &ArgumentSlot) -> *mut u8 {
        // SAFETY: offsets were computed for this buffer
        unsafe { self.base.add(slot.large.unwrap_or(slot.offset)) }
    }

    /// Address of the argument's storage, what `ldarga` pushes.
    pub fn argument_address(&self, index: usize) -> Result<*mut u8, VmError> {
        let slot = self.slot(index)?;
        Ok(self.storage(slot))
    }

    pub fn get_argument(
        &self,
        types: &TypeRegistry,
        structs: &mut StructStack,
        index: usize,
    ) -> Result<StackValue, VmError> {
        let slot = *self.slot(index)?;
        Ok(self.read_slot(types, structs, &slot))
    }

    pub fn set_argument(
        &mut self,
        types: &TypeRegistry,
        structs: &StructStack,
        index: usize,
        value: StackValue,
    ) -> Result<(), VmError> {
        let slot = *self.slot(index)?;
        self.write_slot(types, structs, &slot, value)
    }

    pub fn return_type(&self) -> Option<TypeId> {
        self.layout.ret.and_then(|slot| slot.ty)
    }

    pub fn set_return(
        &mut self,
        types: &TypeRegistry,
        structs: &StructStack,
        value: StackValue,
    ) -> Result<(), VmError> {
        let slot = self.layout.ret.ok_or_else(|| {
            VmError::invalid("value returned from a void method")
        })?;
        self.write_slot(types, structs, &slot, value)
    }

    pub fn get_return(
        &self,
        types: &TypeRegistry,
        structs: &mut StructStack,
    ) -> Option<StackValue> {
        let slot = self.layout.ret?;
        Some(self.read_slot(types, structs, &slot))
    }

    fn read_slot(
        &self,
        types: &TypeRegistry,
        structs: &mut StructStack,
        slot: &ArgumentSlot,
    ) -> StackValue {
        let ptr = self.storage(slot);
        let Some(ty) = slot.ty else {
            // SAFETY: receiver slots are pointer sized
            return StackValue::ByRef(unsafe { ptr.cast::<*mut u8>().read() });
        };
        if let Some(kind) = narrow_kind(types, ty) {
            // SAFETY: narrow primitives are stored as a 32-bit slot value
            let bits = unsafe { ptr.cast::<i32>().read() };
            return canonicalize(kind, StackValue::Int32(bits));
        }
        // SAFETY: the storage covers a value of the declared type
        unsafe { read_value(types, structs, ptr, ty) }
    }

    fn write_slot(
        &mut self,
        types: &TypeRegistry,
        structs: &StructStack,
        slot: &ArgumentSlot,
        value: StackValue,
    ) -> Result<(), VmError> {
        let ptr = self.storage(slot);
        let Some(ty) = slot.ty else {
            let pointer = match value {
                StackValue::Object(object) if !object.is_null() => {
                    object.data_ptr()
                }
                other => other.as_pointer()?,
            };
            // SAFETY: receiver slots are pointer sized
            unsafe { ptr.cast::<*mut u8>().write(pointer) };
            return Ok(());
        };
        if let Some(kind) = narrow_kind(types, ty) {
            let StackValue::Int32(bits) = canonicalize(kind, value) else {
                return Err(VmError::StackTypeMismatch {
                    expected: "int32",
                    found: value.kind(),
                });
            };
            // SAFETY: slots are 8 bytes
            unsafe { ptr.cast::<i64>().write(bits as i64) };
            return Ok(());
        }
        // SAFETY: the storage covers a value of the declared type
        unsafe { write_value(types, structs, ptr, ty, value) }
    }

    pub fn release(self, stack: &mut StackAllocator) {
        stack.release(self.reservation);
    }
}

/// Primitive kinds narrower than 32 bits.
fn narrow_kind(types: &TypeRegistry, ty: TypeId) -> Option<PrimitiveKind> {
    match types.ty(ty).category {
        TypeCategory::Primitive(kind) | TypeCategory::Enum(kind)
            if kind.size() < 4 =>
        {
            Some(kind)
        }
        _ => None,
    }
}
