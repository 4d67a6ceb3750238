//! Calls, object creation, field access, arrays, boxing and casts.

use log::trace;

use crate::{
    Allocator, CallConvention, Constant, FieldId, Instruction, MetadataProvider,
    MethodCallData, MethodId, ObjectRef, PrimitiveKind, RuntimeFailure,
    StackValue, TypeId, TypeShape, VmError,
    object,
    value::{dispose, payload_bytes, read_primitive, read_value, write_primitive, write_value},
};

use super::Interpreter;

impl Interpreter<'_, '_> {
    /// Marshals `args` into a fresh call buffer and invokes `method`. The
    /// popped arguments are consumed whether or not the call succeeds.
    fn invoke_with(
        &mut self,
        method: MethodId,
        args: Vec<StackValue>,
        convention: CallConvention,
    ) -> Result<Option<StackValue>, VmError> {
        let rt = &mut *self.rt;
        let has_this = rt.types.method(method).signature.has_this
            && convention == CallConvention::Standard;
        let this = if has_this { args.first() } else { None };
        let prepared = MethodCallData::prepare(&rt.types, &mut rt.stack, method, this, convention);
        let mut data = match prepared {
            Ok(data) => data,
            Err(err) => {
                for arg in args {
                    dispose(&mut rt.structs, arg);
                }
                return Err(err);
            }
        };
        let mut marshaled = Ok(());
        for (index, &arg) in args.iter().enumerate() {
            marshaled = data.set_argument(&rt.types, &rt.structs, index, arg);
            if marshaled.is_err() {
                break;
            }
        }
        // free in reverse so the side-stack pops back down
        for arg in args.into_iter().rev() {
            dispose(&mut rt.structs, arg);
        }
        if let Err(err) = marshaled {
            data.release(&mut rt.stack);
            return Err(err);
        }
        let data = rt.invoke(method, data)?;
        let result = data.get_return(&rt.types, &mut rt.structs);
        data.release(&mut rt.stack);
        Ok(result)
    }

    fn push_result(&mut self, result: Option<StackValue>) -> Result<(), VmError> {
        match result {
            Some(value) => self.push(value),
            None => Ok(()),
        }
    }

    fn pop_arguments(&mut self, method: MethodId) -> Result<Vec<StackValue>, VmError> {
        let count = self.rt.types.method(method).signature.argument_count();
        self.frame.pop_n(count)
    }

    fn discard(&mut self, args: Vec<StackValue>) {
        for arg in args.into_iter().rev() {
            dispose(&mut self.rt.structs, arg);
        }
    }

    pub(super) fn call(&mut self, method: MethodId) -> Result<(), VmError> {
        let args = self.pop_arguments(method)?;
        let result = self.invoke_with(method, args, CallConvention::Standard)?;
        self.push_result(result)
    }

    /// `callvirt`, with the receiver rewritten first when a `constrained.`
    /// prefix names its type.
    pub(super) fn call_virtual(
        &mut self,
        method: MethodId,
        constrained: Option<TypeId>,
    ) -> Result<(), VmError> {
        let mut args = self.pop_arguments(method)?;
        let Some(&receiver) = args.first() else {
            return Err(VmError::invalid(format!(
                "callvirt of static {}",
                self.rt.types.method_name(method)
            )));
        };

        if let Some(ty) = constrained {
            let address = receiver.as_pointer()?;
            if self.rt.types.is_value_type(ty) {
                let types = &self.rt.types;
                let own = types
                    .ty(ty)
                    .method_table
                    .get(&method)
                    .copied()
                    .filter(|&target| types.method(target).owner == ty);
                if let Some(target) = own {
                    // the value type implements it: call in place
                    trace!("constrained call to {} in place", types.method_name(target));
                    let result = self.invoke_with(target, args, CallConvention::Standard)?;
                    return self.push_result(result);
                }
                let rt = &mut *self.rt;
                // SAFETY: a constrained receiver points at a value of `ty`
                let value = unsafe { read_value(&rt.types, &mut rt.structs, address, ty) };
                let boxed = object::box_value(&mut rt.heap, &rt.types, &rt.structs, ty, value);
                dispose(&mut rt.structs, value);
                args[0] = StackValue::Object(boxed?);
            } else {
                // SAFETY: a constrained reference receiver points at a reference
                args[0] = StackValue::Object(unsafe { address.cast::<ObjectRef>().read_unaligned() });
            }
        }

        let object = args[0].as_object()?;
        let Some(runtime_type) = object.type_id() else {
            self.discard(args);
            return Err(self.rt.raise(RuntimeFailure::NullReference));
        };
        let target = if self.rt.types.method(method).is_virtual() {
            object::resolve_virtual(&self.rt.types, method, runtime_type)?
        } else {
            method
        };
        let result = self.invoke_with(target, args, CallConvention::Standard)?;
        self.push_result(result)
    }

    /// `calli` through a pointer pushed by `ldftn`/`ldvirtftn`.
    pub(super) fn call_indirect(&mut self) -> Result<(), VmError> {
        let pointer = self.pop()?.as_native()?;
        let method = MethodId(pointer as u32);
        if pointer < 0 || method.index() >= self.rt.types.method_count() {
            return Err(VmError::invalid(format!("calli through bad pointer {pointer}")));
        }
        self.call(method)
    }

    /// `newobj`: strings and multi-dimensional arrays build themselves,
    /// value types are constructed in a temporary, classes on the heap.
    pub(super) fn new_object(&mut self, ctor: MethodId) -> Result<(), VmError> {
        let owner = self.rt.types.method(ctor).owner;
        self.rt.ensure_static_constructor_has_run(owner)?;
        let params = self.rt.types.method(ctor).signature.params.len();
        let args = self.frame.pop_n(params)?;

        let desc = self.rt.types.ty(owner);
        let is_value_type = desc.is_value_type();
        let builds_itself = owner == self.rt.types.well_known.string
            || matches!(desc.shape, TypeShape::MdArray { .. });
        if builds_itself {
            let result =
                self.invoke_with(ctor, args, CallConvention::PseudoConstructor(owner))?;
            let Some(value) = result else {
                return Err(VmError::invalid("constructor produced no object"));
            };
            return self.push(value);
        }

        if is_value_type {
            let size = self.rt.types.value_size(owner);
            let temp = self.rt.stack.reserve(size)?;
            let address = self.rt.stack.ptr(&temp);
            let mut call_args = Vec::with_capacity(params + 1);
            call_args.push(StackValue::ByRef(address));
            call_args.extend(args);
            let constructed = self
                .invoke_with(ctor, call_args, CallConvention::Standard)
                .map(|_| {
                    let rt = &mut *self.rt;
                    // SAFETY: the temporary holds one value of `owner`
                    unsafe { read_value(&rt.types, &mut rt.structs, address, owner) }
                });
            self.rt.stack.release(temp);
            return self.push(constructed?);
        }

        let object = match self.rt.heap.allocate_object(&self.rt.types, owner) {
            Ok(object) => object,
            Err(err) => {
                self.discard(args);
                return Err(err);
            }
        };
        let mut call_args = Vec::with_capacity(params + 1);
        call_args.push(StackValue::Object(object));
        call_args.extend(args);
        self.invoke_with(ctor, call_args, CallConvention::Standard)?;
        self.push(StackValue::Object(object))
    }

    fn resolve_field(&self, instruction: &Instruction) -> Result<FieldId, VmError> {
        self.rt.types.resolve_field(instruction.token()?)
    }

    /// Address of an instance field through an object reference or a
    /// pointer to the containing value.
    fn instance_field_address(
        &mut self,
        receiver: StackValue,
        field: FieldId,
    ) -> Result<*mut u8, VmError> {
        match receiver {
            StackValue::Object(object) => {
                let address = object::field_address(&self.rt.types, object, field);
                self.rt.check(address)
            }
            StackValue::ByRef(_) | StackValue::NativeInt(_) => {
                let base = receiver.as_pointer()?;
                if base.is_null() {
                    return Err(self.rt.raise(RuntimeFailure::NullReference));
                }
                // SAFETY: the pointer addresses a value containing the field
                Ok(unsafe { base.add(self.rt.types.field(field).offset) })
            }
            other => Err(VmError::StackTypeMismatch {
                expected: "object reference or pointer",
                found: other.kind(),
            }),
        }
    }

    pub(super) fn load_field(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let field = self.resolve_field(instruction)?;
        let (ty, offset) = {
            let desc = self.rt.types.field(field);
            (desc.ty, desc.offset)
        };
        let receiver = self.pop()?;
        let value = match receiver {
            StackValue::ValueType(owner, payload) => {
                let rt = &mut *self.rt;
                let bytes = payload_bytes(&rt.structs, payload, rt.types.value_size(owner));
                dispose(&mut rt.structs, receiver);
                let bytes = bytes?;
                if offset + rt.types.value_size(ty) > bytes.len() {
                    return Err(VmError::invalid("field outside of its value"));
                }
                // SAFETY: bounds checked against the copied payload
                unsafe { read_value(&rt.types, &mut rt.structs, bytes.as_ptr().add(offset), ty) }
            }
            other => {
                let address = self.instance_field_address(other, field)?;
                let rt = &mut *self.rt;
                // SAFETY: field storage of type `ty`
                unsafe { read_value(&rt.types, &mut rt.structs, address, ty) }
            }
        };
        self.push(value)
    }

    pub(super) fn load_field_address(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let field = self.resolve_field(instruction)?;
        let receiver = self.pop()?;
        let address = self.instance_field_address(receiver, field)?;
        self.push(StackValue::ByRef(address))
    }

    pub(super) fn store_field(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let field = self.resolve_field(instruction)?;
        let ty = self.rt.types.field(field).ty;
        let value = self.pop()?;
        let receiver = self.pop()?;
        let address = match self.instance_field_address(receiver, field) {
            Ok(address) => address,
            Err(err) => {
                dispose(&mut self.rt.structs, value);
                return Err(err);
            }
        };
        let rt = &mut *self.rt;
        // SAFETY: field storage of type `ty`
        let stored = unsafe { write_value(&rt.types, &rt.structs, address, ty, value) };
        dispose(&mut rt.structs, value);
        stored
    }

    /// Address of a static field, running the owner's static constructor
    /// first.
    fn static_field_address(&mut self, field: FieldId) -> Result<*mut u8, VmError> {
        let owner = self.rt.types.field(field).owner;
        self.rt.ensure_static_constructor_has_run(owner)?;
        let rt = &mut *self.rt;
        Ok(rt.statics.field_address(&rt.types, field))
    }

    pub(super) fn load_static_field(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let field = self.resolve_field(instruction)?;
        let desc = self.rt.types.field(field);
        if desc.is_literal() {
            let value = match desc.constant.clone() {
                Some(Constant::Int32(v)) => StackValue::Int32(v),
                Some(Constant::Int64(v)) => StackValue::Int64(v),
                Some(Constant::Double(v)) => StackValue::Double(v),
                Some(Constant::String(text)) => {
                    let rt = &mut *self.rt;
                    StackValue::Object(rt.strings.get_or_add(&mut rt.heap, &rt.types, &text)?)
                }
                Some(Constant::Null) | None => StackValue::NULL,
            };
            return self.push(value);
        }
        let owner = desc.owner;
        self.rt.ensure_static_constructor_has_run(owner)?;
        let value = self.rt.load_static(field)?;
        self.push(value)
    }

    pub(super) fn load_static_field_address(
        &mut self,
        instruction: &Instruction,
    ) -> Result<(), VmError> {
        let field = self.resolve_field(instruction)?;
        let address = self.static_field_address(field)?;
        self.push(StackValue::ByRef(address))
    }

    pub(super) fn store_static_field(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let field = self.resolve_field(instruction)?;
        let value = self.pop()?;
        let address = match self.static_field_address(field) {
            Ok(address) => address,
            Err(err) => {
                dispose(&mut self.rt.structs, value);
                return Err(err);
            }
        };
        let rt = &mut *self.rt;
        let ty = rt.types.field(field).ty;
        // SAFETY: static slot of the field's type
        let stored = unsafe { write_value(&rt.types, &rt.structs, address, ty, value) };
        dispose(&mut rt.structs, value);
        stored
    }

    pub(super) fn load_object(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let address = self.pop_address()?;
        let rt = &mut *self.rt;
        // SAFETY: the program supplies the address of a `ty`
        let value = unsafe { read_value(&rt.types, &mut rt.structs, address, ty) };
        self.push(value)
    }

    pub(super) fn store_object(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let value = self.pop()?;
        let address = self.pop_address()?;
        let rt = &mut *self.rt;
        // SAFETY: as above
        let stored = unsafe { write_value(&rt.types, &rt.structs, address, ty, value) };
        dispose(&mut rt.structs, value);
        stored
    }

    pub(super) fn copy_object(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let source = self.pop_address()?;
        let destination = self.pop_address()?;
        let size = self.rt.types.value_size(ty);
        // SAFETY: both point at a `ty`
        unsafe { std::ptr::copy(source, destination, size) };
        Ok(())
    }

    pub(super) fn init_object(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let address = self.pop_address()?;
        let size = self.rt.types.value_size(ty);
        // SAFETY: points at a `ty`
        unsafe { address.write_bytes(0, size) };
        Ok(())
    }

    pub(super) fn box_value(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let value = self.pop()?;
        let rt = &mut *self.rt;
        let boxed = object::box_value(&mut rt.heap, &rt.types, &rt.structs, ty, value);
        dispose(&mut rt.structs, value);
        self.push(StackValue::Object(boxed?))
    }

    fn unboxed_address(&mut self, ty: TypeId) -> Result<*mut u8, VmError> {
        let boxed = self.pop_object()?;
        let address = object::unbox(&self.rt.types, boxed, ty);
        self.rt.check(address)
    }

    pub(super) fn unbox(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let address = self.unboxed_address(ty)?;
        self.push(StackValue::ByRef(address))
    }

    pub(super) fn unbox_any(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        if !self.rt.types.is_value_type(ty) {
            return self.cast(instruction, true);
        }
        let address = self.unboxed_address(ty)?;
        let rt = &mut *self.rt;
        // SAFETY: payload of a boxed `ty`
        let value = unsafe { read_value(&rt.types, &mut rt.structs, address, ty) };
        self.push(value)
    }

    /// `castclass` (`raise` set) and `isinst`.
    pub(super) fn cast(&mut self, instruction: &Instruction, raise: bool) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let candidate = self.pop_object()?;
        let matches = object::is_instance_of(&self.rt.types, candidate, ty, raise);
        let value = if self.rt.check(matches)? {
            StackValue::Object(candidate)
        } else {
            StackValue::NULL
        };
        self.push(value)
    }

    pub(super) fn new_array(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let element = self.resolve_type(instruction)?;
        let length = self.pop()?.as_native()?;
        let Ok(length) = usize::try_from(length) else {
            return Err(self.rt.raise(RuntimeFailure::Overflow));
        };
        let rt = &mut *self.rt;
        let ty = rt.types.sz_array_of(element);
        let array = rt.heap.allocate_sz_array(&rt.types, ty, length)?;
        self.push(StackValue::Object(array))
    }

    pub(super) fn array_length(&mut self) -> Result<(), VmError> {
        let array = self.pop_object()?;
        let length = object::array_length(array);
        let length = self.rt.check(length)?;
        self.push(StackValue::NativeInt(length as isize))
    }

    /// Pops index and array, null- and bounds-checked.
    fn pop_element(&mut self) -> Result<(ObjectRef, *mut u8), VmError> {
        let index = self.pop()?.as_native()?;
        let array = self.pop_object()?;
        let address = object::element_address(&self.rt.types, array, index);
        Ok((array, self.rt.check(address)?))
    }

    pub(super) fn load_element_address(&mut self, _: &Instruction) -> Result<(), VmError> {
        let (_, address) = self.pop_element()?;
        self.push(StackValue::ByRef(address))
    }

    /// `ldelem.<kind>`, `ldelem.ref` when `kind` is `None`.
    pub(super) fn load_element(&mut self, kind: Option<PrimitiveKind>) -> Result<(), VmError> {
        let (_, address) = self.pop_element()?;
        // SAFETY: in-bounds element
        let value = unsafe {
            match kind {
                Some(kind) => read_primitive(address, kind),
                None => StackValue::Object(address.cast::<ObjectRef>().read_unaligned()),
            }
        };
        self.push(value)
    }

    pub(super) fn load_element_typed(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        let (_, address) = self.pop_element()?;
        let rt = &mut *self.rt;
        // SAFETY: in-bounds element of type `ty`
        let value = unsafe { read_value(&rt.types, &mut rt.structs, address, ty) };
        self.push(value)
    }

    /// `stelem.<kind>`, or `stelem.ref` with its covariance check.
    pub(super) fn store_element(&mut self, kind: Option<PrimitiveKind>) -> Result<(), VmError> {
        let value = self.pop()?;
        let (array, address) = self.pop_element()?;
        match kind {
            // SAFETY: in-bounds element
            Some(kind) => unsafe { write_primitive(address, kind, value) },
            None => {
                let stored = value.as_object()?;
                if let Some(actual) = stored.type_id() {
                    let element = object::array_element_type(&self.rt.types, array);
                    let element = self.rt.check(element)?;
                    if !object::is_assignable_to(&self.rt.types, actual, element) {
                        return Err(self.rt.raise(RuntimeFailure::ArrayTypeMismatch));
                    }
                }
                // SAFETY: in-bounds reference element
                unsafe { address.cast::<ObjectRef>().write_unaligned(stored) };
                Ok(())
            }
        }
    }

    pub(super) fn store_element_typed(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let ty = self.resolve_type(instruction)?;
        if self.rt.types.is_reference_type(ty) {
            return self.store_element(None);
        }
        let value = self.pop()?;
        let (_, address) = match self.pop_element() {
            Ok(element) => element,
            Err(err) => {
                dispose(&mut self.rt.structs, value);
                return Err(err);
            }
        };
        let rt = &mut *self.rt;
        // SAFETY: in-bounds element of type `ty`
        let stored = unsafe { write_value(&rt.types, &rt.structs, address, ty, value) };
        dispose(&mut rt.structs, value);
        stored
    }
}
