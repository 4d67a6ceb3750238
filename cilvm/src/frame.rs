use std::sync::Arc;

use log::debug;

use crate::{
    MethodBody, MethodId, RegionState, StackAllocator, StackReservation,
    StackValue, StructPayload, StructStack, TypeId, TypeRegistry, VmError,
    types::FrameLayout,
    value::dispose,
    visitor::{RootVisitor, visit_value},
};

/// Activation record of one interpreted call: operand stack and locals live
/// on the stack allocator, large struct operands on the side-stack.
#[derive(Debug)]
pub struct Frame {
    pub method: MethodId,
    pub body: Arc<MethodBody>,
    layout: Arc<FrameLayout>,
    locals: StackReservation,
    locals_base: *mut u8,
    operands: StackReservation,
    stack_base: *mut StackValue,
    depth: usize,
    capacity: usize,
    struct_mark: usize,
    scratch: Vec<StackReservation>,
    pub regions: RegionState,
}

impl Frame {
    pub fn enter(
        types: &TypeRegistry,
        stack: &mut StackAllocator,
        structs: &StructStack,
        method: MethodId,
    ) -> Result<Self, VmError> {
        let desc = types.method(method);
        let (Some(body), Some(layout)) =
            (desc.body.clone(), desc.frame_layout.clone())
        else {
            return Err(VmError::invalid(format!(
                "{} has no prepared body",
                types.method_name(method)
            )));
        };
        let capacity = body.max_stack as usize;
        let locals = stack.reserve(layout.locals_size)?;
        let operands =
            match stack.reserve(capacity * size_of::<StackValue>()) {
                Ok(reservation) => reservation,
                Err(err) => {
                    stack.release(locals);
                    return Err(err);
                }
            };
        debug!(
            "enter {}: {} bytes of locals, {capacity} operand slots",
            types.method_name(method),
            layout.locals_size
        );
        Ok(Self {
            method,
            locals_base: stack.ptr(&locals),
            stack_base: stack.ptr(&operands).cast(),
            locals,
            operands,
            layout,
            body,
            depth: 0,
            capacity,
            struct_mark: structs.mark(),
            scratch: Vec::new(),
            regions: RegionState::new(),
        })
    }

    /// Releases everything the frame reserved, in reverse order.
    pub fn exit(mut self, stack: &mut StackAllocator, structs: &mut StructStack) {
        structs.release_to(self.struct_mark);
        while let Some(block) = self.scratch.pop() {
            stack.release(block);
        }
        stack.release(self.operands);
        stack.release(self.locals);
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn push(&mut self, value: StackValue) -> Result<(), VmError> {
        if self.depth == self.capacity {
            return Err(VmError::invalid(format!(
                "operand stack overflow (max {})",
                self.capacity
            )));
        }
        // SAFETY: depth < capacity, the reservation holds `capacity` values
        unsafe { self.stack_base.add(self.depth).write(value) };
        self.depth += 1;
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<StackValue, VmError> {
        if self.depth == 0 {
            return Err(VmError::invalid("operand stack underflow"));
        }
        self.depth -= 1;
        // SAFETY: slots below depth were written by `push`
        Ok(unsafe { self.stack_base.add(self.depth).read() })
    }

    /// Value `n` slots below the top, 0 being the top.
    pub fn peek(&self, n: usize) -> Result<StackValue, VmError> {
        if n >= self.depth {
            return Err(VmError::invalid("operand stack underflow"));
        }
        // SAFETY: below depth
        Ok(unsafe { self.stack_base.add(self.depth - 1 - n).read() })
    }

    /// Pops `count` values, returning them in push order.
    pub fn pop_n(&mut self, count: usize) -> Result<Vec<StackValue>, VmError> {
        if count > self.depth {
            return Err(VmError::invalid("operand stack underflow"));
        }
        self.depth -= count;
        // SAFETY: the popped range was written by `push`
        Ok((0..count)
            .map(|i| unsafe { self.stack_base.add(self.depth + i).read() })
            .collect())
    }

    /// Empties the operand stack, freeing any large struct payloads.
    pub fn clear_stack(&mut self, structs: &mut StructStack) {
        while let Ok(value) = self.pop() {
            dispose(structs, value);
        }
    }

    pub fn local_count(&self) -> usize {
        self.body.locals.len()
    }

    pub fn local_type(&self, index: usize) -> Result<TypeId, VmError> {
        self.body
            .locals
            .get(index)
            .copied()
            .ok_or_else(|| VmError::invalid(format!("local {index} out of range")))
    }

    pub fn local_ptr(&self, index: usize) -> Result<*mut u8, VmError> {
        let offset = self
            .layout
            .local_offsets
            .get(index)
            .ok_or_else(|| VmError::invalid(format!("local {index} out of range")))?;
        // SAFETY: offsets lie within the locals reservation
        Ok(unsafe { self.locals_base.add(*offset) })
    }

    /// Reserves a zeroed scratch block that lives until the frame exits.
    pub fn localloc(
        &mut self,
        stack: &mut StackAllocator,
        size: usize,
    ) -> Result<*mut u8, VmError> {
        let block = stack.reserve(size)?;
        let ptr = stack.ptr(&block);
        self.scratch.push(block);
        Ok(ptr)
    }

    /// Reports every reference the frame keeps alive: operand stack values,
    /// locals and exceptions held by active handlers.
    pub fn visit_roots(
        &mut self,
        types: &TypeRegistry,
        structs: &mut StructStack,
        visitor: &mut impl RootVisitor,
    ) {
        for index in 0..self.depth {
            // SAFETY: below depth
            let slot = unsafe { self.stack_base.add(index) };
            // SAFETY: written by `push`
            match unsafe { &mut *slot } {
                StackValue::Object(object) => visitor.visit_object(object),
                StackValue::ByRef(pointer) => visitor.visit_by_ref(*pointer),
                StackValue::ValueType(ty, StructPayload::Inline(bits)) => {
                    let mut bytes = bits.to_le_bytes();
                    visitor.visit_struct(types, *ty, bytes.as_mut_ptr());
                    *bits = u64::from_le_bytes(bytes);
                }
                StackValue::ValueType(ty, StructPayload::Large(slot)) => {
                    let data = structs.bytes_mut(*slot).as_mut_ptr();
                    visitor.visit_struct(types, *ty, data);
                }
                _ => {}
            }
        }
        for index in 0..self.local_count() {
            if let (Ok(ty), Ok(ptr)) = (self.local_type(index), self.local_ptr(index)) {
                visit_value(types, ty, ptr, visitor);
            }
        }
        self.regions.visit_roots(visitor);
    }
}
