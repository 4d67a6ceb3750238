use std::{alloc::Layout, ptr::NonNull};

use crate::{VmError, layout::align_up};

/// A region handed out by [`StackAllocator::reserve`]. Must be given back
/// through [`StackAllocator::release`] in LIFO order.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct StackReservation {
    offset: usize,
    size: usize,
}

impl StackReservation {
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Bump allocator backing operand stacks, locals and call data. Addresses
/// handed out stay valid until released, the buffer never moves.
#[derive(Debug)]
pub struct StackAllocator {
    memory: NonNull<u8>,
    layout: Layout,
    used: usize,
    high_water: usize,
}

impl StackAllocator {
    const ALIGN: usize = 16;

    pub fn new(size: usize) -> Result<Self, VmError> {
        let size = align_up(size.max(Self::ALIGN), Self::ALIGN);
        let layout = Layout::from_size_align(size, Self::ALIGN)
            .map_err(|_| VmError::OutOfMemory { requested: size })?;
        // SAFETY: layout size is non-zero
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let memory =
            NonNull::new(raw).ok_or(VmError::OutOfMemory { requested: size })?;
        Ok(Self {
            memory,
            layout,
            used: 0,
            high_water: 0,
        })
    }

    /// Reserves `size` zeroed bytes, 8-byte aligned.
    pub fn reserve(&mut self, size: usize) -> Result<StackReservation, VmError> {
        let size = align_up(size, 8);
        let available = self.layout.size() - self.used;
        if size > available {
            return Err(VmError::StackOverflow {
                requested: size,
                available,
            });
        }
        let reservation = StackReservation {
            offset: self.used,
            size,
        };
        // SAFETY: in bounds, checked above
        unsafe { self.ptr(&reservation).write_bytes(0, size) };
        self.used += size;
        self.high_water = self.high_water.max(self.used);
        Ok(reservation)
    }

    #[inline]
    pub fn ptr(&self, reservation: &StackReservation) -> *mut u8 {
        // SAFETY: reservations are always within the buffer
        unsafe { self.memory.as_ptr().add(reservation.offset) }
    }

    pub fn release(&mut self, reservation: StackReservation) {
        assert_eq!(
            reservation.offset + reservation.size,
            self.used,
            "stack reservations must be released in LIFO order"
        );
        self.used = reservation.offset;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout
        unsafe { std::alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}

/// Handle to a large struct on the side-stack. The generation detects use of
/// a handle whose slot was freed and reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LargeSlot {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct SlotEntry {
    offset: usize,
    len: usize,
    generation: u32,
    live: bool,
}

/// Side-stack for value types too large for a single operand slot. The
/// buffer grows geometrically and is never shrunk; slots are addressed by
/// handle rather than pointer so growth cannot leave dangling references.
#[derive(Debug)]
pub struct StructStack {
    data: Vec<u8>,
    entries: Vec<SlotEntry>,
    top: usize,
    generation: u32,
}

impl StructStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            entries: Vec::new(),
            top: 0,
            generation: 0,
        }
    }

    /// Allocates `len` zeroed bytes.
    pub fn allocate(&mut self, len: usize) -> LargeSlot {
        let offset = align_up(self.top, 8);
        let end = offset + len;
        if end > self.data.len() {
            let grown = end.max(self.data.len() * 2);
            self.data.resize(grown, 0);
        }
        self.data[offset..end].fill(0);
        self.top = end;
        self.generation = self.generation.wrapping_add(1);
        self.entries.push(SlotEntry {
            offset,
            len,
            generation: self.generation,
            live: true,
        });
        LargeSlot {
            index: (self.entries.len() - 1) as u32,
            generation: self.generation,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> LargeSlot {
        let slot = self.allocate(bytes.len());
        self.bytes_mut(slot).copy_from_slice(bytes);
        slot
    }

    pub fn duplicate(&mut self, slot: LargeSlot) -> LargeSlot {
        let bytes = self.bytes(slot).to_vec();
        self.push_bytes(&bytes)
    }

    fn entry(&self, slot: LargeSlot) -> &SlotEntry {
        let entry = &self.entries[slot.index as usize];
        assert!(
            entry.live && entry.generation == slot.generation,
            "stale large struct handle {slot:?}"
        );
        entry
    }

    pub fn bytes(&self, slot: LargeSlot) -> &[u8] {
        let entry = self.entry(slot);
        &self.data[entry.offset..entry.offset + entry.len]
    }

    pub fn bytes_mut(&mut self, slot: LargeSlot) -> &mut [u8] {
        let (offset, len) = {
            let entry = self.entry(slot);
            (entry.offset, entry.len)
        };
        &mut self.data[offset..offset + len]
    }

    /// Marks the slot dead and pops every dead slot off the top.
    pub fn free(&mut self, slot: LargeSlot) {
        let index = slot.index as usize;
        if self.entries.get(index).is_some_and(|e| {
            e.live && e.generation == slot.generation
        }) {
            self.entries[index].live = false;
        }
        while self.entries.last().is_some_and(|e| !e.live) {
            self.entries.pop();
        }
        self.top = self.entries.last().map_or(0, |e| e.offset + e.len);
    }

    /// Position to [`release_to`](Self::release_to) when a frame exits.
    pub fn mark(&self) -> usize {
        self.entries.len()
    }

    /// Frees every slot allocated since `mark`.
    pub fn release_to(&mut self, mark: usize) {
        self.entries.truncate(mark);
        while self.entries.last().is_some_and(|e| !e.live) {
            self.entries.pop();
        }
        self.top = self.entries.last().map_or(0, |e| e.offset + e.len);
    }

    pub fn live_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.live).count()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_zeroed_and_lifo() {
        let mut stack = StackAllocator::new(256).expect("stack");
        let a = stack.reserve(12).expect("a");
        assert_eq!(a.size(), 16);
        // SAFETY: 16 bytes reserved
        unsafe { stack.ptr(&a).write_bytes(0xAB, 16) };
        let b = stack.reserve(8).expect("b");
        assert_eq!(stack.used(), 24);
        stack.release(b);
        stack.release(a);
        let c = stack.reserve(16).expect("c");
        // SAFETY: 16 bytes reserved
        let bytes = unsafe { std::slice::from_raw_parts(stack.ptr(&c), 16) };
        assert!(bytes.iter().all(|&b| b == 0));
        stack.release(c);
        assert_eq!(stack.used(), 0);
        assert_eq!(stack.high_water(), 24);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut stack = StackAllocator::new(32).expect("stack");
        let a = stack.reserve(24).expect("fits");
        assert!(matches!(
            stack.reserve(16),
            Err(VmError::StackOverflow { requested: 16, available: 8 })
        ));
        stack.release(a);
    }

    #[test]
    #[should_panic(expected = "LIFO")]
    fn out_of_order_release_panics() {
        let mut stack = StackAllocator::new(64).expect("stack");
        let a = stack.reserve(8).expect("a");
        let _b = stack.reserve(8).expect("b");
        stack.release(a);
    }

    #[test]
    fn side_stack_survives_growth() {
        let mut structs = StructStack::new(16);
        let first = structs.push_bytes(&[1; 12]);
        let second = structs.push_bytes(&[2; 40]);
        assert!(structs.capacity() >= 56);
        assert_eq!(structs.bytes(first), &[1; 12]);
        assert_eq!(structs.bytes(second), &[2; 40]);

        structs.free(first);
        // second is still live, so first stays reserved underneath it
        assert_eq!(structs.live_entries(), 1);
        structs.free(second);
        assert_eq!(structs.mark(), 0);
        assert!(structs.capacity() >= 56);
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn stale_handles_are_detected() {
        let mut structs = StructStack::new(64);
        let slot = structs.allocate(16);
        structs.free(slot);
        let _reused = structs.allocate(16);
        structs.bytes(slot);
    }

    #[test]
    fn release_to_drops_newer_slots() {
        let mut structs = StructStack::new(64);
        let keep = structs.allocate(16);
        let mark = structs.mark();
        structs.allocate(16);
        structs.allocate(16);
        structs.release_to(mark);
        assert_eq!(structs.mark(), 1);
        assert_eq!(structs.bytes(keep).len(), 16);
    }
}
