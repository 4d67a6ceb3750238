use std::collections::HashMap;

use crate::{
    Allocator, ObjectRef, TypeRegistry, VmError, object::new_string,
    visitor::RootVisitor,
};

/// Managed string objects for literals. Every `ldstr` of the same text
/// yields the same object.
#[derive(Debug, Default)]
pub struct InternedStrings {
    table: HashMap<String, ObjectRef, ahash::RandomState>,
}

impl InternedStrings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, value: &str) -> Option<ObjectRef> {
        self.table.get(value).copied()
    }

    pub fn get_or_add(
        &mut self,
        heap: &mut impl Allocator,
        types: &TypeRegistry,
        value: &str,
    ) -> Result<ObjectRef, VmError> {
        if let Some(object) = self.get(value) {
            return Ok(object);
        }
        let object = new_string(heap, types, value)?;
        self.table.insert(value.to_owned(), object);
        Ok(object)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn visit_roots(&mut self, visitor: &mut impl RootVisitor) {
        for object in self.table.values_mut() {
            visitor.visit_object(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heap, layout, object::string_to_rust};

    #[test]
    fn literals_are_shared() {
        let mut types = TypeRegistry::new();
        layout::prepare(&mut types).expect("prepare");
        let mut heap = Heap::new(1 << 16);
        let mut strings = InternedStrings::new();

        let a = strings.get_or_add(&mut heap, &types, "hello").expect("a");
        let b = strings.get_or_add(&mut heap, &types, "hello").expect("b");
        let c = strings.get_or_add(&mut heap, &types, "world").expect("c");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(strings.len(), 2);
        assert_eq!(heap.object_count(), 2);
        assert_eq!(string_to_rust(c).as_deref(), Some("world"));
    }
}
