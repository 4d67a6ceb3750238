//! Type layout and dispatch preparation.
//!
//! [`prepare`] runs ordered passes over the whole registry. Each pass reads
//! facts the previous ones produced, so the order is a precondition:
//!
//! 1. categories (primitive, struct, enum, class, ...) for every type,
//! 2. instance field layout, which needs categories to size fields,
//! 3. traits, which need both category and size,
//! 4. static storage placement,
//! 5. method tables,
//! 6. frame layouts of method bodies, which need value sizes.

use std::collections::HashMap;

use log::debug;

use crate::{
    MethodAttributes, MethodId, PrimitiveKind, TypeCategory, TypeId,
    TypeRegistry, TypeShape, TypeTraits, VmError,
    heap::{ARRAY_DATA_SIZE, STRING_DATA_SIZE},
    types::FrameLayout,
};

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Visit {
    Pending,
    InProgress,
    Done,
}

pub fn prepare(types: &mut TypeRegistry) -> Result<(), VmError> {
    let ids = types.type_ids().collect::<Vec<_>>();
    for &id in &ids {
        classify(types, id);
    }
    let mut visits = vec![Visit::Pending; ids.len()];
    for &id in &ids {
        layout_instance(types, id, &mut visits)?;
    }
    for &id in &ids {
        assign_traits(types, id);
    }
    let mut static_cursor = 0;
    for &id in &ids {
        layout_statics(types, id, &mut static_cursor);
    }
    for &id in &ids {
        build_method_table(types, id);
        types.ty_mut(id).prepared = true;
    }
    for method in types.method_ids() {
        prepare_method(types, method);
    }
    types.prepared = true;
    debug!(
        "prepared {} types, {} bytes of static storage",
        ids.len(),
        static_cursor
    );
    Ok(())
}

/// Lays out a constructed type interned after [`prepare`] ran.
pub(crate) fn prepare_constructed(types: &mut TypeRegistry, id: TypeId) {
    classify(types, id);
    let (size, alignment) = fixed_layout(types, id)
        .unwrap_or((size_of::<usize>(), size_of::<usize>()));
    let desc = types.ty_mut(id);
    desc.instance_size = size;
    desc.alignment = alignment;
    assign_traits(types, id);
    build_method_table(types, id);
    types.ty_mut(id).prepared = true;
    debug!("interned {}", types.full_name(id));
}

fn classify(types: &mut TypeRegistry, id: TypeId) {
    let wk = &types.well_known;
    let desc = types.ty(id);
    let category = match desc.shape {
        TypeShape::SzArray | TypeShape::MdArray { .. } => TypeCategory::Array,
        TypeShape::Pointer => TypeCategory::Pointer,
        TypeShape::ByRef => TypeCategory::ByRef,
        TypeShape::Definition if desc.is_interface() => TypeCategory::Interface,
        TypeShape::Definition if id == wk.value_type || id == wk.enum_ => {
            TypeCategory::Class
        }
        TypeShape::Definition => {
            let primitive = (desc.namespace == "System"
                && desc.base == Some(wk.value_type))
                .then(|| PrimitiveKind::from_name(&desc.name))
                .flatten();
            if let Some(kind) = primitive {
                TypeCategory::Primitive(kind)
            } else if desc.base == Some(wk.enum_) {
                TypeCategory::Enum(enum_underlying(types, id))
            } else if types.is_subclass_of(id, wk.value_type) {
                TypeCategory::Struct
            } else if types.is_subclass_of(id, wk.delegate) {
                TypeCategory::Delegate
            } else {
                TypeCategory::Class
            }
        }
    };
    types.ty_mut(id).category = category;
}

fn enum_underlying(types: &TypeRegistry, id: TypeId) -> PrimitiveKind {
    types
        .ty(id)
        .fields
        .iter()
        .map(|&f| types.field(f))
        .find(|f| !f.is_static())
        .and_then(|f| PrimitiveKind::from_name(&types.ty(f.ty).name))
        .unwrap_or(PrimitiveKind::I4)
}

/// Computes `instance_size` and field offsets. Base types and embedded
/// structs are laid out first.
fn layout_instance(
    types: &mut TypeRegistry,
    id: TypeId,
    visits: &mut [Visit],
) -> Result<(), VmError> {
    match visits[id.index()] {
        Visit::Done => return Ok(()),
        Visit::InProgress => {
            return Err(VmError::invalid(format!(
                "value type {} contains itself",
                types.full_name(id)
            )));
        }
        Visit::Pending => visits[id.index()] = Visit::InProgress,
    }

    let (size, alignment) = match fixed_layout(types, id) {
        Some(fixed) => {
            if let TypeCategory::Primitive(_) | TypeCategory::Enum(_) = types.ty(id).category {
                if let Some(&field) = types.ty(id).fields.first() {
                    if !types.field(field).is_static() {
                        types.field_mut(field).offset = 0;
                    }
                }
            }
            fixed
        }
        None => {
            let (mut offset, mut alignment) = match types.ty(id).base {
                Some(base) => {
                    layout_instance(types, base, visits)?;
                    let base = types.ty(base);
                    (base.instance_size, base.alignment)
                }
                None => (0, 1),
            };
            let fields = types.ty(id).fields.clone();
            for field in fields {
                if types.field(field).is_static() {
                    continue;
                }
                let field_ty = types.field(field).ty;
                if types.ty(field_ty).category == TypeCategory::Struct {
                    layout_instance(types, field_ty, visits)?;
                }
                let size = types.value_size(field_ty);
                let align = types.value_alignment(field_ty).max(1);
                offset = align_up(offset, align);
                types.field_mut(field).offset = offset;
                offset += size;
                alignment = alignment.max(align);
            }
            (align_up(offset, 8), alignment)
        }
    };

    let desc = types.ty_mut(id);
    desc.instance_size = size;
    desc.alignment = alignment;
    visits[id.index()] = Visit::Done;
    Ok(())
}

/// Size and alignment of types whose layout does not depend on fields.
fn fixed_layout(types: &TypeRegistry, id: TypeId) -> Option<(usize, usize)> {
    let pointer = size_of::<usize>();
    match types.ty(id).category {
        TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
            Some((kind.size(), kind.size()))
        }
        TypeCategory::Pointer | TypeCategory::ByRef | TypeCategory::Interface => {
            Some((pointer, pointer))
        }
        TypeCategory::Array => Some((ARRAY_DATA_SIZE, 8)),
        _ if id == types.well_known.string => Some((STRING_DATA_SIZE, 8)),
        TypeCategory::Class
        | TypeCategory::Struct
        | TypeCategory::Delegate
        | TypeCategory::Unresolved => None,
    }
}

fn assign_traits(types: &mut TypeRegistry, id: TypeId) {
    let mut traits = TypeTraits::empty();
    let desc = types.ty(id);
    match desc.category {
        TypeCategory::Class
        | TypeCategory::Interface
        | TypeCategory::Array
        | TypeCategory::Delegate => traits |= TypeTraits::REFERENCE,
        TypeCategory::Struct if desc.instance_size > 8 => {
            traits |= TypeTraits::LARGE_STRUCT
        }
        _ => {}
    }
    if desc.static_constructor.is_some() {
        traits |= TypeTraits::HAS_STATIC_CONSTRUCTOR;
    }
    let mut current = Some(id);
    while let Some(ty) = current {
        if types.ty(ty).finalizer.is_some() {
            traits |= TypeTraits::HAS_FINALIZER;
            break;
        }
        current = types.ty(ty).base;
    }
    types.ty_mut(id).traits = traits;
}

fn layout_statics(types: &mut TypeRegistry, id: TypeId, cursor: &mut usize) {
    let fields = types.ty(id).fields.clone();
    let mut offset = 0;
    for field in fields {
        let desc = types.field(field);
        if !desc.is_static() || desc.is_literal() {
            continue;
        }
        let ty = desc.ty;
        let align = types.value_alignment(ty).max(1);
        offset = align_up(offset, align);
        types.field_mut(field).offset = offset;
        offset += types.value_size(ty);
    }
    if offset == 0 {
        return;
    }
    *cursor = align_up(*cursor, 8);
    let desc = types.ty_mut(id);
    desc.static_offset = *cursor;
    desc.static_size = offset;
    *cursor += offset;
}

fn same_signature(types: &TypeRegistry, a: MethodId, b: MethodId) -> bool {
    let (a, b) = (types.method(a), types.method(b));
    a.name == b.name
        && a.signature.params == b.signature.params
        && a.signature.ret == b.signature.ret
}

fn declared_match(
    types: &TypeRegistry,
    ty: TypeId,
    like: MethodId,
) -> Option<MethodId> {
    types
        .ty(ty)
        .methods
        .iter()
        .copied()
        .find(|&m| !types.method(m).is_static() && same_signature(types, m, like))
}

/// Builds the mapping from every method callable on an instance of `id` to
/// the body that runs.
///
/// A derived member with the same signature as a base virtual overrides it
/// only if it is virtual and does not start a new slot. Otherwise it hides
/// the base member: the base slot keeps resolving to the base chain while
/// the hiding member gets its own entry.
fn build_method_table(types: &mut TypeRegistry, id: TypeId) {
    let mut chain = Vec::new();
    let mut current = Some(id);
    while let Some(ty) = current {
        chain.push(ty);
        current = types.ty(ty).base;
    }

    let mut table: HashMap<MethodId, MethodId, ahash::RandomState> = HashMap::default();
    for &method in &types.ty(id).methods {
        let desc = types.method(method);
        if !desc.is_static() && !desc.is_abstract() {
            table.insert(method, method);
        }
    }

    for interface in types.interfaces_of(id) {
        for &declaration in &types.ty(interface).methods {
            let implementation = chain.iter().find_map(|&ty| {
                declared_match(types, ty, declaration)
                    .filter(|&m| !types.method(m).is_abstract())
            });
            if let Some(implementation) = implementation {
                table.insert(declaration, implementation);
            }
        }
    }

    for (depth, &base) in chain.iter().enumerate().skip(1) {
        for &method in &types.ty(base).methods {
            let desc = types.method(method);
            if desc.is_static() || table.contains_key(&method) {
                continue;
            }
            if !desc.is_virtual() {
                table.insert(method, method);
                continue;
            }
            // walk from just below the declaring type toward `id`
            let mut implementation = (!desc.is_abstract()).then_some(method);
            for &derived in chain[..depth].iter().rev() {
                let Some(candidate) = declared_match(types, derived, method)
                else {
                    continue;
                };
                let candidate = types.method(candidate);
                if !candidate.is_virtual()
                    || candidate.attributes.contains(MethodAttributes::NEW_SLOT)
                {
                    break;
                }
                if !candidate.is_abstract() {
                    implementation = Some(candidate.id);
                }
            }
            if let Some(implementation) = implementation {
                table.insert(method, implementation);
            }
        }
    }

    for &ty in chain.iter().rev() {
        for &(declaration, body) in &types.ty(ty).method_impls {
            let resolved = table.get(&body).copied().unwrap_or(body);
            table.insert(declaration, resolved);
        }
    }

    types.ty_mut(id).method_table = table;
}

/// Computes the frame layout of an interpreted method body.
pub(crate) fn prepare_method(types: &mut TypeRegistry, method: MethodId) {
    let Some(body) = types.method(method).body.clone() else {
        return;
    };
    let mut offset = 0;
    let mut local_offsets = Vec::with_capacity(body.locals.len());
    for &local in &body.locals {
        let align = types.value_alignment(local).max(1);
        offset = align_up(offset, align);
        local_offsets.push(offset);
        offset += types.value_size(local);
    }
    types.method_mut(method).frame_layout = Some(
        FrameLayout {
            local_offsets,
            locals_size: align_up(offset, 8),
        }
        .into(),
    );
}
