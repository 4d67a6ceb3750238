use std::{collections::HashMap, sync::Arc};

use crate::{
    Constant, FieldAttributes, FieldDescription, FieldId, ImplementationKind,
    MethodAttributes, MethodBody, MethodDescription, MethodId,
    MethodSignature, TypeAttributes, TypeCategory, TypeDescription, TypeId,
    TypeShape, VmError, corlib, layout,
};

/// A metadata token: table tag in the high byte, one-based row below it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Token(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Type,
    Field,
    Method,
    String,
    Unknown(u8),
}

impl Token {
    pub const TYPE_TABLE: u8 = 0x02;
    pub const FIELD_TABLE: u8 = 0x04;
    pub const METHOD_TABLE: u8 = 0x06;
    pub const STRING_HEAP: u8 = 0x70;

    const fn encode(table: u8, index: usize) -> Self {
        Self(((table as u32) << 24) | (index as u32 + 1))
    }

    #[inline]
    pub fn table(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Zero-based row, `None` for the nil row.
    #[inline]
    pub fn row(self) -> Option<usize> {
        (self.0 & 0x00FF_FFFF).checked_sub(1).map(|row| row as usize)
    }

    pub fn kind(self) -> TokenKind {
        match self.table() {
            Self::TYPE_TABLE => TokenKind::Type,
            Self::FIELD_TABLE => TokenKind::Field,
            Self::METHOD_TABLE => TokenKind::Method,
            Self::STRING_HEAP => TokenKind::String,
            other => TokenKind::Unknown(other),
        }
    }

    pub fn string(index: usize) -> Self {
        Self::encode(Self::STRING_HEAP, index)
    }
}

impl From<TypeId> for Token {
    fn from(value: TypeId) -> Self {
        Self::encode(Self::TYPE_TABLE, value.index())
    }
}

impl From<MethodId> for Token {
    fn from(value: MethodId) -> Self {
        Self::encode(Self::METHOD_TABLE, value.index())
    }
}

impl From<FieldId> for Token {
    fn from(value: FieldId) -> Self {
        Self::encode(Self::FIELD_TABLE, value.index())
    }
}

/// Resolves inline operands of the instruction stream.
pub trait MetadataProvider {
    fn resolve_type(&self, token: Token) -> Result<TypeId, VmError>;
    fn resolve_method(&self, token: Token) -> Result<MethodId, VmError>;
    fn resolve_field(&self, token: Token) -> Result<FieldId, VmError>;
    fn resolve_string(&self, token: Token) -> Result<&str, VmError>;
}

/// Types the engine refers to by role rather than by token.
#[derive(Debug, Default, Clone)]
pub struct WellKnownTypes {
    pub object: TypeId,
    pub value_type: TypeId,
    pub enum_: TypeId,
    pub string: TypeId,
    pub array: TypeId,
    pub delegate: TypeId,
    pub exception: TypeId,
    pub boolean: TypeId,
    pub char: TypeId,
    pub sbyte: TypeId,
    pub byte: TypeId,
    pub int16: TypeId,
    pub uint16: TypeId,
    pub int32: TypeId,
    pub uint32: TypeId,
    pub int64: TypeId,
    pub uint64: TypeId,
    pub single: TypeId,
    pub double: TypeId,
    pub intptr: TypeId,
    pub uintptr: TypeId,
    pub type_: TypeId,
    pub runtime_type: TypeId,
    pub runtime_type_handle: TypeId,
    pub null_reference_exception: TypeId,
    pub invalid_cast_exception: TypeId,
    pub index_out_of_range_exception: TypeId,
    pub divide_by_zero_exception: TypeId,
    pub overflow_exception: TypeId,
    pub arithmetic_exception: TypeId,
    pub not_finite_number_exception: TypeId,
    pub array_type_mismatch_exception: TypeId,
    pub exception_message: Option<FieldId>,
    pub delegate_target: Option<FieldId>,
    pub delegate_method: Option<FieldId>,
    pub runtime_type_handle_value: Option<FieldId>,
    pub runtime_type_handle_field: Option<FieldId>,
}

/// Arena of every type, method and field known to the runtime. Ids are
/// indices into the arena and stay valid for the registry's lifetime.
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeDescription>,
    methods: Vec<MethodDescription>,
    fields: Vec<FieldDescription>,
    strings: Vec<String>,
    string_rows: HashMap<String, usize, ahash::RandomState>,
    by_name: HashMap<(String, String), TypeId, ahash::RandomState>,
    constructed: HashMap<(TypeId, TypeShape), TypeId, ahash::RandomState>,
    pub well_known: WellKnownTypes,
    pub(crate) prepared: bool,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Creates a registry that already holds the core library.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        corlib::bootstrap(&mut registry);
        registry
    }

    pub(crate) fn empty() -> Self {
        Self {
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            strings: Vec::new(),
            string_rows: HashMap::default(),
            by_name: HashMap::default(),
            constructed: HashMap::default(),
            well_known: WellKnownTypes::default(),
            prepared: false,
        }
    }

    pub fn define_type(
        &mut self,
        namespace: &str,
        name: &str,
        base: Option<TypeId>,
        attributes: TypeAttributes,
    ) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDescription::new(
            id, namespace, name, base, attributes,
        ));
        self.by_name
            .insert((namespace.to_string(), name.to_string()), id);
        id
    }

    pub fn add_interface(&mut self, ty: TypeId, interface: TypeId) {
        self.ty_mut(ty).interfaces.push(interface);
    }

    pub fn define_field(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
        attributes: FieldAttributes,
    ) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDescription {
            id,
            owner,
            name: name.to_string(),
            ty,
            attributes,
            offset: 0,
            constant: None,
        });
        self.ty_mut(owner).fields.push(id);
        id
    }

    pub fn define_literal(
        &mut self,
        owner: TypeId,
        name: &str,
        ty: TypeId,
        value: Constant,
    ) -> FieldId {
        let id = self.define_field(
            owner,
            name,
            ty,
            FieldAttributes::STATIC | FieldAttributes::LITERAL,
        );
        self.fields[id.index()].constant = Some(value);
        id
    }

    pub fn define_method(
        &mut self,
        owner: TypeId,
        name: &str,
        attributes: MethodAttributes,
        signature: MethodSignature,
        kind: ImplementationKind,
    ) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        let mut signature = signature;
        signature.has_this = !attributes.contains(MethodAttributes::STATIC);
        self.methods.push(MethodDescription {
            id,
            owner,
            name: name.to_string(),
            attributes,
            kind,
            signature,
            body: None,
            frame_layout: None,
        });
        let owner = self.ty_mut(owner);
        owner.methods.push(id);
        if name == ".cctor" && attributes.contains(MethodAttributes::STATIC) {
            owner.static_constructor = Some(id);
        }
        if name == "Finalize" && attributes.contains(MethodAttributes::VIRTUAL)
        {
            owner.finalizer = Some(id);
        }
        id
    }

    pub fn set_body(&mut self, method: MethodId, body: MethodBody) {
        self.methods[method.index()].body = Some(Arc::new(body));
        if self.prepared {
            layout::prepare_method(self, method);
        }
    }

    /// Records an explicit override: calls to `declaration` on instances of
    /// `ty` run `body`.
    pub fn add_method_impl(
        &mut self,
        ty: TypeId,
        declaration: MethodId,
        body: MethodId,
    ) {
        self.ty_mut(ty).method_impls.push((declaration, body));
    }

    pub fn user_string(&mut self, value: &str) -> Token {
        if let Some(&row) = self.string_rows.get(value) {
            return Token::string(row);
        }
        let row = self.strings.len();
        self.strings.push(value.to_string());
        self.string_rows.insert(value.to_string(), row);
        Token::string(row)
    }

    #[inline]
    pub fn ty(&self, id: TypeId) -> &TypeDescription {
        &self.types[id.index()]
    }

    #[inline]
    pub fn ty_mut(&mut self, id: TypeId) -> &mut TypeDescription {
        &mut self.types[id.index()]
    }

    #[inline]
    pub fn method(&self, id: MethodId) -> &MethodDescription {
        &self.methods[id.index()]
    }

    #[inline]
    pub fn method_mut(&mut self, id: MethodId) -> &mut MethodDescription {
        &mut self.methods[id.index()]
    }

    #[inline]
    pub fn field(&self, id: FieldId) -> &FieldDescription {
        &self.fields[id.index()]
    }

    #[inline]
    pub(crate) fn field_mut(&mut self, id: FieldId) -> &mut FieldDescription {
        &mut self.fields[id.index()]
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + use<> {
        (0..self.types.len() as u32).map(TypeId)
    }

    pub fn method_ids(&self) -> impl Iterator<Item = MethodId> + use<> {
        (0..self.methods.len() as u32).map(MethodId)
    }

    pub fn field_ids(&self) -> impl Iterator<Item = FieldId> + use<> {
        (0..self.fields.len() as u32).map(FieldId)
    }

    pub fn lookup(&self, namespace: &str, name: &str) -> Option<TypeId> {
        self.by_name
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    /// Looks a type up by its dotted full name.
    pub fn lookup_full(&self, full_name: &str) -> Option<TypeId> {
        match full_name.rsplit_once('.') {
            Some((namespace, name)) => self.lookup(namespace, name),
            None => self.lookup("", full_name),
        }
    }

    pub fn find_method(&self, ty: TypeId, name: &str) -> Option<MethodId> {
        self.ty(ty)
            .methods
            .iter()
            .copied()
            .find(|&m| self.method(m).name == name)
    }

    pub fn find_method_with_params(
        &self,
        ty: TypeId,
        name: &str,
        params: &[TypeId],
    ) -> Option<MethodId> {
        self.ty(ty).methods.iter().copied().find(|&m| {
            let method = self.method(m);
            method.name == name && method.signature.params == params
        })
    }

    pub fn find_field(&self, ty: TypeId, name: &str) -> Option<FieldId> {
        let mut current = Some(ty);
        while let Some(id) = current {
            let desc = self.ty(id);
            if let Some(&field) =
                desc.fields.iter().find(|&&f| self.field(f).name == name)
            {
                return Some(field);
            }
            current = desc.base;
        }
        None
    }

    pub fn full_name(&self, ty: TypeId) -> String {
        self.ty(ty).to_string()
    }

    pub fn method_name(&self, method: MethodId) -> String {
        let desc = self.method(method);
        format!("{}::{}", self.full_name(desc.owner), desc.name)
    }

    /// Key internal implementations are registered under, e.g.
    /// `System.String::Concat(System.String,System.String)`.
    pub fn method_key(&self, method: MethodId) -> String {
        let desc = self.method(method);
        let params = desc
            .signature
            .params
            .iter()
            .map(|&p| self.full_name(p))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({params})", self.method_name(method))
    }

    pub fn sz_array_of(&mut self, element: TypeId) -> TypeId {
        self.constructed_type(element, TypeShape::SzArray)
    }

    pub fn md_array_of(&mut self, element: TypeId, rank: u8) -> TypeId {
        self.constructed_type(element, TypeShape::MdArray { rank })
    }

    pub fn pointer_to(&mut self, element: TypeId) -> TypeId {
        self.constructed_type(element, TypeShape::Pointer)
    }

    pub fn by_ref_to(&mut self, element: TypeId) -> TypeId {
        self.constructed_type(element, TypeShape::ByRef)
    }

    /// Interns the type constructed over `element`. Types created after the
    /// registry has been prepared are laid out immediately.
    pub fn constructed_type(
        &mut self,
        element: TypeId,
        shape: TypeShape,
    ) -> TypeId {
        if let Some(&id) = self.constructed.get(&(element, shape)) {
            return id;
        }
        let (suffix, base) = match shape {
            TypeShape::SzArray => ("[]".to_string(), Some(self.well_known.array)),
            TypeShape::MdArray { rank } => (
                format!("[{}]", ",".repeat(rank.saturating_sub(1) as usize)),
                Some(self.well_known.array),
            ),
            TypeShape::Pointer => ("*".to_string(), None),
            TypeShape::ByRef => ("&".to_string(), None),
            TypeShape::Definition => return element,
        };
        let (namespace, name) = {
            let desc = self.ty(element);
            (desc.namespace.clone(), format!("{}{suffix}", desc.name))
        };
        let attributes = if base.is_some() {
            TypeAttributes::SEALED
        } else {
            TypeAttributes::empty()
        };
        let id = TypeId(self.types.len() as u32);
        let mut desc =
            TypeDescription::new(id, &namespace, &name, base, attributes);
        desc.shape = shape;
        desc.element = Some(element);
        self.types.push(desc);
        self.constructed.insert((element, shape), id);

        if let TypeShape::MdArray { rank } = shape {
            self.define_md_array_methods(id, element, rank);
        }
        if self.prepared {
            layout::prepare_constructed(self, id);
        }
        id
    }

    fn define_md_array_methods(
        &mut self,
        array: TypeId,
        element: TypeId,
        rank: u8,
    ) {
        let int32 = self.well_known.int32;
        let indices = vec![int32; rank as usize];
        let element_ref = self.by_ref_to(element);
        let runtime = ImplementationKind::Runtime;
        let special = MethodAttributes::SPECIAL_NAME;

        self.define_method(
            array,
            ".ctor",
            special,
            MethodSignature::instance(indices.clone(), None),
            runtime,
        );
        self.define_method(
            array,
            "Get",
            MethodAttributes::empty(),
            MethodSignature::instance(indices.clone(), Some(element)),
            runtime,
        );
        let mut set_params = indices.clone();
        set_params.push(element);
        self.define_method(
            array,
            "Set",
            MethodAttributes::empty(),
            MethodSignature::instance(set_params, None),
            runtime,
        );
        self.define_method(
            array,
            "Address",
            MethodAttributes::empty(),
            MethodSignature::instance(indices, Some(element_ref)),
            runtime,
        );
    }

    /// Strict base-chain ancestry, `ty` itself excluded.
    pub fn is_subclass_of(&self, ty: TypeId, ancestor: TypeId) -> bool {
        let mut current = self.ty(ty).base;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.ty(id).base;
        }
        false
    }

    /// Every interface `ty` implements, including those of its bases and
    /// those inherited by other interfaces. Declaration order, no duplicates.
    pub fn interfaces_of(&self, ty: TypeId) -> Vec<TypeId> {
        let mut out = Vec::new();
        let mut current = Some(ty);
        while let Some(id) = current {
            let desc = self.ty(id);
            for &interface in &desc.interfaces {
                self.collect_interface(interface, &mut out);
            }
            current = desc.base;
        }
        out
    }

    fn collect_interface(&self, interface: TypeId, out: &mut Vec<TypeId>) {
        if out.contains(&interface) {
            return;
        }
        out.push(interface);
        for &inherited in &self.ty(interface).interfaces {
            self.collect_interface(inherited, out);
        }
    }

    pub fn implements(&self, ty: TypeId, interface: TypeId) -> bool {
        self.interfaces_of(ty).contains(&interface)
    }

    pub fn is_reference_type(&self, ty: TypeId) -> bool {
        self.ty(ty).is_reference()
    }

    pub fn is_value_type(&self, ty: TypeId) -> bool {
        self.ty(ty).is_value_type()
    }

    /// Bytes a value of `ty` occupies in a field, local, slot or element.
    pub fn value_size(&self, ty: TypeId) -> usize {
        let desc = self.ty(ty);
        match desc.category {
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                kind.size()
            }
            TypeCategory::Struct => desc.instance_size,
            _ => size_of::<usize>(),
        }
    }

    pub fn value_alignment(&self, ty: TypeId) -> usize {
        let desc = self.ty(ty);
        match desc.category {
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                kind.size()
            }
            // embedded structs sit on a pointer boundary
            _ => align_of::<usize>(),
        }
    }

    pub fn static_storage_size(&self) -> usize {
        self.types
            .iter()
            .map(|t| t.static_offset + t.static_size)
            .max()
            .unwrap_or(0)
    }
}

impl MetadataProvider for TypeRegistry {
    fn resolve_type(&self, token: Token) -> Result<TypeId, VmError> {
        match (token.kind(), token.row()) {
            (TokenKind::Type, Some(row)) if row < self.types.len() => {
                Ok(TypeId(row as u32))
            }
            _ => Err(VmError::BadToken(token.0)),
        }
    }

    fn resolve_method(&self, token: Token) -> Result<MethodId, VmError> {
        match (token.kind(), token.row()) {
            (TokenKind::Method, Some(row)) if row < self.methods.len() => {
                Ok(MethodId(row as u32))
            }
            _ => Err(VmError::BadToken(token.0)),
        }
    }

    fn resolve_field(&self, token: Token) -> Result<FieldId, VmError> {
        match (token.kind(), token.row()) {
            (TokenKind::Field, Some(row)) if row < self.fields.len() => {
                Ok(FieldId(row as u32))
            }
            _ => Err(VmError::BadToken(token.0)),
        }
    }

    fn resolve_string(&self, token: Token) -> Result<&str, VmError> {
        match (token.kind(), token.row()) {
            (TokenKind::String, Some(row)) if row < self.strings.len() => {
                Ok(&self.strings[row])
            }
            _ => Err(VmError::BadToken(token.0)),
        }
    }
}
