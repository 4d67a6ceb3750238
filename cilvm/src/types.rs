use std::{collections::HashMap, fmt, sync::Arc};

use bitflags::bitflags;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct TypeId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

impl TypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl MethodId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl FieldId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TypeAttributes: u32 {
        const INTERFACE = 1 << 0;
        const ABSTRACT = 1 << 1;
        const SEALED = 1 << 2;
    }
}

bitflags! {
    /// Facts derived once by the layout builder.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TypeTraits: u8 {
        const REFERENCE = 1 << 0;
        const LARGE_STRUCT = 1 << 1;
        const HAS_STATIC_CONSTRUCTOR = 1 << 2;
        const HAS_FINALIZER = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MethodAttributes: u32 {
        const STATIC = 1 << 0;
        const VIRTUAL = 1 << 1;
        const ABSTRACT = 1 << 2;
        /// starts a new vtable slot instead of overriding a base method
        const NEW_SLOT = 1 << 3;
        const FINAL = 1 << 4;
        const SPECIAL_NAME = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FieldAttributes: u16 {
        const STATIC = 1 << 0;
        const LITERAL = 1 << 1;
        const INIT_ONLY = 1 << 2;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    I,
    U,
}

impl PrimitiveKind {
    pub const fn size(self) -> usize {
        match self {
            Self::Boolean | Self::I1 | Self::U1 => 1,
            Self::Char | Self::I2 | Self::U2 => 2,
            Self::I4 | Self::U4 | Self::R4 => 4,
            Self::I8 | Self::U8 | Self::R8 => 8,
            Self::I | Self::U => size_of::<usize>(),
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::R4 | Self::R8)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "Boolean" => Self::Boolean,
            "Char" => Self::Char,
            "SByte" => Self::I1,
            "Byte" => Self::U1,
            "Int16" => Self::I2,
            "UInt16" => Self::U2,
            "Int32" => Self::I4,
            "UInt32" => Self::U4,
            "Int64" => Self::I8,
            "UInt64" => Self::U8,
            "Single" => Self::R4,
            "Double" => Self::R8,
            "IntPtr" => Self::I,
            "UIntPtr" => Self::U,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TypeCategory {
    /// not yet classified by the layout builder
    Unresolved,
    Primitive(PrimitiveKind),
    Class,
    Struct,
    Enum(PrimitiveKind),
    Interface,
    Array,
    Pointer,
    ByRef,
    Delegate,
}

/// Distinguishes definitions from types constructed over an element type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeShape {
    Definition,
    SzArray,
    MdArray { rank: u8 },
    Pointer,
    ByRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub has_this: bool,
    pub params: Vec<TypeId>,
    pub ret: Option<TypeId>,
}

impl MethodSignature {
    pub fn new(params: Vec<TypeId>, ret: Option<TypeId>) -> Self {
        Self {
            has_this: false,
            params,
            ret,
        }
    }

    pub fn instance(params: Vec<TypeId>, ret: Option<TypeId>) -> Self {
        Self {
            has_this: true,
            params,
            ret,
        }
    }

    /// Argument slots including the receiver.
    pub fn argument_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImplementationKind {
    Interpreted,
    Internal,
    Runtime,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionKind {
    Catch(TypeId),
    Finally,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionRegion {
    pub kind: RegionKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
}

impl ExceptionRegion {
    #[inline]
    pub fn try_contains(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_offset + self.try_length
    }

    #[inline]
    pub fn handler_contains(&self, offset: u32) -> bool {
        offset >= self.handler_offset
            && offset < self.handler_offset + self.handler_length
    }
}

#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub locals: Vec<TypeId>,
    /// ordered innermost first, the way compilers emit them
    pub regions: Vec<ExceptionRegion>,
}

/// Local variable placement computed when a method body is prepared.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    pub local_offsets: Vec<usize>,
    pub locals_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Null,
}

#[derive(Debug)]
pub struct TypeDescription {
    pub id: TypeId,
    pub namespace: String,
    pub name: String,
    pub attributes: TypeAttributes,
    pub base: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub fields: Vec<FieldId>,
    pub methods: Vec<MethodId>,
    /// explicit `(declaration, body)` override pairs
    pub method_impls: Vec<(MethodId, MethodId)>,
    pub shape: TypeShape,
    pub element: Option<TypeId>,

    pub category: TypeCategory,
    pub traits: TypeTraits,
    /// bytes of instance data following the object header (or the whole
    /// value for value types)
    pub instance_size: usize,
    pub alignment: usize,
    pub static_offset: usize,
    pub static_size: usize,
    pub static_constructor: Option<MethodId>,
    pub finalizer: Option<MethodId>,
    /// maps every method callable on an instance to the body that runs
    pub method_table: HashMap<MethodId, MethodId, ahash::RandomState>,
    pub static_constructor_ran: bool,
    pub(crate) prepared: bool,
}

impl TypeDescription {
    pub(crate) fn new(
        id: TypeId,
        namespace: &str,
        name: &str,
        base: Option<TypeId>,
        attributes: TypeAttributes,
    ) -> Self {
        Self {
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            attributes,
            base,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            method_impls: Vec::new(),
            shape: TypeShape::Definition,
            element: None,
            category: TypeCategory::Unresolved,
            traits: TypeTraits::empty(),
            instance_size: 0,
            alignment: 1,
            static_offset: 0,
            static_size: 0,
            static_constructor: None,
            finalizer: None,
            method_table: HashMap::default(),
            static_constructor_ran: false,
            prepared: false,
        }
    }

    #[inline]
    pub fn is_reference(&self) -> bool {
        self.traits.contains(TypeTraits::REFERENCE)
    }

    #[inline]
    pub fn is_large_struct(&self) -> bool {
        self.traits.contains(TypeTraits::LARGE_STRUCT)
    }

    pub fn is_value_type(&self) -> bool {
        matches!(
            self.category,
            TypeCategory::Primitive(_)
                | TypeCategory::Struct
                | TypeCategory::Enum(_)
        )
    }

    pub fn is_array(&self) -> bool {
        matches!(self.shape, TypeShape::SzArray | TypeShape::MdArray { .. })
    }

    pub fn is_interface(&self) -> bool {
        self.attributes.contains(TypeAttributes::INTERFACE)
    }

    /// Rank of an array type, zero otherwise.
    pub fn rank(&self) -> usize {
        match self.shape {
            TypeShape::SzArray => 1,
            TypeShape::MdArray { rank } => rank as usize,
            _ => 0,
        }
    }

    /// Primitive kind a value of this type is stored as, if any.
    pub fn primitive_kind(&self) -> Option<PrimitiveKind> {
        match self.category {
            TypeCategory::Primitive(kind) | TypeCategory::Enum(kind) => {
                Some(kind)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct MethodDescription {
    pub id: MethodId,
    pub owner: TypeId,
    pub name: String,
    pub attributes: MethodAttributes,
    pub kind: ImplementationKind,
    pub signature: MethodSignature,
    pub body: Option<Arc<MethodBody>>,
    pub frame_layout: Option<Arc<FrameLayout>>,
}

impl MethodDescription {
    #[inline]
    pub fn is_static(&self) -> bool {
        self.attributes.contains(MethodAttributes::STATIC)
    }

    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.attributes.contains(MethodAttributes::VIRTUAL)
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.attributes.contains(MethodAttributes::ABSTRACT)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }

    pub fn is_static_constructor(&self) -> bool {
        self.name == ".cctor" && self.is_static()
    }
}

#[derive(Debug)]
pub struct FieldDescription {
    pub id: FieldId,
    pub owner: TypeId,
    pub name: String,
    pub ty: TypeId,
    pub attributes: FieldAttributes,
    /// byte offset within instance data or within the owner's static block
    pub offset: usize,
    pub constant: Option<Constant>,
}

impl FieldDescription {
    #[inline]
    pub fn is_static(&self) -> bool {
        self.attributes.contains(FieldAttributes::STATIC)
    }

    #[inline]
    pub fn is_literal(&self) -> bool {
        self.attributes.contains(FieldAttributes::LITERAL)
    }
}

impl fmt::Display for TypeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}
