//! Methods implemented natively and looked up by signature key.

use std::collections::HashMap;

use crate::{
    MethodCallData, MethodId, ObjectRef, PrimitiveKind, Runtime,
    RuntimeFailure, StackValue, TypeRegistry, VmError,
    object::string_to_rust,
    value::read_primitive,
};

mod arrays;
mod console;
mod math;
mod objects;
mod strings;

pub type InternalFunction = fn(&mut CallContext<'_>) -> Result<(), VmError>;

#[derive(Debug, Copy, Clone)]
pub struct InternalCall {
    /// `Namespace.Type::Method(ParamType,...)`
    pub key: &'static str,
    pub function: InternalFunction,
}

impl InternalCall {
    pub const fn new(key: &'static str, function: InternalFunction) -> Self {
        Self { key, function }
    }
}

pub const INTERNAL_CALLS: &[InternalCall] = &[
    InternalCall::new("System.Object::ToString()", objects::to_string),
    InternalCall::new("System.Object::Equals(System.Object)", objects::equals),
    InternalCall::new("System.Object::GetHashCode()", objects::hash_code),
    InternalCall::new("System.Object::MemberwiseClone()", objects::memberwise_clone),
    InternalCall::new(
        "System.Object::ReferenceEquals(System.Object,System.Object)",
        objects::reference_equals,
    ),
    InternalCall::new("System.Object::GetType()", objects::get_type),
    InternalCall::new("System.Boolean::ToString()", objects::primitive_to_string),
    InternalCall::new("System.Char::ToString()", objects::primitive_to_string),
    InternalCall::new("System.Int32::ToString()", objects::primitive_to_string),
    InternalCall::new("System.Int64::ToString()", objects::primitive_to_string),
    InternalCall::new("System.Double::ToString()", objects::primitive_to_string),
    InternalCall::new(
        "System.Type::GetTypeFromHandle(System.RuntimeTypeHandle)",
        objects::type_from_handle,
    ),
    InternalCall::new("System.Type::get_Name()", objects::type_name),
    InternalCall::new("System.Type::get_FullName()", objects::type_full_name),
    InternalCall::new(
        "System.Type::op_Equality(System.Type,System.Type)",
        objects::reference_equals,
    ),
    InternalCall::new("System.String::.ctor(System.Char[])", strings::from_chars),
    InternalCall::new(
        "System.String::.ctor(System.Char,System.Int32)",
        strings::repeat_char,
    ),
    InternalCall::new("System.String::get_Length()", strings::length),
    InternalCall::new("System.String::get_Chars(System.Int32)", strings::char_at),
    InternalCall::new(
        "System.String::Concat(System.String,System.String)",
        strings::concat,
    ),
    InternalCall::new(
        "System.String::Concat(System.String,System.String,System.String)",
        strings::concat,
    ),
    InternalCall::new(
        "System.String::Concat(System.Object,System.Object)",
        strings::concat_objects,
    ),
    InternalCall::new(
        "System.String::op_Equality(System.String,System.String)",
        strings::op_equality,
    ),
    InternalCall::new(
        "System.String::IsNullOrEmpty(System.String)",
        strings::is_null_or_empty,
    ),
    InternalCall::new("System.String::Equals(System.Object)", strings::equals),
    InternalCall::new("System.String::GetHashCode()", strings::hash_code),
    InternalCall::new("System.String::ToString()", strings::to_string),
    InternalCall::new("System.Array::get_Length()", arrays::length),
    InternalCall::new("System.Array::get_Rank()", arrays::rank),
    InternalCall::new("System.Array::GetLength(System.Int32)", arrays::dimension_length),
    InternalCall::new(
        "System.Array::Copy(System.Array,System.Array,System.Int32)",
        arrays::copy,
    ),
    InternalCall::new("System.Console::WriteLine()", console::write_line),
    InternalCall::new("System.Console::WriteLine(System.String)", console::write_line),
    InternalCall::new("System.Console::WriteLine(System.Int32)", console::write_line),
    InternalCall::new("System.Console::WriteLine(System.Int64)", console::write_line),
    InternalCall::new("System.Console::WriteLine(System.Double)", console::write_line),
    InternalCall::new("System.Console::WriteLine(System.Boolean)", console::write_line),
    InternalCall::new("System.Console::WriteLine(System.Char)", console::write_line),
    InternalCall::new("System.Console::WriteLine(System.Object)", console::write_line),
    InternalCall::new("System.Console::Write(System.String)", console::write),
    InternalCall::new("System.Math::Sqrt(System.Double)", math::sqrt),
    InternalCall::new("System.Math::Abs(System.Int32)", math::abs_i32),
    InternalCall::new("System.Math::Abs(System.Double)", math::abs_f64),
    InternalCall::new("System.Math::Max(System.Int32,System.Int32)", math::max),
    InternalCall::new("System.Math::Min(System.Int32,System.Int32)", math::min),
];

/// Registry of native implementations. Lookups by key are cached per
/// method id.
#[derive(Debug)]
pub struct InternalCalls {
    by_key: HashMap<String, InternalFunction, ahash::RandomState>,
    resolved: HashMap<MethodId, InternalFunction, ahash::RandomState>,
}

impl Default for InternalCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl InternalCalls {
    pub fn new() -> Self {
        let by_key = INTERNAL_CALLS
            .iter()
            .map(|call| (call.key.to_string(), call.function))
            .collect();
        Self {
            by_key,
            resolved: HashMap::default(),
        }
    }

    /// Adds or replaces the implementation registered under `key`.
    pub fn register(&mut self, key: &str, function: InternalFunction) {
        self.by_key.insert(key.to_string(), function);
        self.resolved.clear();
    }

    pub fn resolve(
        &mut self,
        types: &TypeRegistry,
        method: MethodId,
    ) -> Result<InternalFunction, VmError> {
        if let Some(&function) = self.resolved.get(&method) {
            return Ok(function);
        }
        let key = types.method_key(method);
        let function = *self
            .by_key
            .get(&key)
            .ok_or(VmError::MissingInternalCall(key))?;
        self.resolved.insert(method, function);
        Ok(function)
    }
}

/// What a native implementation sees: the runtime and the marshaled
/// arguments of its call.
pub struct CallContext<'a> {
    pub rt: &'a mut Runtime,
    pub method: MethodId,
    data: &'a mut MethodCallData,
}

impl<'a> CallContext<'a> {
    pub fn new(
        rt: &'a mut Runtime,
        method: MethodId,
        data: &'a mut MethodCallData,
    ) -> Self {
        Self { rt, method, data }
    }

    pub fn argument_count(&self) -> usize {
        self.data.argument_count()
    }

    pub fn arg(&mut self, index: usize) -> Result<StackValue, VmError> {
        self.data
            .get_argument(&self.rt.types, &mut self.rt.structs, index)
    }

    pub fn arg_i32(&mut self, index: usize) -> Result<i32, VmError> {
        self.arg(index)?.as_i32()
    }

    pub fn arg_f64(&mut self, index: usize) -> Result<f64, VmError> {
        self.arg(index)?.as_f64()
    }

    pub fn arg_object(&mut self, index: usize) -> Result<ObjectRef, VmError> {
        self.arg(index)?.as_object()
    }

    /// Receiver that must not be null.
    pub fn this_object(&mut self) -> Result<ObjectRef, VmError> {
        let this = self.arg_object(0)?;
        if this.is_null() {
            return Err(self.raise(RuntimeFailure::NullReference));
        }
        Ok(this)
    }

    /// Argument `index` as Rust text, `None` for a null string.
    pub fn arg_string(&mut self, index: usize) -> Result<Option<String>, VmError> {
        Ok(string_to_rust(self.arg_object(index)?))
    }

    pub fn ret(&mut self, value: StackValue) -> Result<(), VmError> {
        self.data.set_return(&self.rt.types, &self.rt.structs, value)
    }

    pub fn ret_bool(&mut self, value: bool) -> Result<(), VmError> {
        self.ret(StackValue::from_bool(value))
    }

    pub fn ret_string(&mut self, text: &str) -> Result<(), VmError> {
        let string = self.rt.new_string(text)?;
        self.ret(StackValue::Object(string))
    }

    pub fn raise(&mut self, failure: RuntimeFailure) -> VmError {
        self.rt.raise(failure)
    }

    /// Throws a new exception of the core type `name` with `message`.
    pub fn throw_new(&mut self, name: &str, message: &str) -> VmError {
        let Some(ty) = self.rt.types.lookup(crate::corlib::SYSTEM, name) else {
            return VmError::invalid(format!("unknown exception type {name}"));
        };
        match self.rt.new_exception(ty, message) {
            Ok(object) => self.rt.exceptions.throw(object),
            Err(err) => err,
        }
    }
}

/// Text of a primitive value the way the core library prints it.
pub fn format_primitive(kind: PrimitiveKind, value: StackValue) -> Result<String, VmError> {
    Ok(match kind {
        PrimitiveKind::Boolean => {
            if value.as_i32()? != 0 { "True" } else { "False" }.to_string()
        }
        PrimitiveKind::Char => char::from_u32(value.as_i32()? as u32)
            .unwrap_or(char::REPLACEMENT_CHARACTER)
            .to_string(),
        PrimitiveKind::U4 => (value.as_i32()? as u32).to_string(),
        PrimitiveKind::U8 => (value.as_i64()? as u64).to_string(),
        PrimitiveKind::I8 => value.as_i64()?.to_string(),
        PrimitiveKind::R4 | PrimitiveKind::R8 => format_double(value.as_f64()?),
        PrimitiveKind::I | PrimitiveKind::U => value.as_native()?.to_string(),
        _ => value.as_i32()?.to_string(),
    })
}

pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        value.to_string()
    }
}

/// Text of any stack value, calling `ToString` on objects.
pub(crate) fn display_value(
    rt: &mut Runtime,
    value: StackValue,
) -> Result<String, VmError> {
    match value {
        StackValue::Object(object) if object.is_null() => Ok(String::new()),
        StackValue::Object(object) => {
            if object.type_id() == Some(rt.types.well_known.string) {
                return Ok(string_to_rust(object).unwrap_or_default());
            }
            let object_type = rt.types.well_known.object;
            let to_string = rt
                .types
                .find_method(object_type, "ToString")
                .ok_or_else(|| VmError::invalid("System.Object::ToString is missing"))?;
            let text = rt.call_virtual(to_string, &[value])?;
            Ok(text
                .and_then(|text| text.as_object().ok())
                .and_then(string_to_rust)
                .unwrap_or_default())
        }
        StackValue::Int32(v) => Ok(v.to_string()),
        StackValue::Int64(v) => Ok(v.to_string()),
        StackValue::NativeInt(v) => Ok(v.to_string()),
        StackValue::Double(v) => Ok(format_double(v)),
        other => Err(VmError::StackTypeMismatch {
            expected: "printable value",
            found: other.kind(),
        }),
    }
}

/// Reads the primitive a by-ref receiver points at.
pub(crate) fn read_receiver(
    context: &mut CallContext<'_>,
    kind: PrimitiveKind,
) -> Result<StackValue, VmError> {
    let pointer = context.arg(0)?.as_pointer()?;
    if pointer.is_null() {
        return Err(context.raise(RuntimeFailure::NullReference));
    }
    // SAFETY: value-type receivers point at a value of the owner's type
    Ok(unsafe { read_primitive(pointer, kind) })
}
