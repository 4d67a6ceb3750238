//! The core library every program links against: the root of the type
//! hierarchy, primitives, strings, arrays, delegates, the exception family,
//! reflection handles and a handful of natives.

use crate::{
    BytecodeBuilder, FieldAttributes, FieldId, ImplementationKind,
    MethodAttributes, MethodId, MethodSignature, OpCode, TypeAttributes,
    TypeId, TypeRegistry,
};

pub const SYSTEM: &str = "System";

fn native(
    r: &mut TypeRegistry,
    owner: TypeId,
    name: &str,
    attributes: MethodAttributes,
    params: Vec<TypeId>,
    ret: Option<TypeId>,
) -> MethodId {
    r.define_method(
        owner,
        name,
        attributes,
        MethodSignature::new(params, ret),
        ImplementationKind::Internal,
    )
}

fn interpreted(
    r: &mut TypeRegistry,
    owner: TypeId,
    name: &str,
    attributes: MethodAttributes,
    params: Vec<TypeId>,
    ret: Option<TypeId>,
) -> MethodId {
    r.define_method(
        owner,
        name,
        attributes,
        MethodSignature::new(params, ret),
        ImplementationKind::Interpreted,
    )
}

const STATIC: MethodAttributes = MethodAttributes::STATIC;
const INSTANCE: MethodAttributes = MethodAttributes::empty();
const CTOR: MethodAttributes = MethodAttributes::SPECIAL_NAME;
const VIRTUAL: MethodAttributes = MethodAttributes::VIRTUAL;

/// `ldarg.0; ldarg.1; stfld field; ret`
fn store_argument_body(field: FieldId) -> crate::MethodBody {
    let mut b = BytecodeBuilder::new();
    b.ldarg(0).ldarg(1).field(OpCode::Stfld, field).op(OpCode::Ret);
    b.into_body(2, Vec::new())
}

/// Populates an empty registry with the core types and records them in
/// [`TypeRegistry::well_known`].
pub(crate) fn bootstrap(r: &mut TypeRegistry) {
    let none = TypeAttributes::empty();
    let sealed = TypeAttributes::SEALED;
    let abstract_ = TypeAttributes::ABSTRACT;

    let object = r.define_type(SYSTEM, "Object", None, none);
    let value_type = r.define_type(SYSTEM, "ValueType", Some(object), abstract_);
    let enum_ = r.define_type(SYSTEM, "Enum", Some(value_type), abstract_);
    let mut primitive =
        |name: &str| r.define_type(SYSTEM, name, Some(value_type), sealed);
    let boolean = primitive("Boolean");
    let char_ = primitive("Char");
    let sbyte = primitive("SByte");
    let byte = primitive("Byte");
    let int16 = primitive("Int16");
    let uint16 = primitive("UInt16");
    let int32 = primitive("Int32");
    let uint32 = primitive("UInt32");
    let int64 = primitive("Int64");
    let uint64 = primitive("UInt64");
    let single = primitive("Single");
    let double = primitive("Double");
    let intptr = primitive("IntPtr");
    let uintptr = primitive("UIntPtr");

    let string = r.define_type(SYSTEM, "String", Some(object), sealed);
    let array = r.define_type(SYSTEM, "Array", Some(object), abstract_);
    {
        let wk = &mut r.well_known;
        wk.object = object;
        wk.value_type = value_type;
        wk.enum_ = enum_;
        wk.boolean = boolean;
        wk.char = char_;
        wk.sbyte = sbyte;
        wk.byte = byte;
        wk.int16 = int16;
        wk.uint16 = uint16;
        wk.int32 = int32;
        wk.uint32 = uint32;
        wk.int64 = int64;
        wk.uint64 = uint64;
        wk.single = single;
        wk.double = double;
        wk.intptr = intptr;
        wk.uintptr = uintptr;
        wk.string = string;
        wk.array = array;
    }

    // System.Object
    let object_ctor = interpreted(r, object, ".ctor", CTOR, vec![], None);
    let mut b = BytecodeBuilder::new();
    b.op(OpCode::Ret);
    r.set_body(object_ctor, b.into_body(0, Vec::new()));
    native(r, object, "ToString", VIRTUAL, vec![], Some(string));
    native(r, object, "Equals", VIRTUAL, vec![object], Some(boolean));
    native(r, object, "GetHashCode", VIRTUAL, vec![], Some(int32));
    native(r, object, "MemberwiseClone", INSTANCE, vec![], Some(object));
    native(
        r,
        object,
        "ReferenceEquals",
        STATIC,
        vec![object, object],
        Some(boolean),
    );

    // primitives
    for ty in [boolean, char_, int32, int64, double] {
        native(r, ty, "ToString", VIRTUAL, vec![], Some(string));
    }

    // System.String
    let char_array = r.sz_array_of(char_);
    native(r, string, ".ctor", CTOR, vec![char_array], None);
    native(r, string, ".ctor", CTOR, vec![char_, int32], None);
    native(r, string, "get_Length", INSTANCE, vec![], Some(int32));
    native(r, string, "get_Chars", INSTANCE, vec![int32], Some(char_));
    native(r, string, "Concat", STATIC, vec![string, string], Some(string));
    native(
        r,
        string,
        "Concat",
        STATIC,
        vec![string, string, string],
        Some(string),
    );
    native(r, string, "Concat", STATIC, vec![object, object], Some(string));
    native(
        r,
        string,
        "op_Equality",
        STATIC,
        vec![string, string],
        Some(boolean),
    );
    native(r, string, "IsNullOrEmpty", STATIC, vec![string], Some(boolean));
    native(r, string, "Equals", VIRTUAL, vec![object], Some(boolean));
    native(r, string, "GetHashCode", VIRTUAL, vec![], Some(int32));
    native(r, string, "ToString", VIRTUAL, vec![], Some(string));

    // System.Array
    native(r, array, "get_Length", INSTANCE, vec![], Some(int32));
    native(r, array, "get_Rank", INSTANCE, vec![], Some(int32));
    native(r, array, "GetLength", INSTANCE, vec![int32], Some(int32));
    native(
        r,
        array,
        "Copy",
        STATIC,
        vec![array, array, int32],
        None,
    );

    // delegates
    let delegate = r.define_type(SYSTEM, "Delegate", Some(object), abstract_);
    let target = r.define_field(delegate, "_target", object, FieldAttributes::empty());
    let method_ptr =
        r.define_field(delegate, "_methodPtr", intptr, FieldAttributes::empty());
    r.define_type(SYSTEM, "MulticastDelegate", Some(delegate), abstract_);

    // reflection handles
    let runtime_type_handle =
        r.define_type(SYSTEM, "RuntimeTypeHandle", Some(value_type), sealed);
    let handle_value = r.define_field(
        runtime_type_handle,
        "m_type",
        intptr,
        FieldAttributes::empty(),
    );
    let type_ = r.define_type(SYSTEM, "Type", Some(object), abstract_);
    let runtime_type = r.define_type(SYSTEM, "RuntimeType", Some(type_), sealed);
    let handle_field = r.define_field(
        runtime_type,
        "m_handle",
        intptr,
        FieldAttributes::empty(),
    );
    native(
        r,
        object,
        "GetType",
        INSTANCE,
        vec![],
        Some(type_),
    );
    native(
        r,
        type_,
        "GetTypeFromHandle",
        STATIC,
        vec![runtime_type_handle],
        Some(type_),
    );
    native(r, type_, "get_Name", INSTANCE, vec![], Some(string));
    native(r, type_, "get_FullName", INSTANCE, vec![], Some(string));
    native(r, type_, "op_Equality", STATIC, vec![type_, type_], Some(boolean));

    // exceptions
    let exception = r.define_type(SYSTEM, "Exception", Some(object), none);
    let message =
        r.define_field(exception, "_message", string, FieldAttributes::empty());
    let exception_ctor = interpreted(r, exception, ".ctor", CTOR, vec![], None);
    let mut b = BytecodeBuilder::new();
    b.ldarg(0).call(object_ctor).op(OpCode::Ret);
    r.set_body(exception_ctor, b.into_body(1, Vec::new()));
    let exception_ctor_message =
        interpreted(r, exception, ".ctor", CTOR, vec![string], None);
    r.set_body(exception_ctor_message, store_argument_body(message));
    let get_message =
        interpreted(r, exception, "get_Message", VIRTUAL, vec![], Some(string));
    let mut b = BytecodeBuilder::new();
    b.ldarg(0).field(OpCode::Ldfld, message).op(OpCode::Ret);
    r.set_body(get_message, b.into_body(1, Vec::new()));

    let mut subclass = |name: &str, base: TypeId| {
        let ty = r.define_type(SYSTEM, name, Some(base), none);
        let base_default = r.find_method_with_params(base, ".ctor", &[]);
        let base_message = r.find_method_with_params(base, ".ctor", &[string]);
        let (Some(base_default), Some(base_message)) = (base_default, base_message)
        else {
            unreachable!("exception bases define both constructors");
        };
        let ctor = interpreted(r, ty, ".ctor", CTOR, vec![], None);
        let mut b = BytecodeBuilder::new();
        b.ldarg(0).call(base_default).op(OpCode::Ret);
        r.set_body(ctor, b.into_body(1, Vec::new()));
        let ctor = interpreted(r, ty, ".ctor", CTOR, vec![string], None);
        let mut b = BytecodeBuilder::new();
        b.ldarg(0).ldarg(1).call(base_message).op(OpCode::Ret);
        r.set_body(ctor, b.into_body(2, Vec::new()));
        ty
    };
    let system_exception = subclass("SystemException", exception);
    let arithmetic = subclass("ArithmeticException", system_exception);
    let divide_by_zero = subclass("DivideByZeroException", arithmetic);
    let overflow = subclass("OverflowException", arithmetic);
    let not_finite = subclass("NotFiniteNumberException", arithmetic);
    let null_reference = subclass("NullReferenceException", system_exception);
    let invalid_cast = subclass("InvalidCastException", system_exception);
    let index_out_of_range =
        subclass("IndexOutOfRangeException", system_exception);
    let array_type_mismatch =
        subclass("ArrayTypeMismatchException", system_exception);
    subclass("InvalidOperationException", system_exception);
    subclass("ArgumentException", system_exception);

    // console and math
    let console = r.define_type(SYSTEM, "Console", Some(object), abstract_);
    native(r, console, "WriteLine", STATIC, vec![], None);
    for ty in [string, int32, int64, double, boolean, char_, object] {
        native(r, console, "WriteLine", STATIC, vec![ty], None);
    }
    native(r, console, "Write", STATIC, vec![string], None);

    let math = r.define_type(SYSTEM, "Math", Some(object), abstract_);
    native(r, math, "Sqrt", STATIC, vec![double], Some(double));
    native(r, math, "Abs", STATIC, vec![int32], Some(int32));
    native(r, math, "Abs", STATIC, vec![double], Some(double));
    native(r, math, "Max", STATIC, vec![int32, int32], Some(int32));
    native(r, math, "Min", STATIC, vec![int32, int32], Some(int32));

    let wk = &mut r.well_known;
    wk.delegate = delegate;
    wk.delegate_target = Some(target);
    wk.delegate_method = Some(method_ptr);
    wk.type_ = type_;
    wk.runtime_type = runtime_type;
    wk.runtime_type_handle = runtime_type_handle;
    wk.runtime_type_handle_value = Some(handle_value);
    wk.runtime_type_handle_field = Some(handle_field);
    wk.exception = exception;
    wk.exception_message = Some(message);
    wk.arithmetic_exception = arithmetic;
    wk.divide_by_zero_exception = divide_by_zero;
    wk.overflow_exception = overflow;
    wk.not_finite_number_exception = not_finite;
    wk.null_reference_exception = null_reference;
    wk.invalid_cast_exception = invalid_cast;
    wk.index_out_of_range_exception = index_out_of_range;
    wk.array_type_mismatch_exception = array_type_mismatch;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TypeCategory;

    #[test]
    fn well_known_types_are_registered_by_name() {
        let r = TypeRegistry::new();
        assert_eq!(r.lookup_full("System.Int32"), Some(r.well_known.int32));
        assert_eq!(r.lookup_full("System.String"), Some(r.well_known.string));
        assert_eq!(
            r.lookup_full("System.OverflowException"),
            Some(r.well_known.overflow_exception)
        );
        assert!(r.is_subclass_of(
            r.well_known.overflow_exception,
            r.well_known.arithmetic_exception
        ));
        assert!(r.is_subclass_of(r.well_known.int32, r.well_known.value_type));
        // unprepared until a runtime lays the registry out
        assert_eq!(r.ty(r.well_known.int32).category, TypeCategory::Unresolved);
    }

    #[test]
    fn exception_constructors_chain_to_their_base() {
        let r = TypeRegistry::new();
        let overflow = r.well_known.overflow_exception;
        let ctor = r
            .find_method_with_params(overflow, ".ctor", &[r.well_known.string])
            .expect("message ctor");
        let body = r.method(ctor).body.as_ref().expect("interpreted body");
        assert_eq!(body.code.last(), Some(&(OpCode::Ret as u8)));
    }
}
