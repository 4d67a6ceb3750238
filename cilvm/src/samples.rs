//! Small programs assembled with [`BytecodeBuilder`] so the binary has
//! something to run without a metadata reader.

use crate::{
    BytecodeBuilder, Constant, FieldAttributes, FieldId, ImplementationKind,
    MethodAttributes, MethodId, MethodSignature, OpCode, RegionKind, Token,
    TypeAttributes, TypeId, TypeRegistry,
};

pub struct Sample {
    pub name: &'static str,
    pub description: &'static str,
    /// Defines the program's types and returns its entry point.
    pub build: fn(&mut TypeRegistry) -> MethodId,
}

pub const SAMPLES: &[Sample] = &[
    Sample {
        name: "fib",
        description: "recursive fibonacci of the first argument (default 20)",
        build: fib,
    },
    Sample {
        name: "dispatch",
        description: "virtual calls over an array of animals",
        build: dispatch,
    },
    Sample {
        name: "exceptions",
        description: "catch, finally and an exception escaping Main",
        build: exceptions,
    },
    Sample {
        name: "arrays",
        description: "vectors, a 3x3 matrix and a bounds violation caught",
        build: arrays,
    },
    Sample {
        name: "statics",
        description: "static constructors and a literal field",
        build: statics,
    },
    Sample {
        name: "structs",
        description: "value types passed, returned and boxed",
        build: structs,
    },
    Sample {
        name: "delegates",
        description: "a delegate mapped over an array, plus calli",
        build: delegates,
    },
];

pub fn find(name: &str) -> Option<&'static Sample> {
    SAMPLES.iter().find(|sample| sample.name == name)
}

const STATIC: MethodAttributes = MethodAttributes::STATIC;
const INSTANCE: MethodAttributes = MethodAttributes::empty();
const CTOR: MethodAttributes = MethodAttributes::SPECIAL_NAME;
const VIRTUAL: MethodAttributes = MethodAttributes::VIRTUAL;

/// The corlib members samples keep reaching for.
struct Corlib {
    int32: TypeId,
    string: TypeId,
    object_ctor: MethodId,
    to_string: MethodId,
    concat: MethodId,
    write_string: MethodId,
    write_int: MethodId,
}

impl Corlib {
    fn find(r: &TypeRegistry) -> Self {
        let wk = &r.well_known;
        let console = r.lookup("System", "Console");
        let method = |ty: Option<TypeId>, name: &str, params: &[TypeId]| {
            ty.and_then(|ty| r.find_method_with_params(ty, name, params))
                .unwrap_or_else(|| panic!("corlib lacks {name}"))
        };
        Self {
            int32: wk.int32,
            string: wk.string,
            object_ctor: method(Some(wk.object), ".ctor", &[]),
            to_string: method(Some(wk.object), "ToString", &[]),
            concat: method(Some(wk.string), "Concat", &[wk.object, wk.object]),
            write_string: method(console, "WriteLine", &[wk.string]),
            write_int: method(console, "WriteLine", &[wk.int32]),
        }
    }
}

fn define(
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

fn assemble(
    r: &mut TypeRegistry,
    method: MethodId,
    locals: Vec<TypeId>,
    build: impl FnOnce(&mut BytecodeBuilder),
) {
    let mut code = BytecodeBuilder::new();
    build(&mut code);
    r.set_body(method, code.into_body(8, locals));
}

fn program(r: &mut TypeRegistry, name: &str) -> TypeId {
    let object = r.well_known.object;
    r.define_type("Samples", name, Some(object), TypeAttributes::ABSTRACT)
}

/// `static int Main(string[] args)`
fn main_method(r: &mut TypeRegistry, owner: TypeId) -> MethodId {
    let args = r.sz_array_of(r.well_known.string);
    let int32 = r.well_known.int32;
    define(r, owner, "Main", STATIC, vec![args], Some(int32))
}

/// `.ctor()` that only chains to `base_ctor`.
fn default_ctor(r: &mut TypeRegistry, ty: TypeId, base_ctor: MethodId) -> MethodId {
    let ctor = define(r, ty, ".ctor", CTOR, vec![], None);
    assemble(r, ctor, vec![], |code| {
        code.ldarg(0).call(base_ctor).op(OpCode::Ret);
    });
    ctor
}

fn fib(r: &mut TypeRegistry) -> MethodId {
    let lib = Corlib::find(r);
    let owner = program(r, "Fibonacci");
    let parse_failed = r.user_string("usage: fib [n]");
    let fib = define(r, owner, "Fib", STATIC, vec![lib.int32], Some(lib.int32));
    assemble(r, fib, vec![], |code| {
        let recurse = code.define_label();
        code.ldarg(0).ldc_i4(2).branch(OpCode::Bge, recurse);
        code.ldarg(0).op(OpCode::Ret);
        code.mark(recurse);
        code.ldarg(0).ldc_i4(1).op(OpCode::Sub).call(fib);
        code.ldarg(0).ldc_i4(2).op(OpCode::Sub).call(fib);
        code.op(OpCode::Add).op(OpCode::Ret);
    });

    // n = args.Length > 0 ? digits of args[0] : 20
    let char_at = r
        .find_method_with_params(lib.string, "get_Chars", &[lib.int32])
        .unwrap_or_else(|| panic!("corlib lacks String::get_Chars"));
    let length = r
        .find_method(lib.string, "get_Length")
        .unwrap_or_else(|| panic!("corlib lacks String::get_Length"));
    let main = main_method(r, owner);
    assemble(r, main, vec![lib.int32, lib.int32, lib.string], |code| {
        let (parse, loop_head, loop_end, bad, run) = (
            code.define_label(),
            code.define_label(),
            code.define_label(),
            code.define_label(),
            code.define_label(),
        );
        code.ldc_i4(20).stloc(0);
        code.ldarg(0).op(OpCode::Ldlen).op(OpCode::ConvI4).branch(OpCode::Brtrue, parse);
        code.branch(OpCode::Br, run);
        code.mark(parse);
        code.ldc_i4(0).stloc(0).ldc_i4(0).stloc(1);
        code.ldarg(0).ldc_i4(0).op(OpCode::LdelemRef).stloc(2);
        code.mark(loop_head);
        code.ldloc(1).ldloc(2).call(length).branch(OpCode::Bge, loop_end);
        code.ldloc(2).ldloc(1).call(char_at).ldc_i4('0' as i32).op(OpCode::Sub);
        code.op(OpCode::Dup).ldc_i4(9).branch(OpCode::BgtUn, bad);
        code.ldloc(0).ldc_i4(10).op(OpCode::Mul).op(OpCode::Add).stloc(0);
        code.ldloc(1).ldc_i4(1).op(OpCode::Add).stloc(1);
        code.branch(OpCode::Br, loop_head);
        code.mark(bad);
        code.op(OpCode::Pop).ldstr(parse_failed).call(lib.write_string);
        code.ldc_i4(2).op(OpCode::Ret);
        code.mark(loop_end);
        code.mark(run);
        code.ldloc(0).call(fib).call(lib.write_int);
        code.ldc_i4(0).op(OpCode::Ret);
    });
    main
}

fn dispatch(r: &mut TypeRegistry) -> MethodId {
    let lib = Corlib::find(r);
    let object = r.well_known.object;
    let owner = program(r, "Dispatch");
    let animal = r.define_type("Samples", "Animal", Some(object), TypeAttributes::ABSTRACT);
    let animal_ctor = default_ctor(r, animal, lib.object_ctor);
    let speak = define(
        r,
        animal,
        "Speak",
        VIRTUAL | MethodAttributes::ABSTRACT,
        vec![],
        Some(lib.string),
    );
    let describe = define(r, animal, "Describe", INSTANCE, vec![], Some(lib.string));
    let says = r.user_string(" says ");
    assemble(r, describe, vec![], |code| {
        code.ldarg(0).callvirt(lib.to_string);
        code.ldstr(says).call(lib.concat);
        code.ldarg(0).callvirt(speak).call(lib.concat).op(OpCode::Ret);
    });

    let mut creatures = Vec::new();
    for (name, sound) in [("Dog", "woof"), ("Cat", "meow"), ("Cow", "moo")] {
        let ty = r.define_type("Samples", name, Some(animal), TypeAttributes::SEALED);
        let ctor = default_ctor(r, ty, animal_ctor);
        let sound = r.user_string(sound);
        let over = define(r, ty, "Speak", VIRTUAL, vec![], Some(lib.string));
        assemble(r, over, vec![], |code| {
            code.ldstr(sound).op(OpCode::Ret);
        });
        creatures.push((ty, ctor));
    }
    // Cat also hides Describe; callers typed as Animal never see it
    let hidden = r.user_string("hidden");
    let (cat, _) = creatures[1];
    let cat_describe = define(r, cat, "Describe", INSTANCE, vec![], Some(lib.string));
    assemble(r, cat_describe, vec![], |code| {
        code.ldstr(hidden).op(OpCode::Ret);
    });

    let animals = r.sz_array_of(animal);
    let main = main_method(r, owner);
    assemble(r, main, vec![animals, lib.int32], |code| {
        let (head, check) = (code.define_label(), code.define_label());
        code.ldc_i4(creatures.len() as i32).typed(OpCode::Newarr, animal).stloc(0);
        for (index, &(_, ctor)) in creatures.iter().enumerate() {
            code.ldloc(0).ldc_i4(index as i32).newobj(ctor).op(OpCode::StelemRef);
        }
        code.ldc_i4(0).stloc(1).branch(OpCode::Br, check);
        code.mark(head);
        code.ldloc(0).ldloc(1).op(OpCode::LdelemRef).call(describe).call(lib.write_string);
        code.ldloc(1).ldc_i4(1).op(OpCode::Add).stloc(1);
        code.mark(check);
        code.ldloc(1).ldloc(0).op(OpCode::Ldlen).op(OpCode::ConvI4).branch(OpCode::Blt, head);
        code.ldc_i4(0).op(OpCode::Ret);
    });
    main
}

fn exceptions(r: &mut TypeRegistry) -> MethodId {
    let lib = Corlib::find(r);
    let wk = r.well_known.clone();
    let owner = program(r, "Exceptions");
    let message = r
        .find_method(wk.exception, "get_Message")
        .unwrap_or_else(|| panic!("corlib lacks Exception::get_Message"));
    let invalid_operation = r.lookup("System", "InvalidOperationException").unwrap_or(wk.exception);
    let raise_ctor = r
        .find_method_with_params(invalid_operation, ".ctor", &[lib.string])
        .unwrap_or_else(|| panic!("corlib lacks InvalidOperationException(string)"));

    let divide = define(r, owner, "Divide", STATIC, vec![lib.int32, lib.int32], Some(lib.int32));
    assemble(r, divide, vec![], |code| {
        code.ldarg(0).ldarg(1).op(OpCode::Div).op(OpCode::Ret);
    });

    let [caught, finally, overflow, escaping] = [
        "caught: ",
        "finally ran",
        "overflow: ",
        "this one escapes Main",
    ]
    .map(|text| r.user_string(text));
    let main = main_method(r, owner);
    assemble(r, main, vec![wk.exception], |code| {
        let (start, catch, finally_start, finally_end, after) = (
            code.define_label(),
            code.define_label(),
            code.define_label(),
            code.define_label(),
            code.define_label(),
        );
        code.mark(start);
        code.ldc_i4(10).ldc_i4(0).call(divide).call(lib.write_int).leave(after);
        code.mark(catch);
        code.stloc(0).ldstr(caught).ldloc(0).callvirt(message);
        code.call(lib.concat).call(lib.write_string).leave(after);
        code.mark(finally_start);
        code.ldstr(finally).call(lib.write_string).op(OpCode::Endfinally);
        code.mark(finally_end);
        code.mark(after);
        code.region(RegionKind::Catch(wk.divide_by_zero_exception), start, catch, catch, finally_start);
        code.region(RegionKind::Finally, start, finally_start, finally_start, finally_end);

        let (start, catch, after) = (code.define_label(), code.define_label(), code.define_label());
        code.mark(start);
        code.ldc_i4(i32::MAX).ldc_i4(2).op(OpCode::MulOvf).call(lib.write_int).leave(after);
        code.mark(catch);
        code.stloc(0).ldstr(overflow).ldloc(0).callvirt(lib.to_string);
        code.call(lib.concat).call(lib.write_string).leave(after);
        code.mark(after);
        code.region(RegionKind::Catch(wk.arithmetic_exception), start, catch, catch, after);

        code.ldstr(escaping).newobj(raise_ctor).op(OpCode::Throw);
    });
    main
}

fn arrays(r: &mut TypeRegistry) -> MethodId {
    let lib = Corlib::find(r);
    let wk = r.well_known.clone();
    let owner = program(r, "Arrays");
    let ints = r.sz_array_of(lib.int32);
    let matrix = r.md_array_of(lib.int32, 2);
    let find = |r: &TypeRegistry, name: &str, arity: usize| {
        let params = vec![lib.int32; arity];
        r.find_method_with_params(matrix, name, &params)
            .unwrap_or_else(|| panic!("matrix lacks {name}"))
    };
    let (ctor, get, set) = (find(r, ".ctor", 2), find(r, "Get", 2), find(r, "Set", 3));
    let out_of_range = r.user_string("index out of range caught");

    let main = main_method(r, owner);
    assemble(r, main, vec![ints, lib.int32, lib.int32, matrix], |code| {
        // squares of 0..10 and their sum
        let (fill, fill_check, sum, sum_check) = (
            code.define_label(),
            code.define_label(),
            code.define_label(),
            code.define_label(),
        );
        code.ldc_i4(10).typed(OpCode::Newarr, lib.int32).stloc(0);
        code.ldc_i4(0).stloc(1).branch(OpCode::Br, fill_check);
        code.mark(fill);
        code.ldloc(0).ldloc(1).ldloc(1).ldloc(1).op(OpCode::Mul).op(OpCode::StelemI4);
        code.ldloc(1).ldc_i4(1).op(OpCode::Add).stloc(1);
        code.mark(fill_check);
        code.ldloc(1).ldloc(0).op(OpCode::Ldlen).op(OpCode::ConvI4).branch(OpCode::Blt, fill);
        code.ldc_i4(0).stloc(2).ldc_i4(0).stloc(1).branch(OpCode::Br, sum_check);
        code.mark(sum);
        code.ldloc(2).ldloc(0).ldloc(1).op(OpCode::LdelemI4).op(OpCode::Add).stloc(2);
        code.ldloc(1).ldc_i4(1).op(OpCode::Add).stloc(1);
        code.mark(sum_check);
        code.ldloc(1).ldc_i4(10).branch(OpCode::Blt, sum);
        code.ldloc(2).call(lib.write_int);

        // 3x3 identity, trace printed
        code.ldc_i4(3).ldc_i4(3).newobj(ctor).stloc(3);
        for i in 0..3 {
            code.ldloc(3).ldc_i4(i).ldc_i4(i).ldc_i4(1).call(set);
        }
        code.ldloc(3).ldc_i4(0).ldc_i4(0).call(get);
        code.ldloc(3).ldc_i4(1).ldc_i4(1).call(get).op(OpCode::Add);
        code.ldloc(3).ldc_i4(2).ldc_i4(2).call(get).op(OpCode::Add);
        code.call(lib.write_int);

        let (start, catch, after) = (code.define_label(), code.define_label(), code.define_label());
        code.mark(start);
        code.ldloc(0).ldc_i4(10).op(OpCode::LdelemI4).call(lib.write_int).leave(after);
        code.mark(catch);
        code.op(OpCode::Pop).ldstr(out_of_range).call(lib.write_string).leave(after);
        code.mark(after);
        code.region(
            RegionKind::Catch(wk.index_out_of_range_exception),
            start,
            catch,
            catch,
            after,
        );
        code.ldc_i4(0).op(OpCode::Ret);
    });
    main
}

fn statics(r: &mut TypeRegistry) -> MethodId {
    let lib = Corlib::find(r);
    let object = r.well_known.object;
    let owner = program(r, "Statics");
    let counter = r.define_type("Samples", "Counter", Some(object), TypeAttributes::empty());
    let count = r.define_field(counter, "count", lib.int32, FieldAttributes::STATIC);
    let step = r.define_literal(counter, "Step", lib.int32, Constant::Int32(5));
    let initialized = r.user_string("Counter initialized");

    let cctor = define(r, counter, ".cctor", STATIC | CTOR, vec![], None);
    assemble(r, cctor, vec![], |code| {
        code.ldstr(initialized).call(lib.write_string);
        code.ldc_i4(100).field(OpCode::Stsfld, count).op(OpCode::Ret);
    });
    let next = define(r, counter, "Next", STATIC, vec![], Some(lib.int32));
    assemble(r, next, vec![], |code| {
        bump(code, count, step);
        code.field(OpCode::Ldsfld, count).op(OpCode::Ret);
    });

    let main = main_method(r, owner);
    assemble(r, main, vec![], |code| {
        for _ in 0..3 {
            code.call(next).call(lib.write_int);
        }
        // exit code is how far the counter moved
        code.field(OpCode::Ldsfld, count).ldc_i4(100).op(OpCode::Sub).op(OpCode::Ret);
    });
    main
}

/// `count += Step`
fn bump(code: &mut BytecodeBuilder, count: FieldId, step: FieldId) {
    code.field(OpCode::Ldsfld, count).field(OpCode::Ldsfld, step).op(OpCode::Add);
    code.field(OpCode::Stsfld, count);
}

fn structs(r: &mut TypeRegistry) -> MethodId {
    let lib = Corlib::find(r);
    let wk = r.well_known.clone();
    let owner = program(r, "Structs");
    let vec2 = r.define_type("Samples", "Vec2", Some(wk.value_type), TypeAttributes::SEALED);
    let x = r.define_field(vec2, "x", wk.int64, FieldAttributes::empty());
    let y = r.define_field(vec2, "y", wk.int64, FieldAttributes::empty());
    let tag = r.define_field(vec2, "tag", wk.int32, FieldAttributes::empty());

    let ctor = define(r, vec2, ".ctor", CTOR, vec![wk.int64, wk.int64], None);
    assemble(r, ctor, vec![], |code| {
        code.ldarg(0).ldarg(1).field(OpCode::Stfld, x);
        code.ldarg(0).ldarg(2).field(OpCode::Stfld, y);
        code.ldarg(0).ldc_i4(7).field(OpCode::Stfld, tag).op(OpCode::Ret);
    });
    let add = define(r, vec2, "Add", STATIC, vec![vec2, vec2], Some(vec2));
    assemble(r, add, vec![], |code| {
        code.ldarg(0).field(OpCode::Ldfld, x).ldarg(1).field(OpCode::Ldfld, x).op(OpCode::Add);
        code.ldarg(0).field(OpCode::Ldfld, y).ldarg(1).field(OpCode::Ldfld, y).op(OpCode::Add);
        code.newobj(ctor).op(OpCode::Ret);
    });
    let dot = define(r, vec2, "Dot", INSTANCE, vec![vec2], Some(wk.int64));
    assemble(r, dot, vec![], |code| {
        code.ldarg(0).field(OpCode::Ldfld, x).ldarga(1).field(OpCode::Ldfld, x).op(OpCode::Mul);
        code.ldarg(0).field(OpCode::Ldfld, y).ldarga(1).field(OpCode::Ldfld, y).op(OpCode::Mul);
        code.op(OpCode::Add).op(OpCode::Ret);
    });
    let write_long = r
        .lookup("System", "Console")
        .and_then(|console| r.find_method_with_params(console, "WriteLine", &[wk.int64]))
        .unwrap_or_else(|| panic!("corlib lacks WriteLine(int64)"));

    let main = main_method(r, owner);
    assemble(r, main, vec![vec2, vec2, wk.object], |code| {
        code.ldc_i8(3).ldc_i8(4).newobj(ctor).stloc(0);
        code.ldc_i8(10).ldc_i8(20).newobj(ctor).stloc(1);
        code.ldloc(0).ldloc(1).call(add).stloc(1);
        code.ldloca(1).field(OpCode::Ldfld, x).call(write_long);
        code.ldloca(1).field(OpCode::Ldfld, y).call(write_long);
        code.ldloca(0).ldloc(1).call(dot).call(write_long);
        // a boxed copy is independent of the local
        code.ldloc(0).typed(OpCode::Box, vec2).stloc(2);
        code.ldloca(0).ldc_i8(0).field(OpCode::Stfld, x);
        code.ldloc(2).typed(OpCode::UnboxAny, vec2).field(OpCode::Ldfld, x).call(write_long);
        code.ldloc(2).typed(OpCode::Unbox, vec2).field(OpCode::Ldfld, tag).op(OpCode::Ret);
    });
    main
}

fn delegates(r: &mut TypeRegistry) -> MethodId {
    let lib = Corlib::find(r);
    let wk = r.well_known.clone();
    let owner = program(r, "Delegates");
    let multicast = r.lookup("System", "MulticastDelegate").unwrap_or(wk.delegate);
    let transform = r.define_type("Samples", "Transform", Some(multicast), TypeAttributes::SEALED);
    let transform_ctor = r.define_method(
        transform,
        ".ctor",
        CTOR,
        MethodSignature::new(vec![wk.object, wk.intptr], None),
        ImplementationKind::Runtime,
    );
    let invoke = r.define_method(
        transform,
        "Invoke",
        VIRTUAL,
        MethodSignature::new(vec![lib.int32], Some(lib.int32)),
        ImplementationKind::Runtime,
    );

    // an instance method bound to its target
    let scaler = r.define_type("Samples", "Scaler", Some(wk.object), TypeAttributes::SEALED);
    let factor = r.define_field(scaler, "factor", lib.int32, FieldAttributes::empty());
    let scaler_ctor = define(r, scaler, ".ctor", CTOR, vec![lib.int32], None);
    assemble(r, scaler_ctor, vec![], |code| {
        code.ldarg(0).call(lib.object_ctor);
        code.ldarg(0).ldarg(1).field(OpCode::Stfld, factor).op(OpCode::Ret);
    });
    let scale = define(r, scaler, "Scale", VIRTUAL, vec![lib.int32], Some(lib.int32));
    assemble(r, scale, vec![], |code| {
        code.ldarg(1).ldarg(0).field(OpCode::Ldfld, factor).op(OpCode::Mul).op(OpCode::Ret);
    });
    let negate = define(r, owner, "Negate", STATIC, vec![lib.int32], Some(lib.int32));
    assemble(r, negate, vec![], |code| {
        code.ldarg(0).op(OpCode::Neg).op(OpCode::Ret);
    });

    let ints = r.sz_array_of(lib.int32);
    let map = define(r, owner, "Map", STATIC, vec![transform, ints], None);
    assemble(r, map, vec![lib.int32], |code| {
        let (head, check) = (code.define_label(), code.define_label());
        code.ldc_i4(0).stloc(0).branch(OpCode::Br, check);
        code.mark(head);
        code.ldarg(1).ldloc(0);
        code.ldarg(0).ldarg(1).ldloc(0).op(OpCode::LdelemI4).callvirt(invoke);
        code.op(OpCode::StelemI4);
        code.ldarg(1).ldloc(0).op(OpCode::LdelemI4).call(lib.write_int);
        code.ldloc(0).ldc_i4(1).op(OpCode::Add).stloc(0);
        code.mark(check);
        code.ldloc(0).ldarg(1).op(OpCode::Ldlen).op(OpCode::ConvI4).branch(OpCode::Blt, head);
        code.op(OpCode::Ret);
    });

    let main = main_method(r, owner);
    assemble(r, main, vec![ints, scaler], |code| {
        code.ldc_i4(3).typed(OpCode::Newarr, lib.int32).stloc(0);
        for (index, value) in [1, 2, 3].into_iter().enumerate() {
            code.ldloc(0).ldc_i4(index as i32).ldc_i4(value).op(OpCode::StelemI4);
        }
        code.ldc_i4(10).newobj(scaler_ctor).stloc(1);
        code.ldloc(1).op(OpCode::Dup).method(OpCode::Ldvirtftn, scale).newobj(transform_ctor);
        code.ldloc(0).call(map);
        code.op(OpCode::Ldnull).method(OpCode::Ldftn, negate).newobj(transform_ctor);
        code.ldloc(0).call(map);
        // calli through the same function pointer
        code.ldc_i4(42).method(OpCode::Ldftn, negate);
        code.token(OpCode::Calli, Token::from(negate)).op(OpCode::Neg).op(OpCode::Ret);
    });
    main
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Runtime, RuntimeCreateInfo, VmError};

    fn run(name: &str, args: &[&str]) -> (Result<i32, VmError>, Vec<String>) {
        let sample = find(name).expect("sample");
        let mut types = TypeRegistry::new();
        let entry = (sample.build)(&mut types);
        let mut rt = Runtime::new(
            types,
            RuntimeCreateInfo {
                echo_console: Some(false),
                ..Default::default()
            },
        )
        .expect("runtime");
        let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
        let result = rt.run_entry_point(entry, &args);
        (result, rt.console.lines())
    }

    #[test]
    fn sample_names_are_unique() {
        for (index, sample) in SAMPLES.iter().enumerate() {
            assert!(SAMPLES[index + 1..].iter().all(|other| other.name != sample.name));
        }
    }

    #[test]
    fn fib() {
        let (result, lines) = run("fib", &[]);
        assert_eq!(result.ok(), Some(0));
        assert_eq!(lines, ["6765"]);
        let (result, lines) = run("fib", &["10"]);
        assert_eq!(result.ok(), Some(0));
        assert_eq!(lines, ["55"]);
        assert_eq!(run("fib", &["1x"]).0.ok(), Some(2));
    }

    #[test]
    fn dispatch() {
        let (result, lines) = run("dispatch", &[]);
        assert_eq!(result.ok(), Some(0));
        assert_eq!(
            lines,
            [
                "Samples.Dog says woof",
                "Samples.Cat says meow",
                "Samples.Cow says moo"
            ]
        );
    }

    #[test]
    fn exceptions() {
        let (result, lines) = run("exceptions", &[]);
        assert!(matches!(
            result,
            Err(VmError::Unhandled { ref type_name, ref message, .. })
                if type_name == "System.InvalidOperationException"
                    && message.as_deref() == Some("this one escapes Main")
        ));
        assert_eq!(
            lines,
            [
                "caught: Attempted to divide by zero.",
                "finally ran",
                "overflow: System.OverflowException",
            ]
        );
    }

    #[test]
    fn arrays() {
        let (result, lines) = run("arrays", &[]);
        assert_eq!(result.ok(), Some(0));
        assert_eq!(lines, ["285", "3", "index out of range caught"]);
    }

    #[test]
    fn statics() {
        let (result, lines) = run("statics", &[]);
        assert_eq!(result.ok(), Some(15));
        assert_eq!(lines, ["Counter initialized", "105", "110", "115"]);
    }

    #[test]
    fn structs() {
        let (result, lines) = run("structs", &[]);
        assert_eq!(result.ok(), Some(7));
        assert_eq!(lines, ["13", "24", "135", "3"]);
    }

    #[test]
    fn delegates() {
        let (result, lines) = run("delegates", &[]);
        assert_eq!(result.ok(), Some(42));
        assert_eq!(lines, ["10", "20", "30", "-10", "-20", "-30"]);
    }
}
