use crate::{
    BytecodeBuilder, Constant, FieldAttributes, ImplementationKind, MethodAttributes,
    MethodId, MethodSignature, OpCode, RegionKind, Runtime, RuntimeCreateInfo, StackValue,
    Token, TypeAttributes, TypeId, TypeRegistry, VmError,
};

fn quiet() -> RuntimeCreateInfo {
    RuntimeCreateInfo {
        echo_console: Some(false),
        stack_size: Some(64 * 1024),
        ..Default::default()
    }
}

/// A registry with an `App.Program` class to hang test methods on.
struct Program {
    types: TypeRegistry,
    app: TypeId,
}

impl Program {
    fn new() -> Self {
        let mut types = TypeRegistry::new();
        let object = types.well_known.object;
        let app = types.define_type("App", "Program", Some(object), TypeAttributes::empty());
        Self { types, app }
    }

    fn class(&mut self, name: &str, base: TypeId) -> TypeId {
        self.types.define_type("App", name, Some(base), TypeAttributes::empty())
    }

    fn value_type(&mut self, name: &str) -> TypeId {
        let base = self.types.well_known.value_type;
        self.types.define_type("App", name, Some(base), TypeAttributes::SEALED)
    }

    fn method(
        &mut self,
        owner: TypeId,
        name: &str,
        attributes: MethodAttributes,
        params: Vec<TypeId>,
        ret: Option<TypeId>,
    ) -> MethodId {
        self.types.define_method(
            owner,
            name,
            attributes,
            MethodSignature::new(params, ret),
            ImplementationKind::Interpreted,
        )
    }

    fn body(&mut self, method: MethodId, locals: Vec<TypeId>, build: impl FnOnce(&mut BytecodeBuilder)) {
        let mut code = BytecodeBuilder::new();
        build(&mut code);
        self.types.set_body(method, code.into_body(8, locals));
    }

    /// Static method on `App.Program`.
    fn function(
        &mut self,
        name: &str,
        params: Vec<TypeId>,
        ret: Option<TypeId>,
        locals: Vec<TypeId>,
        build: impl FnOnce(&mut BytecodeBuilder),
    ) -> MethodId {
        let method = self.method(self.app, name, MethodAttributes::STATIC, params, ret);
        self.body(method, locals, build);
        method
    }

    /// Instance method returning a constant.
    fn constant(&mut self, owner: TypeId, name: &str, attributes: MethodAttributes, value: i32) -> MethodId {
        let int32 = self.types.well_known.int32;
        let method = self.method(owner, name, attributes, vec![], Some(int32));
        self.body(method, vec![], |code| {
            code.ldc_i4(value).op(OpCode::Ret);
        });
        method
    }

    /// `.ctor()` chaining to `base_ctor`.
    fn default_ctor(&mut self, ty: TypeId, base_ctor: MethodId) -> MethodId {
        let ctor = self.method(ty, ".ctor", MethodAttributes::SPECIAL_NAME, vec![], None);
        self.body(ctor, vec![], |code| {
            code.ldarg(0).call(base_ctor).op(OpCode::Ret);
        });
        ctor
    }

    fn object_ctor(&self) -> MethodId {
        let object = self.types.well_known.object;
        self.types.find_method_with_params(object, ".ctor", &[]).expect("Object::.ctor")
    }

    fn write_line(&self) -> MethodId {
        let console = self.types.lookup("System", "Console").expect("Console");
        let string = self.types.well_known.string;
        self.types
            .find_method_with_params(console, "WriteLine", &[string])
            .expect("WriteLine(string)")
    }

    fn core(&self, name: &str) -> TypeId {
        self.types.lookup("System", name).expect("core type")
    }

    fn start(self) -> Runtime {
        Runtime::new(self.types, quiet()).expect("runtime")
    }
}

/// Type of the managed exception a call ended with.
fn thrown(result: Result<Option<StackValue>, VmError>) -> Option<TypeId> {
    match result {
        Err(VmError::Exception(exception)) => exception.object.type_id(),
        _ => None,
    }
}

fn assert_balanced(rt: &Runtime) {
    assert_eq!(rt.stack.used(), 0);
    assert_eq!(rt.call_stack.depth(), 0);
    assert_eq!(rt.structs.live_entries(), 0);
}

#[test]
fn virtual_calls_follow_overrides_and_respect_hiding() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let object_ctor = p.object_ctor();
    let a = p.class("A", wk.object);
    let b = p.class("B", a);
    let a_ctor = p.default_ctor(a, object_ctor);
    let b_ctor = p.default_ctor(b, a_ctor);
    let virt = MethodAttributes::VIRTUAL;
    let a_f = p.constant(a, "F", MethodAttributes::empty(), 1);
    let a_g = p.constant(a, "G", virt, 2);
    let a_h = p.constant(a, "H", virt, 10);
    let b_f = p.constant(b, "F", MethodAttributes::empty(), 3);
    let b_g = p.constant(b, "G", virt, 4);
    let b_h = p.constant(b, "H", virt | MethodAttributes::NEW_SLOT, 11);
    let make = p.function("Make", vec![], Some(a), vec![], |code| {
        code.newobj(b_ctor).op(OpCode::Ret);
    });
    let expectations = [(a_f, 1), (b_f, 3), (a_g, 4), (b_g, 4), (a_h, 10), (b_h, 11)];
    let probes = expectations
        .into_iter()
        .enumerate()
        .map(|(index, (method, expected))| {
            let probe = p.function(&format!("Probe{index}"), vec![a], Some(wk.int32), vec![], |code| {
                code.ldarg(0).callvirt(method).op(OpCode::Ret);
            });
            (probe, expected)
        })
        .collect::<Vec<_>>();

    let mut rt = p.start();
    let instance = rt.call(make, &[]).expect("make").expect("instance");
    for (probe, expected) in probes {
        assert_eq!(
            rt.call(probe, &[instance]).expect("probe"),
            Some(StackValue::Int32(expected))
        );
    }
    assert_balanced(&rt);
}

#[test]
fn callvirt_on_null_raises() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let to_string = p.types.find_method(wk.object, "ToString").expect("ToString");
    let main = p.function("Main", vec![], None, vec![], |code| {
        code.op(OpCode::Ldnull).callvirt(to_string).op(OpCode::Pop).op(OpCode::Ret);
    });
    let mut rt = p.start();
    assert_eq!(thrown(rt.call(main, &[])), Some(wk.null_reference_exception));
    assert_balanced(&rt);
}

#[test]
fn nested_finally_blocks_run_innermost_first() {
    let mut p = Program::new();
    let write_line = p.write_line();
    let [body, inner, outer, done] =
        ["body", "inner", "outer", "done"].map(|text| p.types.user_string(text));
    let main = p.function("Main", vec![], None, vec![], |code| {
        let start = code.define_label();
        let inner_handler = code.define_label();
        let outer_handler = code.define_label();
        let end = code.define_label();
        code.mark(start);
        code.ldstr(body).call(write_line).leave(end);
        code.mark(inner_handler);
        code.ldstr(inner).call(write_line).op(OpCode::Endfinally);
        code.mark(outer_handler);
        code.ldstr(outer).call(write_line).op(OpCode::Endfinally);
        code.mark(end);
        code.ldstr(done).call(write_line).op(OpCode::Ret);
        code.region(RegionKind::Finally, start, inner_handler, inner_handler, outer_handler);
        code.region(RegionKind::Finally, start, outer_handler, outer_handler, end);
    });

    let mut rt = p.start();
    rt.call(main, &[]).expect("main");
    assert_eq!(rt.console.lines(), ["body", "inner", "outer", "done"]);
    assert_balanced(&rt);
}

#[test]
fn exceptions_run_finally_blocks_before_reaching_a_catch() {
    let mut p = Program::new();
    let write_line = p.write_line();
    let arithmetic = p.core("ArithmeticException");
    let [finally, caught, done] =
        ["finally", "caught", "done"].map(|text| p.types.user_string(text));
    let main = p.function("Main", vec![], None, vec![], |code| {
        let start = code.define_label();
        let finally_handler = code.define_label();
        let finally_end = code.define_label();
        let catch_handler = code.define_label();
        let end = code.define_label();
        code.mark(start);
        code.ldc_i4(1).ldc_i4(0).op(OpCode::Div).op(OpCode::Pop).leave(end);
        code.mark(finally_handler);
        code.ldstr(finally).call(write_line).op(OpCode::Endfinally);
        code.mark(finally_end);
        code.leave(end);
        code.mark(catch_handler);
        code.op(OpCode::Pop).ldstr(caught).call(write_line).leave(end);
        code.mark(end);
        code.ldstr(done).call(write_line).op(OpCode::Ret);
        code.region(RegionKind::Finally, start, finally_handler, finally_handler, finally_end);
        code.region(RegionKind::Catch(arithmetic), start, catch_handler, catch_handler, end);
    });

    let mut rt = p.start();
    rt.call(main, &[]).expect("main");
    assert_eq!(rt.console.lines(), ["finally", "caught", "done"]);
    assert_balanced(&rt);
}

#[test]
fn first_matching_catch_clause_wins() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let invalid_cast = wk.invalid_cast_exception;
    let divide_by_zero = wk.divide_by_zero_exception;
    let main = p.function("Main", vec![], Some(wk.int32), vec![wk.int32], |code| {
        let start = code.define_label();
        let first = code.define_label();
        let second = code.define_label();
        let end = code.define_label();
        code.mark(start);
        code.ldc_i4(1).ldc_i4(0).op(OpCode::Div).op(OpCode::Pop).leave(end);
        code.mark(first);
        code.op(OpCode::Pop).ldc_i4(1).stloc(0).leave(end);
        code.mark(second);
        code.op(OpCode::Pop).ldc_i4(2).stloc(0).leave(end);
        code.mark(end);
        code.ldloc(0).op(OpCode::Ret);
        code.region(RegionKind::Catch(invalid_cast), start, first, first, second);
        code.region(RegionKind::Catch(divide_by_zero), start, first, second, end);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(2)));
    assert_balanced(&rt);
}

#[test]
fn rethrow_reaches_the_enclosing_handler() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let (exception, null_reference) = (wk.exception, wk.null_reference_exception);
    let main = p.function("Main", vec![], Some(wk.int32), vec![wk.int32], |code| {
        let start = code.define_label();
        let inner = code.define_label();
        let outer = code.define_label();
        let end = code.define_label();
        code.mark(start);
        code.op(OpCode::Ldnull).op(OpCode::Ldlen).op(OpCode::Pop).leave(end);
        code.mark(inner);
        code.op(OpCode::Pop).op(OpCode::Rethrow);
        code.mark(outer);
        code.op(OpCode::Pop).ldc_i4(7).stloc(0).leave(end);
        code.mark(end);
        code.ldloc(0).op(OpCode::Ret);
        code.region(RegionKind::Catch(exception), start, inner, inner, outer);
        code.region(RegionKind::Catch(null_reference), start, outer, outer, end);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(7)));
    assert_balanced(&rt);
}

#[test]
fn thrown_objects_carry_their_message() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let write_line = p.write_line();
    let ctor = p
        .types
        .find_method_with_params(wk.exception, ".ctor", &[wk.string])
        .expect("Exception(string)");
    let message = p.types.find_method(wk.exception, "get_Message").expect("get_Message");
    let boom = p.types.user_string("boom");
    let exception = wk.exception;
    let main = p.function("Main", vec![], None, vec![], |code| {
        let start = code.define_label();
        let handler = code.define_label();
        let end = code.define_label();
        code.mark(start);
        code.ldstr(boom).newobj(ctor).op(OpCode::Throw);
        code.mark(handler);
        code.callvirt(message).call(write_line).leave(end);
        code.mark(end);
        code.op(OpCode::Ret);
        code.region(RegionKind::Catch(exception), start, handler, handler, end);
    });
    let unhandled = p.function("Unhandled", vec![], None, vec![], |code| {
        code.ldstr(boom).newobj(ctor).op(OpCode::Throw);
    });

    let mut rt = p.start();
    rt.call(main, &[]).expect("main");
    assert_eq!(rt.console.lines(), ["boom"]);
    assert_eq!(thrown(rt.call(unhandled, &[])), Some(wk.exception));
    assert_balanced(&rt);
}

#[test]
fn arithmetic_faults_become_managed_exceptions() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let overflow = p.function("Overflow", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_i4(i32::MAX).ldc_i4(1).op(OpCode::AddOvf).op(OpCode::Ret);
    });
    let unsigned = p.function("Unsigned", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_i4(-1).op(OpCode::ConvOvfU4).op(OpCode::Ret);
    });
    let divide = p.function("Divide", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_i4(7).ldc_i4(0).op(OpCode::Rem).op(OpCode::Ret);
    });
    let finite = p.function("Finite", vec![], None, vec![], |code| {
        code.ldc_r8(f64::NAN).op(OpCode::Ckfinite).op(OpCode::Pop).op(OpCode::Ret);
    });
    let wrapping = p.function("Wrapping", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_i4(i32::MAX).ldc_i4(1).op(OpCode::Add).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(thrown(rt.call(overflow, &[])), Some(wk.overflow_exception));
    assert_eq!(thrown(rt.call(unsigned, &[])), Some(wk.overflow_exception));
    assert_eq!(thrown(rt.call(divide, &[])), Some(wk.divide_by_zero_exception));
    assert_eq!(thrown(rt.call(finite, &[])), Some(wk.not_finite_number_exception));
    assert_eq!(rt.call(wrapping, &[]).expect("wrapping"), Some(StackValue::Int32(i32::MIN)));
    assert_balanced(&rt);
}

#[test]
fn conversions_truncate_and_widen() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let main = p.function("Main", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_i4(300).op(OpCode::ConvU1);
        code.ldc_r8(-2.5).op(OpCode::ConvI4);
        code.op(OpCode::Add).op(OpCode::Ret);
    });
    let widen = p.function("Widen", vec![], Some(wk.int64), vec![], |code| {
        code.ldc_i4(-1).op(OpCode::ConvU4).op(OpCode::ConvU8).op(OpCode::Ret);
    });
    let signed = p.function("Signed", vec![], Some(wk.int64), vec![], |code| {
        code.ldc_i4(-1).op(OpCode::ConvI8).op(OpCode::Ret);
    });
    let native = p.function("Native", vec![], Some(wk.int64), vec![], |code| {
        code.ldc_i4(-1).op(OpCode::ConvU).op(OpCode::ConvU8).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(42)));
    assert_eq!(
        rt.call(widen, &[]).expect("widen"),
        Some(StackValue::Int64(4_294_967_295))
    );
    assert_eq!(rt.call(signed, &[]).expect("signed"), Some(StackValue::Int64(-1)));
    assert_eq!(
        rt.call(native, &[]).expect("native"),
        Some(StackValue::Int64(4_294_967_295))
    );
    assert_balanced(&rt);
}

/// Pushes 1 when `op` branches on the two operands already on the stack.
fn branch_bit(code: &mut BytecodeBuilder, op: OpCode) {
    let (taken, join) = (code.define_label(), code.define_label());
    code.branch(op, taken).ldc_i4(0).branch(OpCode::Br, join);
    code.mark(taken).ldc_i4(1);
    code.mark(join);
}

#[test]
fn unordered_and_unsigned_branches() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let main = p.function("Main", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_r8(f64::NAN).ldc_r8(1.0);
        branch_bit(code, OpCode::Bge);
        code.ldc_i4(8).op(OpCode::Mul);
        code.ldc_r8(f64::NAN).ldc_r8(1.0);
        branch_bit(code, OpCode::BgeUn);
        code.ldc_i4(4).op(OpCode::Mul).op(OpCode::Add);
        code.ldc_i4(-1).ldc_i4(0);
        branch_bit(code, OpCode::Blt);
        code.ldc_i4(2).op(OpCode::Mul).op(OpCode::Add);
        code.ldc_i4(-1).ldc_i4(0);
        branch_bit(code, OpCode::BltUn);
        code.op(OpCode::Add).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(6)));
}

#[test]
fn switch_falls_through_out_of_range() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let select = p.function("Select", vec![wk.int32], Some(wk.int32), vec![], |code| {
        let cases = [code.define_label(), code.define_label(), code.define_label()];
        code.ldarg(0).switch(&cases).ldc_i4(99).op(OpCode::Ret);
        for (case, value) in cases.into_iter().zip([10, 20, 30]) {
            code.mark(case).ldc_i4(value).op(OpCode::Ret);
        }
    });

    let mut rt = p.start();
    for (input, expected) in [(0, 10), (1, 20), (2, 30), (3, 99), (-1, 99)] {
        assert_eq!(
            rt.call(select, &[StackValue::Int32(input)]).expect("select"),
            Some(StackValue::Int32(expected))
        );
    }
}

#[test]
fn arrays_store_load_and_check_bounds() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let ints = p.types.sz_array_of(wk.int32);
    let int32 = wk.int32;
    let sum = p.function("Sum", vec![], Some(wk.int32), vec![ints], |code| {
        code.ldc_i4(3).typed(OpCode::Newarr, int32).stloc(0);
        for (index, value) in [(0, 5), (1, 6), (2, 7)] {
            code.ldloc(0).ldc_i4(index).ldc_i4(value).op(OpCode::StelemI4);
        }
        code.ldloc(0).ldc_i4(0).op(OpCode::LdelemI4);
        code.ldloc(0).ldc_i4(2).op(OpCode::LdelemI4).op(OpCode::Add);
        code.ldloc(0).op(OpCode::Ldlen).op(OpCode::ConvI4).op(OpCode::Add);
        code.op(OpCode::Ret);
    });
    let past_end = p.function("PastEnd", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_i4(3).typed(OpCode::Newarr, int32).ldc_i4(3).op(OpCode::LdelemI4).op(OpCode::Ret);
    });
    let negative = p.function("Negative", vec![], None, vec![], |code| {
        code.ldc_i4(-1).typed(OpCode::Newarr, int32).op(OpCode::Pop).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(sum, &[]).expect("sum"), Some(StackValue::Int32(15)));
    assert_eq!(thrown(rt.call(past_end, &[])), Some(wk.index_out_of_range_exception));
    assert_eq!(thrown(rt.call(negative, &[])), Some(wk.overflow_exception));
    assert_balanced(&rt);
}

#[test]
fn array_covariance_is_checked_on_store() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let objects = p.types.sz_array_of(wk.object);
    let object_ctor = p.object_ctor();
    let text = p.types.user_string("s");
    let string = wk.string;
    let main = p.function("Main", vec![], None, vec![objects], |code| {
        code.ldc_i4(2).typed(OpCode::Newarr, string).stloc(0);
        code.ldloc(0).ldc_i4(0).ldstr(text).op(OpCode::StelemRef);
        code.ldloc(0).ldc_i4(1).newobj(object_ctor).op(OpCode::StelemRef);
        code.op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(thrown(rt.call(main, &[])), Some(wk.array_type_mismatch_exception));
    assert_balanced(&rt);
}

#[test]
fn isinst_compares_array_shapes_and_elements() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let objects = p.types.sz_array_of(wk.object);
    let ints = p.types.sz_array_of(wk.int32);
    let grid = p.types.md_array_of(wk.object, 2);
    let checks = [
        (wk.string, objects, 8),
        (wk.int32, objects, 4),
        (wk.int32, ints, 2),
        (wk.string, grid, 1),
    ];
    let main = p.function("Main", vec![], Some(wk.int32), vec![], |code| {
        code.ldc_i4(0);
        for (element, target, weight) in checks {
            code.ldc_i4(1).typed(OpCode::Newarr, element).typed(OpCode::Isinst, target);
            code.op(OpCode::Ldnull).op(OpCode::CgtUn);
            code.ldc_i4(weight).op(OpCode::Mul).op(OpCode::Add);
        }
        code.op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(8 + 2)));
}

#[test]
fn castclass_rejects_unrelated_types() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let object_ctor = p.object_ctor();
    let string = wk.string;
    let main = p.function("Main", vec![], None, vec![], |code| {
        code.op(OpCode::Ldnull).typed(OpCode::Castclass, string).op(OpCode::Pop);
        code.newobj(object_ctor).typed(OpCode::Castclass, string).op(OpCode::Pop);
        code.op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(thrown(rt.call(main, &[])), Some(wk.invalid_cast_exception));
}

#[test]
fn static_constructors_run_once_base_first() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let write_line = p.write_line();
    let base = p.class("Base", wk.object);
    let derived = p.class("Derived", base);
    let x = p.types.define_field(derived, "X", wk.int32, FieldAttributes::STATIC);
    let answer = p.types.define_literal(p.app, "Answer", wk.int32, Constant::Int32(42));
    let [base_text, derived_text] = ["base", "derived"].map(|text| p.types.user_string(text));
    let base_cctor = p.method(base, ".cctor", MethodAttributes::STATIC, vec![], None);
    p.body(base_cctor, vec![], |code| {
        code.ldstr(base_text).call(write_line).op(OpCode::Ret);
    });
    let derived_cctor = p.method(derived, ".cctor", MethodAttributes::STATIC, vec![], None);
    p.body(derived_cctor, vec![], |code| {
        code.ldstr(derived_text).call(write_line);
        // re-entrant read while initializing
        code.field(OpCode::Ldsfld, x).op(OpCode::Pop);
        code.ldc_i4(7).field(OpCode::Stsfld, x).op(OpCode::Ret);
    });
    let main = p.function("Main", vec![], Some(wk.int32), vec![], |code| {
        code.field(OpCode::Ldsfld, x).field(OpCode::Ldsfld, x).op(OpCode::Add);
        code.field(OpCode::Ldsfld, answer).op(OpCode::Add).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(56)));
    assert_eq!(rt.call(main, &[]).expect("again"), Some(StackValue::Int32(56)));
    assert_eq!(rt.console.lines(), ["base", "derived"]);
    assert_balanced(&rt);
}

#[test]
fn value_types_construct_box_and_unbox() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let point = p.value_type("Point");
    let x = p.types.define_field(point, "x", wk.int32, FieldAttributes::empty());
    let y = p.types.define_field(point, "y", wk.int32, FieldAttributes::empty());
    let ctor = p.method(point, ".ctor", MethodAttributes::SPECIAL_NAME, vec![wk.int32, wk.int32], None);
    p.body(ctor, vec![], |code| {
        code.ldarg(0).ldarg(1).field(OpCode::Stfld, x);
        code.ldarg(0).ldarg(2).field(OpCode::Stfld, y);
        code.op(OpCode::Ret);
    });
    let sum = p.method(point, "Sum", MethodAttributes::empty(), vec![], Some(wk.int32));
    p.body(sum, vec![], |code| {
        code.ldarg(0).field(OpCode::Ldfld, x);
        code.ldarg(0).field(OpCode::Ldfld, y);
        code.op(OpCode::Add).op(OpCode::Ret);
    });
    let main = p.function("Main", vec![], Some(wk.int32), vec![wk.object, point], |code| {
        code.ldc_i4(3).ldc_i4(4).newobj(ctor).typed(OpCode::Box, point).stloc(0);
        code.ldloc(0).typed(OpCode::UnboxAny, point).stloc(1);
        code.ldloc(1).field(OpCode::Ldfld, x).ldc_i4(10).op(OpCode::Mul);
        code.ldloca(1).call(sum).op(OpCode::Add).op(OpCode::Ret);
    });
    let mismatch = p.function("Mismatch", vec![], Some(wk.int32), vec![], |code| {
        let int32 = wk.int32;
        code.ldc_i4(3).typed(OpCode::Box, int32).typed(OpCode::UnboxAny, point).op(OpCode::Pop);
        code.ldc_i4(0).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(37)));
    assert_eq!(thrown(rt.call(mismatch, &[])), Some(wk.invalid_cast_exception));
    assert_balanced(&rt);
}

#[test]
fn large_structs_survive_copies() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let big = p.value_type("Big");
    let a = p.types.define_field(big, "a", wk.int64, FieldAttributes::empty());
    p.types.define_field(big, "b", wk.int64, FieldAttributes::empty());
    let c = p.types.define_field(big, "c", wk.int64, FieldAttributes::empty());
    let main = p.function("Main", vec![], Some(wk.int64), vec![big, big, wk.object], |code| {
        code.ldloca(0).typed(OpCode::Initobj, big);
        code.ldloca(0).ldc_i8(5).field(OpCode::Stfld, a);
        code.ldloca(0).ldc_i8(6).field(OpCode::Stfld, c);
        code.ldloc(0).typed(OpCode::Box, big).stloc(2);
        code.ldloc(2).typed(OpCode::UnboxAny, big).stloc(1);
        code.ldloc(1).op(OpCode::Dup).op(OpCode::Pop).op(OpCode::Pop);
        code.ldloc(1).field(OpCode::Ldfld, a);
        code.ldloc(1).field(OpCode::Ldfld, c);
        code.op(OpCode::Add).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert!(rt.types.ty(big).is_large_struct());
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int64(11)));
    assert_balanced(&rt);
}

#[test]
fn constrained_calls_use_the_value_type_override_or_box() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let write_line = p.write_line();
    let to_string = p.types.find_method(wk.object, "ToString").expect("ToString");
    let point = p.value_type("Point");
    p.types.define_field(point, "x", wk.int32, FieldAttributes::empty());
    let plain = p.value_type("Plain");
    p.types.define_field(plain, "v", wk.int32, FieldAttributes::empty());
    let text = p.types.user_string("P");
    let point_to_string =
        p.method(point, "ToString", MethodAttributes::VIRTUAL, vec![], Some(wk.string));
    p.body(point_to_string, vec![], |code| {
        code.ldstr(text).op(OpCode::Ret);
    });
    let main = p.function("Main", vec![], None, vec![point, plain], |code| {
        for (local, ty) in [(0, point), (1, plain)] {
            code.ldloca(local).typed(OpCode::Initobj, ty);
            code.ldloca(local).typed(OpCode::Constrained, ty).callvirt(to_string);
            code.call(write_line);
        }
        code.op(OpCode::Ret);
    });

    let mut rt = p.start();
    rt.call(main, &[]).expect("main");
    assert_eq!(rt.console.lines(), ["P", "App.Plain"]);
    assert_balanced(&rt);
}

#[test]
fn delegates_and_function_pointers_reach_their_target() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let multicast = p.core("MulticastDelegate");
    let func = p.types.define_type("App", "Func", Some(multicast), TypeAttributes::SEALED);
    let ctor = p.types.define_method(
        func,
        ".ctor",
        MethodAttributes::SPECIAL_NAME,
        MethodSignature::new(vec![wk.object, wk.intptr], None),
        ImplementationKind::Runtime,
    );
    let invoke = p.types.define_method(
        func,
        "Invoke",
        MethodAttributes::VIRTUAL,
        MethodSignature::new(vec![wk.int32], Some(wk.int32)),
        ImplementationKind::Runtime,
    );
    let double = p.function("Double", vec![wk.int32], Some(wk.int32), vec![], |code| {
        code.ldarg(0).ldc_i4(2).op(OpCode::Mul).op(OpCode::Ret);
    });
    let main = p.function("Main", vec![], Some(wk.int32), vec![], |code| {
        code.op(OpCode::Ldnull).method(OpCode::Ldftn, double).newobj(ctor);
        code.ldc_i4(21).callvirt(invoke);
        code.ldc_i4(20).method(OpCode::Ldftn, double).token(OpCode::Calli, Token::from(double));
        code.op(OpCode::Add).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(82)));
    assert_balanced(&rt);
}

#[test]
fn localloc_blocks_are_addressable() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let main = p.function("Main", vec![], Some(wk.int32), vec![wk.intptr], |code| {
        code.ldc_i4(16).op(OpCode::Localloc).stloc(0);
        code.ldloc(0).ldc_i4(5).op(OpCode::StindI4);
        code.ldloc(0).ldc_i4(4).op(OpCode::Add).ldc_i4(7).op(OpCode::StindI4);
        code.ldloc(0).op(OpCode::LdindI4);
        code.ldloc(0).ldc_i4(4).op(OpCode::Add).op(OpCode::LdindI4);
        code.op(OpCode::Add).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(12)));
    assert_balanced(&rt);
}

#[test]
fn negative_block_sizes_are_rejected() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let copy = p.function("Copy", vec![], None, vec![wk.int64, wk.int64], |code| {
        code.ldloca(0).ldloca(1).ldc_i4(-8).op(OpCode::Cpblk).op(OpCode::Ret);
    });
    let init = p.function("Init", vec![], None, vec![wk.int64], |code| {
        code.ldloca(0).ldc_i4(0).ldc_i4(-1).op(OpCode::Initblk).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert!(matches!(rt.call(copy, &[]), Err(VmError::InvalidProgram(_))));
    assert!(matches!(rt.call(init, &[]), Err(VmError::InvalidProgram(_))));
}

#[test]
fn string_literals_are_interned() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let text = p.types.user_string("hello");
    let length = p.types.find_method(wk.string, "get_Length").expect("get_Length");
    let main = p.function("Main", vec![], Some(wk.int32), vec![], |code| {
        code.ldstr(text).ldstr(text).op(OpCode::Ceq);
        code.ldstr(text).call(length).op(OpCode::Add).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(6)));
    assert_eq!(rt.strings.len(), 1);
    assert!(rt.stats.instructions > 0);
}

#[test]
fn arguments_and_locals_round_trip_through_addresses() {
    let mut p = Program::new();
    let wk = p.types.well_known.clone();
    let bump = p.function("Bump", vec![wk.int32], Some(wk.int32), vec![wk.byte], |code| {
        code.ldarga(0).op(OpCode::Dup).op(OpCode::LdindI4).ldc_i4(1).op(OpCode::Add);
        code.op(OpCode::StindI4);
        // a byte local keeps only the low bits
        code.ldc_i4(0x1FF).stloc(0);
        code.ldarg(0).ldloc(0).op(OpCode::Add);
        code.starg(0).ldarg(0).op(OpCode::Ret);
    });

    let mut rt = p.start();
    assert_eq!(
        rt.call(bump, &[StackValue::Int32(10)]).expect("bump"),
        Some(StackValue::Int32(11 + 0xFF))
    );
}
