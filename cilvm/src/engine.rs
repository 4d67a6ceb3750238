//! The execution engine: the [`Runtime`] context, call dispatch, one-time
//! static initialization and the entry point.

use std::{collections::HashMap, ptr::NonNull, sync::Arc};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    Allocator, CallConvention, ExceptionEngine, FieldId, Frame, Heap,
    ImplementationKind, InternalCalls, InternedStrings, MethodCallData,
    MethodId, ObjectRef, RuntimeCreateInfo, RuntimeFailure, RuntimeSettings,
    StackAllocator, StackValue, StructStack, TraceFrame, TypeId, TypeRegistry,
    VmError, interpreter, layout,
    object::{self, string_to_rust},
    runtime_methods,
    value::{dispose, read_value},
    visitor::{MarkVisitor, RootVisitor, visit_value},
};

/// One entry of the logical call stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub method: MethodId,
    pub il_offset: u32,
    /// interpreter frame of the activation, none for native methods
    frame: Option<NonNull<Frame>>,
}

/// Methods currently executing, outermost first. Kept alongside the host
/// stack so exceptions and diagnostics can name interpreted frames.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<FrameDescriptor>,
}

impl CallStack {
    pub fn push(&mut self, method: MethodId) {
        self.frames.push(FrameDescriptor {
            method,
            il_offset: 0,
            frame: None,
        });
    }

    /// Exposes the innermost activation's frame to root enumeration. The
    /// frame must stay in place until [`CallStack::detach`].
    pub(crate) fn attach(&mut self, frame: &mut Frame) {
        if let Some(top) = self.frames.last_mut() {
            top.frame = Some(NonNull::from(frame));
        }
    }

    pub(crate) fn detach(&mut self) {
        if let Some(top) = self.frames.last_mut() {
            top.frame = None;
        }
    }

    pub fn pop(&mut self) -> Option<FrameDescriptor> {
        self.frames.pop()
    }

    /// Records the offset of the instruction the innermost frame executes.
    #[inline]
    pub fn set_offset(&mut self, il_offset: u32) {
        if let Some(top) = self.frames.last_mut() {
            top.il_offset = il_offset;
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[FrameDescriptor] {
        &self.frames
    }
}

/// Text written through `System.Console`. Clones share the same buffer so a
/// host can keep a handle while the runtime runs.
#[derive(Debug, Clone, Default)]
pub struct ConsoleOutput {
    buffer: Arc<Mutex<String>>,
    echo: bool,
}

impl ConsoleOutput {
    pub fn new(echo: bool) -> Self {
        Self {
            buffer: Arc::default(),
            echo,
        }
    }

    pub fn write(&self, text: &str) {
        if self.echo {
            print!("{text}");
        }
        self.buffer.lock().push_str(text);
    }

    pub fn write_line(&self, text: &str) {
        if self.echo {
            println!("{text}");
        }
        let mut buffer = self.buffer.lock();
        buffer.push_str(text);
        buffer.push('\n');
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.buffer.lock().lines().map(str::to_owned).collect()
    }
}

/// Process-wide static field storage, one block per type.
#[derive(Debug)]
pub struct StaticStorage {
    data: Vec<u64>,
}

impl StaticStorage {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size.div_ceil(8)],
        }
    }

    /// Address of a static field. The buffer is sized once and never moves.
    pub fn field_address(&mut self, types: &TypeRegistry, field: FieldId) -> *mut u8 {
        let desc = types.field(field);
        let offset = types.ty(desc.owner).static_offset + desc.offset;
        debug_assert!(offset + types.value_size(desc.ty) <= self.data.len() * 8);
        // SAFETY: static blocks were placed within the buffer by the layout
        unsafe { self.data.as_mut_ptr().cast::<u8>().add(offset) }
    }

    pub fn visit_roots(&mut self, types: &TypeRegistry, visitor: &mut impl RootVisitor) {
        for ty in types.type_ids() {
            for &field in &types.ty(ty).fields {
                let desc = types.field(field);
                if !desc.is_static() || desc.is_literal() {
                    continue;
                }
                let address = self.field_address(types, field);
                visit_value(types, desc.ty, address, visitor);
            }
        }
    }
}

/// Counters reported by `--stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutionStats {
    pub instructions: u64,
    pub calls: u64,
}

/// Everything a running program shares: metadata, heap, statics, the stack
/// allocator and the side-stack. Components receive it explicitly, there is
/// no global state.
pub struct Runtime {
    pub types: TypeRegistry,
    pub heap: Heap,
    pub statics: StaticStorage,
    pub stack: StackAllocator,
    pub structs: StructStack,
    pub internals: InternalCalls,
    pub strings: InternedStrings,
    pub exceptions: ExceptionEngine,
    pub call_stack: CallStack,
    pub console: ConsoleOutput,
    pub settings: RuntimeSettings,
    pub stats: ExecutionStats,
    type_objects: HashMap<TypeId, ObjectRef, ahash::RandomState>,
}

impl Runtime {
    /// Lays out the registry and sets up the runtime around it.
    pub fn new(
        mut types: TypeRegistry,
        info: RuntimeCreateInfo,
    ) -> Result<Self, VmError> {
        let settings = RuntimeSettings::from_info(&info);
        layout::prepare(&mut types)?;
        let statics = StaticStorage::new(types.static_storage_size());
        info!(
            "runtime ready: {} types, {} bytes of statics, {} byte stack",
            types.type_count(),
            types.static_storage_size(),
            settings.stack_size
        );
        Ok(Self {
            heap: Heap::new(settings.heap_limit),
            stack: StackAllocator::new(settings.stack_size)?,
            structs: StructStack::new(settings.struct_stack_capacity),
            console: ConsoleOutput::new(settings.echo_console),
            internals: InternalCalls::new(),
            strings: InternedStrings::new(),
            exceptions: ExceptionEngine::default(),
            call_stack: CallStack::default(),
            stats: ExecutionStats::default(),
            type_objects: HashMap::default(),
            statics,
            types,
            settings,
        })
    }

    /// Runs `method` with the marshaled arguments in `data` and hands the
    /// buffer back for the caller to read the return value and release it.
    /// On failure the buffer is released here.
    pub fn invoke(
        &mut self,
        method: MethodId,
        mut data: MethodCallData,
    ) -> Result<MethodCallData, VmError> {
        let owner = self.types.method(method).owner;
        if let Err(err) = self.ensure_static_constructor_has_run(owner) {
            data.release(&mut self.stack);
            return Err(err);
        }
        let limit = self.settings.max_call_depth;
        if self.call_stack.depth() >= limit {
            data.release(&mut self.stack);
            return Err(VmError::CallDepthExceeded(limit));
        }

        self.stats.calls += 1;
        self.call_stack.push(method);
        let result = self.dispatch(method, &mut data);
        let descriptor = self.call_stack.pop();
        match result {
            Ok(()) => Ok(data),
            Err(mut err) => {
                if let Some(descriptor) = descriptor {
                    ExceptionEngine::attach_frame(
                        &mut err,
                        TraceFrame {
                            method: descriptor.method,
                            il_offset: descriptor.il_offset,
                        },
                    );
                }
                data.release(&mut self.stack);
                Err(err)
            }
        }
    }

    fn dispatch(
        &mut self,
        method: MethodId,
        data: &mut MethodCallData,
    ) -> Result<(), VmError> {
        let desc = self.types.method(method);
        if desc.is_abstract() {
            return Err(VmError::invalid(format!(
                "call to abstract method {}",
                self.types.method_name(method)
            )));
        }
        let kind = desc.kind;
        match kind {
            ImplementationKind::Interpreted => {
                debug!("interpret {}", self.types.method_name(method));
                interpreter::execute(self, method, data)
            }
            ImplementationKind::Internal => {
                let function = self.internals.resolve(&self.types, method)?;
                debug!("internal {}", self.types.method_key(method));
                function(&mut crate::CallContext::new(self, method, data))
            }
            ImplementationKind::Runtime => {
                debug!("runtime method {}", self.types.method_name(method));
                runtime_methods::invoke(self, method, data)
            }
        }
    }

    /// Runs the static constructors of `ty` and its bases that have not run
    /// yet, most-base first. Each type is marked before its constructor is
    /// invoked, so re-entrant access during initialization does not recurse.
    pub fn ensure_static_constructor_has_run(
        &mut self,
        ty: TypeId,
    ) -> Result<(), VmError> {
        let mut pending = Vec::new();
        let mut current = Some(ty);
        while let Some(id) = current {
            let desc = self.types.ty_mut(id);
            if !desc.static_constructor_ran {
                desc.static_constructor_ran = true;
                if let Some(cctor) = desc.static_constructor {
                    pending.push(cctor);
                }
            }
            current = desc.base;
        }
        for cctor in pending.into_iter().rev() {
            debug!("static constructor {}", self.types.method_name(cctor));
            self.call(cctor, &[])?;
        }
        Ok(())
    }

    /// Marshals `args`, invokes `method` and returns its result.
    pub fn call(
        &mut self,
        method: MethodId,
        args: &[StackValue],
    ) -> Result<Option<StackValue>, VmError> {
        let desc = self.types.method(method);
        let this = desc.signature.has_this.then(|| args.first()).flatten();
        if args.len() != desc.signature.argument_count() {
            return Err(VmError::invalid(format!(
                "{} takes {} arguments, {} given",
                self.types.method_name(method),
                desc.signature.argument_count(),
                args.len()
            )));
        }
        let mut data = MethodCallData::prepare(
            &self.types,
            &mut self.stack,
            method,
            this,
            CallConvention::Standard,
        )?;
        for (index, &arg) in args.iter().enumerate() {
            if let Err(err) =
                data.set_argument(&self.types, &self.structs, index, arg)
            {
                data.release(&mut self.stack);
                return Err(err);
            }
        }
        let data = self.invoke(method, data)?;
        let result = data.get_return(&self.types, &mut self.structs);
        data.release(&mut self.stack);
        Ok(result)
    }

    /// Virtual call on a reference receiver, the way `callvirt` dispatches.
    pub fn call_virtual(
        &mut self,
        method: MethodId,
        args: &[StackValue],
    ) -> Result<Option<StackValue>, VmError> {
        let receiver = match args.first() {
            Some(value) => value.as_object()?,
            None => return Err(VmError::invalid("virtual call without receiver")),
        };
        let Some(ty) = receiver.type_id() else {
            return Err(self.raise(RuntimeFailure::NullReference));
        };
        let target = object::resolve_virtual(&self.types, method, ty)?;
        self.call(target, args)
    }

    /// Runs a program's entry point and returns its exit code. An exception
    /// escaping the entry point becomes [`VmError::Unhandled`].
    pub fn run_entry_point(
        &mut self,
        method: MethodId,
        args: &[String],
    ) -> Result<i32, VmError> {
        info!("running {}", self.types.method_name(method));
        let desc = self.types.method(method);
        let returns_int = desc.signature.ret == Some(self.types.well_known.int32);
        let arguments = match desc.signature.params.len() {
            0 => Vec::new(),
            1 => vec![StackValue::Object(self.string_array(args)?)],
            _ => {
                return Err(VmError::invalid(
                    "entry point takes at most one string[] argument",
                ));
            }
        };

        let result = self.call(method, &arguments);
        assert_eq!(
            self.stack.used(),
            0,
            "stack reservations leaked past the entry point"
        );
        let code = match result {
            Ok(Some(value)) if returns_int => {
                let code = value.as_i32()?;
                dispose(&mut self.structs, value);
                code
            }
            Ok(value) => {
                if let Some(value) = value {
                    dispose(&mut self.structs, value);
                }
                0
            }
            Err(VmError::Exception(exception)) => {
                let unhandled = self.describe_unhandled(exception.object, &exception.trace);
                warn!("{unhandled}");
                return Err(unhandled);
            }
            Err(err) => return Err(err),
        };
        info!(
            "exit code {code}, {} bytes of stack at peak, {} objects",
            self.stack.high_water(),
            self.heap.object_count()
        );
        Ok(code)
    }

    fn describe_unhandled(&self, object: ObjectRef, trace: &[TraceFrame]) -> VmError {
        let type_name = object
            .type_id()
            .map_or_else(|| "null".to_string(), |ty| self.types.full_name(ty));
        VmError::Unhandled {
            type_name,
            message: self.exception_message(object),
            trace: trace
                .iter()
                .map(|frame| {
                    format!(
                        "at {} +{:#06x}",
                        self.types.method_name(frame.method),
                        frame.il_offset
                    )
                })
                .collect(),
        }
    }

    /// The `_message` of an exception object.
    pub fn exception_message(&self, exception: ObjectRef) -> Option<String> {
        let field = self.types.well_known.exception_message?;
        let ty = exception.type_id()?;
        if !self.types.is_subclass_of(ty, self.types.well_known.exception)
            && ty != self.types.well_known.exception
        {
            return None;
        }
        let address = object::field_address(&self.types, exception, field).ok()?;
        // SAFETY: `_message` is a reference field of every exception
        let message = unsafe { address.cast::<ObjectRef>().read() };
        string_to_rust(message)
    }

    /// Creates the exception object for an engine-detected failure and
    /// starts propagating it.
    pub fn raise(&mut self, failure: RuntimeFailure) -> VmError {
        let wk = &self.types.well_known;
        let ty = match failure {
            RuntimeFailure::NullReference => wk.null_reference_exception,
            RuntimeFailure::InvalidCast => wk.invalid_cast_exception,
            RuntimeFailure::IndexOutOfRange => wk.index_out_of_range_exception,
            RuntimeFailure::DivideByZero => wk.divide_by_zero_exception,
            RuntimeFailure::Overflow => wk.overflow_exception,
            RuntimeFailure::Arithmetic => wk.arithmetic_exception,
            RuntimeFailure::NotFiniteNumber => wk.not_finite_number_exception,
            RuntimeFailure::ArrayTypeMismatch => wk.array_type_mismatch_exception,
        };
        match self.new_exception(ty, failure.default_message()) {
            Ok(object) => self.exceptions.throw(object),
            Err(err) => err,
        }
    }

    /// Maps a failed object-model check onto a managed exception.
    pub fn check<T>(&mut self, result: Result<T, RuntimeFailure>) -> Result<T, VmError> {
        result.map_err(|failure| self.raise(failure))
    }

    pub(crate) fn new_exception(&mut self, ty: TypeId, message: &str) -> Result<ObjectRef, VmError> {
        let object = self.heap.allocate_object(&self.types, ty)?;
        let text = self.strings.get_or_add(&mut self.heap, &self.types, message)?;
        if let Some(field) = self.types.well_known.exception_message {
            // SAFETY: freshly allocated exception with a `_message` field
            unsafe {
                object
                    .data_ptr()
                    .add(self.types.field(field).offset)
                    .cast::<ObjectRef>()
                    .write(text);
            }
        }
        Ok(object)
    }

    pub fn new_string(&mut self, text: &str) -> Result<ObjectRef, VmError> {
        object::new_string(&mut self.heap, &self.types, text)
    }

    fn string_array(&mut self, values: &[String]) -> Result<ObjectRef, VmError> {
        let ty = self.types.sz_array_of(self.types.well_known.string);
        let array = self.heap.allocate_sz_array(&self.types, ty, values.len())?;
        let elements = object::elements_ptr(array).cast::<ObjectRef>();
        for (index, value) in values.iter().enumerate() {
            let string = self.new_string(value)?;
            // SAFETY: index is below the array length
            unsafe { elements.add(index).write(string) };
        }
        Ok(array)
    }

    /// The single `System.RuntimeType` object describing `ty`.
    pub fn type_object(&mut self, ty: TypeId) -> Result<ObjectRef, VmError> {
        if let Some(&object) = self.type_objects.get(&ty) {
            return Ok(object);
        }
        let wk = &self.types.well_known;
        let (runtime_type, handle) = (wk.runtime_type, wk.runtime_type_handle_field);
        let object = self.heap.allocate_object(&self.types, runtime_type)?;
        if let Some(field) = handle {
            // SAFETY: RuntimeType carries a native-int handle field
            unsafe {
                object
                    .data_ptr()
                    .add(self.types.field(field).offset)
                    .cast::<isize>()
                    .write(ty.0 as isize);
            }
        }
        self.type_objects.insert(ty, object);
        Ok(object)
    }

    /// The type a `System.RuntimeType` object describes.
    pub fn type_of_type_object(&self, object: ObjectRef) -> Option<TypeId> {
        if object.type_id()? != self.types.well_known.runtime_type {
            return None;
        }
        let field = self.types.well_known.runtime_type_handle_field?;
        let address = object::field_address(&self.types, object, field).ok()?;
        // SAFETY: native-int handle field
        let raw = unsafe { address.cast::<isize>().read() };
        Some(TypeId(raw as u32))
    }

    /// Reads a static field as a stack value.
    pub fn load_static(&mut self, field: FieldId) -> Result<StackValue, VmError> {
        let ty = self.types.field(field).ty;
        let address = self.statics.field_address(&self.types, field);
        // SAFETY: static slot of the field's type
        Ok(unsafe { read_value(&self.types, &mut self.structs, address, ty) })
    }

    /// Reports every root: statics, literals, type objects, the last thrown
    /// exception and the operands, locals and caught exceptions of each
    /// interpreter frame on the call stack.
    pub fn visit_roots(&mut self, visitor: &mut impl RootVisitor) {
        let Self {
            types,
            statics,
            structs,
            strings,
            exceptions,
            call_stack,
            type_objects,
            ..
        } = self;
        statics.visit_roots(types, visitor);
        strings.visit_roots(visitor);
        exceptions.visit_roots(visitor);
        for object in type_objects.values_mut() {
            visitor.visit_object(object);
        }
        for descriptor in &call_stack.frames {
            if let Some(mut frame) = descriptor.frame {
                // SAFETY: attached frames stay in place until detached
                unsafe { frame.as_mut() }.visit_roots(types, structs, visitor);
            }
        }
    }

    /// Mark phase over [`Runtime::visit_roots`]. Returns the number of
    /// objects reached; unmarked objects are garbage as far as the runtime
    /// knows.
    pub fn mark_reachable(&mut self) -> usize {
        self.heap.clear_marks();
        let mut visitor = MarkVisitor::new();
        self.visit_roots(&mut visitor);
        let marked = visitor.finish(&self.types);
        debug!("marked {marked} of {} objects", self.heap.object_count());
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BytecodeBuilder, CallContext, FieldAttributes, MethodAttributes, MethodSignature,
        OpCode, TypeAttributes,
    };

    fn quiet() -> RuntimeCreateInfo {
        RuntimeCreateInfo {
            echo_console: Some(false),
            stack_size: Some(64 * 1024),
            ..Default::default()
        }
    }

    #[test]
    fn entry_point_returns_exit_code() {
        let mut types = TypeRegistry::new();
        let wk = types.well_known.clone();
        let program = types.define_type("App", "Program", Some(wk.object), TypeAttributes::empty());
        let strings = types.sz_array_of(wk.string);
        let main = types.define_method(
            program,
            "Main",
            MethodAttributes::STATIC,
            MethodSignature::new(vec![strings], Some(wk.int32)),
            ImplementationKind::Interpreted,
        );
        let mut b = BytecodeBuilder::new();
        b.ldarg(0).op(OpCode::Ldlen).op(OpCode::ConvI4).ldc_i4(40).op(OpCode::Add).op(OpCode::Ret);
        types.set_body(main, b.into_body(2, vec![]));

        let mut rt = Runtime::new(types, quiet()).expect("runtime");
        let args = vec!["a".to_string(), "b".to_string()];
        assert_eq!(rt.run_entry_point(main, &args).expect("run"), 42);
        assert_eq!(rt.stack.used(), 0);
        assert_eq!(rt.call_stack.depth(), 0);
    }

    #[test]
    fn unhandled_exception_reports_type_and_trace() {
        let mut types = TypeRegistry::new();
        let wk = types.well_known.clone();
        let program = types.define_type("App", "Program", Some(wk.object), TypeAttributes::empty());
        let main = types.define_method(
            program,
            "Main",
            MethodAttributes::STATIC,
            MethodSignature::new(vec![], None),
            ImplementationKind::Interpreted,
        );
        let mut b = BytecodeBuilder::new();
        b.op(OpCode::Ldnull).op(OpCode::Ldlen).op(OpCode::Pop).op(OpCode::Ret);
        types.set_body(main, b.into_body(1, vec![]));

        let mut rt = Runtime::new(types, quiet()).expect("runtime");
        match rt.run_entry_point(main, &[]) {
            Err(VmError::Unhandled { type_name, message, trace }) => {
                assert_eq!(type_name, "System.NullReferenceException");
                assert_eq!(
                    message.as_deref(),
                    Some(RuntimeFailure::NullReference.default_message())
                );
                assert_eq!(trace, vec!["at App.Program::Main +0x0001".to_string()]);
            }
            other => panic!("expected an unhandled exception, got {other:?}"),
        }
        assert_eq!(rt.stack.used(), 0);
    }

    #[test]
    fn call_depth_is_limited() {
        let mut types = TypeRegistry::new();
        let wk = types.well_known.clone();
        let program = types.define_type("App", "Program", Some(wk.object), TypeAttributes::empty());
        let recurse = types.define_method(
            program,
            "Recurse",
            MethodAttributes::STATIC,
            MethodSignature::new(vec![], None),
            ImplementationKind::Interpreted,
        );
        let mut b = BytecodeBuilder::new();
        b.call(recurse).op(OpCode::Ret);
        types.set_body(recurse, b.into_body(1, vec![]));

        let info = RuntimeCreateInfo {
            max_call_depth: Some(16),
            ..quiet()
        };
        let mut rt = Runtime::new(types, info).expect("runtime");
        assert!(matches!(rt.call(recurse, &[]), Err(VmError::CallDepthExceeded(16))));
        assert_eq!(rt.stack.used(), 0);
        assert_eq!(rt.call_stack.depth(), 0);
    }

    #[test]
    fn marking_reaches_statics_but_not_garbage() {
        let mut types = TypeRegistry::new();
        let wk = types.well_known.clone();
        let holder = types.define_type("App", "Holder", Some(wk.object), TypeAttributes::empty());
        let field = types.define_field(holder, "Value", wk.string, FieldAttributes::STATIC);
        let mut rt = Runtime::new(types, quiet()).expect("runtime");

        let kept = rt.new_string("kept").expect("string");
        rt.new_string("garbage").expect("string");
        let address = rt.statics.field_address(&rt.types, field);
        // SAFETY: string-typed static slot
        unsafe { address.cast::<ObjectRef>().write(kept) };
        assert_eq!(rt.load_static(field).expect("load"), StackValue::Object(kept));
        assert_eq!(rt.mark_reachable(), 1);
    }

    fn count_marked(ctx: &mut CallContext<'_>) -> Result<(), VmError> {
        let marked = ctx.rt.mark_reachable();
        ctx.ret(StackValue::Int32(marked as i32))
    }

    #[test]
    fn marking_reaches_locals_and_operands_of_running_frames() {
        let mut types = TypeRegistry::new();
        let wk = types.well_known.clone();
        let program = types.define_type("App", "Program", Some(wk.object), TypeAttributes::empty());
        let collect = types.define_method(
            program,
            "Collect",
            MethodAttributes::STATIC,
            MethodSignature::new(vec![], Some(wk.int32)),
            ImplementationKind::Internal,
        );
        let main = types.define_method(
            program,
            "Main",
            MethodAttributes::STATIC,
            MethodSignature::new(vec![], Some(wk.int32)),
            ImplementationKind::Interpreted,
        );
        let ints = types.sz_array_of(wk.int32);
        let mut b = BytecodeBuilder::new();
        // one array only in a local, one only on the operand stack
        b.ldc_i4(3).typed(OpCode::Newarr, wk.int32).stloc(0);
        b.ldc_i4(1).typed(OpCode::Newarr, wk.object);
        b.call(collect).stloc(1).op(OpCode::Pop);
        b.ldloc(1).op(OpCode::Ret);
        types.set_body(main, b.into_body(2, vec![ints, wk.int32]));

        let mut rt = Runtime::new(types, quiet()).expect("runtime");
        let key = rt.types.method_key(collect);
        rt.internals.register(&key, count_marked);
        assert_eq!(rt.call(main, &[]).expect("main"), Some(StackValue::Int32(2)));
        assert_eq!(rt.mark_reachable(), 0);
    }

    #[test]
    fn type_objects_are_cached() {
        let types = TypeRegistry::new();
        let mut rt = Runtime::new(types, quiet()).expect("runtime");
        let int32 = rt.types.well_known.int32;
        let a = rt.type_object(int32).expect("type object");
        let b = rt.type_object(int32).expect("type object");
        assert_eq!(a, b);
        assert_eq!(rt.type_of_type_object(a), Some(int32));
    }
}
