//! An execution engine for CLI bytecode: typed evaluation stacks over a
//! bump allocator, a region-based exception engine, value types with a
//! side-stack for large structs, and an object model over a managed heap.

mod builder;
mod calldata;
mod config;
mod corlib;
mod engine;
mod error;
mod exceptions;
mod frame;
mod heap;
mod internal;
mod interning;
mod interpreter;
mod layout;
mod metadata;
mod opcode;
mod runtime_methods;
mod stack;
mod types;

pub mod object;
pub mod samples;
pub mod value;
pub mod visitor;

pub use builder::{BytecodeBuilder, Label};
pub use calldata::{ArgumentLayout, ArgumentSlot, CallConvention, MethodCallData};
pub use config::{RuntimeCreateInfo, RuntimeSettings};
pub use engine::{
    CallStack, ConsoleOutput, ExecutionStats, FrameDescriptor, Runtime, StaticStorage,
};
pub use error::{ArithmeticError, RuntimeFailure, VmError};
pub use exceptions::{
    ExceptionEngine, ManagedException, RegionPhase, RegionState, TraceFrame, Transfer,
};
pub use frame::Frame;
pub use heap::{Allocator, Heap, ObjectRef};
pub use internal::{CallContext, InternalCall, InternalCalls, InternalFunction};
pub use interning::InternedStrings;
pub use metadata::{MetadataProvider, Token, TokenKind, TypeRegistry, WellKnownTypes};
pub use opcode::{Cursor, Instruction, OpCode, Operand, OperandKind};
pub use stack::{LargeSlot, StackAllocator, StackReservation, StructStack};
pub use types::{
    Constant, ExceptionRegion, FieldAttributes, FieldDescription, FieldId, FrameLayout,
    ImplementationKind, MethodAttributes, MethodBody, MethodDescription, MethodId,
    MethodSignature, PrimitiveKind, RegionKind, TypeAttributes, TypeCategory,
    TypeDescription, TypeId, TypeShape, TypeTraits,
};
pub use value::{RuntimeType, StackItemKind, StackValue, StructPayload};
pub use visitor::{MarkVisitor, RootVisitor};
