//! The bytecode evaluation loop.
//!
//! One [`Interpreter`] runs one activation: it owns the [`Frame`] and
//! borrows the runtime and the caller's marshaled arguments. Calls recurse
//! through [`Runtime::invoke`], so the host stack mirrors the managed one.

mod arith;
mod convert;
mod objects;
#[cfg(test)]
mod tests;

use log::trace;

use crate::{
    ArithmeticError, Cursor, Frame, Instruction, ManagedException,
    MetadataProvider, MethodCallData, MethodId, ObjectRef, OpCode, Operand,
    PrimitiveKind, Runtime, RuntimeFailure, StackValue, StructPayload,
    Transfer, TypeId, TokenKind, VmError,
    value::{dispose, read_primitive, read_value, write_primitive, write_value},
};

use self::{
    arith::{BinaryOp, Comparison, Overflow, ShiftOp},
    convert::Check,
};

/// What the loop does after an instruction.
#[derive(Debug)]
enum Flow {
    Next,
    Jump(u32),
    Return,
    /// leave the method with an exception this frame already searched for
    Unwind(ManagedException),
}

/// Runs the interpreted body of `method` with the arguments in `data`.
pub fn execute(
    rt: &mut Runtime,
    method: MethodId,
    data: &mut MethodCallData,
) -> Result<(), VmError> {
    let frame = Frame::enter(&rt.types, &mut rt.stack, &rt.structs, method)?;
    let mut interpreter = Interpreter {
        rt,
        frame,
        args: data,
        constrained: None,
    };
    let result = interpreter.run();
    interpreter.rt.call_stack.detach();
    let Interpreter { rt, frame, .. } = interpreter;
    frame.exit(&mut rt.stack, &mut rt.structs);
    result
}

pub(crate) struct Interpreter<'rt, 'data> {
    rt: &'rt mut Runtime,
    frame: Frame,
    args: &'data mut MethodCallData,
    /// type named by a pending `constrained.` prefix
    constrained: Option<TypeId>,
}

fn is_prefix(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::Constrained
            | OpCode::Volatile
            | OpCode::Unaligned
            | OpCode::Tail
            | OpCode::Readonly
            | OpCode::No
    )
}

impl Interpreter<'_, '_> {
    fn run(&mut self) -> Result<(), VmError> {
        self.rt.call_stack.attach(&mut self.frame);
        let body = self.frame.body.clone();
        let mut cursor = Cursor::new(&body.code);
        loop {
            if cursor.is_at_end() {
                return Err(VmError::invalid(format!(
                    "{} runs past the end of its body",
                    self.rt.types.method_name(self.frame.method)
                )));
            }
            let offset = cursor.offset();
            self.rt.call_stack.set_offset(offset);
            let instruction = cursor.decode()?;
            trace!(
                "{:#06x} {} {:?} (depth {})",
                offset,
                instruction.op.name(),
                instruction.operand,
                self.frame.depth()
            );
            self.rt.stats.instructions += 1;

            let flow = match self.step(offset, &instruction) {
                Ok(flow) => flow,
                Err(VmError::Exception(exception)) => {
                    let transfer = self.frame.regions.raise(
                        &self.rt.types,
                        &body.regions,
                        exception,
                        offset,
                    );
                    self.transfer(transfer)?
                }
                Err(err) => return Err(err),
            };
            if !is_prefix(instruction.op) {
                self.constrained = None;
            }
            match flow {
                Flow::Next => {}
                Flow::Jump(target) => cursor.seek(target)?,
                Flow::Return => return Ok(()),
                Flow::Unwind(exception) => return Err(VmError::Exception(exception)),
            }
        }
    }

    /// Applies a region transition: handlers start with an empty operand
    /// stack, catch handlers with the exception on it.
    fn transfer(&mut self, transfer: Transfer) -> Result<Flow, VmError> {
        match transfer {
            Transfer::Jump { target, exception } => {
                self.frame.clear_stack(&mut self.rt.structs);
                if let Some(exception) = exception {
                    self.frame.push(StackValue::Object(exception))?;
                }
                Ok(Flow::Jump(target))
            }
            Transfer::Propagate(exception) => Ok(Flow::Unwind(exception)),
        }
    }

    #[inline]
    fn push(&mut self, value: StackValue) -> Result<(), VmError> {
        self.frame.push(value)
    }

    #[inline]
    fn pop(&mut self) -> Result<StackValue, VmError> {
        self.frame.pop()
    }

    fn pop_object(&mut self) -> Result<ObjectRef, VmError> {
        self.pop()?.as_object()
    }

    /// Pointer operand of an indirect access, null-checked.
    fn pop_address(&mut self) -> Result<*mut u8, VmError> {
        let value = self.pop()?;
        let address = match value {
            StackValue::Object(object) if !object.is_null() => object.data_ptr(),
            StackValue::Object(_) => std::ptr::null_mut(),
            other => other.as_pointer()?,
        };
        if address.is_null() {
            return Err(self.rt.raise(RuntimeFailure::NullReference));
        }
        Ok(address)
    }

    fn resolve_type(&self, instruction: &Instruction) -> Result<TypeId, VmError> {
        self.rt.types.resolve_type(instruction.token()?)
    }

    fn resolve_method(&self, instruction: &Instruction) -> Result<MethodId, VmError> {
        self.rt.types.resolve_method(instruction.token()?)
    }

    /// Maps a failed numeric helper onto a managed exception. Operands of
    /// the wrong kind are a defect of the program, not a runtime failure.
    fn numeric(
        &mut self,
        result: Result<StackValue, ArithmeticError>,
    ) -> Result<StackValue, VmError> {
        result.map_err(|err| match err {
            ArithmeticError::InvalidOperands => {
                VmError::invalid("operands of incompatible kinds")
            }
            other => self.rt.raise(other.into()),
        })
    }

    fn binary(&mut self, op: BinaryOp, overflow: Overflow) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let value = self.numeric(arith::binary(op, a, b, overflow))?;
        self.push(value)
    }

    fn shift(&mut self, op: ShiftOp) -> Result<(), VmError> {
        let amount = self.pop()?;
        let value = self.pop()?;
        let value = self.numeric(arith::shift(op, value, amount))?;
        self.push(value)
    }

    fn convert(&mut self, target: PrimitiveKind, check: Check) -> Result<(), VmError> {
        let value = self.pop()?;
        let value = self.numeric(convert::convert(value, target, check))?;
        self.push(value)
    }

    fn compare(&mut self, cmp: Comparison) -> Result<bool, VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        arith::compare(cmp, a, b)
            .map_err(|_| VmError::invalid("comparison of incompatible kinds"))
    }

    /// Conditional branch on `a cmp b`, negated for the complementary
    /// opcodes (`bge` is "not less than, unordered counts as less").
    fn branch_if(
        &mut self,
        cmp: Comparison,
        negate: bool,
        instruction: &Instruction,
    ) -> Result<Flow, VmError> {
        let taken = self.compare(cmp)? != negate;
        Ok(if taken {
            Flow::Jump(instruction.target()?)
        } else {
            Flow::Next
        })
    }

    fn load_argument(&mut self, index: usize) -> Result<(), VmError> {
        let value = self
            .args
            .get_argument(&self.rt.types, &mut self.rt.structs, index)?;
        self.push(value)
    }

    fn store_argument(&mut self, index: usize) -> Result<(), VmError> {
        let value = self.pop()?;
        let stored = self
            .args
            .set_argument(&self.rt.types, &self.rt.structs, index, value);
        dispose(&mut self.rt.structs, value);
        stored
    }

    fn load_local(&mut self, index: usize) -> Result<(), VmError> {
        let ty = self.frame.local_type(index)?;
        let ptr = self.frame.local_ptr(index)?;
        // SAFETY: the local's storage holds a value of its declared type
        let value = unsafe { read_value(&self.rt.types, &mut self.rt.structs, ptr, ty) };
        self.push(value)
    }

    fn store_local(&mut self, index: usize) -> Result<(), VmError> {
        let ty = self.frame.local_type(index)?;
        let ptr = self.frame.local_ptr(index)?;
        let value = self.pop()?;
        // SAFETY: as above
        let stored = unsafe { write_value(&self.rt.types, &self.rt.structs, ptr, ty, value) };
        dispose(&mut self.rt.structs, value);
        stored
    }

    fn load_indirect(&mut self, kind: Option<PrimitiveKind>) -> Result<(), VmError> {
        let address = self.pop_address()?;
        // SAFETY: the program supplies an address of a value of this kind
        let value = unsafe {
            match kind {
                Some(kind) => read_primitive(address, kind),
                None => StackValue::Object(address.cast::<ObjectRef>().read_unaligned()),
            }
        };
        self.push(value)
    }

    fn store_indirect(&mut self, kind: Option<PrimitiveKind>) -> Result<(), VmError> {
        let value = self.pop()?;
        let address = self.pop_address()?;
        // SAFETY: as above
        unsafe {
            match kind {
                Some(kind) => write_primitive(address, kind, value),
                None => {
                    address.cast::<ObjectRef>().write_unaligned(value.as_object()?);
                    Ok(())
                }
            }
        }
    }

    fn duplicate(&mut self) -> Result<(), VmError> {
        let value = match self.frame.peek(0)? {
            StackValue::ValueType(ty, StructPayload::Large(slot)) => {
                StackValue::ValueType(ty, StructPayload::Large(self.rt.structs.duplicate(slot)))
            }
            other => other,
        };
        self.push(value)
    }

    fn switch(&mut self, instruction: &Instruction) -> Result<Flow, VmError> {
        let Operand::Switch(targets) = &instruction.operand else {
            return Err(VmError::invalid("switch without a jump table"));
        };
        let index = self.pop()?.as_i32()?;
        // out-of-range indices fall through
        Ok(match usize::try_from(index).ok().and_then(|i| targets.get(i)) {
            Some(&target) => Flow::Jump(target),
            None => Flow::Next,
        })
    }

    fn ret(&mut self) -> Result<Flow, VmError> {
        if self.args.return_type().is_some() {
            let value = self.pop()?;
            let stored = self.args.set_return(&self.rt.types, &self.rt.structs, value);
            dispose(&mut self.rt.structs, value);
            stored?;
        }
        if self.frame.depth() != 0 {
            return Err(VmError::invalid(format!(
                "{} returns with {} values left on the stack",
                self.rt.types.method_name(self.frame.method),
                self.frame.depth()
            )));
        }
        Ok(Flow::Return)
    }

    fn throw(&mut self) -> Result<Flow, VmError> {
        let object = self.pop_object()?;
        if object.is_null() {
            return Err(self.rt.raise(RuntimeFailure::NullReference));
        }
        Err(self.rt.exceptions.throw(object))
    }

    fn rethrow(&mut self) -> Result<Flow, VmError> {
        match self.frame.regions.current_exception() {
            Some(object) => Err(self.rt.exceptions.throw(object)),
            None => Err(VmError::invalid("rethrow outside of a catch handler")),
        }
    }

    fn leave(&mut self, offset: u32, instruction: &Instruction) -> Result<Flow, VmError> {
        let target = instruction.target()?;
        self.frame.clear_stack(&mut self.rt.structs);
        let body = self.frame.body.clone();
        Ok(Flow::Jump(self.frame.regions.leave(&body.regions, offset, target)))
    }

    fn end_finally(&mut self) -> Result<Flow, VmError> {
        let body = self.frame.body.clone();
        let transfer = self.frame.regions.end_finally(&self.rt.types, &body.regions)?;
        self.transfer(transfer)
    }

    fn check_finite(&mut self) -> Result<(), VmError> {
        let value = self.pop()?;
        let value = self.numeric(convert::check_finite(value))?;
        self.push(value)
    }

    /// `ldtoken` of a type pushes its `RuntimeTypeHandle`.
    fn load_token(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        let token = instruction.token()?;
        if token.kind() != TokenKind::Type {
            return Err(VmError::Unimplemented("ldtoken of a member"));
        }
        let ty = self.rt.types.resolve_type(token)?;
        let handle = self.rt.types.well_known.runtime_type_handle;
        self.push(StackValue::ValueType(handle, StructPayload::Inline(ty.0 as u64)))
    }

    fn load_function(&mut self, instruction: &Instruction, virtual_: bool) -> Result<(), VmError> {
        let mut method = self.resolve_method(instruction)?;
        if virtual_ {
            let object = self.pop_object()?;
            let Some(ty) = object.type_id() else {
                return Err(self.rt.raise(RuntimeFailure::NullReference));
            };
            if self.rt.types.method(method).is_virtual() {
                method = crate::object::resolve_virtual(&self.rt.types, method, ty)?;
            }
        }
        self.push(StackValue::NativeInt(method.0 as isize))
    }

    fn local_alloc(&mut self) -> Result<(), VmError> {
        let size = self.block_size("localloc")?;
        let block = self.frame.localloc(&mut self.rt.stack, size)?;
        self.push(StackValue::NativeInt(block as isize))
    }

    fn block_size(&mut self, op: &str) -> Result<usize, VmError> {
        let size = self.pop()?.as_native()?;
        usize::try_from(size).map_err(|_| VmError::invalid(format!("negative {op} size")))
    }

    fn copy_block(&mut self) -> Result<(), VmError> {
        let size = self.block_size("cpblk")?;
        let source = self.pop_address()?;
        let destination = self.pop_address()?;
        // SAFETY: the program vouches for both blocks; they may overlap
        unsafe { std::ptr::copy(source, destination, size) };
        Ok(())
    }

    fn init_block(&mut self) -> Result<(), VmError> {
        let size = self.block_size("initblk")?;
        let value = self.pop()?.as_i32()? as u8;
        let destination = self.pop_address()?;
        // SAFETY: the program vouches for the block
        unsafe { destination.write_bytes(value, size) };
        Ok(())
    }

    fn step(&mut self, offset: u32, instruction: &Instruction) -> Result<Flow, VmError> {
        use OpCode::*;

        let immediate = |instruction: &Instruction| match instruction.operand {
            Operand::Int32(v) => Ok(v),
            _ => Err(VmError::invalid("missing immediate operand")),
        };

        match instruction.op {
            Nop | Break | Volatile | Unaligned | Tail | Readonly | No => {}
            Constrained => self.constrained = Some(self.resolve_type(instruction)?),

            Ldarg0 => self.load_argument(0)?,
            Ldarg1 => self.load_argument(1)?,
            Ldarg2 => self.load_argument(2)?,
            Ldarg3 => self.load_argument(3)?,
            LdargS | Ldarg => self.load_argument(instruction.var()? as usize)?,
            LdargaS | Ldarga => {
                let address = self.args.argument_address(instruction.var()? as usize)?;
                self.push(StackValue::ByRef(address))?;
            }
            StargS | Starg => self.store_argument(instruction.var()? as usize)?,
            Ldloc0 => self.load_local(0)?,
            Ldloc1 => self.load_local(1)?,
            Ldloc2 => self.load_local(2)?,
            Ldloc3 => self.load_local(3)?,
            LdlocS | Ldloc => self.load_local(instruction.var()? as usize)?,
            LdlocaS | Ldloca => {
                let address = self.frame.local_ptr(instruction.var()? as usize)?;
                self.push(StackValue::ByRef(address))?;
            }
            Stloc0 => self.store_local(0)?,
            Stloc1 => self.store_local(1)?,
            Stloc2 => self.store_local(2)?,
            Stloc3 => self.store_local(3)?,
            StlocS | Stloc => self.store_local(instruction.var()? as usize)?,

            Ldnull => self.push(StackValue::NULL)?,
            LdcI4M1 => self.push(StackValue::Int32(-1))?,
            LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47
            | LdcI48 => {
                let value = instruction.op.code() as i32 - LdcI40.code() as i32;
                self.push(StackValue::Int32(value))?;
            }
            LdcI4S | LdcI4 => self.push(StackValue::Int32(immediate(instruction)?))?,
            LdcI8 => match instruction.operand {
                Operand::Int64(v) => self.push(StackValue::Int64(v))?,
                _ => return Err(VmError::invalid("ldc.i8 without operand")),
            },
            LdcR4 | LdcR8 => match instruction.operand {
                Operand::Float(v) => self.push(StackValue::Double(v))?,
                _ => return Err(VmError::invalid("ldc.r without operand")),
            },
            Dup => self.duplicate()?,
            Pop => {
                let value = self.pop()?;
                dispose(&mut self.rt.structs, value);
            }

            Call => {
                let method = self.resolve_method(instruction)?;
                self.call(method)?;
            }
            Callvirt => {
                let method = self.resolve_method(instruction)?;
                let constrained = self.constrained.take();
                self.call_virtual(method, constrained)?;
            }
            Calli => self.call_indirect()?,
            Ret => return self.ret(),

            Br | BrS => return Ok(Flow::Jump(instruction.target()?)),
            Brfalse | BrfalseS | Brtrue | BrtrueS => {
                let truthy = self.pop()?.is_true()?;
                let on_true = matches!(instruction.op, Brtrue | BrtrueS);
                if truthy == on_true {
                    return Ok(Flow::Jump(instruction.target()?));
                }
            }
            Beq | BeqS => return self.branch_if(Comparison::Eq, false, instruction),
            Bge | BgeS => return self.branch_if(Comparison::LtUn, true, instruction),
            Bgt | BgtS => return self.branch_if(Comparison::Gt, false, instruction),
            Ble | BleS => return self.branch_if(Comparison::GtUn, true, instruction),
            Blt | BltS => return self.branch_if(Comparison::Lt, false, instruction),
            BneUn | BneUnS => return self.branch_if(Comparison::Eq, true, instruction),
            BgeUn | BgeUnS => return self.branch_if(Comparison::Lt, true, instruction),
            BgtUn | BgtUnS => return self.branch_if(Comparison::GtUn, false, instruction),
            BleUn | BleUnS => return self.branch_if(Comparison::Gt, true, instruction),
            BltUn | BltUnS => return self.branch_if(Comparison::LtUn, false, instruction),
            Switch => return self.switch(instruction),

            LdindI1 => self.load_indirect(Some(PrimitiveKind::I1))?,
            LdindU1 => self.load_indirect(Some(PrimitiveKind::U1))?,
            LdindI2 => self.load_indirect(Some(PrimitiveKind::I2))?,
            LdindU2 => self.load_indirect(Some(PrimitiveKind::U2))?,
            LdindI4 => self.load_indirect(Some(PrimitiveKind::I4))?,
            LdindU4 => self.load_indirect(Some(PrimitiveKind::U4))?,
            LdindI8 => self.load_indirect(Some(PrimitiveKind::I8))?,
            LdindI => self.load_indirect(Some(PrimitiveKind::I))?,
            LdindR4 => self.load_indirect(Some(PrimitiveKind::R4))?,
            LdindR8 => self.load_indirect(Some(PrimitiveKind::R8))?,
            LdindRef => self.load_indirect(None)?,
            StindRef => self.store_indirect(None)?,
            StindI1 => self.store_indirect(Some(PrimitiveKind::I1))?,
            StindI2 => self.store_indirect(Some(PrimitiveKind::I2))?,
            StindI4 => self.store_indirect(Some(PrimitiveKind::I4))?,
            StindI8 => self.store_indirect(Some(PrimitiveKind::I8))?,
            StindR4 => self.store_indirect(Some(PrimitiveKind::R4))?,
            StindR8 => self.store_indirect(Some(PrimitiveKind::R8))?,
            StindI => self.store_indirect(Some(PrimitiveKind::I))?,

            Add => self.binary(BinaryOp::Add, Overflow::Wrap)?,
            Sub => self.binary(BinaryOp::Sub, Overflow::Wrap)?,
            Mul => self.binary(BinaryOp::Mul, Overflow::Wrap)?,
            Div => self.binary(BinaryOp::Div, Overflow::Wrap)?,
            DivUn => self.binary(BinaryOp::DivUn, Overflow::Wrap)?,
            Rem => self.binary(BinaryOp::Rem, Overflow::Wrap)?,
            RemUn => self.binary(BinaryOp::RemUn, Overflow::Wrap)?,
            And => self.binary(BinaryOp::And, Overflow::Wrap)?,
            Or => self.binary(BinaryOp::Or, Overflow::Wrap)?,
            Xor => self.binary(BinaryOp::Xor, Overflow::Wrap)?,
            AddOvf => self.binary(BinaryOp::Add, Overflow::Signed)?,
            AddOvfUn => self.binary(BinaryOp::Add, Overflow::Unsigned)?,
            SubOvf => self.binary(BinaryOp::Sub, Overflow::Signed)?,
            SubOvfUn => self.binary(BinaryOp::Sub, Overflow::Unsigned)?,
            MulOvf => self.binary(BinaryOp::Mul, Overflow::Signed)?,
            MulOvfUn => self.binary(BinaryOp::Mul, Overflow::Unsigned)?,
            Shl => self.shift(ShiftOp::Shl)?,
            Shr => self.shift(ShiftOp::Shr)?,
            ShrUn => self.shift(ShiftOp::ShrUn)?,
            Neg => {
                let value = self.pop()?;
                let value = self.numeric(arith::negate(value))?;
                self.push(value)?;
            }
            Not => {
                let value = self.pop()?;
                let value = self.numeric(arith::not(value))?;
                self.push(value)?;
            }

            ConvI1 => self.convert(PrimitiveKind::I1, Check::Unchecked)?,
            ConvI2 => self.convert(PrimitiveKind::I2, Check::Unchecked)?,
            ConvI4 => self.convert(PrimitiveKind::I4, Check::Unchecked)?,
            ConvI8 => self.convert(PrimitiveKind::I8, Check::Unchecked)?,
            ConvR4 => self.convert(PrimitiveKind::R4, Check::Unchecked)?,
            ConvR8 => self.convert(PrimitiveKind::R8, Check::Unchecked)?,
            ConvU1 => self.convert(PrimitiveKind::U1, Check::Unchecked)?,
            ConvU2 => self.convert(PrimitiveKind::U2, Check::Unchecked)?,
            ConvU4 => self.convert(PrimitiveKind::U4, Check::Unchecked)?,
            ConvU8 => self.convert(PrimitiveKind::U8, Check::Unchecked)?,
            ConvI => self.convert(PrimitiveKind::I, Check::Unchecked)?,
            ConvU => self.convert(PrimitiveKind::U, Check::Unchecked)?,
            ConvRUn => {
                let value = self.pop()?;
                let value = self.numeric(convert::to_float_unsigned(value))?;
                self.push(value)?;
            }
            ConvOvfI1 => self.convert(PrimitiveKind::I1, Check::Checked)?,
            ConvOvfU1 => self.convert(PrimitiveKind::U1, Check::Checked)?,
            ConvOvfI2 => self.convert(PrimitiveKind::I2, Check::Checked)?,
            ConvOvfU2 => self.convert(PrimitiveKind::U2, Check::Checked)?,
            ConvOvfI4 => self.convert(PrimitiveKind::I4, Check::Checked)?,
            ConvOvfU4 => self.convert(PrimitiveKind::U4, Check::Checked)?,
            ConvOvfI8 => self.convert(PrimitiveKind::I8, Check::Checked)?,
            ConvOvfU8 => self.convert(PrimitiveKind::U8, Check::Checked)?,
            ConvOvfI => self.convert(PrimitiveKind::I, Check::Checked)?,
            ConvOvfU => self.convert(PrimitiveKind::U, Check::Checked)?,
            ConvOvfI1Un => self.convert(PrimitiveKind::I1, Check::CheckedUnsigned)?,
            ConvOvfI2Un => self.convert(PrimitiveKind::I2, Check::CheckedUnsigned)?,
            ConvOvfI4Un => self.convert(PrimitiveKind::I4, Check::CheckedUnsigned)?,
            ConvOvfI8Un => self.convert(PrimitiveKind::I8, Check::CheckedUnsigned)?,
            ConvOvfU1Un => self.convert(PrimitiveKind::U1, Check::CheckedUnsigned)?,
            ConvOvfU2Un => self.convert(PrimitiveKind::U2, Check::CheckedUnsigned)?,
            ConvOvfU4Un => self.convert(PrimitiveKind::U4, Check::CheckedUnsigned)?,
            ConvOvfU8Un => self.convert(PrimitiveKind::U8, Check::CheckedUnsigned)?,
            ConvOvfIUn => self.convert(PrimitiveKind::I, Check::CheckedUnsigned)?,
            ConvOvfUUn => self.convert(PrimitiveKind::U, Check::CheckedUnsigned)?,
            Ckfinite => self.check_finite()?,

            Ceq => {
                let result = self.compare(Comparison::Eq)?;
                self.push(StackValue::from_bool(result))?;
            }
            Cgt => {
                let result = self.compare(Comparison::Gt)?;
                self.push(StackValue::from_bool(result))?;
            }
            CgtUn => {
                let result = self.compare(Comparison::GtUn)?;
                self.push(StackValue::from_bool(result))?;
            }
            Clt => {
                let result = self.compare(Comparison::Lt)?;
                self.push(StackValue::from_bool(result))?;
            }
            CltUn => {
                let result = self.compare(Comparison::LtUn)?;
                self.push(StackValue::from_bool(result))?;
            }

            Ldstr => {
                let text = self.rt.types.resolve_string(instruction.token()?)?;
                let string = self
                    .rt
                    .strings
                    .get_or_add(&mut self.rt.heap, &self.rt.types, text)?;
                self.push(StackValue::Object(string))?;
            }
            Ldtoken => self.load_token(instruction)?,
            Ldftn => self.load_function(instruction, false)?,
            Ldvirtftn => self.load_function(instruction, true)?,

            Newobj => {
                let ctor = self.resolve_method(instruction)?;
                self.new_object(ctor)?;
            }
            Ldfld => self.load_field(instruction)?,
            Ldflda => self.load_field_address(instruction)?,
            Stfld => self.store_field(instruction)?,
            Ldsfld => self.load_static_field(instruction)?,
            Ldsflda => self.load_static_field_address(instruction)?,
            Stsfld => self.store_static_field(instruction)?,
            Ldobj => self.load_object(instruction)?,
            Stobj => self.store_object(instruction)?,
            Cpobj => self.copy_object(instruction)?,
            Initobj => self.init_object(instruction)?,
            Sizeof => {
                let ty = self.resolve_type(instruction)?;
                let size = self.rt.types.value_size(ty);
                self.push(StackValue::Int32(size as i32))?;
            }
            Box => self.box_value(instruction)?,
            Unbox => self.unbox(instruction)?,
            UnboxAny => self.unbox_any(instruction)?,
            Castclass => self.cast(instruction, true)?,
            Isinst => self.cast(instruction, false)?,

            Newarr => self.new_array(instruction)?,
            Ldlen => self.array_length()?,
            Ldelema => self.load_element_address(instruction)?,
            LdelemI1 => self.load_element(Some(PrimitiveKind::I1))?,
            LdelemU1 => self.load_element(Some(PrimitiveKind::U1))?,
            LdelemI2 => self.load_element(Some(PrimitiveKind::I2))?,
            LdelemU2 => self.load_element(Some(PrimitiveKind::U2))?,
            LdelemI4 => self.load_element(Some(PrimitiveKind::I4))?,
            LdelemU4 => self.load_element(Some(PrimitiveKind::U4))?,
            LdelemI8 => self.load_element(Some(PrimitiveKind::I8))?,
            LdelemI => self.load_element(Some(PrimitiveKind::I))?,
            LdelemR4 => self.load_element(Some(PrimitiveKind::R4))?,
            LdelemR8 => self.load_element(Some(PrimitiveKind::R8))?,
            LdelemRef => self.load_element(None)?,
            Ldelem => self.load_element_typed(instruction)?,
            StelemI => self.store_element(Some(PrimitiveKind::I))?,
            StelemI1 => self.store_element(Some(PrimitiveKind::I1))?,
            StelemI2 => self.store_element(Some(PrimitiveKind::I2))?,
            StelemI4 => self.store_element(Some(PrimitiveKind::I4))?,
            StelemI8 => self.store_element(Some(PrimitiveKind::I8))?,
            StelemR4 => self.store_element(Some(PrimitiveKind::R4))?,
            StelemR8 => self.store_element(Some(PrimitiveKind::R8))?,
            StelemRef => self.store_element(None)?,
            Stelem => self.store_element_typed(instruction)?,

            Throw => return self.throw(),
            Rethrow => return self.rethrow(),
            Leave | LeaveS => return self.leave(offset, instruction),
            Endfinally => return self.end_finally(),

            Localloc => self.local_alloc()?,
            Cpblk => self.copy_block()?,
            Initblk => self.init_block()?,

            Jmp => return Err(VmError::Unimplemented("jmp")),
            Arglist => return Err(VmError::Unimplemented("arglist")),
            Mkrefany => return Err(VmError::Unimplemented("mkrefany")),
            Refanyval => return Err(VmError::Unimplemented("refanyval")),
            Refanytype => return Err(VmError::Unimplemented("refanytype")),
            Endfilter => return Err(VmError::Unimplemented("endfilter")),
        }
        Ok(Flow::Next)
    }
}
