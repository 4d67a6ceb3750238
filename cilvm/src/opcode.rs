use crate::{Token, VmError};

/// Inline operand encoding following an opcode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// signed 8-bit immediate (`ldc.i4.s`)
    ShortInt,
    /// unsigned 8-bit immediate (`unaligned.`, `no.`)
    Byte,
    Int,
    Long,
    ShortFloat,
    Float,
    ShortVar,
    Var,
    ShortBranch,
    Branch,
    Switch,
    Token,
}

macro_rules! opcodes {
    ($($variant:ident = $code:literal, $name:literal, $operand:ident;)*) => {
        /// Every CIL opcode. Two-byte opcodes carry their `0xFE` prefix in
        /// the high byte of the discriminant.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum OpCode {
            $($variant = $code,)*
        }

        impl OpCode {
            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            pub fn operand(self) -> OperandKind {
                match self {
                    $(Self::$variant => OperandKind::$operand,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", None;
    Break = 0x01, "break", None;
    Ldarg0 = 0x02, "ldarg.0", None;
    Ldarg1 = 0x03, "ldarg.1", None;
    Ldarg2 = 0x04, "ldarg.2", None;
    Ldarg3 = 0x05, "ldarg.3", None;
    Ldloc0 = 0x06, "ldloc.0", None;
    Ldloc1 = 0x07, "ldloc.1", None;
    Ldloc2 = 0x08, "ldloc.2", None;
    Ldloc3 = 0x09, "ldloc.3", None;
    Stloc0 = 0x0A, "stloc.0", None;
    Stloc1 = 0x0B, "stloc.1", None;
    Stloc2 = 0x0C, "stloc.2", None;
    Stloc3 = 0x0D, "stloc.3", None;
    LdargS = 0x0E, "ldarg.s", ShortVar;
    LdargaS = 0x0F, "ldarga.s", ShortVar;
    StargS = 0x10, "starg.s", ShortVar;
    LdlocS = 0x11, "ldloc.s", ShortVar;
    LdlocaS = 0x12, "ldloca.s", ShortVar;
    StlocS = 0x13, "stloc.s", ShortVar;
    Ldnull = 0x14, "ldnull", None;
    LdcI4M1 = 0x15, "ldc.i4.m1", None;
    LdcI40 = 0x16, "ldc.i4.0", None;
    LdcI41 = 0x17, "ldc.i4.1", None;
    LdcI42 = 0x18, "ldc.i4.2", None;
    LdcI43 = 0x19, "ldc.i4.3", None;
    LdcI44 = 0x1A, "ldc.i4.4", None;
    LdcI45 = 0x1B, "ldc.i4.5", None;
    LdcI46 = 0x1C, "ldc.i4.6", None;
    LdcI47 = 0x1D, "ldc.i4.7", None;
    LdcI48 = 0x1E, "ldc.i4.8", None;
    LdcI4S = 0x1F, "ldc.i4.s", ShortInt;
    LdcI4 = 0x20, "ldc.i4", Int;
    LdcI8 = 0x21, "ldc.i8", Long;
    LdcR4 = 0x22, "ldc.r4", ShortFloat;
    LdcR8 = 0x23, "ldc.r8", Float;
    Dup = 0x25, "dup", None;
    Pop = 0x26, "pop", None;
    Jmp = 0x27, "jmp", Token;
    Call = 0x28, "call", Token;
    Calli = 0x29, "calli", Token;
    Ret = 0x2A, "ret", None;
    BrS = 0x2B, "br.s", ShortBranch;
    BrfalseS = 0x2C, "brfalse.s", ShortBranch;
    BrtrueS = 0x2D, "brtrue.s", ShortBranch;
    BeqS = 0x2E, "beq.s", ShortBranch;
    BgeS = 0x2F, "bge.s", ShortBranch;
    BgtS = 0x30, "bgt.s", ShortBranch;
    BleS = 0x31, "ble.s", ShortBranch;
    BltS = 0x32, "blt.s", ShortBranch;
    BneUnS = 0x33, "bne.un.s", ShortBranch;
    BgeUnS = 0x34, "bge.un.s", ShortBranch;
    BgtUnS = 0x35, "bgt.un.s", ShortBranch;
    BleUnS = 0x36, "ble.un.s", ShortBranch;
    BltUnS = 0x37, "blt.un.s", ShortBranch;
    Br = 0x38, "br", Branch;
    Brfalse = 0x39, "brfalse", Branch;
    Brtrue = 0x3A, "brtrue", Branch;
    Beq = 0x3B, "beq", Branch;
    Bge = 0x3C, "bge", Branch;
    Bgt = 0x3D, "bgt", Branch;
    Ble = 0x3E, "ble", Branch;
    Blt = 0x3F, "blt", Branch;
    BneUn = 0x40, "bne.un", Branch;
    BgeUn = 0x41, "bge.un", Branch;
    BgtUn = 0x42, "bgt.un", Branch;
    BleUn = 0x43, "ble.un", Branch;
    BltUn = 0x44, "blt.un", Branch;
    Switch = 0x45, "switch", Switch;
    LdindI1 = 0x46, "ldind.i1", None;
    LdindU1 = 0x47, "ldind.u1", None;
    LdindI2 = 0x48, "ldind.i2", None;
    LdindU2 = 0x49, "ldind.u2", None;
    LdindI4 = 0x4A, "ldind.i4", None;
    LdindU4 = 0x4B, "ldind.u4", None;
    LdindI8 = 0x4C, "ldind.i8", None;
    LdindI = 0x4D, "ldind.i", None;
    LdindR4 = 0x4E, "ldind.r4", None;
    LdindR8 = 0x4F, "ldind.r8", None;
    LdindRef = 0x50, "ldind.ref", None;
    StindRef = 0x51, "stind.ref", None;
    StindI1 = 0x52, "stind.i1", None;
    StindI2 = 0x53, "stind.i2", None;
    StindI4 = 0x54, "stind.i4", None;
    StindI8 = 0x55, "stind.i8", None;
    StindR4 = 0x56, "stind.r4", None;
    StindR8 = 0x57, "stind.r8", None;
    Add = 0x58, "add", None;
    Sub = 0x59, "sub", None;
    Mul = 0x5A, "mul", None;
    Div = 0x5B, "div", None;
    DivUn = 0x5C, "div.un", None;
    Rem = 0x5D, "rem", None;
    RemUn = 0x5E, "rem.un", None;
    And = 0x5F, "and", None;
    Or = 0x60, "or", None;
    Xor = 0x61, "xor", None;
    Shl = 0x62, "shl", None;
    Shr = 0x63, "shr", None;
    ShrUn = 0x64, "shr.un", None;
    Neg = 0x65, "neg", None;
    Not = 0x66, "not", None;
    ConvI1 = 0x67, "conv.i1", None;
    ConvI2 = 0x68, "conv.i2", None;
    ConvI4 = 0x69, "conv.i4", None;
    ConvI8 = 0x6A, "conv.i8", None;
    ConvR4 = 0x6B, "conv.r4", None;
    ConvR8 = 0x6C, "conv.r8", None;
    ConvU4 = 0x6D, "conv.u4", None;
    ConvU8 = 0x6E, "conv.u8", None;
    Callvirt = 0x6F, "callvirt", Token;
    Cpobj = 0x70, "cpobj", Token;
    Ldobj = 0x71, "ldobj", Token;
    Ldstr = 0x72, "ldstr", Token;
    Newobj = 0x73, "newobj", Token;
    Castclass = 0x74, "castclass", Token;
    Isinst = 0x75, "isinst", Token;
    ConvRUn = 0x76, "conv.r.un", None;
    Unbox = 0x79, "unbox", Token;
    Throw = 0x7A, "throw", None;
    Ldfld = 0x7B, "ldfld", Token;
    Ldflda = 0x7C, "ldflda", Token;
    Stfld = 0x7D, "stfld", Token;
    Ldsfld = 0x7E, "ldsfld", Token;
    Ldsflda = 0x7F, "ldsflda", Token;
    Stsfld = 0x80, "stsfld", Token;
    Stobj = 0x81, "stobj", Token;
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", None;
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", None;
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", None;
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", None;
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", None;
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", None;
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", None;
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", None;
    ConvOvfIUn = 0x8A, "conv.ovf.i.un", None;
    ConvOvfUUn = 0x8B, "conv.ovf.u.un", None;
    Box = 0x8C, "box", Token;
    Newarr = 0x8D, "newarr", Token;
    Ldlen = 0x8E, "ldlen", None;
    Ldelema = 0x8F, "ldelema", Token;
    LdelemI1 = 0x90, "ldelem.i1", None;
    LdelemU1 = 0x91, "ldelem.u1", None;
    LdelemI2 = 0x92, "ldelem.i2", None;
    LdelemU2 = 0x93, "ldelem.u2", None;
    LdelemI4 = 0x94, "ldelem.i4", None;
    LdelemU4 = 0x95, "ldelem.u4", None;
    LdelemI8 = 0x96, "ldelem.i8", None;
    LdelemI = 0x97, "ldelem.i", None;
    LdelemR4 = 0x98, "ldelem.r4", None;
    LdelemR8 = 0x99, "ldelem.r8", None;
    LdelemRef = 0x9A, "ldelem.ref", None;
    StelemI = 0x9B, "stelem.i", None;
    StelemI1 = 0x9C, "stelem.i1", None;
    StelemI2 = 0x9D, "stelem.i2", None;
    StelemI4 = 0x9E, "stelem.i4", None;
    StelemI8 = 0x9F, "stelem.i8", None;
    StelemR4 = 0xA0, "stelem.r4", None;
    StelemR8 = 0xA1, "stelem.r8", None;
    StelemRef = 0xA2, "stelem.ref", None;
    Ldelem = 0xA3, "ldelem", Token;
    Stelem = 0xA4, "stelem", Token;
    UnboxAny = 0xA5, "unbox.any", Token;
    ConvOvfI1 = 0xB3, "conv.ovf.i1", None;
    ConvOvfU1 = 0xB4, "conv.ovf.u1", None;
    ConvOvfI2 = 0xB5, "conv.ovf.i2", None;
    ConvOvfU2 = 0xB6, "conv.ovf.u2", None;
    ConvOvfI4 = 0xB7, "conv.ovf.i4", None;
    ConvOvfU4 = 0xB8, "conv.ovf.u4", None;
    ConvOvfI8 = 0xB9, "conv.ovf.i8", None;
    ConvOvfU8 = 0xBA, "conv.ovf.u8", None;
    Refanyval = 0xC2, "refanyval", Token;
    Ckfinite = 0xC3, "ckfinite", None;
    Mkrefany = 0xC6, "mkrefany", Token;
    Ldtoken = 0xD0, "ldtoken", Token;
    ConvU2 = 0xD1, "conv.u2", None;
    ConvU1 = 0xD2, "conv.u1", None;
    ConvI = 0xD3, "conv.i", None;
    ConvOvfI = 0xD4, "conv.ovf.i", None;
    ConvOvfU = 0xD5, "conv.ovf.u", None;
    AddOvf = 0xD6, "add.ovf", None;
    AddOvfUn = 0xD7, "add.ovf.un", None;
    MulOvf = 0xD8, "mul.ovf", None;
    MulOvfUn = 0xD9, "mul.ovf.un", None;
    SubOvf = 0xDA, "sub.ovf", None;
    SubOvfUn = 0xDB, "sub.ovf.un", None;
    Endfinally = 0xDC, "endfinally", None;
    Leave = 0xDD, "leave", Branch;
    LeaveS = 0xDE, "leave.s", ShortBranch;
    StindI = 0xDF, "stind.i", None;
    ConvU = 0xE0, "conv.u", None;
    Arglist = 0xFE00, "arglist", None;
    Ceq = 0xFE01, "ceq", None;
    Cgt = 0xFE02, "cgt", None;
    CgtUn = 0xFE03, "cgt.un", None;
    Clt = 0xFE04, "clt", None;
    CltUn = 0xFE05, "clt.un", None;
    Ldftn = 0xFE06, "ldftn", Token;
    Ldvirtftn = 0xFE07, "ldvirtftn", Token;
    Ldarg = 0xFE09, "ldarg", Var;
    Ldarga = 0xFE0A, "ldarga", Var;
    Starg = 0xFE0B, "starg", Var;
    Ldloc = 0xFE0C, "ldloc", Var;
    Ldloca = 0xFE0D, "ldloca", Var;
    Stloc = 0xFE0E, "stloc", Var;
    Localloc = 0xFE0F, "localloc", None;
    Endfilter = 0xFE11, "endfilter", None;
    Unaligned = 0xFE12, "unaligned.", Byte;
    Volatile = 0xFE13, "volatile.", None;
    Tail = 0xFE14, "tail.", None;
    Initobj = 0xFE15, "initobj", Token;
    Constrained = 0xFE16, "constrained.", Token;
    Cpblk = 0xFE17, "cpblk", None;
    Initblk = 0xFE18, "initblk", None;
    No = 0xFE19, "no.", Byte;
    Rethrow = 0xFE1A, "rethrow", None;
    Sizeof = 0xFE1C, "sizeof", Token;
    Refanytype = 0xFE1D, "refanytype", None;
    Readonly = 0xFE1E, "readonly.", None;
}

impl OpCode {
    pub const PREFIX: u8 = 0xFE;

    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn encode(self, buf: &mut Vec<u8>) {
        let code = self.code();
        if code > 0xFF {
            buf.push(Self::PREFIX);
        }
        buf.push(code as u8);
    }
}

/// Decoded inline operand. Short forms are widened and branch offsets are
/// already resolved to absolute code offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Int32(i32),
    Int64(i64),
    Float(f64),
    Var(u16),
    Target(u32),
    Switch(Vec<u32>),
    Token(Token),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn token(&self) -> Result<Token, VmError> {
        match self.operand {
            Operand::Token(token) => Ok(token),
            _ => Err(self.malformed()),
        }
    }

    pub fn var(&self) -> Result<u16, VmError> {
        match self.operand {
            Operand::Var(index) => Ok(index),
            _ => Err(self.malformed()),
        }
    }

    pub fn target(&self) -> Result<u32, VmError> {
        match self.operand {
            Operand::Target(target) => Ok(target),
            _ => Err(self.malformed()),
        }
    }

    fn malformed(&self) -> VmError {
        VmError::invalid(format!("malformed operand for `{}`", self.op.name()))
    }
}

/// Seekable reader over a method's instruction stream.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pos: 0 }
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.pos as u32
    }

    pub fn seek(&mut self, offset: u32) -> Result<(), VmError> {
        let offset = offset as usize;
        if offset >= self.code.len() {
            return Err(VmError::invalid(format!(
                "branch target {offset:#x} outside of method body"
            )));
        }
        self.pos = offset;
        Ok(())
    }

    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], VmError> {
        let end = self.pos + N;
        let bytes = self.code.get(self.pos..end).ok_or_else(|| {
            VmError::invalid("instruction stream ends inside an operand")
        })?;
        self.pos = end;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, VmError> {
        Ok(self.take::<1>()?[0])
    }

    fn read_i32(&mut self) -> Result<i32, VmError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn branch_target(&self, delta: i64) -> Result<u32, VmError> {
        let target = self.pos as i64 + delta;
        u32::try_from(target)
            .map_err(|_| VmError::invalid("branch target before method start"))
    }

    pub fn decode(&mut self) -> Result<Instruction, VmError> {
        let first = self.read_u8()?;
        let code = if first == OpCode::PREFIX {
            0xFE00 | self.read_u8()? as u16
        } else {
            first as u16
        };
        let op = OpCode::from_code(code).ok_or_else(|| {
            VmError::invalid(format!("unknown opcode {code:#x}"))
        })?;

        let operand = match op.operand() {
            OperandKind::None => Operand::None,
            OperandKind::ShortInt => Operand::Int32(self.read_u8()? as i8 as i32),
            OperandKind::Byte => Operand::Int32(self.read_u8()? as i32),
            OperandKind::Int => Operand::Int32(self.read_i32()?),
            OperandKind::Long => Operand::Int64(i64::from_le_bytes(self.take()?)),
            OperandKind::ShortFloat => {
                Operand::Float(f32::from_le_bytes(self.take()?) as f64)
            }
            OperandKind::Float => Operand::Float(f64::from_le_bytes(self.take()?)),
            OperandKind::ShortVar => Operand::Var(self.read_u8()? as u16),
            OperandKind::Var => Operand::Var(u16::from_le_bytes(self.take()?)),
            OperandKind::ShortBranch => {
                let delta = self.read_u8()? as i8 as i64;
                Operand::Target(self.branch_target(delta)?)
            }
            OperandKind::Branch => {
                let delta = self.read_i32()? as i64;
                Operand::Target(self.branch_target(delta)?)
            }
            OperandKind::Switch => {
                let count = self.read_i32()?;
                let count = usize::try_from(count)
                    .map_err(|_| VmError::invalid("negative switch count"))?;
                let mut deltas = Vec::with_capacity(count);
                for _ in 0..count {
                    deltas.push(self.read_i32()? as i64);
                }
                // offsets are relative to the end of the whole table
                let targets = deltas
                    .into_iter()
                    .map(|delta| self.branch_target(delta))
                    .collect::<Result<Vec<_>, _>>()?;
                Operand::Switch(targets)
            }
            OperandKind::Token => {
                Operand::Token(Token(u32::from_le_bytes(self.take()?)))
            }
        };
        Ok(Instruction { op, operand })
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(u32, Instruction), VmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_at_end() {
            return None;
        }
        let offset = self.offset();
        Some(self.decode().map(|instruction| (offset, instruction)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_short_and_long_forms() {
        let code = [
            0x1F, 0xFE, // ldc.i4.s -2
            0x20, 0x10, 0x00, 0x00, 0x00, // ldc.i4 16
            0x2B, 0x00, // br.s +0
            0xFE, 0x0C, 0x03, 0x00, // ldloc 3
            0x2A, // ret
        ];
        let decoded = Cursor::new(&code)
            .collect::<Result<Vec<_>, _>>()
            .expect("decode");
        assert_eq!(decoded[0].1.operand, Operand::Int32(-2));
        assert_eq!(decoded[1].1.operand, Operand::Int32(16));
        assert_eq!(decoded[2].1.op, OpCode::BrS);
        assert_eq!(decoded[2].1.operand, Operand::Target(9));
        assert_eq!(decoded[3].0, 9);
        assert_eq!(decoded[3].1.op, OpCode::Ldloc);
        assert_eq!(decoded[3].1.operand, Operand::Var(3));
        assert_eq!(decoded[4].1.op, OpCode::Ret);
    }

    #[test]
    fn switch_targets_are_relative_to_table_end() {
        let mut code = vec![0x45];
        code.extend_from_slice(&2i32.to_le_bytes());
        code.extend_from_slice(&0i32.to_le_bytes());
        code.extend_from_slice(&(-13i32).to_le_bytes());
        code.push(0x2A);
        let instruction = Cursor::new(&code).decode().expect("switch");
        assert_eq!(instruction.operand, Operand::Switch(vec![13, 0]));
    }

    #[test]
    fn truncated_operand_is_rejected() {
        let code = [0x20, 0x01];
        assert!(matches!(
            Cursor::new(&code).decode(),
            Err(VmError::InvalidProgram(_))
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(Cursor::new(&[0xFE, 0x08]).decode().is_err());
        assert!(Cursor::new(&[0x24]).decode().is_err());
    }

    #[test]
    fn two_byte_opcodes_round_trip_through_encode() {
        let mut buf = Vec::new();
        OpCode::Ceq.encode(&mut buf);
        OpCode::Add.encode(&mut buf);
        assert_eq!(buf, [0xFE, 0x01, 0x58]);
        assert_eq!(OpCode::from_code(0xFE16), Some(OpCode::Constrained));
        assert_eq!(OpCode::Constrained.name(), "constrained.");
    }
}
