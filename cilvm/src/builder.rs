use crate::{
    ExceptionRegion, FieldId, MethodBody, MethodId, OpCode, OperandKind,
    RegionKind, Token, TypeId,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// position of the 4-byte operand
    at: usize,
    /// offset the branch delta is relative to
    base: usize,
    label: Label,
}

#[derive(Debug)]
struct PendingRegion {
    kind: RegionKind,
    try_start: Label,
    try_end: Label,
    handler_start: Label,
    handler_end: Label,
}

/// Assembles method bodies. Branches always use the long encodings and are
/// patched once every label has been marked.
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    regions: Vec<PendingRegion>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    fn emit_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn emit_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Emits an opcode that takes no inline operand.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        debug_assert_eq!(op.operand(), OperandKind::None, "{}", op.name());
        op.encode(&mut self.buf);
        self
    }

    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        match value {
            -1 => OpCode::LdcI4M1.encode(&mut self.buf),
            0..=8 => self.buf.push(OpCode::LdcI40 as u8 + value as u8),
            -128..=127 => {
                OpCode::LdcI4S.encode(&mut self.buf);
                self.emit_u8(value as i8 as u8);
            }
            _ => {
                OpCode::LdcI4.encode(&mut self.buf);
                self.emit_u32(value as u32);
            }
        }
        self
    }

    pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
        OpCode::LdcI8.encode(&mut self.buf);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_r4(&mut self, value: f32) -> &mut Self {
        OpCode::LdcR4.encode(&mut self.buf);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_r8(&mut self, value: f64) -> &mut Self {
        OpCode::LdcR8.encode(&mut self.buf);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn var(
        &mut self,
        index: u16,
        fixed: Option<[OpCode; 4]>,
        short: OpCode,
        long: OpCode,
    ) -> &mut Self {
        match (fixed, index) {
            (Some(ops), 0..=3) => ops[index as usize].encode(&mut self.buf),
            (_, 0..=255) => {
                short.encode(&mut self.buf);
                self.emit_u8(index as u8);
            }
            _ => {
                long.encode(&mut self.buf);
                self.emit_u16(index);
            }
        }
        self
    }

    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        use OpCode::*;
        self.var(index, Some([Ldarg0, Ldarg1, Ldarg2, Ldarg3]), LdargS, Ldarg)
    }

    pub fn ldarga(&mut self, index: u16) -> &mut Self {
        self.var(index, None, OpCode::LdargaS, OpCode::Ldarga)
    }

    pub fn starg(&mut self, index: u16) -> &mut Self {
        self.var(index, None, OpCode::StargS, OpCode::Starg)
    }

    pub fn ldloc(&mut self, index: u16) -> &mut Self {
        use OpCode::*;
        self.var(index, Some([Ldloc0, Ldloc1, Ldloc2, Ldloc3]), LdlocS, Ldloc)
    }

    pub fn ldloca(&mut self, index: u16) -> &mut Self {
        self.var(index, None, OpCode::LdlocaS, OpCode::Ldloca)
    }

    pub fn stloc(&mut self, index: u16) -> &mut Self {
        use OpCode::*;
        self.var(index, Some([Stloc0, Stloc1, Stloc2, Stloc3]), StlocS, Stloc)
    }

    /// Emits an opcode followed by a metadata token.
    pub fn token(&mut self, op: OpCode, token: Token) -> &mut Self {
        debug_assert_eq!(op.operand(), OperandKind::Token, "{}", op.name());
        op.encode(&mut self.buf);
        self.emit_u32(token.0);
        self
    }

    pub fn method(&mut self, op: OpCode, method: MethodId) -> &mut Self {
        self.token(op, Token::from(method))
    }

    pub fn field(&mut self, op: OpCode, field: FieldId) -> &mut Self {
        self.token(op, Token::from(field))
    }

    pub fn typed(&mut self, op: OpCode, ty: TypeId) -> &mut Self {
        self.token(op, Token::from(ty))
    }

    pub fn call(&mut self, method: MethodId) -> &mut Self {
        self.method(OpCode::Call, method)
    }

    pub fn callvirt(&mut self, method: MethodId) -> &mut Self {
        self.method(OpCode::Callvirt, method)
    }

    pub fn newobj(&mut self, ctor: MethodId) -> &mut Self {
        self.method(OpCode::Newobj, ctor)
    }

    pub fn ldstr(&mut self, token: Token) -> &mut Self {
        self.token(OpCode::Ldstr, token)
    }

    pub fn define_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn mark(&mut self, label: Label) -> &mut Self {
        debug_assert!(self.labels[label.0].is_none(), "label marked twice");
        self.labels[label.0] = Some(self.buf.len());
        self
    }

    /// Emits a long-form branch (or `leave`) to `label`.
    pub fn branch(&mut self, op: OpCode, label: Label) -> &mut Self {
        debug_assert_eq!(op.operand(), OperandKind::Branch, "{}", op.name());
        op.encode(&mut self.buf);
        let at = self.buf.len();
        self.emit_u32(0);
        self.fixups.push(Fixup {
            at,
            base: self.buf.len(),
            label,
        });
        self
    }

    pub fn leave(&mut self, label: Label) -> &mut Self {
        self.branch(OpCode::Leave, label)
    }

    pub fn switch(&mut self, labels: &[Label]) -> &mut Self {
        OpCode::Switch.encode(&mut self.buf);
        self.emit_u32(labels.len() as u32);
        let start = self.buf.len();
        let base = start + labels.len() * 4;
        for (i, &label) in labels.iter().enumerate() {
            self.emit_u32(0);
            self.fixups.push(Fixup {
                at: start + i * 4,
                base,
                label,
            });
        }
        self
    }

    /// Registers a protected region. Regions must be added innermost first.
    pub fn region(
        &mut self,
        kind: RegionKind,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
    ) -> &mut Self {
        self.regions.push(PendingRegion {
            kind,
            try_start,
            try_end,
            handler_start,
            handler_end,
        });
        self
    }

    fn resolve(&self, label: Label) -> usize {
        match self.labels[label.0] {
            Some(offset) => offset,
            None => panic!("label {} used but never marked", label.0),
        }
    }

    pub fn finish(mut self) -> (Vec<u8>, Vec<ExceptionRegion>) {
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label) as i64;
            let delta = (target - fixup.base as i64) as i32;
            self.buf[fixup.at..fixup.at + 4]
                .copy_from_slice(&delta.to_le_bytes());
        }
        let regions = self
            .regions
            .iter()
            .map(|region| {
                let try_start = self.resolve(region.try_start);
                let handler_start = self.resolve(region.handler_start);
                ExceptionRegion {
                    kind: region.kind,
                    try_offset: try_start as u32,
                    try_length: (self.resolve(region.try_end) - try_start)
                        as u32,
                    handler_offset: handler_start as u32,
                    handler_length: (self.resolve(region.handler_end)
                        - handler_start)
                        as u32,
                }
            })
            .collect();
        (self.buf, regions)
    }

    pub fn into_body(self, max_stack: u16, locals: Vec<TypeId>) -> MethodBody {
        let (code, regions) = self.finish();
        MethodBody {
            code,
            max_stack,
            locals,
            regions,
        }
    }
}
