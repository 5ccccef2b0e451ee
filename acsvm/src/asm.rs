//! Bytecode writer.
//!
//! Produces the raw format read by [`crate::Module::read_bytecode`]. Jump
//! targets are labels; their operands are reserved as fixed-width VLNs and
//! patched once every label is bound.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::code::{raw, Code};
use crate::error::ReadError;
use crate::module::{ScriptFlags, ScriptName, ScriptType, BYTECODE_SIGN, BYTECODE_VERSION};
use crate::serial::{write_string, write_svln, write_vln, write_vln_padded};
use crate::Word;

const LABEL_WIDTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone)]
pub struct ScriptDecl {
    pub name: ScriptName,
    pub ty: ScriptType,
    pub flags: ScriptFlags,
    pub arg_count: Word,
    pub loc_reg_count: Word,
    pub loc_arr_count: Word,
}

impl ScriptDecl {
    pub fn numbered(number: i32) -> Self {
        Self::new(ScriptName::Num(number))
    }

    pub fn named(name: &str) -> Self {
        Self::new(ScriptName::Name(name.to_string()))
    }

    fn new(name: ScriptName) -> Self {
        Self {
            name,
            ty: ScriptType::CLOSED,
            flags: ScriptFlags::empty(),
            arg_count: 0,
            loc_reg_count: 0,
            loc_arr_count: 0,
        }
    }

    pub fn ty(mut self, ty: ScriptType) -> Self {
        self.ty = ty;
        self
    }

    pub fn flags(mut self, flags: ScriptFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn args(mut self, count: Word) -> Self {
        self.arg_count = count;
        self.loc_reg_count = self.loc_reg_count.max(count);
        self
    }

    pub fn regs(mut self, count: Word) -> Self {
        self.loc_reg_count = count.max(self.arg_count);
        self
    }

    pub fn arrs(mut self, count: Word) -> Self {
        self.loc_arr_count = count;
        self
    }
}

#[derive(Debug, Clone)]
struct FunctionDecl {
    param_count: Word,
    loc_reg_count: Word,
    loc_arr_count: Word,
    entry: Label,
}

#[derive(Debug, Default)]
pub struct Assembler {
    reg_count: Word,
    arr_count: Word,
    strings: Vec<Vec<u8>>,
    functions: Vec<FunctionDecl>,
    scripts: Vec<(ScriptDecl, usize)>,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module-scope register and array counts.
    pub fn module_vars(&mut self, reg_count: Word, arr_count: Word) -> &mut Self {
        self.reg_count = reg_count;
        self.arr_count = arr_count;
        self
    }

    /// Module string index for `bytes`, added on first use.
    pub fn string(&mut self, bytes: &[u8]) -> Word {
        if let Some(i) = self.strings.iter().position(|s| s == bytes) {
            return i as Word;
        }
        self.strings.push(bytes.to_vec());
        (self.strings.len() - 1) as Word
    }

    /// Starts a script at the current position.
    pub fn script(&mut self, decl: ScriptDecl) -> &mut Self {
        if let ScriptName::Name(name) = &decl.name {
            let name = name.clone();
            self.string(name.as_bytes());
        }
        self.scripts.push((decl, self.code.len()));
        self
    }

    /// Reserves a function index; its body starts at [`Self::begin_function`].
    pub fn declare_function(&mut self, param_count: Word, loc_reg_count: Word, loc_arr_count: Word) -> Word {
        let entry = self.new_label();
        self.functions.push(FunctionDecl {
            param_count,
            loc_reg_count: loc_reg_count.max(param_count),
            loc_arr_count,
            entry,
        });
        (self.functions.len() - 1) as Word
    }

    pub fn begin_function(&mut self, func: Word) -> &mut Self {
        if let Some(entry) = self.functions.get(func as usize).map(|f| f.entry) {
            self.bind(entry);
        }
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// Current byte offset in the code block.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Emits `code` with literal operands.
    pub fn op(&mut self, code: Code, args: &[Word]) -> &mut Self {
        self.raw_op(code as Word, args)
    }

    pub fn raw_op(&mut self, op: Word, args: &[Word]) -> &mut Self {
        self.emit(op);
        for &a in args {
            self.emit(a);
        }
        self
    }

    /// Emits a branch: `lits` first, then the label operand.
    pub fn jump(&mut self, code: Code, lits: &[Word], target: Label) -> &mut Self {
        self.op(code, lits);
        self.fixups.push((self.code.len(), target));
        self.code.extend_from_slice(&[0x80, 0x80, 0x80, 0x80, 0x00]);
        self
    }

    pub fn push_str(&mut self, bytes: &[u8]) -> &mut Self {
        let idx = self.string(bytes);
        self.raw_op(raw::PUSH_STR, &[idx])
    }

    fn emit(&mut self, v: Word) {
        // writing to a Vec cannot fail
        let _ = write_vln(&mut self.code, v);
    }

    pub fn finish(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut code = self.code.clone();
        for &(pos, label) in &self.fixups {
            let target = self.label_offset(label)?;
            let mut slot = Vec::with_capacity(LABEL_WIDTH);
            write_vln_padded(&mut slot, target, LABEL_WIDTH)?;
            code[pos..pos + LABEL_WIDTH].copy_from_slice(&slot);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&BYTECODE_SIGN);
        out.write_u32::<LittleEndian>(BYTECODE_VERSION)?;
        write_vln(&mut out, self.reg_count)?;
        write_vln(&mut out, self.arr_count)?;

        write_vln(&mut out, self.strings.len())?;
        for s in &self.strings {
            write_string(&mut out, s)?;
        }

        write_vln(&mut out, self.functions.len())?;
        for f in &self.functions {
            write_vln(&mut out, f.param_count)?;
            write_vln(&mut out, f.loc_reg_count)?;
            write_vln(&mut out, f.loc_arr_count)?;
            write_vln(&mut out, self.label_offset(f.entry)?)?;
        }

        write_vln(&mut out, self.scripts.len())?;
        for (decl, entry) in &self.scripts {
            match &decl.name {
                ScriptName::Num(n) => {
                    write_vln(&mut out, 0u8)?;
                    write_svln(&mut out, *n)?;
                }
                ScriptName::Name(name) => {
                    let idx = self
                        .strings
                        .iter()
                        .position(|s| s == name.as_bytes())
                        .ok_or_else(|| ReadError::malformed(format!("script name {name} not in string pool")))?;
                    write_vln(&mut out, 1u8)?;
                    write_vln(&mut out, idx)?;
                }
            }
            write_vln(&mut out, decl.ty.0)?;
            write_vln(&mut out, decl.flags.bits())?;
            write_vln(&mut out, decl.arg_count)?;
            write_vln(&mut out, decl.loc_reg_count)?;
            write_vln(&mut out, decl.loc_arr_count)?;
            write_vln(&mut out, *entry)?;
        }

        write_vln(&mut out, code.len())?;
        out.extend_from_slice(&code);
        Ok(out)
    }

    fn label_offset(&self, label: Label) -> Result<usize, ReadError> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| ReadError::malformed(format!("label {} is never bound", label.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_label_is_an_error() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(1));
        let nowhere = asm.new_label();
        asm.jump(Code::Jump, &[], nowhere);
        assert!(asm.finish().is_err());
    }

    #[test]
    fn forward_labels_are_patched() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(1));
        let end = asm.new_label();
        asm.jump(Code::Jump, &[], end);
        asm.op(Code::Nop, &[]);
        asm.bind(end);
        asm.op(Code::Terminate, &[]);
        let bytes = asm.finish().unwrap();

        // jump opcode, then target 7 padded to five bytes
        let tail = &bytes[bytes.len() - 8..];
        assert_eq!(tail, &[Code::Jump as u8, 0x87, 0x80, 0x80, 0x80, 0x00, 0, 2]);
    }

    #[test]
    fn strings_are_pooled() {
        let mut asm = Assembler::new();
        assert_eq!(asm.string(b"a"), 0);
        assert_eq!(asm.string(b"b"), 1);
        assert_eq!(asm.string(b"a"), 0);
    }
}
