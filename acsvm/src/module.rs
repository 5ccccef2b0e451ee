//! Compiled bytecode units.
//!
//! On-disk layout, integers as VLN unless noted:
//!
//! ```text
//! "ACSV" version:u32le
//! reg_count arr_count
//! string_count { len bytes }*
//! function_count { param_count loc_reg_count loc_arr_count entry }*
//! script_count { kind number|string_idx type flags arg_count loc_reg_count loc_arr_count entry }*
//! code_len code_bytes
//! ```
//!
//! Entry points and jump operands are byte offsets into `code_bytes`. After
//! loading they are word indices into the translated code.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::io::{self, Cursor, Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use num_traits::FromPrimitive;

use crate::code::{ArgKind, Code, CodeEntry, CodeTable, KillType};
use crate::config::UnknownCodePolicy;
use crate::error::ReadError;
use crate::serial::{read_block, read_string, read_svln, read_vln, read_sign, write_string, write_svln, write_vln};
use crate::string::{RefStrings, StringTable};
use crate::{SWord, Word};

pub const BYTECODE_SIGN: [u8; 4] = *b"ACSV";
pub const BYTECODE_VERSION: u32 = 1;

/// Lookup key of a module. `aux` and `num` are host data, typically a
/// resource handle and a lump index.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleName {
    pub name: String,
    pub aux: usize,
    pub num: usize,
}

impl ModuleName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aux: 0,
            num: 0,
        }
    }

    pub fn with_num(mut self, num: usize) -> Self {
        self.num = num;
        self
    }

    pub fn with_aux(mut self, aux: usize) -> Self {
        self.aux = aux;
        self
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, self.name.as_bytes())?;
        write_vln(w, self.aux)?;
        write_vln(w, self.num)
    }

    pub fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self, ReadError> {
        let name = String::from_utf8(read_string(r)?)
            .map_err(|_| ReadError::malformed("module name is not UTF-8"))?;
        Ok(Self {
            name,
            aux: read_vln(r)?,
            num: read_vln(r)?,
        })
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}#{}", self.name, self.num)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptName {
    Num(SWord),
    Name(String),
}

impl ScriptName {
    pub fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        match self {
            ScriptName::Num(n) => {
                write_vln(w, 0u8)?;
                write_svln(w, *n)
            }
            ScriptName::Name(s) => {
                write_vln(w, 1u8)?;
                write_string(w, s.as_bytes())
            }
        }
    }

    pub fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self, ReadError> {
        match read_vln::<u8, _>(r)? {
            0 => Ok(ScriptName::Num(read_svln(r)?)),
            1 => Ok(ScriptName::Name(String::from_utf8_lossy(&read_string(r)?).into_owned())),
            k => Err(ReadError::malformed(format!("invalid script name kind {k}"))),
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptName::Num(n) => write!(f, "{n}"),
            ScriptName::Name(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<SWord> for ScriptName {
    fn from(n: SWord) -> Self {
        ScriptName::Num(n)
    }
}

impl From<&str> for ScriptName {
    fn from(s: &str) -> Self {
        ScriptName::Name(s.to_string())
    }
}

/// Event a script answers to. Hosts may define types beyond the constants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptType(pub Word);

impl ScriptType {
    pub const CLOSED: ScriptType = ScriptType(0);
    pub const OPEN: ScriptType = ScriptType(1);
    pub const RESPAWN: ScriptType = ScriptType(2);
    pub const DEATH: ScriptType = ScriptType(3);
    pub const ENTER: ScriptType = ScriptType(4);
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ScriptFlags: Word {
        const NET = 0x0001;
        const CLIENTSIDE = 0x0002;
        /// Several instances may run at once.
        const MULTI = 0x0004;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: ScriptName,
    pub ty: ScriptType,
    pub flags: ScriptFlags,
    pub arg_count: Word,
    pub loc_reg_count: Word,
    pub loc_arr_count: Word,
    pub entry: Word,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub param_count: Word,
    pub loc_reg_count: Word,
    pub loc_arr_count: Word,
    pub entry: Word,
}

#[derive(Debug)]
pub struct Module {
    name: ModuleName,
    reg_count: Word,
    arr_count: Word,
    strings: Vec<Word>,
    functions: Vec<Function>,
    scripts: Vec<Script>,
    code: Vec<Word>,
}

impl Module {
    /// Parses, validates and translates one bytecode unit.
    ///
    /// Nothing is interned before the whole unit validated, so a failed load
    /// leaves `strings` untouched. On success the module holds one lock on
    /// each of its string constants.
    pub fn read_bytecode(
        name: ModuleName,
        data: &[u8],
        table: &CodeTable,
        policy: UnknownCodePolicy,
        strings: &mut StringTable,
    ) -> Result<Module, ReadError> {
        let mut r = Cursor::new(data);

        read_sign(&mut r, &BYTECODE_SIGN)?;
        let version = r.read_u32::<LittleEndian>()?;
        if version != BYTECODE_VERSION {
            return Err(ReadError::Version(version));
        }

        let reg_count = read_vln::<Word, _>(&mut r)?;
        let arr_count = read_vln::<Word, _>(&mut r)?;

        let mut raw_strings = Vec::new();
        for _ in 0..read_vln::<usize, _>(&mut r)? {
            raw_strings.push(read_string(&mut r)?);
        }

        let mut functions = Vec::new();
        for i in 0..read_vln::<usize, _>(&mut r)? {
            let func = Function {
                param_count: read_vln(&mut r)?,
                loc_reg_count: read_vln(&mut r)?,
                loc_arr_count: read_vln(&mut r)?,
                entry: read_vln(&mut r)?,
            };
            if func.param_count > func.loc_reg_count {
                return Err(ReadError::malformed(format!(
                    "function {i} takes {} params but has {} local registers",
                    func.param_count, func.loc_reg_count
                )));
            }
            functions.push(func);
        }

        let mut scripts = Vec::new();
        for _ in 0..read_vln::<usize, _>(&mut r)? {
            let name = match read_vln::<u8, _>(&mut r)? {
                0 => ScriptName::Num(read_svln(&mut r)?),
                1 => {
                    let idx = read_vln::<usize, _>(&mut r)?;
                    let bytes = raw_strings
                        .get(idx)
                        .ok_or_else(|| ReadError::malformed(format!("script name string {idx} out of range")))?;
                    ScriptName::Name(String::from_utf8_lossy(bytes).into_owned())
                }
                k => return Err(ReadError::malformed(format!("invalid script kind {k}"))),
            };
            let script = Script {
                name,
                ty: ScriptType(read_vln(&mut r)?),
                flags: ScriptFlags::from_bits_retain(read_vln(&mut r)?),
                arg_count: read_vln(&mut r)?,
                loc_reg_count: read_vln(&mut r)?,
                loc_arr_count: read_vln(&mut r)?,
                entry: read_vln(&mut r)?,
            };
            if script.arg_count > script.loc_reg_count {
                return Err(ReadError::malformed(format!(
                    "script {} takes {} args but has {} local registers",
                    script.name, script.arg_count, script.loc_reg_count
                )));
            }
            scripts.push(script);
        }

        let code_len = read_vln::<usize, _>(&mut r)?;
        let raw_code = read_block(&mut r, code_len)?;
        if r.position() as usize != data.len() {
            return Err(ReadError::malformed("trailing bytes after code block"));
        }

        let translated = Translator::new(table, policy, raw_strings.len(), functions.len()).run(&raw_code)?;

        for func in &mut functions {
            func.entry = translated.resolve(func.entry as usize)?;
        }
        for script in &mut scripts {
            script.entry = translated.resolve(script.entry as usize)?;
        }

        let Translated {
            mut code, str_slots, ..
        } = translated;

        let string_idx: Vec<Word> = raw_strings
            .iter()
            .map(|s| {
                let idx = strings.intern(s);
                strings.lock(idx);
                idx
            })
            .collect();
        for slot in str_slots {
            code[slot] = string_idx[code[slot] as usize];
        }

        log::debug!(
            "loaded module {name}: {} scripts, {} functions, {} code words",
            scripts.len(),
            functions.len(),
            code.len()
        );

        Ok(Module {
            name,
            reg_count,
            arr_count,
            strings: string_idx,
            functions,
            scripts,
            code,
        })
    }

    pub fn name(&self) -> &ModuleName {
        &self.name
    }

    pub fn reg_count(&self) -> Word {
        self.reg_count
    }

    pub fn arr_count(&self) -> Word {
        self.arr_count
    }

    /// String table indices of the module's constants, in module order.
    pub fn strings(&self) -> &[Word] {
        &self.strings
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    pub fn code(&self) -> &[Word] {
        &self.code
    }

    pub fn find_script(&self, name: &ScriptName) -> Option<(usize, &Script)> {
        self.scripts.iter().enumerate().find(|(_, s)| &s.name == name)
    }

    /// Drops the module's locks on its string constants.
    pub fn release_strings(&self, strings: &mut StringTable) {
        for &idx in &self.strings {
            strings.unlock(idx);
        }
    }

    /// Human-readable listing of the translated code.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; module {}", self.name);
        for script in &self.scripts {
            let _ = writeln!(
                out,
                "; script {} type={} flags={:#x} args={} regs={} arrs={} entry={}",
                script.name,
                script.ty.0,
                script.flags.bits(),
                script.arg_count,
                script.loc_reg_count,
                script.loc_arr_count,
                script.entry
            );
        }
        for (i, func) in self.functions.iter().enumerate() {
            let _ = writeln!(
                out,
                "; function {i} params={} regs={} arrs={} entry={}",
                func.param_count, func.loc_reg_count, func.loc_arr_count, func.entry
            );
        }

        let mut ip = 0;
        while ip < self.code.len() {
            let Some(code) = Code::from_u32(self.code[ip]) else {
                let _ = writeln!(out, "{ip:6}  .word {:#x}", self.code[ip]);
                ip += 1;
                continue;
            };
            let end = (ip + 1 + code.arg_count()).min(self.code.len());
            let _ = write!(out, "{ip:6}  {code}");
            for &arg in &self.code[ip + 1..end] {
                let _ = write!(out, " {arg}");
            }
            out.push('\n');
            ip = end;
        }
        out
    }
}

impl RefStrings for Module {
    fn ref_strings(&self, strings: &mut StringTable) {
        for &idx in &self.strings {
            strings.mark(idx);
        }
    }
}

struct Translated {
    code: Vec<Word>,
    offsets: HashMap<usize, Word>,
    str_slots: Vec<usize>,
}

impl Translated {
    fn resolve(&self, offset: usize) -> Result<Word, ReadError> {
        self.offsets
            .get(&offset)
            .copied()
            .ok_or_else(|| ReadError::malformed(format!("offset {offset} is not an instruction boundary")))
    }
}

struct Translator<'a> {
    table: &'a CodeTable,
    policy: UnknownCodePolicy,
    string_count: usize,
    func_count: usize,
}

impl<'a> Translator<'a> {
    fn new(table: &'a CodeTable, policy: UnknownCodePolicy, string_count: usize, func_count: usize) -> Self {
        Self {
            table,
            policy,
            string_count,
            func_count,
        }
    }

    fn run(&self, raw: &[u8]) -> Result<Translated, ReadError> {
        let mut r = Cursor::new(raw);
        let mut code = Vec::new();
        let mut offsets = HashMap::new();
        let mut jumps = Vec::new();
        let mut str_slots = Vec::new();

        while (r.position() as usize) < raw.len() {
            let pos = r.position() as usize;
            offsets.insert(pos, code.len() as Word);
            let op = read_vln::<Word, _>(&mut r)?;

            match self.table.get(op) {
                Some(CodeEntry::Code(data)) => {
                    code.push(data.code as Word);
                    for kind in &data.args {
                        let v = read_vln::<Word, _>(&mut r)?;
                        match kind {
                            ArgKind::Lit => {}
                            ArgKind::Jump => jumps.push((code.len(), v as usize)),
                            ArgKind::Str => {
                                if v as usize >= self.string_count {
                                    return Err(ReadError::malformed(format!(
                                        "string {v} out of range at offset {pos}"
                                    )));
                                }
                                str_slots.push(code.len());
                            }
                            ArgKind::Func => {
                                if v as usize >= self.func_count {
                                    return Err(ReadError::malformed(format!(
                                        "function {v} out of range at offset {pos}"
                                    )));
                                }
                            }
                        }
                        code.push(v);
                    }
                }
                Some(CodeEntry::Func(data)) => {
                    for _ in 0..data.inline {
                        let v = read_vln::<Word, _>(&mut r)?;
                        code.extend([Code::PushLit as Word, v]);
                    }
                    for &v in &data.implicit {
                        code.extend([Code::PushLit as Word, v]);
                    }
                    code.extend([Code::CallFunc as Word, data.argc(), data.func]);
                }
                None => match self.policy {
                    UnknownCodePolicy::Trap => {
                        log::debug!("unknown opcode {op} at offset {pos} translated to a kill");
                        code.extend([Code::Kill as Word, KillType::UnknownCode as Word, op]);
                    }
                    UnknownCodePolicy::Error => {
                        return Err(ReadError::malformed(format!("unknown opcode {op} at offset {pos}")));
                    }
                },
            }
        }
        offsets.insert(raw.len(), code.len() as Word);

        let mut translated = Translated {
            code,
            offsets,
            str_slots,
        };
        for (slot, target) in jumps {
            translated.code[slot] = translated.resolve(target)?;
        }
        Ok(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Assembler, ScriptDecl};
    use pretty_assertions::assert_eq;

    fn load(bytes: &[u8], strings: &mut StringTable) -> Result<Module, ReadError> {
        Module::read_bytecode(
            ModuleName::new("test"),
            bytes,
            &CodeTable::standard(),
            UnknownCodePolicy::Trap,
            strings,
        )
    }

    #[test]
    fn jumps_are_rewritten_to_word_indices() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(1));
        let top = asm.new_label();
        asm.bind(top);
        asm.op(Code::PushLit, &[300]);
        asm.op(Code::Drop, &[]);
        asm.jump(Code::Jump, &[], top);
        let bytes = asm.finish().unwrap();

        let mut strings = StringTable::new();
        let module = load(&bytes, &mut strings).unwrap();
        assert_eq!(
            module.code(),
            &[Code::PushLit as Word, 300, Code::Drop as Word, Code::Jump as Word, 0]
        );
        assert_eq!(module.scripts()[0].entry, 0);
    }

    #[test]
    fn strings_are_interned_and_locked() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::named("greet"));
        asm.push_str(b"hello");
        asm.op(Code::Drop, &[]);
        asm.op(Code::Terminate, &[]);
        let bytes = asm.finish().unwrap();

        let mut strings = StringTable::new();
        let module = load(&bytes, &mut strings).unwrap();
        let hello = strings.intern(b"hello");
        assert_eq!(module.code()[1], hello);
        assert_eq!(strings.get(hello).unwrap().lock_count(), 1);
        assert!(module.find_script(&ScriptName::from("greet")).is_some());
    }

    #[test]
    fn unknown_opcode_traps_or_fails() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(1));
        asm.raw_op(999, &[]);
        asm.op(Code::Terminate, &[]);
        let bytes = asm.finish().unwrap();

        let mut strings = StringTable::new();
        let module = load(&bytes, &mut strings).unwrap();
        assert_eq!(
            &module.code()[..3],
            &[Code::Kill as Word, KillType::UnknownCode as Word, 999]
        );

        let err = Module::read_bytecode(
            ModuleName::new("strict"),
            &bytes,
            &CodeTable::standard(),
            UnknownCodePolicy::Error,
            &mut strings,
        )
        .unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));
    }

    #[test]
    fn redirect_pushes_inline_operands_then_calls() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(1));
        asm.raw_op(crate::code::raw::RANDOM_LIT, &[1, 6]);
        asm.op(Code::Terminate, &[]);
        let bytes = asm.finish().unwrap();

        let mut strings = StringTable::new();
        let module = load(&bytes, &mut strings).unwrap();
        assert_eq!(
            &module.code()[..7],
            &[
                Code::PushLit as Word,
                1,
                Code::PushLit as Word,
                6,
                Code::CallFunc as Word,
                2,
                crate::func::BuiltinFunc::Random as Word
            ]
        );
    }

    #[test]
    fn failed_load_interns_nothing() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(1));
        asm.push_str(b"orphan");
        asm.op(Code::Terminate, &[]);
        let mut bytes = asm.finish().unwrap();
        bytes.push(0);

        let mut strings = StringTable::new();
        assert!(load(&bytes, &mut strings).is_err());
        assert!(strings.is_empty());
    }

    #[test]
    fn bad_header_is_rejected() {
        let mut strings = StringTable::new();
        assert!(matches!(
            load(b"ACSX\x01\0\0\0", &mut strings),
            Err(ReadError::BadSignature { .. })
        ));
        assert!(matches!(load(b"ACSV\x02\0\0\0", &mut strings), Err(ReadError::Version(2))));
        assert!(matches!(load(b"ACSV\x01\0", &mut strings), Err(ReadError::UnexpectedEof)));
    }

    #[test]
    fn jump_into_operand_is_rejected() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(1));
        // PushLit 5 occupies bytes 0..2; a jump to byte 1 lands on its operand
        asm.op(Code::PushLit, &[5]);
        asm.op(Code::Jump, &[1]);
        let bytes = asm.finish().unwrap();

        let mut strings = StringTable::new();
        assert!(matches!(load(&bytes, &mut strings), Err(ReadError::Malformed(_))));
    }

    #[test]
    fn disassembly_lists_codes() {
        let mut asm = Assembler::new();
        asm.script(ScriptDecl::numbered(3));
        asm.op(Code::PushLit, &[7]);
        asm.op(Code::DropModReg, &[0]);
        asm.op(Code::Terminate, &[]);
        let bytes = asm.finish().unwrap();

        let mut strings = StringTable::new();
        let text = load(&bytes, &mut strings).unwrap().disassemble();
        assert!(text.contains("PushLit 7"));
        assert!(text.contains("DropModReg 0"));
        assert!(text.contains("; script 3 type=0"));
    }
}
