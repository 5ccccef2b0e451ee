//! Internal instruction set and the raw-opcode translation table.
//!
//! Bytecode on disk uses raw opcodes. At load time each raw opcode is looked
//! up in a [`CodeTable`] and rewritten either into an internal [`Code`] with
//! its operands resolved, or into a `CallFunc` with implicit arguments. The
//! interpreter only ever sees translated code.

use std::collections::HashMap;

use num_derive::FromPrimitive;
use strum::IntoEnumIterator;

use crate::func::BuiltinFunc;
use crate::Word;

#[repr(u32)]
#[derive(FromPrimitive, strum::Display, strum::EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Nop = 0,
    Kill = 1,
    Terminate = 2,
    Suspend = 3,
    Restart = 4,
    Delay = 5,
    DelayLit = 6,
    WaitScrI = 7,
    WaitScrS = 8,
    WaitTag = 9,

    PushLit = 10,
    Drop = 11,
    Copy = 12,
    Swap = 13,

    PushLocReg = 14,
    DropLocReg = 15,
    IncLocReg = 16,
    DecLocReg = 17,
    PushLocArr = 18,
    DropLocArr = 19,

    PushModReg = 20,
    DropModReg = 21,
    IncModReg = 22,
    DecModReg = 23,
    PushModArr = 24,
    DropModArr = 25,

    PushHubReg = 26,
    DropHubReg = 27,
    IncHubReg = 28,
    DecHubReg = 29,
    PushHubArr = 30,
    DropHubArr = 31,

    PushGblReg = 32,
    DropGblReg = 33,
    IncGblReg = 34,
    DecGblReg = 35,
    PushGblArr = 36,
    DropGblArr = 37,

    Add = 38,
    Sub = 39,
    Mul = 40,
    Div = 41,
    Mod = 42,
    MulX = 43,
    DivX = 44,
    Neg = 45,
    BitAnd = 46,
    BitIor = 47,
    BitXor = 48,
    BitNot = 49,
    ShL = 50,
    ShR = 51,
    CmpEQ = 52,
    CmpNE = 53,
    CmpLT = 54,
    CmpLE = 55,
    CmpGT = 56,
    CmpGE = 57,
    LogAnd = 58,
    LogOr = 59,
    LogNot = 60,

    Jump = 61,
    JcndTru = 62,
    JcndNil = 63,
    JcndLit = 64,
    Call = 65,
    CallNul = 66,
    Retn = 67,
    RetnVal = 68,
    CallFunc = 69,
}

/// How an inline operand is decoded and resolved at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Taken as is.
    Lit,
    /// Byte offset into the code block, rewritten to a word index.
    Jump,
    /// Module string index, rewritten to a string table index.
    Str,
    /// Module function index, checked against the function table.
    Func,
}

impl Code {
    pub fn args(self) -> &'static [ArgKind] {
        use ArgKind::{Func, Lit};
        use Code::*;

        match self {
            Kill => &[Lit, Lit],
            DelayLit | WaitTag | PushLit => &[Lit],

            PushLocReg | DropLocReg | IncLocReg | DecLocReg | PushLocArr | DropLocArr => &[Lit],
            PushModReg | DropModReg | IncModReg | DecModReg | PushModArr | DropModArr => &[Lit],
            PushHubReg | DropHubReg | IncHubReg | DecHubReg | PushHubArr | DropHubArr => &[Lit],
            PushGblReg | DropGblReg | IncGblReg | DecGblReg | PushGblArr | DropGblArr => &[Lit],

            Jump | JcndTru | JcndNil => &[ArgKind::Jump],
            JcndLit => &[Lit, ArgKind::Jump],
            Call | CallNul => &[Func],
            CallFunc => &[Lit, Lit],

            _ => &[],
        }
    }

    #[inline]
    pub fn arg_count(self) -> usize {
        self.args().len()
    }
}

/// Reasons a thread can be killed. Scripts may also raise these through the
/// `Kill` instruction; unrecognized values read as `None`.
#[repr(u32)]
#[derive(FromPrimitive, strum::Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillType {
    None = 0,
    OutOfBounds = 1,
    UnknownCode = 2,
    UnknownFunc = 3,
    BranchLimit = 4,
    /// Locals of a called function could not be allocated.
    OutOfMemory = 5,
}

/// Raw opcodes of the standard table that do not map one-to-one onto a
/// [`Code`].
pub mod raw {
    use crate::Word;

    pub const PUSH_STR: Word = 100;

    pub const PRINT_BEGIN: Word = 128;
    pub const PRINT_STRING: Word = 129;
    pub const PRINT_NUMBER: Word = 130;
    pub const PRINT_CHAR: Word = 131;
    pub const PRINT_FIXED: Word = 132;
    pub const PRINT_END: Word = 133;
    pub const PRINT_MOD_ARRAY: Word = 134;
    pub const SCR_STOP: Word = 135;
    pub const SCR_PAUSE: Word = 136;
    pub const RANDOM: Word = 137;
    pub const RANDOM_LIT: Word = 138;
    pub const STR_LEN: Word = 139;
    pub const SET_RESULT: Word = 140;
    pub const SCR_ACTIVE: Word = 141;
    pub const CHECK_LOCK: Word = 142;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeData {
    pub code: Code,
    pub args: Vec<ArgKind>,
}

impl CodeData {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            args: code.args().to_vec(),
        }
    }

    /// Same code with a different operand decoding, e.g. a `PushLit` whose
    /// operand is a module string.
    pub fn with_args(code: Code, args: Vec<ArgKind>) -> Self {
        Self { code, args }
    }
}

/// A raw opcode redirected to `CallFunc`.
///
/// The callee receives `stack` popped arguments, then `inline` literal
/// operands read from the instruction, then the `implicit` words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncData {
    pub func: Word,
    pub stack: Word,
    pub inline: Word,
    pub implicit: Vec<Word>,
}

impl FuncData {
    pub fn new(func: Word, stack: Word) -> Self {
        Self {
            func,
            stack,
            inline: 0,
            implicit: Vec::new(),
        }
    }

    pub fn with_inline(mut self, inline: Word) -> Self {
        self.inline = inline;
        self
    }

    pub fn with_implicit(mut self, implicit: Vec<Word>) -> Self {
        self.implicit = implicit;
        self
    }

    pub fn argc(&self) -> Word {
        self.stack + self.inline + self.implicit.len() as Word
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeEntry {
    Code(CodeData),
    Func(FuncData),
}

#[derive(Debug, Clone)]
pub struct CodeTable {
    entries: HashMap<Word, CodeEntry>,
}

impl Default for CodeTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl CodeTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Raw `n` is `Code` `n` for every internal code, plus `PUSH_STR` and the
    /// built-in redirects in [`raw`].
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for code in Code::iter() {
            table.add_code_data(code as Word, CodeData::new(code));
        }
        table.add_code_data(raw::PUSH_STR, CodeData::with_args(Code::PushLit, vec![ArgKind::Str]));

        let redirects = [
            (raw::PRINT_BEGIN, BuiltinFunc::PrintBegin, 0),
            (raw::PRINT_STRING, BuiltinFunc::PrintString, 1),
            (raw::PRINT_NUMBER, BuiltinFunc::PrintNumber, 1),
            (raw::PRINT_CHAR, BuiltinFunc::PrintChar, 1),
            (raw::PRINT_FIXED, BuiltinFunc::PrintFixed, 1),
            (raw::PRINT_END, BuiltinFunc::PrintEnd, 0),
            (raw::PRINT_MOD_ARRAY, BuiltinFunc::PrintModArray, 1),
            (raw::SCR_STOP, BuiltinFunc::ScrStopI, 1),
            (raw::SCR_PAUSE, BuiltinFunc::ScrPauseI, 1),
            (raw::RANDOM, BuiltinFunc::Random, 2),
            (raw::STR_LEN, BuiltinFunc::StrLen, 1),
            (raw::SET_RESULT, BuiltinFunc::SetResultValue, 1),
            (raw::SCR_ACTIVE, BuiltinFunc::ScrActiveI, 1),
            (raw::CHECK_LOCK, BuiltinFunc::CheckLock, 2),
        ];
        for (op, func, stack) in redirects {
            table.add_func_data(op, FuncData::new(func as Word, stack));
        }
        table.add_func_data(raw::RANDOM_LIT, FuncData::new(BuiltinFunc::Random as Word, 0).with_inline(2));

        table
    }

    /// Maps `raw` to `data`. Returns false and leaves the table as it was
    /// when `data` does not carry exactly the operands its code executes.
    pub fn add_code_data(&mut self, raw: Word, data: CodeData) -> bool {
        if data.args.len() != data.code.arg_count() {
            log::warn!(
                "raw opcode {raw}: {} takes {} operands, got {}",
                data.code,
                data.code.arg_count(),
                data.args.len()
            );
            return false;
        }
        self.entries.insert(raw, CodeEntry::Code(data));
        true
    }

    pub fn add_func_data(&mut self, raw: Word, data: FuncData) {
        self.entries.insert(raw, CodeEntry::Func(data));
    }

    pub fn remove(&mut self, raw: Word) -> Option<CodeEntry> {
        self.entries.remove(&raw)
    }

    pub fn get(&self, raw: Word) -> Option<&CodeEntry> {
        self.entries.get(&raw)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
