//! Script threads and the instruction interpreter.
//!
//! A thread is a cooperatively scheduled script instance, not an OS thread.
//! [`Thread::exec`] runs one thread for one tick: until it blocks, yields,
//! stops, or exhausts the branch limit.

use std::io::{self, Read, Write};
use std::rc::Rc;

use num_traits::FromPrimitive;

use crate::array::Array;
use crate::code::{Code, KillType};
use crate::environment::{Environment, KillInfo};
use crate::error::{Error, ReadError};
use crate::module::{Module, Script};
use crate::scope::{ScopeId, VarLevel};
use crate::serial::{read_bool, read_string, read_svln, read_vln, write_bool, write_string, write_svln, write_vln};
use crate::string::{RefStrings, StringTable};
use crate::{SWord, Word};

pub type ThreadId = u32;

// Upper bound on CallFunc arguments padded from an underflowing stack.
const MAX_FUNC_ARGS: usize = 1024;

/// Host payload carried by every thread and inherited by the threads it
/// starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ThreadInfo {
    pub activator: Word,
    pub line: Word,
    pub side: Word,
}

impl ThreadInfo {
    fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        write_vln(w, self.activator)?;
        write_vln(w, self.line)?;
        write_vln(w, self.side)
    }

    fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self, ReadError> {
        Ok(Self {
            activator: read_vln(r)?,
            line: read_vln(r)?,
            side: read_vln(r)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ThreadState {
    #[default]
    Inactive,
    Running,
    /// Reaped on the next scheduling pass.
    Stopped,
    Paused,
    WaitScrI(SWord),
    WaitScrS(String),
    WaitTag { ty: Word, tag: Word },
}

impl ThreadState {
    /// Stopped and Inactive threads never run again.
    pub fn is_finished(&self) -> bool {
        matches!(self, ThreadState::Stopped | ThreadState::Inactive)
    }

    fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        match self {
            ThreadState::Inactive => write_vln(w, 0u8),
            ThreadState::Running => write_vln(w, 1u8),
            ThreadState::Stopped => write_vln(w, 2u8),
            ThreadState::Paused => write_vln(w, 3u8),
            ThreadState::WaitScrI(n) => {
                write_vln(w, 4u8)?;
                write_svln(w, *n)
            }
            ThreadState::WaitScrS(s) => {
                write_vln(w, 5u8)?;
                write_string(w, s.as_bytes())
            }
            ThreadState::WaitTag { ty, tag } => {
                write_vln(w, 6u8)?;
                write_vln(w, *ty)?;
                write_vln(w, *tag)
            }
        }
    }

    fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self, ReadError> {
        Ok(match read_vln::<u8, _>(r)? {
            0 => ThreadState::Inactive,
            1 => ThreadState::Running,
            2 => ThreadState::Stopped,
            3 => ThreadState::Paused,
            4 => ThreadState::WaitScrI(read_svln(r)?),
            5 => ThreadState::WaitScrS(String::from_utf8_lossy(&read_string(r)?).into_owned()),
            6 => ThreadState::WaitTag {
                ty: read_vln(r)?,
                tag: read_vln(r)?,
            },
            k => return Err(ReadError::malformed(format!("invalid thread state {k}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallFrame {
    ret: usize,
    loc_reg_base: usize,
    loc_arr_base: usize,
    discard: bool,
    func: Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecOutcome {
    Step,
    /// Stop for this tick but stay runnable.
    Yield,
}

#[derive(Debug, Default)]
pub struct Thread {
    id: ThreadId,
    module: Option<Rc<Module>>,
    scope: ScopeId,
    module_idx: usize,
    script: usize,

    code_ptr: usize,
    stack: Vec<Word>,
    call_stack: Vec<CallFrame>,

    /// Locals of every frame, flattened. The current frame starts at the bases.
    loc_regs: Vec<Word>,
    loc_arrs: Vec<Array>,
    loc_reg_base: usize,
    loc_arr_base: usize,

    pub result: Word,
    pub delay: Word,
    pub state: ThreadState,
    pub info: ThreadInfo,

    pub(crate) print_buf: Vec<u8>,

    /// Start arguments, reloaded into the locals by `Restart`.
    args: Vec<Word>,
    /// Tick in which the scheduler last gave this thread a turn.
    pub(crate) last_tick: u64,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        module: Rc<Module>,
        scope: ScopeId,
        module_idx: usize,
        script_idx: usize,
        args: &[Word],
        info: ThreadInfo,
    ) -> Result<Self, Error> {
        let script = module
            .scripts()
            .get(script_idx)
            .ok_or_else(|| ReadError::malformed(format!("script {script_idx} out of range in {}", module.name())))?;

        let args = &args[..args.len().min(script.arg_count as usize)];
        let mut thread = Self {
            id,
            scope,
            module_idx,
            script: script_idx,
            state: ThreadState::Running,
            info,
            ..Default::default()
        };
        thread.args.try_reserve_exact(args.len())?;
        thread.args.extend_from_slice(args);
        thread.loc_regs.try_reserve_exact(script.loc_reg_count as usize)?;
        thread.loc_arrs.try_reserve_exact(script.loc_arr_count as usize)?;
        thread.reset_locals(script);
        thread.module = Some(module);
        Ok(thread)
    }

    /// Puts the locals and the code pointer back where `script` starts.
    /// Storage is expected to be reserved already.
    fn reset_locals(&mut self, script: &Script) {
        self.stack.clear();
        self.call_stack.clear();
        self.loc_reg_base = 0;
        self.loc_arr_base = 0;

        self.loc_regs.clear();
        self.loc_regs.resize(script.loc_reg_count as usize, 0);
        for (reg, &arg) in self.loc_regs.iter_mut().zip(&self.args) {
            *reg = arg;
        }
        self.loc_arrs.clear();
        self.loc_arrs.resize(script.loc_arr_count as usize, Array::new());
        self.code_ptr = script.entry as usize;
    }

    /// Placeholder left in the scope while the real thread is executing.
    pub(crate) fn marker(id: ThreadId) -> Self {
        Self {
            id,
            state: ThreadState::Running,
            ..Default::default()
        }
    }

    pub(crate) fn is_marker(&self) -> bool {
        self.module.is_none()
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn module(&self) -> Option<&Rc<Module>> {
        self.module.as_ref()
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn module_index(&self) -> usize {
        self.module_idx
    }

    pub fn script_index(&self) -> usize {
        self.script
    }

    pub fn script(&self) -> Option<&Script> {
        self.module.as_ref()?.scripts().get(self.script)
    }

    pub fn code_ptr(&self) -> usize {
        self.code_ptr
    }

    pub fn stack(&self) -> &[Word] {
        &self.stack
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Local registers of the current frame.
    pub fn loc_regs(&self) -> &[Word] {
        &self.loc_regs[self.loc_reg_base.min(self.loc_regs.len())..]
    }

    pub fn print_buffer(&self) -> &[u8] {
        &self.print_buf
    }

    #[inline]
    pub fn push(&mut self, v: Word) {
        self.stack.push(v);
    }

    /// Pops the top of the stack. An empty stack reads as 0.
    #[inline]
    pub fn pop(&mut self) -> Word {
        self.stack.pop().unwrap_or(0)
    }

    pub fn stop(&mut self) {
        self.state = ThreadState::Stopped;
    }

    /// Forces the thread into Stopped and reports `ty` to the kill hook.
    pub(crate) fn kill(&mut self, env: &mut Environment, ty: KillType, data: Word) {
        self.state = ThreadState::Stopped;

        let info = KillInfo {
            ty,
            data,
            module: self.module.as_ref().map(|m| m.name().clone()).unwrap_or_default(),
            script: self.script().map(|s| s.name.clone()),
            code_ptr: self.code_ptr as Word,
        };
        log::warn!(
            "killed thread {} of {} script {}: {ty} ({data})",
            self.id,
            info.module,
            info.script.as_ref().map_or_else(|| "?".to_string(), |s| s.to_string())
        );
        if let Some(hook) = env.hooks.kill.as_mut() {
            hook(&info);
        }
    }

    /// Runs this thread for one tick.
    ///
    /// The thread must not be reachable through `env`; the scheduler leaves a
    /// marker in its place while it runs.
    pub(crate) fn exec(&mut self, env: &mut Environment) {
        let Some(module) = self.module.clone() else {
            self.state = ThreadState::Stopped;
            return;
        };
        let code = module.code();
        let limit = env.config.branch_limit;
        let mut branches: Word = 0;

        while self.state == ThreadState::Running && self.delay == 0 {
            if limit != 0 {
                if branches >= limit {
                    self.kill(env, KillType::BranchLimit, branches);
                    return;
                }
                branches += 1;
            }

            let ip = self.code_ptr;
            let Some(&word) = code.get(ip) else {
                self.kill(env, KillType::OutOfBounds, ip as Word);
                return;
            };
            let Some(op) = Code::from_u32(word) else {
                self.kill(env, KillType::UnknownCode, word);
                return;
            };
            let argc = op.arg_count();
            let Some(args) = code.get(ip + 1..ip + 1 + argc) else {
                self.kill(env, KillType::OutOfBounds, ip as Word);
                return;
            };
            self.code_ptr = ip + 1 + argc;

            if self.step(env, &module, op, args) == ExecOutcome::Yield {
                return;
            }
        }
    }

    fn step(&mut self, env: &mut Environment, module: &Module, op: Code, args: &[Word]) -> ExecOutcome {
        use Code::*;

        if let Some((level, action)) = var_op(op) {
            self.var_access(env, level, action, args[0]);
            return ExecOutcome::Step;
        }

        match op {
            Nop => {}
            Kill => {
                let ty = KillType::from_u32(args[0]).unwrap_or(KillType::None);
                self.kill(env, ty, args[1]);
            }
            Terminate => self.state = ThreadState::Stopped,
            Suspend => self.state = ThreadState::Paused,
            Restart => self.restart(module),
            Delay => self.delay = self.pop(),
            DelayLit => self.delay = args[0],
            WaitScrI => self.state = ThreadState::WaitScrI(self.pop() as SWord),
            WaitScrS => {
                let idx = self.pop();
                let name = env.strings.get(idx).map(|s| s.to_string_lossy()).unwrap_or_default();
                self.state = ThreadState::WaitScrS(name);
            }
            WaitTag => {
                let tag = self.pop();
                self.state = ThreadState::WaitTag { ty: args[0], tag };
            }

            PushLit => self.push(args[0]),
            Drop => {
                self.pop();
            }
            Copy => {
                let v = self.stack.last().copied().unwrap_or(0);
                self.push(v);
            }
            Swap => {
                let b = self.pop();
                let a = self.pop();
                self.push(b);
                self.push(a);
            }

            Add => self.binary(|a, b| a.wrapping_add(b)),
            Sub => self.binary(|a, b| a.wrapping_sub(b)),
            Mul => self.binary(|a, b| a.wrapping_mul(b)),
            Div => self.binary(|a, b| if b == 0 { 0 } else { a.wrapping_div(b) }),
            Mod => self.binary(|a, b| if b == 0 { 0 } else { a.wrapping_rem(b) }),
            MulX => self.binary(|a, b| ((a as i64 * b as i64) >> 16) as SWord),
            DivX => self.binary(|a, b| if b == 0 { 0 } else { (((a as i64) << 16) / b as i64) as SWord }),
            Neg => {
                let a = self.pop() as SWord;
                self.push(a.wrapping_neg() as Word);
            }
            BitAnd => self.binary(|a, b| a & b),
            BitIor => self.binary(|a, b| a | b),
            BitXor => self.binary(|a, b| a ^ b),
            BitNot => {
                let a = self.pop();
                self.push(!a);
            }
            ShL => self.binary(|a, b| a.wrapping_shl(b as u32 & 31)),
            ShR => self.binary(|a, b| a.wrapping_shr(b as u32 & 31)),
            CmpEQ => self.binary(|a, b| (a == b) as SWord),
            CmpNE => self.binary(|a, b| (a != b) as SWord),
            CmpLT => self.binary(|a, b| (a < b) as SWord),
            CmpLE => self.binary(|a, b| (a <= b) as SWord),
            CmpGT => self.binary(|a, b| (a > b) as SWord),
            CmpGE => self.binary(|a, b| (a >= b) as SWord),
            LogAnd => self.binary(|a, b| (a != 0 && b != 0) as SWord),
            LogOr => self.binary(|a, b| (a != 0 || b != 0) as SWord),
            LogNot => {
                let a = self.pop();
                self.push((a == 0) as Word);
            }

            Jump => self.code_ptr = args[0] as usize,
            JcndTru => {
                if self.pop() != 0 {
                    self.code_ptr = args[0] as usize;
                }
            }
            JcndNil => {
                if self.pop() == 0 {
                    self.code_ptr = args[0] as usize;
                }
            }
            JcndLit => {
                if self.stack.last() == Some(&args[0]) {
                    self.pop();
                    self.code_ptr = args[1] as usize;
                }
            }
            Call | CallNul => self.call(env, module, args[0], op == CallNul),
            Retn => self.ret(None),
            RetnVal => {
                let v = self.pop();
                self.ret(Some(v));
            }
            CallFunc => return self.call_func(env, args[0] as usize, args[1]),

            // register and array codes are handled by var_op above
            _ => {}
        }
        ExecOutcome::Step
    }

    fn binary(&mut self, f: impl FnOnce(SWord, SWord) -> SWord) {
        let b = self.pop() as SWord;
        let a = self.pop() as SWord;
        self.push(f(a, b) as Word);
    }

    fn restart(&mut self, module: &Module) {
        let Some(script) = module.scripts().get(self.script) else {
            self.state = ThreadState::Stopped;
            return;
        };
        self.reset_locals(script);
    }

    fn call(&mut self, env: &mut Environment, module: &Module, func_idx: Word, discard: bool) {
        let Some(func) = module.functions().get(func_idx as usize) else {
            self.kill(env, KillType::UnknownFunc, func_idx);
            return;
        };

        let reg_base = self.loc_regs.len();
        let arr_base = self.loc_arrs.len();
        let params = func.param_count as usize;

        if self.loc_regs.try_reserve(func.loc_reg_count as usize).is_err()
            || self.loc_arrs.try_reserve(func.loc_arr_count as usize).is_err()
        {
            self.kill(env, KillType::OutOfMemory, func_idx);
            return;
        }
        self.loc_regs.resize(reg_base + func.loc_reg_count as usize, 0);
        self.loc_arrs.resize(arr_base + func.loc_arr_count as usize, Array::new());
        for i in (0..params).rev() {
            let v = self.pop();
            self.loc_regs[reg_base + i] = v;
        }

        self.call_stack.push(CallFrame {
            ret: self.code_ptr,
            loc_reg_base: self.loc_reg_base,
            loc_arr_base: self.loc_arr_base,
            discard,
            func: func_idx,
        });
        self.loc_reg_base = reg_base;
        self.loc_arr_base = arr_base;
        self.code_ptr = func.entry as usize;
    }

    fn ret(&mut self, value: Option<Word>) {
        let Some(frame) = self.call_stack.pop() else {
            if let Some(v) = value {
                self.result = v;
            }
            self.state = ThreadState::Stopped;
            return;
        };

        self.loc_regs.truncate(self.loc_reg_base);
        self.loc_arrs.truncate(self.loc_arr_base);
        self.loc_reg_base = frame.loc_reg_base;
        self.loc_arr_base = frame.loc_arr_base;
        self.code_ptr = frame.ret;
        if !frame.discard {
            self.push(value.unwrap_or(0));
        }
    }

    fn call_func(&mut self, env: &mut Environment, argc: usize, func: Word) -> ExecOutcome {
        let argc = argc.min(MAX_FUNC_ARGS);
        let split = self.stack.len().saturating_sub(argc);
        let mut args = vec![0; argc - (self.stack.len() - split)];
        args.extend(self.stack.drain(split..));

        match env.call_func(self, func, &args) {
            None => {
                self.kill(env, KillType::UnknownFunc, func);
                ExecOutcome::Step
            }
            Some(true) => ExecOutcome::Yield,
            Some(false) => ExecOutcome::Step,
        }
    }

    fn var_access(&mut self, env: &mut Environment, level: VarLevel, action: VarAction, idx: Word) {
        match action {
            VarAction::PushReg => {
                let v = self.reg_slot(env, level, idx).map_or(0, |r| *r);
                self.push(v);
            }
            VarAction::DropReg => {
                let v = self.pop();
                if let Some(r) = self.reg_slot(env, level, idx) {
                    *r = v;
                }
            }
            VarAction::IncReg => {
                if let Some(r) = self.reg_slot(env, level, idx) {
                    *r = r.wrapping_add(1);
                }
            }
            VarAction::DecReg => {
                if let Some(r) = self.reg_slot(env, level, idx) {
                    *r = r.wrapping_sub(1);
                }
            }
            VarAction::PushArr => {
                let key = self.pop();
                let v = match level {
                    VarLevel::Loc => self.loc_arrs.get(self.loc_arr_base + idx as usize).map_or(0, |a| a.get(key)),
                    _ => env
                        .scopes
                        .vars(level, self.scope, self.module_idx)
                        .map_or(0, |vars| vars.arr_get(idx, key)),
                };
                self.push(v);
            }
            VarAction::DropArr => {
                let v = self.pop();
                let key = self.pop();
                match level {
                    VarLevel::Loc => {
                        if let Some(a) = self.loc_arrs.get_mut(self.loc_arr_base + idx as usize) {
                            a.set(key, v);
                        }
                    }
                    _ => {
                        if let Some(vars) = env.scopes.vars_mut(level, self.scope, self.module_idx) {
                            vars.arr_store(idx, key, v, &mut env.strings);
                        }
                    }
                }
            }
        }
    }

    fn reg_slot<'a>(&'a mut self, env: &'a mut Environment, level: VarLevel, idx: Word) -> Option<&'a mut Word> {
        match level {
            VarLevel::Loc => self.loc_regs.get_mut(self.loc_reg_base + idx as usize),
            _ => env.scopes.vars_mut(level, self.scope, self.module_idx)?.reg_mut(idx),
        }
    }

    pub(crate) fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        write_vln(w, self.id)?;
        write_vln(w, self.script)?;
        write_vln(w, self.code_ptr)?;

        write_vln(w, self.stack.len())?;
        for &v in &self.stack {
            write_vln(w, v)?;
        }

        write_vln(w, self.call_stack.len())?;
        for f in &self.call_stack {
            write_vln(w, f.ret)?;
            write_vln(w, f.loc_reg_base)?;
            write_vln(w, f.loc_arr_base)?;
            write_bool(w, f.discard)?;
            write_vln(w, f.func)?;
        }

        write_vln(w, self.loc_regs.len())?;
        for &v in &self.loc_regs {
            write_vln(w, v)?;
        }
        write_vln(w, self.loc_arrs.len())?;
        for a in &self.loc_arrs {
            a.write(w)?;
        }
        write_vln(w, self.loc_reg_base)?;
        write_vln(w, self.loc_arr_base)?;

        write_vln(w, self.result)?;
        write_vln(w, self.delay)?;
        self.state.write(w)?;
        self.info.write(w)?;
        write_string(w, &self.print_buf)?;

        write_vln(w, self.args.len())?;
        for &v in &self.args {
            write_vln(w, v)?;
        }
        Ok(())
    }

    pub(crate) fn read<R: Read + ?Sized>(
        r: &mut R,
        module: Rc<Module>,
        scope: ScopeId,
        module_idx: usize,
    ) -> Result<Self, ReadError> {
        let id = read_vln(r)?;
        let script = read_vln::<usize, _>(r)?;
        if script >= module.scripts().len() {
            return Err(ReadError::malformed(format!("thread {id} runs unknown script {script}")));
        }
        let code_ptr = read_vln(r)?;

        let mut stack = Vec::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            stack.push(read_vln(r)?);
        }

        let mut call_stack = Vec::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            call_stack.push(CallFrame {
                ret: read_vln(r)?,
                loc_reg_base: read_vln(r)?,
                loc_arr_base: read_vln(r)?,
                discard: read_bool(r)?,
                func: read_vln(r)?,
            });
        }

        let mut loc_regs = Vec::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            loc_regs.push(read_vln(r)?);
        }
        let mut loc_arrs = Vec::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            loc_arrs.push(Array::read(r)?);
        }
        let loc_reg_base = read_vln::<usize, _>(r)?;
        let loc_arr_base = read_vln::<usize, _>(r)?;
        if loc_reg_base > loc_regs.len() || loc_arr_base > loc_arrs.len() {
            return Err(ReadError::malformed(format!("thread {id} frame base out of range")));
        }

        Ok(Self {
            id,
            module: Some(module),
            scope,
            module_idx,
            script,
            code_ptr,
            stack,
            call_stack,
            loc_regs,
            loc_arrs,
            loc_reg_base,
            loc_arr_base,
            result: read_vln(r)?,
            delay: read_vln(r)?,
            state: ThreadState::read(r)?,
            info: ThreadInfo::read(r)?,
            print_buf: read_string(r)?,
            args: read_words(r)?,
            last_tick: 0,
        })
    }
}

fn read_words<R: Read + ?Sized>(r: &mut R) -> Result<Vec<Word>, ReadError> {
    let mut words = Vec::new();
    for _ in 0..read_vln::<usize, _>(r)? {
        words.push(read_vln(r)?);
    }
    Ok(words)
}

impl RefStrings for Thread {
    fn ref_strings(&self, strings: &mut StringTable) {
        for &v in self.stack.iter().chain(&self.loc_regs).chain(&self.args) {
            strings.mark(v);
        }
        strings.mark(self.result);
        for a in &self.loc_arrs {
            a.ref_strings(strings);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarAction {
    PushReg,
    DropReg,
    IncReg,
    DecReg,
    PushArr,
    DropArr,
}

fn var_op(op: Code) -> Option<(VarLevel, VarAction)> {
    use Code::*;
    use VarAction::*;

    let level = match op {
        PushLocReg | DropLocReg | IncLocReg | DecLocReg | PushLocArr | DropLocArr => VarLevel::Loc,
        PushModReg | DropModReg | IncModReg | DecModReg | PushModArr | DropModArr => VarLevel::Mod,
        PushHubReg | DropHubReg | IncHubReg | DecHubReg | PushHubArr | DropHubArr => VarLevel::Hub,
        PushGblReg | DropGblReg | IncGblReg | DecGblReg | PushGblArr | DropGblArr => VarLevel::Gbl,
        _ => return None,
    };
    let action = match op {
        PushLocReg | PushModReg | PushHubReg | PushGblReg => PushReg,
        DropLocReg | DropModReg | DropHubReg | DropGblReg => DropReg,
        IncLocReg | IncModReg | IncHubReg | IncGblReg => IncReg,
        DecLocReg | DecModReg | DecHubReg | DecGblReg => DecReg,
        PushLocArr | PushModArr | PushHubArr | PushGblArr => PushArr,
        _ => DropArr,
    };
    Some((level, action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn thread_state_serializes() {
        for state in [
            ThreadState::Running,
            ThreadState::Paused,
            ThreadState::WaitScrI(-4),
            ThreadState::WaitScrS("lift".to_string()),
            ThreadState::WaitTag { ty: 1, tag: 12 },
        ] {
            let mut out = Vec::new();
            state.write(&mut out).unwrap();
            assert_eq!(ThreadState::read(&mut Cursor::new(out)).unwrap(), state);
        }
    }

    #[test]
    fn var_ops_cover_every_level() {
        assert_eq!(var_op(Code::IncHubReg), Some((VarLevel::Hub, VarAction::IncReg)));
        assert_eq!(var_op(Code::DropGblArr), Some((VarLevel::Gbl, VarAction::DropArr)));
        assert_eq!(var_op(Code::PushLocArr), Some((VarLevel::Loc, VarAction::PushArr)));
        assert_eq!(var_op(Code::Add), None);
    }

    #[test]
    fn empty_stack_pops_zero() {
        let mut t = Thread::marker(1);
        assert_eq!(t.pop(), 0);
        t.push(3);
        assert_eq!(t.pop(), 3);
    }
}
