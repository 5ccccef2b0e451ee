//! The environment: root object of one VM instance.
//!
//! It owns the string table, the module registry, the scope tree, the code
//! and function tables and the host hooks, and drives scheduling through
//! [`Environment::exec`].

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::rc::Rc;

use strum::IntoEnumIterator;

use crate::array::Array;
use crate::code::{CodeData, CodeTable, FuncData, KillType};
use crate::config::VmConfig;
use crate::error::{Error, ReadError, Result};
use crate::func::BuiltinFunc;
use crate::module::{Module, ModuleName, ScriptName};
use crate::scope::{GlobalScope, HubScope, MapScope, ScopeId, Scopes};
use crate::string::{RefStrings, StringTable};
use crate::thread::{Thread, ThreadInfo, ThreadState};
use crate::{SWord, Word};

const DEFAULT_SEED: u32 = 0x2545_f491;

/// A host function bound to a `CallFunc` index at or above
/// [`VmConfig::func_base`]. Returns true to make the calling thread yield.
pub type HostFunc = Rc<dyn Fn(&mut Environment, &mut Thread, &[Word]) -> bool>;

/// Report handed to [`EnvHooks::kill`] when a thread is force-stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillInfo {
    pub ty: KillType,
    pub data: Word,
    pub module: ModuleName,
    pub script: Option<ScriptName>,
    pub code_ptr: Word,
}

/// Host overridable behaviour. Every hook is optional; an absent hook takes
/// the documented default.
#[derive(Default)]
pub struct EnvHooks {
    /// Bytes of a module requested by name. Without it only modules handed
    /// over with [`Environment::load_module_bytes`] can be used.
    pub load_module: Option<Box<dyn FnMut(&ModuleName) -> Result<Vec<u8>, ReadError>>>,
    /// Host name mapping; defaults to [`ModuleName::new`].
    pub resolve_module_name: Option<Box<dyn FnMut(&str) -> ModuleName>>,
    /// Whether a `WaitTag` is satisfied; defaults to true.
    pub check_tag: Option<Box<dyn FnMut(Word, Word) -> bool>>,
    /// `CheckLock(lock, door)`; defaults to true.
    pub check_lock: Option<Box<dyn FnMut(&ThreadInfo, Word, Word) -> bool>>,
    /// Receives a finished print buffer; defaults to the info log.
    pub print: Option<Box<dyn FnMut(&ThreadInfo, &[u8])>>,
    /// Appends a module array to a print buffer.
    pub print_array: Option<Box<dyn FnMut(&Array, &mut Vec<u8>)>>,
    pub kill: Option<Box<dyn FnMut(&KillInfo)>>,
    pub thread_start: Option<Box<dyn FnMut(&Thread)>>,
    pub thread_stop: Option<Box<dyn FnMut(&Thread)>>,
    /// Marks strings the host holds during a collection.
    pub ref_strings: Option<Box<dyn FnMut(&mut StringTable)>>,
    pub save_extra: Option<Box<dyn FnMut(&mut dyn Write) -> io::Result<()>>>,
    pub load_extra: Option<Box<dyn FnMut(&mut dyn Read) -> Result<(), ReadError>>>,
}

impl fmt::Debug for EnvHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvHooks")
            .field("load_module", &self.load_module.is_some())
            .field("resolve_module_name", &self.resolve_module_name.is_some())
            .field("check_tag", &self.check_tag.is_some())
            .field("check_lock", &self.check_lock.is_some())
            .field("print", &self.print.is_some())
            .field("print_array", &self.print_array.is_some())
            .field("kill", &self.kill.is_some())
            .field("thread_start", &self.thread_start.is_some())
            .field("thread_stop", &self.thread_stop.is_some())
            .field("ref_strings", &self.ref_strings.is_some())
            .field("save_extra", &self.save_extra.is_some())
            .field("load_extra", &self.load_extra.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOutcome {
    /// The thread at this index was reaped; the next one moved into it.
    Removed,
    Next,
    End,
}

pub struct Environment {
    pub(crate) config: VmConfig,
    pub hooks: EnvHooks,
    pub(crate) strings: StringTable,
    pub(crate) scopes: Scopes,
    pub(crate) modules: BTreeMap<ModuleName, Rc<Module>>,
    /// Bytes of modules handed over directly, reused when a saved state is
    /// loaded without a loader hook.
    pub(crate) sources: BTreeMap<ModuleName, Vec<u8>>,
    code_table: CodeTable,
    builtins: Vec<Option<BuiltinFunc>>,
    funcs: Vec<HostFunc>,
    pub(crate) rng: u32,
    pub(crate) in_exec: bool,
    /// Number of the current or most recent `exec()` call.
    pub(crate) tick: u64,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("strings", &self.strings.len())
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("funcs", &self.funcs.len())
            .field("in_exec", &self.in_exec)
            .finish()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}

impl Environment {
    pub fn new(config: VmConfig) -> Self {
        let mut builtins = vec![None; config.func_base as usize];
        for f in BuiltinFunc::iter() {
            if let Some(slot) = builtins.get_mut(f as usize) {
                *slot = Some(f);
            }
        }

        Self {
            scopes: Scopes::new(config.scope_reg_count, config.scope_arr_count),
            config,
            hooks: EnvHooks::default(),
            strings: StringTable::new(),
            modules: BTreeMap::new(),
            sources: BTreeMap::new(),
            code_table: CodeTable::standard(),
            builtins,
            funcs: Vec::new(),
            rng: DEFAULT_SEED,
            in_exec: false,
            tick: 0,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn branch_limit(&self) -> Word {
        self.config.branch_limit
    }

    pub fn set_branch_limit(&mut self, limit: Word) {
        self.config.branch_limit = limit;
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    pub fn code_table(&self) -> &CodeTable {
        &self.code_table
    }

    /// Table edits only affect modules loaded afterwards.
    pub fn code_table_mut(&mut self) -> &mut CodeTable {
        &mut self.code_table
    }

    /// See [`CodeTable::add_code_data`].
    pub fn add_code_data(&mut self, raw: Word, data: CodeData) -> bool {
        self.code_table.add_code_data(raw, data)
    }

    pub fn add_func_data(&mut self, raw: Word, data: FuncData) {
        self.code_table.add_func_data(raw, data);
    }

    /// Registers a host function and returns its `CallFunc` index.
    pub fn add_func(&mut self, func: HostFunc) -> Word {
        self.funcs.push(func);
        self.config.func_base + (self.funcs.len() - 1) as Word
    }

    /// Points built-in index `idx` at `func`, or unbinds it. Returns false
    /// when `idx` is not below `func_base`.
    pub fn map_builtin(&mut self, idx: Word, func: Option<BuiltinFunc>) -> bool {
        match self.builtins.get_mut(idx as usize) {
            Some(slot) => {
                *slot = func;
                true
            }
            None => false,
        }
    }

    /// Dispatches `CallFunc`. None when nothing is bound at `func`.
    pub(crate) fn call_func(&mut self, thread: &mut Thread, func: Word, args: &[Word]) -> Option<bool> {
        if func < self.config.func_base {
            let builtin = self.builtins.get(func as usize).copied().flatten()?;
            return Some(self.call_builtin(builtin, thread, args));
        }
        let host = self.funcs.get((func - self.config.func_base) as usize)?.clone();
        Some(host(self, thread, args))
    }

    pub fn set_random_seed(&mut self, seed: u32) {
        self.rng = if seed == 0 { DEFAULT_SEED } else { seed };
    }

    /// Uniform-ish value in `[min, max]` from the environment's xorshift state.
    pub fn random(&mut self, min: SWord, max: SWord) -> SWord {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;

        let span = (hi as i64 - lo as i64 + 1) as u64;
        (lo as i64 + (x as u64 % span) as i64) as SWord
    }

    /// Module name for a host string, through the resolve hook if set.
    pub fn module_name(&mut self, name: &str) -> ModuleName {
        match self.hooks.resolve_module_name.as_mut() {
            Some(resolve) => resolve(name),
            None => ModuleName::new(name),
        }
    }

    /// Returns the module registered under `name`, loading it through the
    /// loader hook on first use.
    pub fn get_module(&mut self, name: &ModuleName) -> Result<Rc<Module>> {
        if let Some(module) = self.modules.get(name) {
            return Ok(module.clone());
        }

        let bytes = match self.sources.get(name) {
            Some(bytes) => bytes.clone(),
            None => match self.hooks.load_module.as_mut() {
                Some(load) => load(name)?,
                None => return Err(ReadError::malformed(format!("no loader for module {name}")).into()),
            },
        };
        self.register_module(name.clone(), &bytes)
    }

    /// Registers a module from bytes the host already holds. A module of
    /// the same name that is already loaded is returned as is.
    pub fn load_module_bytes(&mut self, name: ModuleName, bytes: &[u8]) -> Result<Rc<Module>> {
        if let Some(module) = self.modules.get(&name) {
            return Ok(module.clone());
        }
        let module = self.register_module(name.clone(), bytes)?;
        self.sources.insert(name, bytes.to_vec());
        Ok(module)
    }

    fn register_module(&mut self, name: ModuleName, bytes: &[u8]) -> Result<Rc<Module>> {
        let module = Module::read_bytecode(
            name.clone(),
            bytes,
            &self.code_table,
            self.config.unknown_code,
            &mut self.strings,
        )?;
        let module = Rc::new(module);
        self.modules.insert(name, module.clone());
        Ok(module)
    }

    pub fn find_module(&self, name: &ModuleName) -> Option<&Rc<Module>> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &Rc<Module>> {
        self.modules.values()
    }

    /// Drops a module nothing else references. Returns false while a scope
    /// or the host still holds it.
    pub fn free_module(&mut self, name: &ModuleName) -> bool {
        let Some(module) = self.modules.get(name) else {
            return false;
        };
        if Rc::strong_count(module) > 1 {
            return false;
        }
        if let Some(module) = self.modules.remove(name) {
            module.release_strings(&mut self.strings);
        }
        self.sources.remove(name);
        log::debug!("freed module {name}");
        true
    }

    /// Global scope `id`, created on first use.
    pub fn global_scope(&mut self, id: Word) -> &mut GlobalScope {
        self.scopes.get_or_create_global(id)
    }

    pub fn hub_scope(&mut self, global: Word, hub: Word) -> &mut HubScope {
        self.scopes.get_or_create_hub(global, hub)
    }

    pub fn map_scope(&mut self, id: ScopeId) -> &mut MapScope {
        self.scopes.get_or_create_map(id)
    }

    pub fn find_global_scope(&self, id: Word) -> Option<&GlobalScope> {
        self.scopes.global(id)
    }

    pub fn find_hub_scope(&self, global: Word, hub: Word) -> Option<&HubScope> {
        self.scopes.hub(global, hub)
    }

    pub fn find_map_scope(&self, id: ScopeId) -> Option<&MapScope> {
        self.scopes.map(id)
    }

    pub fn find_map_scope_mut(&mut self, id: ScopeId) -> Option<&mut MapScope> {
        self.scopes.map_mut(id)
    }

    /// Global scopes in id order.
    pub fn global_scopes(&self) -> impl Iterator<Item = &GlobalScope> {
        self.scopes.globals.values()
    }

    /// Removes a global scope with everything below it. Its threads stop
    /// without running again.
    pub fn free_global_scope(&mut self, id: Word) -> bool {
        let Some(mut global) = self.scopes.globals.remove(&id) else {
            return false;
        };
        global.release(&mut self.strings);
        self.stop_threads(global.into_threads());
        log::debug!("freed global scope {id}");
        true
    }

    pub fn free_hub_scope(&mut self, global: Word, hub: Word) -> bool {
        let Some(mut scope) = self.scopes.global_mut(global).and_then(|g| g.remove_hub(hub)) else {
            return false;
        };
        scope.release(&mut self.strings);
        self.stop_threads(scope.into_threads());
        log::debug!("freed hub scope {global}:{hub}");
        true
    }

    pub fn free_map_scope(&mut self, id: ScopeId) -> bool {
        let Some(mut map) = self.scopes.hub_mut(id.global, id.hub).and_then(|h| h.remove_map(id.map)) else {
            return false;
        };
        map.release(&mut self.strings);
        self.stop_threads(map.into_threads());
        log::debug!("freed map scope {id:?}");
        true
    }

    fn stop_threads(&mut self, threads: impl Iterator<Item = Thread>) {
        for mut t in threads.filter(|t| !t.is_marker()) {
            t.state = ThreadState::Stopped;
            if let Some(hook) = self.hooks.thread_stop.as_mut() {
                hook(&t);
            }
        }
    }

    /// True while any thread in any scope can still run.
    pub fn has_active_thread(&self) -> bool {
        self.scopes
            .globals
            .values()
            .flat_map(|g| g.hubs())
            .flat_map(|h| h.maps())
            .any(|m| m.has_active_thread())
    }

    /// Frees every string that is neither locked nor reachable from a module,
    /// a scope, a thread or the host's `ref_strings` hook. Returns the number
    /// of strings freed.
    pub fn collect_strings(&mut self) -> Result<usize> {
        if self.in_exec {
            return Err(Error::Busy);
        }

        self.strings.collect_begin();
        for m in self.modules.values() {
            m.ref_strings(&mut self.strings);
        }
        for g in self.scopes.globals.values() {
            g.ref_strings(&mut self.strings);
        }
        if let Some(hook) = self.hooks.ref_strings.as_mut() {
            hook(&mut self.strings);
        }
        let freed = self.strings.collect_end();
        log::debug!("string collection freed {freed} strings");
        Ok(freed)
    }

    /// Runs one tick: every runnable thread of every active map scope gets
    /// one turn, in scope id order and then creation order.
    pub fn exec(&mut self) {
        if self.in_exec {
            log::warn!("nested exec ignored");
            return;
        }
        self.in_exec = true;
        self.tick = self.tick.wrapping_add(1);
        for id in self.scopes.map_ids() {
            if self.scopes.is_active(id) {
                self.exec_map(id);
            }
        }
        self.in_exec = false;
    }

    fn exec_map(&mut self, id: ScopeId) {
        let mut module_idx = 0;
        while self.scopes.map(id).is_some_and(|m| module_idx < m.module_scopes.len()) {
            let mut thread_idx = 0;
            loop {
                match self.exec_slot(id, module_idx, thread_idx) {
                    SlotOutcome::Removed => {}
                    SlotOutcome::Next => thread_idx += 1,
                    SlotOutcome::End => break,
                }
            }
            module_idx += 1;
        }
    }

    fn thread_at_mut(&mut self, id: ScopeId, module_idx: usize, thread_idx: usize) -> Option<&mut Thread> {
        self.scopes.module_scope_mut(id, module_idx)?.threads.get_mut(thread_idx)
    }

    fn exec_slot(&mut self, id: ScopeId, module_idx: usize, thread_idx: usize) -> SlotOutcome {
        // a host function may deactivate or free the scope mid tick
        if !self.scopes.is_active(id) {
            return SlotOutcome::End;
        }
        let tick = self.tick;
        let Some((state, last_tick)) = self
            .thread_at_mut(id, module_idx, thread_idx)
            .map(|t| (t.state.clone(), t.last_tick))
        else {
            return SlotOutcome::End;
        };

        let runnable = match &state {
            ThreadState::Stopped | ThreadState::Inactive => {
                self.reap_thread(id, module_idx, thread_idx);
                return SlotOutcome::Removed;
            }
            ThreadState::Paused => false,
            ThreadState::Running => true,
            ThreadState::WaitScrI(n) => !self.scope_script_active(id, &ScriptName::Num(*n)),
            ThreadState::WaitScrS(s) => !self.scope_script_active(id, &ScriptName::Name(s.clone())),
            ThreadState::WaitTag { ty, tag } => match self.hooks.check_tag.as_mut() {
                Some(check) => check(*ty, *tag),
                None => true,
            },
        };
        // one turn per tick, even for threads a script already ran this tick
        if !runnable || last_tick == tick {
            return SlotOutcome::Next;
        }

        let Some(thread) = self.thread_at_mut(id, module_idx, thread_idx) else {
            return SlotOutcome::End;
        };
        thread.last_tick = tick;
        if state != ThreadState::Running {
            log::trace!("thread {} resumes after {state:?}", thread.id());
            thread.state = ThreadState::Running;
        }
        if thread.delay > 0 {
            thread.delay -= 1;
            if thread.delay > 0 {
                return SlotOutcome::Next;
            }
        }

        let tid = thread.id();
        let mut running = mem::replace(thread, Thread::marker(tid));
        running.exec(self);
        self.reattach(id, module_idx, running);
        SlotOutcome::Next
    }

    fn scope_script_active(&self, id: ScopeId, name: &ScriptName) -> bool {
        self.scopes.map(id).is_some_and(|m| m.script_active(name))
    }

    fn reap_thread(&mut self, id: ScopeId, module_idx: usize, thread_idx: usize) {
        let Some(map) = self.scopes.map_mut(id) else {
            return;
        };
        let Some(ms) = map.module_scopes.get_mut(module_idx) else {
            return;
        };
        if thread_idx >= ms.threads.len() {
            return;
        }
        let thread = ms.threads.remove(thread_idx);
        map.release_slot(&thread);
        log::trace!("reaped thread {} in {id:?}", thread.id());
        if let Some(hook) = self.hooks.thread_stop.as_mut() {
            hook(&thread);
        }
    }

    /// Puts a detached thread back in place of its marker. Stop and pause
    /// requests made against the marker while it ran carry over.
    pub(crate) fn reattach(&mut self, id: ScopeId, module_idx: usize, mut thread: Thread) {
        let marker = self
            .scopes
            .module_scope_mut(id, module_idx)
            .and_then(|ms| ms.thread_mut(thread.id()))
            .filter(|t| t.is_marker());

        match marker {
            Some(marker) => {
                match marker.state {
                    ThreadState::Stopped => thread.state = ThreadState::Stopped,
                    ThreadState::Paused if !thread.state.is_finished() => thread.state = ThreadState::Paused,
                    _ => {}
                }
                *marker = thread;
            }
            None => {
                log::debug!("scope {id:?} went away while thread {} ran", thread.id());
                thread.state = ThreadState::Stopped;
                if let Some(hook) = self.hooks.thread_stop.as_mut() {
                    hook(&thread);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Assembler, ScriptDecl};
    use crate::code::Code;
    use crate::module::ScriptType;

    fn open_module() -> Vec<u8> {
        let mut asm = Assembler::new();
        asm.module_vars(1, 0);
        asm.script(ScriptDecl::numbered(1).ty(ScriptType::OPEN));
        asm.op(Code::PushLit, &[3]).op(Code::DropModReg, &[0]).op(Code::Terminate, &[]);
        asm.finish().unwrap()
    }

    #[test]
    fn builtin_table_starts_identity_mapped() {
        let mut env = Environment::default();
        assert!(env.map_builtin(BuiltinFunc::Random as Word, None));
        assert!(!env.map_builtin(env.config().func_base, Some(BuiltinFunc::Nop)));
    }

    #[test]
    fn host_funcs_start_at_func_base() {
        let mut env = Environment::default();
        let noop: HostFunc = Rc::new(|_: &mut Environment, _: &mut Thread, _: &[Word]| false);
        let first = env.add_func(noop.clone());
        let second = env.add_func(noop);
        assert_eq!(first, env.config().func_base);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn random_stays_in_range() {
        let mut env = Environment::default();
        env.set_random_seed(7);
        for _ in 0..1000 {
            let v = env.random(-3, 3);
            assert!((-3..=3).contains(&v));
        }
        assert_eq!(env.random(5, 5), 5);
    }

    #[test]
    fn module_is_freed_only_when_unreferenced() {
        let mut env = Environment::default();
        let name = ModuleName::new("open");
        let module = env.load_module_bytes(name.clone(), &open_module()).unwrap();
        assert!(!env.free_module(&name));
        drop(module);
        assert!(env.free_module(&name));
        assert!(env.find_module(&name).is_none());
    }

    #[test]
    fn missing_loader_is_an_error() {
        let mut env = Environment::default();
        assert!(env.get_module(&ModuleName::new("nowhere")).is_err());
    }
}
