//! The Global → Hub → Map → Module scope tree.
//!
//! Every level is keyed by an integer id and created lazily. Global and hub
//! scopes hold fixed-size register and array files; a map scope holds the
//! modules registered for that map, one [`ModuleScope`] per module, and the
//! per-script slots used to start, stop and wait on scripts by name.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::rc::Rc;

use crate::array::Array;
use crate::error::{Error, ReadError};
use crate::module::{Module, ModuleName, ScriptName};
use crate::serial::{read_bool, read_vln, write_bool, write_vln};
use crate::string::{RefStrings, StringTable};
use crate::thread::{Thread, ThreadId};
use crate::Word;

/// Address of a map scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId {
    pub global: Word,
    pub hub: Word,
    pub map: Word,
}

impl ScopeId {
    pub const fn new(global: Word, hub: Word, map: Word) -> Self {
        Self { global, hub, map }
    }
}

/// Registers and arrays of one scope level.
///
/// Out-of-range reads return 0 and out-of-range writes are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeVars {
    regs: Vec<Word>,
    arrs: Vec<Array>,
    str_arrs: BTreeSet<Word>,
}

impl ScopeVars {
    pub fn new(reg_count: Word, arr_count: Word) -> Self {
        Self {
            regs: vec![0; reg_count as usize],
            arrs: vec![Array::new(); arr_count as usize],
            str_arrs: BTreeSet::new(),
        }
    }

    /// Like [`ScopeVars::new`], but a size that cannot be allocated is an
    /// error instead of an abort. Used for sizes declared by bytecode.
    pub fn try_new(reg_count: Word, arr_count: Word) -> Result<Self, Error> {
        let mut regs = Vec::new();
        regs.try_reserve_exact(reg_count as usize)?;
        regs.resize(reg_count as usize, 0);

        let mut arrs = Vec::new();
        arrs.try_reserve_exact(arr_count as usize)?;
        arrs.resize(arr_count as usize, Array::new());

        Ok(Self {
            regs,
            arrs,
            str_arrs: BTreeSet::new(),
        })
    }

    pub fn reg_count(&self) -> usize {
        self.regs.len()
    }

    pub fn arr_count(&self) -> usize {
        self.arrs.len()
    }

    #[inline]
    pub fn reg(&self, idx: Word) -> Word {
        self.regs.get(idx as usize).copied().unwrap_or(0)
    }

    pub fn set_reg(&mut self, idx: Word, value: Word) {
        if let Some(r) = self.regs.get_mut(idx as usize) {
            *r = value;
        }
    }

    pub fn reg_mut(&mut self, idx: Word) -> Option<&mut Word> {
        self.regs.get_mut(idx as usize)
    }

    pub fn arr(&self, idx: Word) -> Option<&Array> {
        self.arrs.get(idx as usize)
    }

    pub fn arr_mut(&mut self, idx: Word) -> Option<&mut Array> {
        self.arrs.get_mut(idx as usize)
    }

    /// Reads `arr[key]`, 0 when either index is absent.
    pub fn arr_get(&self, idx: Word, key: Word) -> Word {
        self.arr(idx).map_or(0, |a| a.get(key))
    }

    /// Declares whether array `idx` holds string indices.
    pub fn set_string_array(&mut self, idx: Word, is_string: bool) {
        if is_string {
            self.str_arrs.insert(idx);
        } else {
            self.str_arrs.remove(&idx);
        }
    }

    pub fn is_string_array(&self, idx: Word) -> bool {
        self.str_arrs.contains(&idx)
    }

    /// Script-side store. String arrays keep their lock counts in step.
    pub fn arr_store(&mut self, idx: Word, key: Word, value: Word, strings: &mut StringTable) {
        let is_string = self.is_string_array(idx);
        if let Some(arr) = self.arrs.get_mut(idx as usize) {
            if is_string {
                arr.set_str(key, value, strings);
            } else {
                arr.set(key, value);
            }
        }
    }

    /// Drops every lock held by string arrays.
    pub fn release(&mut self, strings: &mut StringTable) {
        for &idx in &self.str_arrs {
            if let Some(arr) = self.arrs.get_mut(idx as usize) {
                arr.clear_str(strings);
            }
        }
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        write_vln(w, self.regs.len())?;
        for &r in &self.regs {
            write_vln(w, r)?;
        }
        write_vln(w, self.arrs.len())?;
        for a in &self.arrs {
            a.write(w)?;
        }
        write_vln(w, self.str_arrs.len())?;
        for &idx in &self.str_arrs {
            write_vln(w, idx)?;
        }
        Ok(())
    }

    pub fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self, ReadError> {
        let mut regs = Vec::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            regs.push(read_vln(r)?);
        }
        let mut arrs = Vec::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            arrs.push(Array::read(r)?);
        }
        let mut str_arrs = BTreeSet::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            str_arrs.insert(read_vln(r)?);
        }
        Ok(Self { regs, arrs, str_arrs })
    }
}

impl RefStrings for ScopeVars {
    fn ref_strings(&self, strings: &mut StringTable) {
        for &r in &self.regs {
            strings.mark(r);
        }
        for a in &self.arrs {
            a.ref_strings(strings);
        }
    }
}

/// One module's variables and running threads inside a map.
#[derive(Debug)]
pub struct ModuleScope {
    module: Rc<Module>,
    pub vars: ScopeVars,
    pub(crate) threads: Vec<Thread>,
}

impl ModuleScope {
    fn new(module: Rc<Module>) -> Result<Self, Error> {
        let vars = ScopeVars::try_new(module.reg_count(), module.arr_count())?;
        Ok(Self {
            module,
            vars,
            threads: Vec::new(),
        })
    }

    pub fn module(&self) -> &Rc<Module> {
        &self.module
    }

    /// Threads in creation order.
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id() == id)
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id() == id)
    }
}

impl RefStrings for ModuleScope {
    fn ref_strings(&self, strings: &mut StringTable) {
        self.vars.ref_strings(strings);
        for t in &self.threads {
            t.ref_strings(strings);
        }
    }
}

/// Where a script lives and which thread currently owns its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptSlot {
    pub(crate) module: usize,
    pub(crate) script: usize,
    pub(crate) thread: Option<ThreadId>,
}

#[derive(Debug)]
pub struct MapScope {
    id: Word,
    pub active: bool,
    pub(crate) module_scopes: Vec<ModuleScope>,
    pub(crate) slots: BTreeMap<ScriptName, ScriptSlot>,
    next_thread_id: ThreadId,
}

impl MapScope {
    fn new(id: Word) -> Self {
        Self {
            id,
            active: true,
            module_scopes: Vec::new(),
            slots: BTreeMap::new(),
            next_thread_id: 1,
        }
    }

    pub fn id(&self) -> Word {
        self.id
    }

    pub fn modules(&self) -> impl Iterator<Item = &Rc<Module>> {
        self.module_scopes.iter().map(|m| &m.module)
    }

    pub fn module_scopes(&self) -> &[ModuleScope] {
        &self.module_scopes
    }

    pub fn module_scope(&self, idx: usize) -> Option<&ModuleScope> {
        self.module_scopes.get(idx)
    }

    pub fn module_scope_mut(&mut self, idx: usize) -> Option<&mut ModuleScope> {
        self.module_scopes.get_mut(idx)
    }

    pub fn find_module_scope(&self, name: &ModuleName) -> Option<usize> {
        self.module_scopes.iter().position(|m| m.module.name() == name)
    }

    /// Registers a module. Returns its module-scope index if it was new.
    ///
    /// Script names already claimed by an earlier module stay with it.
    pub(crate) fn add_module(&mut self, module: Rc<Module>) -> Result<Option<usize>, Error> {
        if self.find_module_scope(module.name()).is_some() {
            return Ok(None);
        }
        let scope = ModuleScope::new(module.clone())?;
        self.module_scopes.try_reserve(1)?;
        let idx = self.module_scopes.len();
        for (script, s) in module.scripts().iter().enumerate() {
            self.slots.entry(s.name.clone()).or_insert(ScriptSlot {
                module: idx,
                script,
                thread: None,
            });
        }
        self.module_scopes.push(scope);
        Ok(Some(idx))
    }

    pub(crate) fn alloc_thread_id(&mut self) -> ThreadId {
        let id = self.next_thread_id;
        self.next_thread_id = self.next_thread_id.wrapping_add(1).max(1);
        id
    }

    pub(crate) fn slot(&self, name: &ScriptName) -> Option<&ScriptSlot> {
        self.slots.get(name)
    }

    /// The thread currently holding `name`, with its module-scope index.
    pub fn script_thread(&self, name: &ScriptName) -> Option<&Thread> {
        let slot = self.slots.get(name)?;
        self.module_scopes.get(slot.module)?.thread(slot.thread?)
    }

    pub(crate) fn script_thread_mut(&mut self, name: &ScriptName) -> Option<&mut Thread> {
        let slot = self.slots.get(name)?;
        let id = slot.thread?;
        self.module_scopes.get_mut(slot.module)?.thread_mut(id)
    }

    /// A script is active while its owning thread has not stopped.
    /// Unknown scripts are never active.
    pub fn script_active(&self, name: &ScriptName) -> bool {
        self.script_thread(name)
            .is_some_and(|t| !t.state.is_finished())
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.module_scopes.iter().flat_map(|m| m.threads.iter())
    }

    pub fn has_active_thread(&self) -> bool {
        self.threads()
            .any(|t| !t.state.is_finished())
    }

    /// Frees the slot `thread` holds, if any.
    pub(crate) fn release_slot(&mut self, thread: &Thread) {
        let Some(name) = thread.script().map(|s| s.name.clone()) else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(&name) {
            if slot.thread == Some(thread.id()) {
                slot.thread = None;
            }
        }
    }

    pub(crate) fn release(&mut self, strings: &mut StringTable) {
        for m in &mut self.module_scopes {
            m.vars.release(strings);
        }
    }

    pub(crate) fn write<W: Write + ?Sized>(&self, w: &mut W, module_index: &dyn Fn(&ModuleName) -> usize) -> io::Result<()> {
        write_vln(w, self.id)?;
        write_bool(w, self.active)?;
        write_vln(w, self.next_thread_id)?;

        write_vln(w, self.module_scopes.len())?;
        for m in &self.module_scopes {
            write_vln(w, module_index(m.module.name()))?;
            m.vars.write(w)?;
            write_vln(w, m.threads.len())?;
            for t in &m.threads {
                t.write(w)?;
            }
        }

        write_vln(w, self.slots.len())?;
        for (name, slot) in &self.slots {
            name.write(w)?;
            write_vln(w, slot.module)?;
            write_vln(w, slot.script)?;
            write_bool(w, slot.thread.is_some())?;
            write_vln(w, slot.thread.unwrap_or(0))?;
        }
        Ok(())
    }

    pub(crate) fn read<R: Read + ?Sized>(r: &mut R, global: Word, hub: Word, modules: &[Rc<Module>]) -> Result<Self, ReadError> {
        let id = read_vln(r)?;
        let mut map = MapScope::new(id);
        map.active = read_bool(r)?;
        map.next_thread_id = read_vln(r)?;
        let scope = ScopeId::new(global, hub, id);

        for module_idx in 0..read_vln::<usize, _>(r)? {
            let saved = read_vln::<usize, _>(r)?;
            let module = modules
                .get(saved)
                .cloned()
                .ok_or_else(|| ReadError::malformed(format!("module index {saved} out of range")))?;
            let mut ms = ModuleScope {
                module,
                vars: ScopeVars::read(r)?,
                threads: Vec::new(),
            };
            for _ in 0..read_vln::<usize, _>(r)? {
                let t = Thread::read(r, ms.module.clone(), scope, module_idx)?;
                ms.threads.push(t);
            }
            map.module_scopes.push(ms);
        }

        for _ in 0..read_vln::<usize, _>(r)? {
            let name = ScriptName::read(r)?;
            let module: usize = read_vln(r)?;
            let script = read_vln(r)?;
            let has_thread = read_bool(r)?;
            let thread = read_vln(r)?;
            if map.module_scopes.get(module).map_or(true, |m| script >= m.module.scripts().len()) {
                return Err(ReadError::malformed(format!("script slot {name} out of range")));
            }
            map.slots.insert(
                name,
                ScriptSlot {
                    module,
                    script,
                    thread: has_thread.then_some(thread),
                },
            );
        }
        Ok(map)
    }
}

impl RefStrings for MapScope {
    fn ref_strings(&self, strings: &mut StringTable) {
        for m in &self.module_scopes {
            m.ref_strings(strings);
        }
    }
}

#[derive(Debug)]
pub struct HubScope {
    id: Word,
    pub active: bool,
    pub vars: ScopeVars,
    maps: BTreeMap<Word, MapScope>,
}

impl HubScope {
    fn new(id: Word, reg_count: Word, arr_count: Word) -> Self {
        Self {
            id,
            active: true,
            vars: ScopeVars::new(reg_count, arr_count),
            maps: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Word {
        self.id
    }

    pub fn map(&self, id: Word) -> Option<&MapScope> {
        self.maps.get(&id)
    }

    pub fn map_mut(&mut self, id: Word) -> Option<&mut MapScope> {
        self.maps.get_mut(&id)
    }

    /// Map scopes in id order.
    pub fn maps(&self) -> impl Iterator<Item = &MapScope> {
        self.maps.values()
    }

    pub(crate) fn get_or_create_map(&mut self, id: Word) -> &mut MapScope {
        self.maps.entry(id).or_insert_with(|| {
            log::debug!("creating map scope {id}");
            MapScope::new(id)
        })
    }

    pub(crate) fn remove_map(&mut self, id: Word) -> Option<MapScope> {
        self.maps.remove(&id)
    }

    pub(crate) fn release(&mut self, strings: &mut StringTable) {
        self.vars.release(strings);
        for m in self.maps.values_mut() {
            m.release(strings);
        }
    }

    pub(crate) fn into_threads(self) -> impl Iterator<Item = Thread> {
        self.maps.into_values().flat_map(MapScope::into_threads)
    }

    pub(crate) fn write<W: Write + ?Sized>(&self, w: &mut W, module_index: &dyn Fn(&ModuleName) -> usize) -> io::Result<()> {
        write_vln(w, self.id)?;
        write_bool(w, self.active)?;
        self.vars.write(w)?;
        write_vln(w, self.maps.len())?;
        for m in self.maps.values() {
            m.write(w, module_index)?;
        }
        Ok(())
    }

    pub(crate) fn read<R: Read + ?Sized>(r: &mut R, global: Word, modules: &[Rc<Module>]) -> Result<Self, ReadError> {
        let id = read_vln(r)?;
        let active = read_bool(r)?;
        let vars = ScopeVars::read(r)?;
        let mut maps = BTreeMap::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            let map = MapScope::read(r, global, id, modules)?;
            maps.insert(map.id, map);
        }
        Ok(Self { id, active, vars, maps })
    }
}

impl MapScope {
    pub(crate) fn into_threads(self) -> impl Iterator<Item = Thread> {
        self.module_scopes.into_iter().flat_map(|m| m.threads.into_iter())
    }
}

impl RefStrings for HubScope {
    fn ref_strings(&self, strings: &mut StringTable) {
        self.vars.ref_strings(strings);
        for m in self.maps.values() {
            m.ref_strings(strings);
        }
    }
}

#[derive(Debug)]
pub struct GlobalScope {
    id: Word,
    pub active: bool,
    pub vars: ScopeVars,
    hubs: BTreeMap<Word, HubScope>,
}

impl GlobalScope {
    fn new(id: Word, reg_count: Word, arr_count: Word) -> Self {
        Self {
            id,
            active: true,
            vars: ScopeVars::new(reg_count, arr_count),
            hubs: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Word {
        self.id
    }

    pub fn hub(&self, id: Word) -> Option<&HubScope> {
        self.hubs.get(&id)
    }

    pub fn hub_mut(&mut self, id: Word) -> Option<&mut HubScope> {
        self.hubs.get_mut(&id)
    }

    /// Hub scopes in id order.
    pub fn hubs(&self) -> impl Iterator<Item = &HubScope> {
        self.hubs.values()
    }

    pub(crate) fn get_or_create_hub(&mut self, id: Word, reg_count: Word, arr_count: Word) -> &mut HubScope {
        self.hubs.entry(id).or_insert_with(|| {
            log::debug!("creating hub scope {id}");
            HubScope::new(id, reg_count, arr_count)
        })
    }

    pub(crate) fn remove_hub(&mut self, id: Word) -> Option<HubScope> {
        self.hubs.remove(&id)
    }

    pub(crate) fn release(&mut self, strings: &mut StringTable) {
        self.vars.release(strings);
        for h in self.hubs.values_mut() {
            h.release(strings);
        }
    }

    pub(crate) fn into_threads(self) -> impl Iterator<Item = Thread> {
        self.hubs.into_values().flat_map(HubScope::into_threads)
    }

    pub(crate) fn write<W: Write + ?Sized>(&self, w: &mut W, module_index: &dyn Fn(&ModuleName) -> usize) -> io::Result<()> {
        write_vln(w, self.id)?;
        write_bool(w, self.active)?;
        self.vars.write(w)?;
        write_vln(w, self.hubs.len())?;
        for h in self.hubs.values() {
            h.write(w, module_index)?;
        }
        Ok(())
    }

    pub(crate) fn read<R: Read + ?Sized>(r: &mut R, modules: &[Rc<Module>]) -> Result<Self, ReadError> {
        let id = read_vln(r)?;
        let active = read_bool(r)?;
        let vars = ScopeVars::read(r)?;
        let mut hubs = BTreeMap::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            let hub = HubScope::read(r, id, modules)?;
            hubs.insert(hub.id, hub);
        }
        Ok(Self { id, active, vars, hubs })
    }
}

impl RefStrings for GlobalScope {
    fn ref_strings(&self, strings: &mut StringTable) {
        self.vars.ref_strings(strings);
        for h in self.hubs.values() {
            h.ref_strings(strings);
        }
    }
}

/// Which register file an instruction addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarLevel {
    Loc,
    Mod,
    Hub,
    Gbl,
}

/// Root of the scope tree, owned by the environment.
#[derive(Debug, Default)]
pub(crate) struct Scopes {
    pub(crate) globals: BTreeMap<Word, GlobalScope>,
    reg_count: Word,
    arr_count: Word,
}

impl Scopes {
    pub(crate) fn new(reg_count: Word, arr_count: Word) -> Self {
        Self {
            globals: BTreeMap::new(),
            reg_count,
            arr_count,
        }
    }

    pub(crate) fn global(&self, id: Word) -> Option<&GlobalScope> {
        self.globals.get(&id)
    }

    pub(crate) fn global_mut(&mut self, id: Word) -> Option<&mut GlobalScope> {
        self.globals.get_mut(&id)
    }

    pub(crate) fn get_or_create_global(&mut self, id: Word) -> &mut GlobalScope {
        let (regs, arrs) = (self.reg_count, self.arr_count);
        self.globals.entry(id).or_insert_with(|| {
            log::debug!("creating global scope {id}");
            GlobalScope::new(id, regs, arrs)
        })
    }

    pub(crate) fn get_or_create_hub(&mut self, global: Word, hub: Word) -> &mut HubScope {
        let (regs, arrs) = (self.reg_count, self.arr_count);
        self.get_or_create_global(global).get_or_create_hub(hub, regs, arrs)
    }

    pub(crate) fn get_or_create_map(&mut self, id: ScopeId) -> &mut MapScope {
        self.get_or_create_hub(id.global, id.hub).get_or_create_map(id.map)
    }

    pub(crate) fn hub(&self, global: Word, hub: Word) -> Option<&HubScope> {
        self.global(global)?.hub(hub)
    }

    pub(crate) fn hub_mut(&mut self, global: Word, hub: Word) -> Option<&mut HubScope> {
        self.global_mut(global)?.hub_mut(hub)
    }

    pub(crate) fn map(&self, id: ScopeId) -> Option<&MapScope> {
        self.hub(id.global, id.hub)?.map(id.map)
    }

    pub(crate) fn map_mut(&mut self, id: ScopeId) -> Option<&mut MapScope> {
        self.hub_mut(id.global, id.hub)?.map_mut(id.map)
    }

    pub(crate) fn module_scope_mut(&mut self, id: ScopeId, module: usize) -> Option<&mut ModuleScope> {
        self.map_mut(id)?.module_scopes.get_mut(module)
    }

    /// Variables visible at `level` from module `module` of map `id`.
    /// Local variables live in the thread, so `Loc` has none here.
    pub(crate) fn vars(&self, level: VarLevel, id: ScopeId, module: usize) -> Option<&ScopeVars> {
        match level {
            VarLevel::Loc => None,
            VarLevel::Mod => Some(&self.map(id)?.module_scopes.get(module)?.vars),
            VarLevel::Hub => Some(&self.hub(id.global, id.hub)?.vars),
            VarLevel::Gbl => Some(&self.global(id.global)?.vars),
        }
    }

    pub(crate) fn vars_mut(&mut self, level: VarLevel, id: ScopeId, module: usize) -> Option<&mut ScopeVars> {
        match level {
            VarLevel::Loc => None,
            VarLevel::Mod => Some(&mut self.module_scope_mut(id, module)?.vars),
            VarLevel::Hub => Some(&mut self.hub_mut(id.global, id.hub)?.vars),
            VarLevel::Gbl => Some(&mut self.global_mut(id.global)?.vars),
        }
    }

    /// True when the map and both of its ancestors are active.
    pub(crate) fn is_active(&self, id: ScopeId) -> bool {
        let Some(global) = self.global(id.global) else {
            return false;
        };
        let Some(hub) = global.hub(id.hub) else {
            return false;
        };
        global.active && hub.active && hub.map(id.map).is_some_and(|m| m.active)
    }

    /// Every map scope address in scheduling order.
    pub(crate) fn map_ids(&self) -> Vec<ScopeId> {
        let mut ids = Vec::new();
        for g in self.globals.values() {
            for h in g.hubs.values() {
                for m in h.maps.values() {
                    ids.push(ScopeId::new(g.id, h.id, m.id));
                }
            }
        }
        ids
    }

    pub(crate) fn clear(&mut self) {
        self.globals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_vars_ignore_out_of_range() {
        let mut vars = ScopeVars::new(2, 1);
        vars.set_reg(1, 9);
        vars.set_reg(5, 9);
        assert_eq!(vars.reg(1), 9);
        assert_eq!(vars.reg(5), 0);
        assert_eq!(vars.arr_get(3, 0), 0);
    }

    #[test]
    fn string_arrays_lock_on_store() {
        let mut strings = StringTable::new();
        let s = strings.intern(b"name");
        let mut vars = ScopeVars::new(0, 2);
        vars.set_string_array(1, true);

        vars.arr_store(0, 0, s, &mut strings);
        assert_eq!(strings.get(s).unwrap().lock_count(), 0);
        vars.arr_store(1, 0, s, &mut strings);
        assert_eq!(strings.get(s).unwrap().lock_count(), 1);

        vars.release(&mut strings);
        assert_eq!(strings.get(s).unwrap().lock_count(), 0);
    }

    #[test]
    fn children_are_created_once_per_id() {
        let mut scopes = Scopes::new(4, 4);
        scopes.get_or_create_hub(0, 1).vars.set_reg(0, 42);
        assert_eq!(scopes.get_or_create_hub(0, 1).vars.reg(0), 42);
        assert_eq!(scopes.get_or_create_hub(0, 2).vars.reg(0), 0);

        scopes.get_or_create_map(ScopeId::new(0, 1, 7));
        scopes.get_or_create_map(ScopeId::new(0, 1, 3));
        assert_eq!(
            scopes.map_ids(),
            vec![ScopeId::new(0, 1, 3), ScopeId::new(0, 1, 7)]
        );
    }

    #[test]
    fn vars_resolve_by_level() {
        let mut scopes = Scopes::new(4, 0);
        let id = ScopeId::new(2, 1, 0);
        scopes.get_or_create_map(id);
        scopes.vars_mut(VarLevel::Gbl, id, 0).unwrap().set_reg(3, 11);
        assert_eq!(scopes.global(2).unwrap().vars.reg(3), 11);
        assert_eq!(scopes.vars(VarLevel::Hub, id, 0).unwrap().reg(3), 0);
        assert!(scopes.vars(VarLevel::Mod, id, 0).is_none());
        assert!(scopes.vars(VarLevel::Loc, id, 0).is_none());
    }

    #[test]
    fn inactive_ancestor_freezes_map() {
        let mut scopes = Scopes::new(0, 0);
        let id = ScopeId::new(0, 0, 0);
        scopes.get_or_create_map(id);
        assert!(scopes.is_active(id));
        scopes.hub_mut(0, 0).unwrap().active = false;
        assert!(!scopes.is_active(id));
    }
}
