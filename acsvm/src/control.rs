//! Script control: adding modules to map scopes and starting, stopping and
//! pausing scripts by name.
//!
//! A script name resolves to the first module in the map that declares it.
//! Unless the script is flagged [`ScriptFlags::MULTI`], at most one thread
//! holds the name at a time.

use std::mem;
use std::rc::Rc;

use crate::environment::Environment;
use crate::error::Result;
use crate::module::{Module, ScriptFlags, ScriptName, ScriptType};
use crate::scope::ScopeId;
use crate::thread::{Thread, ThreadId, ThreadInfo, ThreadState};
use crate::Word;

impl Environment {
    /// Registers `modules` with map scope `scope`, creating the scope if
    /// needed. Modules already present are skipped. Returns how many were
    /// added.
    pub fn add_modules(&mut self, scope: ScopeId, modules: &[Rc<Module>]) -> Result<usize> {
        let map = self.scopes.get_or_create_map(scope);
        let mut added = Vec::new();
        for m in modules {
            if let Some(idx) = map.add_module(m.clone())? {
                added.push(idx);
            }
        }

        if self.config.start_open_on_add {
            for &module_idx in &added {
                let open: Vec<usize> = self
                    .scopes
                    .map(scope)
                    .and_then(|m| m.module_scope(module_idx))
                    .map(|ms| {
                        ms.module()
                            .scripts()
                            .iter()
                            .enumerate()
                            .filter(|(_, s)| s.ty == ScriptType::OPEN)
                            .map(|(i, _)| i)
                            .collect()
                    })
                    .unwrap_or_default();
                for script_idx in open {
                    self.start_at(scope, module_idx, script_idx, &[], ThreadInfo::default(), false)?;
                }
            }
        }
        Ok(added.len())
    }

    /// Starts `name` in `scope`. A paused instance resumes instead. Returns
    /// false when the script is unknown or already running.
    pub fn script_start(&mut self, scope: ScopeId, name: &ScriptName, args: &[Word], info: ThreadInfo) -> Result<bool> {
        let Some((module_idx, script_idx)) = self.resolve_script(scope, name) else {
            return Ok(false);
        };
        self.start_at(scope, module_idx, script_idx, args, info, false)
    }

    /// Like [`Self::script_start`], but a running instance is stopped and a
    /// fresh one started in its place.
    pub fn script_start_forced(
        &mut self,
        scope: ScopeId,
        name: &ScriptName,
        args: &[Word],
        info: ThreadInfo,
    ) -> Result<bool> {
        let Some((module_idx, script_idx)) = self.resolve_script(scope, name) else {
            return Ok(false);
        };
        self.start_at(scope, module_idx, script_idx, args, info, true)
    }

    /// Starts a new instance of `name` and runs it right away, inside the
    /// current tick if called from a script. Returns its result value if it
    /// finished in that turn.
    pub fn script_start_result(
        &mut self,
        scope: ScopeId,
        name: &ScriptName,
        args: &[Word],
        info: ThreadInfo,
    ) -> Result<Option<Word>> {
        let Some((module_idx, script_idx)) = self.resolve_script(scope, name) else {
            return Ok(None);
        };
        let claim = self.can_claim(scope, name, module_idx, script_idx);
        let Some(id) = self.spawn(scope, module_idx, script_idx, args, info, claim)? else {
            return Ok(None);
        };

        let Some(slot) = self
            .scopes
            .module_scope_mut(scope, module_idx)
            .and_then(|ms| ms.thread_mut(id))
        else {
            return Ok(None);
        };
        let mut thread = mem::replace(slot, Thread::marker(id));
        thread.last_tick = self.tick;

        let nested = mem::replace(&mut self.in_exec, true);
        thread.exec(self);
        self.in_exec = nested;

        let result = (thread.state == ThreadState::Stopped).then_some(thread.result);
        self.reattach(scope, module_idx, thread);
        Ok(result)
    }

    /// Starts every script of type `ty` in `scope` that is not already
    /// running. Returns the number of threads started.
    pub fn script_start_type(&mut self, scope: ScopeId, ty: ScriptType, args: &[Word], info: ThreadInfo) -> Result<usize> {
        let targets: Vec<(usize, usize)> = match self.scopes.map(scope) {
            Some(map) => map
                .module_scopes()
                .iter()
                .enumerate()
                .flat_map(|(m, ms)| {
                    ms.module()
                        .scripts()
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.ty == ty)
                        .map(move |(s, _)| (m, s))
                })
                .collect(),
            None => return Ok(0),
        };

        let mut started = 0;
        for (module_idx, script_idx) in targets {
            if self.start_at(scope, module_idx, script_idx, args, info, false)? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Stops every live instance of `name`. Returns true if one was found.
    pub fn script_stop(&mut self, scope: ScopeId, name: &ScriptName) -> bool {
        self.set_script_state(scope, name, ThreadState::Stopped)
    }

    /// Pauses every live instance of `name` until it is started again.
    pub fn script_pause(&mut self, scope: ScopeId, name: &ScriptName) -> bool {
        self.set_script_state(scope, name, ThreadState::Paused)
    }

    pub fn script_active(&self, scope: ScopeId, name: &ScriptName) -> bool {
        self.scopes.map(scope).is_some_and(|m| m.script_active(name))
    }

    fn resolve_script(&self, scope: ScopeId, name: &ScriptName) -> Option<(usize, usize)> {
        let slot = self.scopes.map(scope)?.slot(name)?;
        Some((slot.module, slot.script))
    }

    fn set_script_state(&mut self, scope: ScopeId, name: &ScriptName, state: ThreadState) -> bool {
        let Some((module_idx, script_idx)) = self.resolve_script(scope, name) else {
            return false;
        };
        // a thread running right now is only reachable through its marker,
        // and a marker only stands in for the slot holder
        let holder = self.scopes.map(scope).and_then(|m| m.slot(name)).and_then(|s| s.thread);
        let Some(ms) = self.scopes.module_scope_mut(scope, module_idx) else {
            return false;
        };

        let mut found = false;
        let targets = ms.threads.iter_mut().filter(|t| {
            if t.is_marker() {
                Some(t.id()) == holder
            } else {
                t.script_index() == script_idx
            }
        });
        for t in targets.filter(|t| !t.state.is_finished()) {
            t.state = state.clone();
            found = true;
        }
        if found {
            log::debug!("script {name} in {scope:?} set to {state:?}");
        }
        found
    }

    /// Whether a new instance of the script at these indices takes the name
    /// slot of `name`.
    fn can_claim(&self, scope: ScopeId, name: &ScriptName, module_idx: usize, script_idx: usize) -> bool {
        let Some(map) = self.scopes.map(scope) else {
            return false;
        };
        let owns = map
            .slot(name)
            .is_some_and(|s| s.module == module_idx && s.script == script_idx);
        let multi = map
            .module_scope(module_idx)
            .and_then(|ms| ms.module().scripts().get(script_idx))
            .is_some_and(|s| s.flags.contains(ScriptFlags::MULTI));
        owns && !multi && !map.script_active(name)
    }

    fn start_at(
        &mut self,
        scope: ScopeId,
        module_idx: usize,
        script_idx: usize,
        args: &[Word],
        info: ThreadInfo,
        forced: bool,
    ) -> Result<bool> {
        let Some(map) = self.scopes.map_mut(scope) else {
            return Ok(false);
        };
        let Some(script) = map
            .module_scope(module_idx)
            .and_then(|ms| ms.module().scripts().get(script_idx))
        else {
            return Ok(false);
        };
        let name = script.name.clone();
        let multi = script.flags.contains(ScriptFlags::MULTI);
        let owns = map
            .slot(&name)
            .is_some_and(|s| s.module == module_idx && s.script == script_idx);

        if owns && !multi {
            if let Some(t) = map.script_thread_mut(&name) {
                match t.state {
                    ThreadState::Stopped | ThreadState::Inactive => {}
                    ThreadState::Paused if !forced => {
                        t.state = ThreadState::Running;
                        log::debug!("resumed script {name} in {scope:?}");
                        return Ok(true);
                    }
                    _ if forced => t.state = ThreadState::Stopped,
                    _ => return Ok(false),
                }
            }
        }

        Ok(self
            .spawn(scope, module_idx, script_idx, args, info, owns && !multi)?
            .is_some())
    }

    fn spawn(
        &mut self,
        scope: ScopeId,
        module_idx: usize,
        script_idx: usize,
        args: &[Word],
        info: ThreadInfo,
        claim: bool,
    ) -> Result<Option<ThreadId>> {
        let Some(map) = self.scopes.map_mut(scope) else {
            return Ok(None);
        };
        let id = map.alloc_thread_id();
        let Some(ms) = map.module_scope_mut(module_idx) else {
            return Ok(None);
        };

        let thread = Thread::new(id, ms.module().clone(), scope, module_idx, script_idx, args, info)?;
        let name = thread.script().map(|s| s.name.clone());
        ms.threads.try_reserve(1)?;
        ms.threads.push(thread);

        if claim {
            if let Some(slot) = name.as_ref().and_then(|n| map.slots.get_mut(n)) {
                slot.thread = Some(id);
            }
        }
        log::debug!(
            "started script {} in {scope:?} as thread {id}",
            name.as_ref().map_or_else(|| "?".to_string(), |n| n.to_string())
        );

        if let Some(hook) = self.hooks.thread_start.as_mut() {
            if let Some(t) = self
                .scopes
                .map(scope)
                .and_then(|m| m.module_scope(module_idx))
                .and_then(|ms| ms.thread(id))
            {
                hook(t);
            }
        }
        Ok(Some(id))
    }
}
