//! Built-in functions reached through `CallFunc`.
//!
//! Indices below [`crate::VmConfig::func_base`] go through the environment's
//! built-in table, which starts out mapping each [`BuiltinFunc`] to its own
//! discriminant. Arguments arrive in push order; results are pushed back onto
//! the calling thread's stack.

use num_derive::FromPrimitive;
use strum::{Display, EnumIter};

use crate::environment::Environment;
use crate::module::ScriptName;
use crate::thread::{Thread, ThreadState};
use crate::util::fixed_to_float;
use crate::{SWord, Word};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Display, EnumIter)]
pub enum BuiltinFunc {
    Nop = 0,

    PrintBegin,
    PrintString,
    PrintNumber,
    PrintChar,
    PrintFixed,
    PrintEnd,
    PrintModArray,

    ScrStartI,
    ScrStartS,
    ScrStartForcedI,
    ScrStartForcedS,
    ScrStartResultI,
    ScrStartResultS,
    ScrStopI,
    ScrStopS,
    ScrPauseI,
    ScrPauseS,
    ScrActiveI,

    SetResultValue,
    Random,
    StrLen,
    CheckLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Normal,
    Forced,
    Result,
}

impl Environment {
    /// Runs `func` for `thread`. Returns true when the thread must yield.
    pub(crate) fn call_builtin(&mut self, func: BuiltinFunc, thread: &mut Thread, args: &[Word]) -> bool {
        use BuiltinFunc::*;

        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        let rest = args.get(1..).unwrap_or(&[]);

        match func {
            Nop => {}

            PrintBegin => thread.print_buf.clear(),
            PrintString => {
                if let Some(bytes) = self.strings.bytes(arg(0)) {
                    thread.print_buf.extend_from_slice(bytes);
                }
            }
            PrintNumber => thread.print_buf.extend_from_slice((arg(0) as SWord).to_string().as_bytes()),
            PrintChar => thread.print_buf.push(arg(0) as u8),
            PrintFixed => thread
                .print_buf
                .extend_from_slice(fixed_to_float(arg(0)).to_string().as_bytes()),
            PrintEnd => {
                let buf = std::mem::take(&mut thread.print_buf);
                match self.hooks.print.as_mut() {
                    Some(print) => print(&thread.info, &buf),
                    None => log::info!("{}", String::from_utf8_lossy(&buf)),
                }
            }
            PrintModArray => {
                let arr = self
                    .scopes
                    .map(thread.scope())
                    .and_then(|m| m.module_scope(thread.module_index()))
                    .and_then(|ms| ms.vars.arr(arg(0)));
                if let Some(arr) = arr {
                    match self.hooks.print_array.as_mut() {
                        Some(print_array) => print_array(arr, &mut thread.print_buf),
                        None => thread
                            .print_buf
                            .extend(arr.iter().map(|(_, v)| v).take_while(|&v| v != 0).map(|v| v as u8)),
                    }
                }
            }

            ScrStartI => self.builtin_start(thread, ScriptName::Num(arg(0) as SWord), rest, StartMode::Normal),
            ScrStartS => {
                if let Some(name) = self.string_name(arg(0)) {
                    self.builtin_start(thread, name, rest, StartMode::Normal);
                } else {
                    thread.push(0);
                }
            }
            ScrStartForcedI => self.builtin_start(thread, ScriptName::Num(arg(0) as SWord), rest, StartMode::Forced),
            ScrStartForcedS => {
                if let Some(name) = self.string_name(arg(0)) {
                    self.builtin_start(thread, name, rest, StartMode::Forced);
                } else {
                    thread.push(0);
                }
            }
            ScrStartResultI => self.builtin_start(thread, ScriptName::Num(arg(0) as SWord), rest, StartMode::Result),
            ScrStartResultS => {
                if let Some(name) = self.string_name(arg(0)) {
                    self.builtin_start(thread, name, rest, StartMode::Result);
                } else {
                    thread.push(0);
                }
            }

            ScrStopI | ScrStopS | ScrPauseI | ScrPauseS => {
                let name = match func {
                    ScrStopI | ScrPauseI => Some(ScriptName::Num(arg(0) as SWord)),
                    _ => self.string_name(arg(0)),
                };
                let pause = matches!(func, ScrPauseI | ScrPauseS);
                let found = name.is_some_and(|name| self.builtin_stop(thread, &name, pause));
                thread.push(found as Word);
            }
            ScrActiveI => {
                let active = self.script_active(thread.scope(), &ScriptName::Num(arg(0) as SWord));
                thread.push(active as Word);
            }

            SetResultValue => thread.result = arg(0),
            Random => {
                let v = self.random(arg(0) as SWord, arg(1) as SWord);
                thread.push(v as Word);
            }
            StrLen => {
                let len = self.strings.get(arg(0)).map_or(0, |s| s.len());
                thread.push(len as Word);
            }
            CheckLock => {
                let open = match self.hooks.check_lock.as_mut() {
                    Some(check) => check(&thread.info, arg(0), arg(1)),
                    None => true,
                };
                thread.push(open as Word);
            }
        }
        false
    }

    fn string_name(&self, idx: Word) -> Option<ScriptName> {
        self.strings.get(idx).map(|s| ScriptName::Name(s.to_string_lossy()))
    }

    /// True when `thread` is the instance holding `name` in its own map.
    fn runs_script(&self, thread: &Thread, name: &ScriptName) -> bool {
        self.scopes
            .map(thread.scope())
            .and_then(|m| m.slot(name))
            .is_some_and(|slot| slot.thread == Some(thread.id()))
    }

    fn builtin_start(&mut self, thread: &mut Thread, name: ScriptName, args: &[Word], mode: StartMode) {
        let scope = thread.scope();
        let info = thread.info;
        let own = self.runs_script(thread, &name);

        let pushed = match mode {
            StartMode::Normal => {
                // the calling thread sits behind a marker, so check it directly
                if own && !thread.state.is_finished() {
                    Ok(0)
                } else {
                    self.script_start(scope, &name, args, info).map(Word::from)
                }
            }
            StartMode::Forced => {
                if own {
                    thread.state = ThreadState::Stopped;
                }
                self.script_start_forced(scope, &name, args, info).map(Word::from)
            }
            StartMode::Result => self
                .script_start_result(scope, &name, args, info)
                .map(|r| r.unwrap_or(0)),
        };

        match pushed {
            Ok(v) => thread.push(v),
            Err(e) => {
                log::error!("failed to start script {name}: {e}");
                thread.push(0);
            }
        }
    }

    fn builtin_stop(&mut self, thread: &mut Thread, name: &ScriptName, pause: bool) -> bool {
        let scope = thread.scope();
        let mut found = if pause {
            self.script_pause(scope, name)
        } else {
            self.script_stop(scope, name)
        };

        if self.runs_script(thread, name) && !thread.state.is_finished() {
            thread.state = if pause { ThreadState::Paused } else { ThreadState::Stopped };
            found = true;
        }
        found
    }
}
