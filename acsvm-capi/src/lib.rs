//! C linkage for acsvm.
//!
//! Handles are opaque. Functions report failure with a `false` or null
//! return and, when the host set one, a call to its `error` callback.
//! Environment functions must not be called from inside a CallFunc callback.

mod handle;

use std::ffi::{c_char, c_void, CStr, CString};
use std::io::Cursor;
use std::rc::Rc;
use std::slice;

use acsvm::{
    ArgKind, Code, CodeData, Environment, FuncData, KillInfo, ModuleName, ReadError, ScopeId, ScriptName, ScriptType,
    Thread, ThreadInfo, VmConfig, Word,
};
use anyhow::{anyhow, bail, Context, Result};
use num_traits::FromPrimitive;

pub use handle::{AcsvmByteSink, AcsvmEnv, AcsvmThread};

pub type AcsvmErrorFn = unsafe extern "C" fn(ctx: *mut c_void, msg: *const c_char);
pub type AcsvmLoadModuleFn = unsafe extern "C" fn(ctx: *mut c_void, name: *const c_char, sink: *mut AcsvmByteSink) -> bool;
pub type AcsvmPrintFn = unsafe extern "C" fn(ctx: *mut c_void, activator: u32, bytes: *const u8, len: usize);
pub type AcsvmKillFn = unsafe extern "C" fn(ctx: *mut c_void, ty: u32, data: u32);
pub type AcsvmCheckTagFn = unsafe extern "C" fn(ctx: *mut c_void, ty: u32, tag: u32) -> bool;
pub type AcsvmCheckLockFn = unsafe extern "C" fn(ctx: *mut c_void, activator: u32, lock: u32, door: u32) -> bool;
pub type AcsvmCallFunc =
    unsafe extern "C" fn(ctx: *mut c_void, thread: *mut AcsvmThread, args: *const u32, argc: usize) -> bool;

/// Host callbacks. Every pointer may be null; `ctx` is passed back as is.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AcsvmCallbacks {
    pub ctx: *mut c_void,
    pub error: Option<AcsvmErrorFn>,
    pub load_module: Option<AcsvmLoadModuleFn>,
    pub print: Option<AcsvmPrintFn>,
    pub kill: Option<AcsvmKillFn>,
    pub check_tag: Option<AcsvmCheckTagFn>,
    pub check_lock: Option<AcsvmCheckLockFn>,
}

impl Default for AcsvmCallbacks {
    fn default() -> Self {
        Self {
            ctx: std::ptr::null_mut(),
            error: None,
            load_module: None,
            print: None,
            kill: None,
            check_tag: None,
            check_lock: None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcsvmScope {
    pub global: u32,
    pub hub: u32,
    pub map: u32,
}

impl From<AcsvmScope> for ScopeId {
    fn from(s: AcsvmScope) -> Self {
        ScopeId::new(s.global, s.hub, s.map)
    }
}

pub const ACSVM_LEVEL_GLOBAL: u32 = 0;
pub const ACSVM_LEVEL_HUB: u32 = 1;
pub const ACSVM_LEVEL_MAP: u32 = 2;

unsafe fn words<'a>(ptr: *const u32, len: usize) -> &'a [Word] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        slice::from_raw_parts(ptr, len)
    }
}

unsafe fn c_str<'a>(s: *const c_char) -> Result<&'a str> {
    if s.is_null() {
        bail!("null string");
    }
    CStr::from_ptr(s).to_str().context("string is not UTF-8")
}

/// Runs `f` on a checked handle; errors go to the host and yield `fallback`.
unsafe fn with_env<T>(ptr: *mut AcsvmEnv, fallback: T, f: impl FnOnce(&mut AcsvmEnv) -> Result<T>) -> T {
    let Some(handle) = handle::env_mut(ptr) else {
        return fallback;
    };
    match f(handle) {
        Ok(v) => v,
        Err(e) => {
            handle.report(&e);
            fallback
        }
    }
}

fn info(activator: u32) -> ThreadInfo {
    ThreadInfo {
        activator,
        ..Default::default()
    }
}

fn install_hooks(env: &mut Environment, cb: AcsvmCallbacks) {
    let ctx = cb.ctx;
    if let Some(load) = cb.load_module {
        env.hooks.load_module = Some(Box::new(move |name: &ModuleName| -> Result<Vec<u8>, ReadError> {
            let cname = CString::new(name.name.clone()).map_err(|_| ReadError::malformed("module name contains NUL"))?;
            let mut sink = AcsvmByteSink::default();
            if unsafe { load(ctx, cname.as_ptr(), &mut sink) } {
                Ok(sink.bytes)
            } else {
                Err(ReadError::malformed(format!("host could not load module {name}")))
            }
        }));
    }
    if let Some(print) = cb.print {
        env.hooks.print = Some(Box::new(move |info: &ThreadInfo, bytes: &[u8]| unsafe {
            print(ctx, info.activator, bytes.as_ptr(), bytes.len())
        }));
    }
    if let Some(kill) = cb.kill {
        env.hooks.kill = Some(Box::new(move |info: &KillInfo| unsafe { kill(ctx, info.ty as u32, info.data) }));
    }
    if let Some(check_tag) = cb.check_tag {
        env.hooks.check_tag = Some(Box::new(move |ty: Word, tag: Word| unsafe { check_tag(ctx, ty, tag) }));
    }
    if let Some(check_lock) = cb.check_lock {
        env.hooks.check_lock = Some(Box::new(move |info: &ThreadInfo, lock: Word, door: Word| unsafe {
            check_lock(ctx, info.activator, lock, door)
        }));
    }
}

/// Creates an environment with default settings. `callbacks` may be null.
///
/// # Safety
/// `callbacks` must be null or point to a valid [`AcsvmCallbacks`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_new(callbacks: *const AcsvmCallbacks) -> *mut AcsvmEnv {
    let cb = if callbacks.is_null() {
        AcsvmCallbacks::default()
    } else {
        *callbacks
    };
    let mut env = Environment::new(VmConfig::default());
    install_hooks(&mut env, cb);
    AcsvmEnv::into_raw(env, cb)
}

/// # Safety
/// `env` must come from [`acsvm_env_new`] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_free(env: *mut AcsvmEnv) {
    handle::env_free(env);
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_set_branch_limit(env: *mut AcsvmEnv, limit: u32) -> bool {
    with_env(env, false, |h| {
        h.env.set_branch_limit(limit);
        Ok(true)
    })
}

/// Binds `func` to the next host CallFunc index, written to `out_index`.
///
/// # Safety
/// `env` must come from [`acsvm_env_new`]; `out_index` may be null.
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_add_callfunc(env: *mut AcsvmEnv, func: Option<AcsvmCallFunc>, out_index: *mut u32) -> bool {
    with_env(env, false, |h| {
        let func = func.ok_or_else(|| anyhow!("null callfunc"))?;
        let ctx = h.callbacks.ctx;
        let idx = h.env.add_func(Rc::new(move |_: &mut Environment, thread: &mut Thread, args: &[Word]| {
            AcsvmThread::lend(thread, |lent| unsafe { func(ctx, lent, args.as_ptr(), args.len()) })
        }));
        if !out_index.is_null() {
            *out_index = idx;
        }
        Ok(true)
    })
}

/// Maps raw opcode `raw` to internal code `code`. `arg_kinds` holds one
/// byte per operand: 0 literal, 1 jump, 2 string, 3 function.
///
/// # Safety
/// `env` must come from [`acsvm_env_new`]; `arg_kinds` must hold `argc` bytes.
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_add_code_data(
    env: *mut AcsvmEnv,
    raw: u32,
    code: u32,
    arg_kinds: *const u8,
    argc: usize,
) -> bool {
    with_env(env, false, |h| {
        let code = Code::from_u32(code).ok_or_else(|| anyhow!("unknown internal code {code}"))?;
        let kinds = if arg_kinds.is_null() || argc == 0 {
            &[][..]
        } else {
            slice::from_raw_parts(arg_kinds, argc)
        };
        let args = kinds
            .iter()
            .map(|&k| match k {
                0 => Ok(ArgKind::Lit),
                1 => Ok(ArgKind::Jump),
                2 => Ok(ArgKind::Str),
                3 => Ok(ArgKind::Func),
                _ => Err(anyhow!("unknown operand kind {k}")),
            })
            .collect::<Result<Vec<_>>>()?;
        let given = args.len();
        if !h.env.add_code_data(raw, CodeData::with_args(code, args)) {
            bail!("{code} takes {} operands, got {given}", code.arg_count());
        }
        Ok(true)
    })
}

/// Maps raw opcode `raw` to a CallFunc of `func`.
///
/// # Safety
/// `env` must come from [`acsvm_env_new`]; `implicit` must hold
/// `implicit_len` words.
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_add_func_data(
    env: *mut AcsvmEnv,
    raw: u32,
    func: u32,
    stack: u32,
    inline: u32,
    implicit: *const u32,
    implicit_len: usize,
) -> bool {
    with_env(env, false, |h| {
        let data = FuncData::new(func, stack)
            .with_inline(inline)
            .with_implicit(words(implicit, implicit_len).to_vec());
        h.env.add_func_data(raw, data);
        Ok(true)
    })
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_exec(env: *mut AcsvmEnv) -> bool {
    with_env(env, false, |h| {
        h.env.exec();
        Ok(true)
    })
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_has_active_thread(env: *mut AcsvmEnv) -> bool {
    with_env(env, false, |h| Ok(h.env.has_active_thread()))
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_collect_strings(env: *mut AcsvmEnv) -> bool {
    with_env(env, false, |h| {
        h.env.collect_strings()?;
        Ok(true)
    })
}

/// Serializes the environment into a new buffer released with
/// [`acsvm_buffer_free`].
///
/// # Safety
/// `env` must come from [`acsvm_env_new`]; both out pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_save(env: *mut AcsvmEnv, out_data: *mut *mut u8, out_len: *mut usize) -> bool {
    with_env(env, false, |h| {
        if out_data.is_null() || out_len.is_null() {
            bail!("null output pointer");
        }
        let mut buf = Vec::new();
        h.env.save_state(&mut buf)?;
        let buf = buf.into_boxed_slice();
        *out_len = buf.len();
        *out_data = Box::into_raw(buf) as *mut u8;
        Ok(true)
    })
}

/// # Safety
/// `data` and `len` must come from one [`acsvm_env_save`] call.
#[no_mangle]
pub unsafe extern "C" fn acsvm_buffer_free(data: *mut u8, len: usize) {
    if data.is_null() {
        return;
    }
    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(data, len)));
}

/// # Safety
/// `env` must come from [`acsvm_env_new`]; `data` must hold `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn acsvm_env_load(env: *mut AcsvmEnv, data: *const u8, len: usize) -> bool {
    with_env(env, false, |h| {
        if data.is_null() {
            bail!("null state buffer");
        }
        let bytes = slice::from_raw_parts(data, len);
        h.env.load_state(&mut Cursor::new(bytes))?;
        Ok(true)
    })
}

/// Loads module `name` through the host loader and adds it to a map scope.
///
/// # Safety
/// `env` must come from [`acsvm_env_new`]; `name` must be a C string.
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_add_module(env: *mut AcsvmEnv, scope: AcsvmScope, name: *const c_char) -> bool {
    with_env(env, false, |h| {
        let name = h.env.module_name(c_str(name)?);
        let module = h.env.get_module(&name).with_context(|| format!("loading module {name}"))?;
        h.env.add_modules(scope.into(), &[module])?;
        Ok(true)
    })
}

/// # Safety
/// `env` must come from [`acsvm_env_new`]; `args` must hold `argc` words.
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_start(
    env: *mut AcsvmEnv,
    scope: AcsvmScope,
    number: i32,
    args: *const u32,
    argc: usize,
    activator: u32,
) -> bool {
    with_env(env, false, |h| {
        Ok(h.env
            .script_start(scope.into(), &ScriptName::Num(number), words(args, argc), info(activator))?)
    })
}

/// # Safety
/// As [`acsvm_map_script_start`]; `name` must be a C string.
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_start_named(
    env: *mut AcsvmEnv,
    scope: AcsvmScope,
    name: *const c_char,
    args: *const u32,
    argc: usize,
    activator: u32,
) -> bool {
    with_env(env, false, |h| {
        let name = ScriptName::from(c_str(name)?);
        Ok(h.env.script_start(scope.into(), &name, words(args, argc), info(activator))?)
    })
}

/// # Safety
/// As [`acsvm_map_script_start`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_start_forced(
    env: *mut AcsvmEnv,
    scope: AcsvmScope,
    number: i32,
    args: *const u32,
    argc: usize,
    activator: u32,
) -> bool {
    with_env(env, false, |h| {
        Ok(h.env
            .script_start_forced(scope.into(), &ScriptName::Num(number), words(args, argc), info(activator))?)
    })
}

/// Runs a new instance of the script immediately. Returns true and writes
/// its result when it finished in that run.
///
/// # Safety
/// As [`acsvm_map_script_start`]; `out_result` may be null.
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_start_result(
    env: *mut AcsvmEnv,
    scope: AcsvmScope,
    number: i32,
    args: *const u32,
    argc: usize,
    activator: u32,
    out_result: *mut u32,
) -> bool {
    with_env(env, false, |h| {
        let result =
            h.env
                .script_start_result(scope.into(), &ScriptName::Num(number), words(args, argc), info(activator))?;
        match result {
            Some(v) => {
                if !out_result.is_null() {
                    *out_result = v;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    })
}

/// Starts every script of type `ty`. Returns the number started.
///
/// # Safety
/// As [`acsvm_map_script_start`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_start_type(
    env: *mut AcsvmEnv,
    scope: AcsvmScope,
    ty: u32,
    args: *const u32,
    argc: usize,
    activator: u32,
) -> u32 {
    with_env(env, 0, |h| {
        let started = h
            .env
            .script_start_type(scope.into(), ScriptType(ty), words(args, argc), info(activator))?;
        Ok(started as u32)
    })
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_stop(env: *mut AcsvmEnv, scope: AcsvmScope, number: i32) -> bool {
    with_env(env, false, |h| Ok(h.env.script_stop(scope.into(), &ScriptName::Num(number))))
}

/// # Safety
/// `env` must come from [`acsvm_env_new`]; `name` must be a C string.
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_stop_named(env: *mut AcsvmEnv, scope: AcsvmScope, name: *const c_char) -> bool {
    with_env(env, false, |h| {
        let name = ScriptName::from(c_str(name)?);
        Ok(h.env.script_stop(scope.into(), &name))
    })
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_pause(env: *mut AcsvmEnv, scope: AcsvmScope, number: i32) -> bool {
    with_env(env, false, |h| Ok(h.env.script_pause(scope.into(), &ScriptName::Num(number))))
}

/// # Safety
/// `env` must come from [`acsvm_env_new`]; `name` must be a C string.
#[no_mangle]
pub unsafe extern "C" fn acsvm_map_script_pause_named(env: *mut AcsvmEnv, scope: AcsvmScope, name: *const c_char) -> bool {
    with_env(env, false, |h| {
        let name = ScriptName::from(c_str(name)?);
        Ok(h.env.script_pause(scope.into(), &name))
    })
}

/// Sets the active flag of the global, hub or map scope on the path to
/// `scope`, creating it if needed. `level` is one of the `ACSVM_LEVEL_*`
/// constants.
///
/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_scope_set_active(env: *mut AcsvmEnv, scope: AcsvmScope, level: u32, active: bool) -> bool {
    with_env(env, false, |h| {
        match level {
            ACSVM_LEVEL_GLOBAL => h.env.global_scope(scope.global).active = active,
            ACSVM_LEVEL_HUB => h.env.hub_scope(scope.global, scope.hub).active = active,
            ACSVM_LEVEL_MAP => h.env.map_scope(scope.into()).active = active,
            _ => bail!("unknown scope level {level}"),
        }
        Ok(true)
    })
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_global_reg_get(env: *mut AcsvmEnv, global: u32, idx: u32) -> u32 {
    with_env(env, 0, |h| Ok(h.env.global_scope(global).vars.reg(idx)))
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_global_reg_set(env: *mut AcsvmEnv, global: u32, idx: u32, value: u32) -> bool {
    with_env(env, false, |h| {
        h.env.global_scope(global).vars.set_reg(idx, value);
        Ok(true)
    })
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_hub_reg_get(env: *mut AcsvmEnv, global: u32, hub: u32, idx: u32) -> u32 {
    with_env(env, 0, |h| Ok(h.env.hub_scope(global, hub).vars.reg(idx)))
}

/// # Safety
/// `env` must come from [`acsvm_env_new`].
#[no_mangle]
pub unsafe extern "C" fn acsvm_hub_reg_set(env: *mut AcsvmEnv, global: u32, hub: u32, idx: u32, value: u32) -> bool {
    with_env(env, false, |h| {
        h.env.hub_scope(global, hub).vars.set_reg(idx, value);
        Ok(true)
    })
}

/// # Safety
/// `thread` must be the handle of a running CallFunc callback.
#[no_mangle]
pub unsafe extern "C" fn acsvm_thread_push(thread: *mut AcsvmThread, value: u32) -> bool {
    match handle::thread_mut(thread) {
        Some(t) => {
            t.push(value);
            true
        }
        None => false,
    }
}

/// # Safety
/// `thread` must be the handle of a running CallFunc callback.
#[no_mangle]
pub unsafe extern "C" fn acsvm_thread_get_result(thread: *mut AcsvmThread) -> u32 {
    handle::thread_mut(thread).map_or(0, |t| t.result)
}

/// # Safety
/// `thread` must be the handle of a running CallFunc callback.
#[no_mangle]
pub unsafe extern "C" fn acsvm_thread_set_result(thread: *mut AcsvmThread, value: u32) -> bool {
    match handle::thread_mut(thread) {
        Some(t) => {
            t.result = value;
            true
        }
        None => false,
    }
}

/// Suspends the thread for `ticks` ticks once the callback returns.
///
/// # Safety
/// `thread` must be the handle of a running CallFunc callback.
#[no_mangle]
pub unsafe extern "C" fn acsvm_thread_set_delay(thread: *mut AcsvmThread, ticks: u32) -> bool {
    match handle::thread_mut(thread) {
        Some(t) => {
            t.delay = ticks;
            true
        }
        None => false,
    }
}

/// # Safety
/// `thread` must be the handle of a running CallFunc callback.
#[no_mangle]
pub unsafe extern "C" fn acsvm_thread_activator(thread: *mut AcsvmThread) -> u32 {
    handle::thread_mut(thread).map_or(0, |t| t.info.activator)
}

/// Appends `len` bytes to a loader sink.
///
/// # Safety
/// `sink` must be the sink passed to the loader callback; `data` must hold
/// `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn acsvm_byte_sink_write(sink: *mut AcsvmByteSink, data: *const u8, len: usize) -> bool {
    if sink.is_null() || (data.is_null() && len != 0) {
        log::error!("null byte sink or data");
        return false;
    }
    if len != 0 {
        (*sink).bytes.extend_from_slice(slice::from_raw_parts(data, len));
    }
    true
}
