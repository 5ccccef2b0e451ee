//! Opaque handles handed across the C boundary.
//!
//! Live handles are tracked per OS thread. A pointer is only dereferenced
//! after it is found among them, so freed or foreign pointers are rejected.
//! The magic word at the start of each handle tells the handle kinds apart.

use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::CString;

use acsvm::{Environment, Thread};

use crate::AcsvmCallbacks;

const ENV_MAGIC: u32 = u32::from_be_bytes(*b"ACSE");
const THREAD_MAGIC: u32 = u32::from_be_bytes(*b"ACST");

thread_local! {
    static LIVE: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

fn track<T>(ptr: *const T) {
    LIVE.with(|live| live.borrow_mut().insert(ptr as usize));
}

fn untrack<T>(ptr: *const T) {
    LIVE.with(|live| live.borrow_mut().remove(&(ptr as usize)));
}

fn is_live<T>(ptr: *const T) -> bool {
    LIVE.with(|live| live.borrow().contains(&(ptr as usize)))
}

pub struct AcsvmEnv {
    magic: u32,
    pub(crate) env: Environment,
    pub(crate) callbacks: AcsvmCallbacks,
}

impl AcsvmEnv {
    /// Boxes and registers a new handle. Release it with [`env_free`].
    pub(crate) fn into_raw(env: Environment, callbacks: AcsvmCallbacks) -> *mut Self {
        let ptr = Box::into_raw(Box::new(Self {
            magic: ENV_MAGIC,
            env,
            callbacks,
        }));
        track(ptr);
        ptr
    }

    /// Logs `err` and forwards it to the host's error callback.
    pub(crate) fn report(&self, err: &anyhow::Error) {
        let msg = format!("{err:#}");
        log::error!("{msg}");
        if let Some(error) = self.callbacks.error {
            if let Ok(msg) = CString::new(msg) {
                unsafe { error(self.callbacks.ctx, msg.as_ptr()) };
            }
        }
    }
}

/// # Safety
/// `ptr` must be null or point to memory readable as an [`AcsvmEnv`].
pub(crate) unsafe fn env_mut<'a>(ptr: *mut AcsvmEnv) -> Option<&'a mut AcsvmEnv> {
    if ptr.is_null() {
        log::error!("null environment handle");
        return None;
    }
    if !is_live(ptr) {
        log::error!("unknown or freed environment handle {ptr:p}");
        return None;
    }
    let handle = &mut *ptr;
    if handle.magic != ENV_MAGIC {
        log::error!("invalid environment handle {ptr:p}");
        return None;
    }
    Some(handle)
}

/// # Safety
/// As [`env_mut`]; the handle must not be used afterwards.
pub(crate) unsafe fn env_free(ptr: *mut AcsvmEnv) {
    if env_mut(ptr).is_none() {
        return;
    }
    untrack(ptr);
    drop(Box::from_raw(ptr));
}

/// A thread lent to a CallFunc callback. Valid until the callback returns.
pub struct AcsvmThread {
    magic: u32,
    thread: *mut Thread,
}

impl AcsvmThread {
    /// Runs `f` with a handle to `thread` that is live only for the call.
    pub(crate) fn lend<R>(thread: &mut Thread, f: impl FnOnce(*mut AcsvmThread) -> R) -> R {
        let mut handle = Self {
            magic: THREAD_MAGIC,
            thread,
        };
        let ptr: *mut AcsvmThread = &mut handle;
        track(ptr);
        let result = f(ptr);
        untrack(ptr);
        result
    }
}

/// # Safety
/// `ptr` must be null or the handle passed to a running CallFunc callback.
pub(crate) unsafe fn thread_mut<'a>(ptr: *mut AcsvmThread) -> Option<&'a mut Thread> {
    if ptr.is_null() {
        log::error!("null thread handle");
        return None;
    }
    if !is_live(ptr) {
        log::error!("thread handle {ptr:p} used outside its callback");
        return None;
    }
    let handle = &mut *ptr;
    if handle.magic != THREAD_MAGIC || handle.thread.is_null() {
        log::error!("invalid thread handle {ptr:p}");
        return None;
    }
    Some(&mut *handle.thread)
}

/// Receives module bytes from the host's loader callback.
#[derive(Debug, Default)]
pub struct AcsvmByteSink {
    pub(crate) bytes: Vec<u8>,
}
