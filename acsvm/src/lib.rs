//! acsvm
//!
//! An embeddable bytecode virtual machine for game event scripts.
//!
//! The host owns one [`Environment`] per game session, loads compiled modules
//! into map scopes and calls [`Environment::exec`] once per game tick. Scripts
//! run as cooperatively scheduled [`Thread`]s; nothing here is thread-safe and
//! nothing here spawns OS threads.

pub mod array;
pub mod asm;
pub mod code;
pub mod config;
pub mod control;
pub mod environment;
pub mod error;
pub mod func;
pub mod module;
pub mod scope;
pub mod serial;
pub mod state;
pub mod string;
pub mod thread;
pub mod util;

/// Native value type of the VM.
pub type Word = u32;
/// Signed view of a [`Word`].
pub type SWord = i32;

pub use array::Array;
pub use code::{ArgKind, Code, CodeData, CodeTable, FuncData, KillType};
pub use config::{UnknownCodePolicy, VmConfig, VmConfigBuilder};
pub use environment::{EnvHooks, Environment, HostFunc, KillInfo};
pub use error::{Error, ReadError, Result};
pub use func::BuiltinFunc;
pub use module::{Function, Module, ModuleName, Script, ScriptFlags, ScriptName, ScriptType};
pub use scope::{GlobalScope, HubScope, MapScope, ModuleScope, ScopeId, ScopeVars};
pub use string::{str_hash, AcsString, RefStrings, StringTable};
pub use thread::{Thread, ThreadId, ThreadInfo, ThreadState};
