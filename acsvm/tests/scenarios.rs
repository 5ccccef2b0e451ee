use std::cell::{Cell, RefCell};
use std::io::Cursor;
use std::rc::Rc;

use anyhow::Result;
use pretty_assertions::assert_eq;

use acsvm::asm::{Assembler, ScriptDecl};
use acsvm::code::raw;
use acsvm::{
    BuiltinFunc, Code, Environment, Error, KillInfo, KillType, ModuleName, ReadError, ScopeId, ScriptName, ScriptType,
    StringTable, Thread, ThreadInfo, ThreadState, UnknownCodePolicy, VmConfig, VmConfigBuilder, Word,
};

const MAP: ScopeId = ScopeId::new(0, 0, 0);

fn setup(config: VmConfig, bytes: &[u8]) -> Result<Environment> {
    let mut env = Environment::new(config);
    let module = env.load_module_bytes(ModuleName::new("test"), bytes)?;
    env.add_modules(MAP, &[module])?;
    Ok(env)
}

fn mod_reg(env: &Environment, idx: Word) -> Word {
    env.find_map_scope(MAP)
        .and_then(|m| m.module_scope(0))
        .map_or(0, |ms| ms.vars.reg(idx))
}

fn start(env: &mut Environment, number: i32) -> Result<bool> {
    Ok(env.script_start(MAP, &ScriptName::Num(number), &[], ThreadInfo::default())?)
}

fn collect_kills(env: &mut Environment) -> Rc<RefCell<Vec<KillInfo>>> {
    let kills = Rc::new(RefCell::new(Vec::new()));
    let sink = kills.clone();
    env.hooks.kill = Some(Box::new(move |info: &KillInfo| sink.borrow_mut().push(info.clone())));
    kills
}

#[test]
fn open_script_writes_module_array() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(0, 1);
    asm.script(ScriptDecl::numbered(1).ty(ScriptType::OPEN));
    asm.op(Code::PushLit, &[0])
        .op(Code::PushLit, &[5])
        .op(Code::DropModArr, &[0])
        .op(Code::Terminate, &[]);

    let config = VmConfigBuilder::new().with_start_open_on_add(true).get();
    let mut env = setup(config, &asm.finish()?)?;

    let stopped = Rc::new(Cell::new(0));
    let counter = stopped.clone();
    env.hooks.thread_stop = Some(Box::new(move |_: &Thread| counter.set(counter.get() + 1)));

    assert!(env.has_active_thread());
    env.exec();
    let arr = env.find_map_scope(MAP).and_then(|m| m.module_scope(0)).map(|ms| ms.vars.arr_get(0, 0));
    assert_eq!(arr, Some(5));
    assert!(!env.has_active_thread());

    env.exec();
    assert_eq!(stopped.get(), 1);
    Ok(())
}

#[test]
fn waiter_resumes_after_target_stops() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);

    asm.script(ScriptDecl::numbered(1));
    let spin = asm.new_label();
    asm.bind(spin);
    asm.op(Code::DelayLit, &[1]).jump(Code::Jump, &[], spin);

    asm.script(ScriptDecl::numbered(2));
    asm.op(Code::PushLit, &[1])
        .op(Code::DropModReg, &[0])
        .op(Code::PushLit, &[1])
        .op(Code::WaitScrI, &[])
        .op(Code::PushLit, &[2])
        .op(Code::DropModReg, &[0])
        .op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    assert!(start(&mut env, 1)?);
    assert!(start(&mut env, 2)?);

    env.exec();
    assert_eq!(mod_reg(&env, 0), 1);
    env.exec();
    env.exec();
    assert_eq!(mod_reg(&env, 0), 1);

    assert!(env.script_stop(MAP, &ScriptName::Num(1)));
    env.exec();
    assert_eq!(mod_reg(&env, 0), 2);
    assert!(!env.script_active(MAP, &ScriptName::Num(1)));
    Ok(())
}

#[test]
fn modules_load_once_per_name() -> Result<()> {
    let mut asm = Assembler::new();
    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::Terminate, &[]);
    let bytes = asm.finish()?;

    let loads = Rc::new(Cell::new(0));
    let counter = loads.clone();
    let mut env = Environment::default();
    env.hooks.load_module = Some(Box::new(move |_: &ModuleName| {
        counter.set(counter.get() + 1);
        Ok::<_, ReadError>(bytes.clone())
    }));

    let name = ModuleName::new("shared");
    let a = env.get_module(&name)?;
    let b = env.get_module(&name)?;
    assert!(Rc::ptr_eq(&a, &b));
    assert_eq!(loads.get(), 1);

    env.add_modules(MAP, &[a.clone()])?;
    assert_eq!(env.add_modules(MAP, &[b])?, 0);
    Ok(())
}

#[test]
fn branch_limit_kills_only_the_runaway() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);

    asm.script(ScriptDecl::numbered(1));
    let top = asm.new_label();
    asm.bind(top);
    asm.jump(Code::Jump, &[], top);

    asm.script(ScriptDecl::numbered(2));
    asm.op(Code::PushLit, &[7]).op(Code::DropModReg, &[0]).op(Code::Terminate, &[]);

    let config = VmConfigBuilder::new().with_branch_limit(100).get();
    let mut env = setup(config, &asm.finish()?)?;
    let kills = collect_kills(&mut env);

    start(&mut env, 1)?;
    start(&mut env, 2)?;
    env.exec();

    let kills = kills.borrow();
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].ty, KillType::BranchLimit);
    assert_eq!(kills[0].data, 100);
    assert_eq!(kills[0].script, Some(ScriptName::Num(1)));
    assert_eq!(mod_reg(&env, 0), 7);
    Ok(())
}

#[test]
fn unknown_opcode_traps_or_fails_load() -> Result<()> {
    let mut asm = Assembler::new();
    asm.script(ScriptDecl::numbered(1));
    asm.raw_op(99, &[]).op(Code::Terminate, &[]);
    let bytes = asm.finish()?;

    let mut env = setup(VmConfig::default(), &bytes)?;
    let kills = collect_kills(&mut env);
    start(&mut env, 1)?;
    env.exec();
    assert_eq!(kills.borrow()[0].ty, KillType::UnknownCode);
    assert_eq!(kills.borrow()[0].data, 99);

    let strict = VmConfigBuilder::new().with_unknown_code(UnknownCodePolicy::Error).get();
    let mut env = Environment::new(strict);
    assert!(env.load_module_bytes(ModuleName::new("strict"), &bytes).is_err());
    assert!(env.strings().is_empty());
    Ok(())
}

#[test]
fn bad_calls_and_runaway_code_are_killed() -> Result<()> {
    let mut asm = Assembler::new();
    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::CallFunc, &[0, 9999]).op(Code::Terminate, &[]);
    asm.script(ScriptDecl::numbered(2));
    asm.op(Code::PushLit, &[1]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    let kills = collect_kills(&mut env);
    start(&mut env, 1)?;
    start(&mut env, 2)?;
    env.exec();

    let tys: Vec<KillType> = kills.borrow().iter().map(|k| k.ty).collect();
    assert_eq!(tys, vec![KillType::UnknownFunc, KillType::OutOfBounds]);
    assert!(!env.has_active_thread());
    Ok(())
}

#[test]
fn functions_take_params_and_return_values() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(2, 0);
    let sub = asm.declare_function(2, 2, 0);
    let noop = asm.declare_function(0, 0, 0);

    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::PushLit, &[10])
        .op(Code::PushLit, &[3])
        .op(Code::Call, &[sub])
        .op(Code::DropModReg, &[0])
        .op(Code::Call, &[noop])
        .op(Code::DropModReg, &[1])
        .op(Code::CallNul, &[noop])
        .op(Code::Terminate, &[]);

    asm.begin_function(sub);
    asm.op(Code::PushLocReg, &[0])
        .op(Code::PushLocReg, &[1])
        .op(Code::Sub, &[])
        .op(Code::RetnVal, &[]);
    asm.begin_function(noop);
    asm.op(Code::Retn, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    if let Some(ms) = env.find_map_scope_mut(MAP).and_then(|m| m.module_scope_mut(0)) {
        ms.vars.set_reg(1, 55);
    }
    start(&mut env, 1)?;
    env.exec();

    assert_eq!(mod_reg(&env, 0), 7);
    assert_eq!(mod_reg(&env, 1), 0);
    Ok(())
}

#[test]
fn pause_holds_thread_until_restarted() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);
    asm.script(ScriptDecl::numbered(1));
    let top = asm.new_label();
    asm.bind(top);
    asm.op(Code::IncModReg, &[0]).op(Code::DelayLit, &[1]).jump(Code::Jump, &[], top);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    start(&mut env, 1)?;
    env.exec();
    assert_eq!(mod_reg(&env, 0), 1);

    assert!(env.script_pause(MAP, &ScriptName::Num(1)));
    env.exec();
    env.exec();
    assert_eq!(mod_reg(&env, 0), 1);
    assert!(env.script_active(MAP, &ScriptName::Num(1)));

    assert!(start(&mut env, 1)?);
    env.exec();
    assert_eq!(mod_reg(&env, 0), 2);

    // a running, non-MULTI script is not started twice
    assert!(!start(&mut env, 1)?);
    Ok(())
}

#[test]
fn start_result_runs_immediately() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);

    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::PushLit, &[2])
        .op(Code::CallFunc, &[1, BuiltinFunc::ScrStartResultI as Word])
        .op(Code::DropModReg, &[0])
        .op(Code::Terminate, &[]);

    asm.script(ScriptDecl::numbered(2).args(1));
    asm.op(Code::PushLocReg, &[0])
        .op(Code::PushLit, &[40])
        .op(Code::Add, &[])
        .op(Code::RetnVal, &[]);

    asm.script(ScriptDecl::numbered(3));
    asm.op(Code::DelayLit, &[5]).op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    let direct = env.script_start_result(MAP, &ScriptName::Num(2), &[2], ThreadInfo::default())?;
    assert_eq!(direct, Some(42));
    let pending = env.script_start_result(MAP, &ScriptName::Num(3), &[], ThreadInfo::default())?;
    assert_eq!(pending, None);

    start(&mut env, 1)?;
    env.exec();
    assert_eq!(mod_reg(&env, 0), 40);
    Ok(())
}

#[test]
fn host_functions_yield_and_push_results() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);
    let config = VmConfig::default();
    let host = config.func_base;

    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::PushLit, &[4])
        .op(Code::PushLit, &[5])
        .op(Code::CallFunc, &[2, host])
        .op(Code::DropModReg, &[0])
        .op(Code::Terminate, &[]);

    let mut env = setup(config, &asm.finish()?)?;
    let idx = env.add_func(Rc::new(|_: &mut Environment, thread: &mut Thread, args: &[Word]| {
        thread.push(args.iter().sum());
        true
    }));
    assert_eq!(idx, host);

    start(&mut env, 1)?;
    env.exec();
    assert_eq!(mod_reg(&env, 0), 0);
    env.exec();
    assert_eq!(mod_reg(&env, 0), 9);
    Ok(())
}

#[test]
fn print_builtins_reach_the_host() -> Result<()> {
    let mut asm = Assembler::new();
    asm.script(ScriptDecl::numbered(1));
    asm.raw_op(raw::PRINT_BEGIN, &[])
        .push_str(b"hp ")
        .raw_op(raw::PRINT_STRING, &[])
        .op(Code::PushLit, &[(-5i32) as Word])
        .raw_op(raw::PRINT_NUMBER, &[])
        .op(Code::PushLit, &[b'!' as Word])
        .raw_op(raw::PRINT_CHAR, &[])
        .raw_op(raw::PRINT_END, &[])
        .op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = lines.clone();
    env.hooks.print = Some(Box::new(move |_: &ThreadInfo, bytes: &[u8]| {
        sink.borrow_mut().push(String::from_utf8_lossy(bytes).into_owned())
    }));

    start(&mut env, 1)?;
    env.exec();
    assert_eq!(*lines.borrow(), vec!["hp -5!".to_string()]);
    Ok(())
}

#[test]
fn scope_variables_are_shared_by_level() -> Result<()> {
    let mut asm = Assembler::new();
    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::PushLit, &[77])
        .op(Code::DropHubReg, &[0])
        .op(Code::PushLit, &[3])
        .op(Code::PushLit, &[8])
        .op(Code::DropGblArr, &[1])
        .op(Code::Terminate, &[]);

    let mut env = Environment::default();
    let module = env.load_module_bytes(ModuleName::new("levels"), &asm.finish()?)?;
    let other = ScopeId::new(0, 0, 1);
    env.add_modules(other, &[module])?;
    env.script_start(other, &ScriptName::Num(1), &[], ThreadInfo::default())?;
    env.exec();

    assert_eq!(env.find_hub_scope(0, 0).map(|h| h.vars.reg(0)), Some(77));
    assert_eq!(env.find_global_scope(0).map(|g| g.vars.arr_get(1, 3)), Some(8));
    Ok(())
}

#[test]
fn inactive_scope_freezes_threads() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);
    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::IncModReg, &[0]).op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    start(&mut env, 1)?;
    env.hub_scope(0, 0).active = false;
    env.exec();
    assert_eq!(mod_reg(&env, 0), 0);

    env.hub_scope(0, 0).active = true;
    env.exec();
    assert_eq!(mod_reg(&env, 0), 1);
    Ok(())
}

#[test]
fn freeing_a_scope_stops_its_threads() -> Result<()> {
    let mut asm = Assembler::new();
    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::DelayLit, &[100]).op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    let stopped = Rc::new(Cell::new(0));
    let counter = stopped.clone();
    env.hooks.thread_stop = Some(Box::new(move |t: &Thread| {
        assert_eq!(t.state, ThreadState::Stopped);
        counter.set(counter.get() + 1);
    }));

    start(&mut env, 1)?;
    env.exec();
    assert!(env.has_active_thread());

    assert!(env.free_map_scope(MAP));
    assert_eq!(stopped.get(), 1);
    assert!(!env.has_active_thread());
    assert!(!env.free_map_scope(MAP));

    assert_eq!(env.map_scope(MAP).module_scopes().len(), 0);
    Ok(())
}

#[test]
fn string_collection_keeps_reachable_strings() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);
    asm.script(ScriptDecl::numbered(1));
    asm.push_str(b"kept").op(Code::DropModReg, &[0]).op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    let temp = env.strings_mut().intern(b"temporary");
    let held = env.strings_mut().intern(b"held");
    let host_held = held;
    env.hooks.ref_strings = Some(Box::new(move |strings: &mut StringTable| strings.mark(host_held)));

    start(&mut env, 1)?;
    env.exec();

    let freed = env.collect_strings()?;
    assert_eq!(freed, 1);
    assert!(env.strings().get(temp).is_none());
    assert!(env.strings().get(held).is_some());
    let kept = mod_reg(&env, 0);
    assert_eq!(env.strings().bytes(kept), Some(&b"kept"[..]));
    Ok(())
}

#[test]
fn saved_state_resumes_where_it_left_off() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);
    asm.script(ScriptDecl::numbered(1).regs(1));
    asm.op(Code::PushLit, &[3])
        .op(Code::DropModReg, &[0])
        .op(Code::PushLit, &[11])
        .op(Code::DropLocReg, &[0])
        .op(Code::DelayLit, &[1])
        .op(Code::PushLocReg, &[0])
        .op(Code::IncModReg, &[0])
        .op(Code::DropModReg, &[0])
        .op(Code::Terminate, &[]);
    let bytes = asm.finish()?;

    let mut env = setup(VmConfig::default(), &bytes)?;
    start(&mut env, 1)?;
    env.exec();
    assert_eq!(mod_reg(&env, 0), 3);

    let mut saved = Vec::new();
    env.save_state(&mut saved)?;

    let mut restored = Environment::default();
    restored.load_module_bytes(ModuleName::new("test"), &bytes)?;
    restored.load_state(&mut Cursor::new(saved))?;
    assert!(restored.script_active(MAP, &ScriptName::Num(1)));
    assert_eq!(mod_reg(&restored, 0), 3);

    restored.exec();
    assert_eq!(mod_reg(&restored, 0), 11);
    assert!(!restored.has_active_thread());
    Ok(())
}

#[test]
fn threads_started_mid_tick_wait_for_the_next_tick() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(1, 0);

    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::PushLit, &[2])
        .op(Code::CallFunc, &[1, BuiltinFunc::ScrStartResultI as Word])
        .op(Code::Drop, &[])
        .op(Code::Terminate, &[]);

    asm.script(ScriptDecl::numbered(2));
    asm.op(Code::IncModReg, &[0])
        .op(Code::DelayLit, &[1])
        .op(Code::IncModReg, &[0])
        .op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    start(&mut env, 1)?;
    env.exec();
    assert_eq!(mod_reg(&env, 0), 1);
    assert!(env.script_active(MAP, &ScriptName::Num(2)));

    env.exec();
    assert_eq!(mod_reg(&env, 0), 2);
    assert!(!env.script_active(MAP, &ScriptName::Num(2)));
    Ok(())
}

#[test]
fn oversized_declarations_fail_without_aborting() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(0, Word::MAX);
    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::Terminate, &[]);

    let mut env = Environment::default();
    let module = env.load_module_bytes(ModuleName::new("huge"), &asm.finish()?)?;
    let err = env.add_modules(MAP, &[module]);
    assert!(matches!(err, Err(Error::Alloc(_))), "{err:?}");
    assert_eq!(env.map_scope(MAP).module_scopes().len(), 0);

    let mut asm = Assembler::new();
    let big = asm.declare_function(0, 0, Word::MAX);
    asm.script(ScriptDecl::numbered(1));
    asm.op(Code::CallNul, &[big]).op(Code::Terminate, &[]);
    asm.begin_function(big);
    asm.op(Code::Retn, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    let kills = collect_kills(&mut env);
    start(&mut env, 1)?;
    env.exec();
    let kills = kills.borrow();
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].ty, KillType::OutOfMemory);
    assert_eq!(kills[0].data, big);
    assert!(!env.script_active(MAP, &ScriptName::Num(1)));
    Ok(())
}

#[test]
fn restart_resets_locals_to_the_start_arguments() -> Result<()> {
    let mut asm = Assembler::new();
    asm.module_vars(3, 0);
    asm.script(ScriptDecl::numbered(1).args(1).regs(2));
    let done = asm.new_label();
    asm.op(Code::IncModReg, &[0])
        .op(Code::PushModReg, &[0])
        .op(Code::PushLit, &[2])
        .op(Code::CmpEQ, &[])
        .jump(Code::JcndTru, &[], done)
        .op(Code::PushLit, &[5])
        .op(Code::DropLocReg, &[0])
        .op(Code::PushLit, &[9])
        .op(Code::DropLocReg, &[1])
        .op(Code::Restart, &[]);
    asm.bind(done);
    asm.op(Code::PushLocReg, &[0])
        .op(Code::DropModReg, &[1])
        .op(Code::PushLocReg, &[1])
        .op(Code::DropModReg, &[2])
        .op(Code::Terminate, &[]);

    let mut env = setup(VmConfig::default(), &asm.finish()?)?;
    assert!(env.script_start(MAP, &ScriptName::Num(1), &[7], ThreadInfo::default())?);
    env.exec();

    assert_eq!(mod_reg(&env, 0), 2);
    assert_eq!(mod_reg(&env, 1), 7);
    assert_eq!(mod_reg(&env, 2), 0);
    Ok(())
}
