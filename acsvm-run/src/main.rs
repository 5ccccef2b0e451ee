mod config;

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::rc::Rc;

use acsvm::{Environment, KillInfo, ModuleName, ReadError, ScopeId, ScriptName, ScriptType, SWord, Thread, ThreadInfo, Word};
use anyhow::{Context, Result};
use clap::Parser as ClapParser;

use crate::config::{RunConfig, RunConfigReader};

const MAP: ScopeId = ScopeId::new(0, 0, 0);

#[derive(ClapParser, Debug)]
#[command(version, about = "Runs compiled acsvm modules until their scripts finish")]
struct Args {
    /// JSON run configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    branch_limit: Option<Word>,

    #[arg(short = 't', long)]
    max_ticks: Option<u64>,

    /// Print the translated code of every module before running
    #[arg(short, long)]
    dump: bool,

    /// Write the final state here
    #[arg(long)]
    save: Option<PathBuf>,

    /// Resume from a saved state instead of starting OPEN scripts
    #[arg(long)]
    load: Option<PathBuf>,

    /// Extra scripts to start by number
    #[arg(short, long)]
    start: Vec<SWord>,

    /// Module files; each file path is the module name
    #[arg(required_unless_present = "load")]
    modules: Vec<PathBuf>,
}

fn read_config(args: &Args) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfigReader::read_run_json(path).with_context(|| format!("reading {}", path.display()))?,
        None => RunConfig::default(),
    };
    if let Some(limit) = args.branch_limit {
        config.vm.branch_limit = limit;
    }
    if let Some(ticks) = args.max_ticks {
        config.max_ticks = ticks;
    }
    Ok(config)
}

fn install_hooks(env: &mut Environment) {
    env.hooks.load_module = Some(Box::new(|name: &ModuleName| {
        fs::read(&name.name).map_err(ReadError::from)
    }));
    env.hooks.print = Some(Box::new(|_: &ThreadInfo, bytes: &[u8]| {
        println!("{}", String::from_utf8_lossy(bytes));
    }));
    env.hooks.kill = Some(Box::new(|info: &KillInfo| {
        log::error!(
            "{} script {} killed at {}: {} ({})",
            info.module,
            info.script.as_ref().map_or_else(|| "?".to_string(), |s| s.to_string()),
            info.code_ptr,
            info.ty,
            info.data
        );
    }));

    // HostPrintLine: prints its arguments as signed integers
    let idx = env.add_func(Rc::new(|_: &mut Environment, _: &mut Thread, args: &[Word]| {
        let line: Vec<String> = args.iter().map(|&a| (a as SWord).to_string()).collect();
        println!("{}", line.join(" "));
        false
    }));
    log::trace!("HostPrintLine bound at {idx}");
}

fn load_modules(env: &mut Environment, args: &Args) -> Result<()> {
    let mut modules = Vec::new();
    for path in &args.modules {
        let name = env.module_name(&path.to_string_lossy());
        let module = env
            .get_module(&name)
            .with_context(|| format!("loading module {}", path.display()))?;
        if args.dump {
            println!("; module {name}");
            print!("{}", module.disassemble());
        }
        modules.push(module);
    }
    env.add_modules(MAP, &modules)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = read_config(&args)?;

    env_logger::Builder::new()
        .filter_level(config.logger.level_filter)
        .parse_default_env()
        .init();

    let mut env = Environment::new(config.vm.clone());
    install_hooks(&mut env);

    match &args.load {
        Some(path) => {
            let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
            env.load_state(&mut BufReader::new(file))
                .with_context(|| format!("loading state {}", path.display()))?;
            log::info!("resumed from {}", path.display());
        }
        None => {
            load_modules(&mut env, &args)?;
            let started = env.script_start_type(MAP, ScriptType::OPEN, &[], ThreadInfo::default())?;
            log::debug!("started {started} OPEN scripts");
        }
    }
    for &number in &args.start {
        if !env.script_start(MAP, &ScriptName::Num(number), &[], ThreadInfo::default())? {
            log::warn!("script {number} was not started");
        }
    }

    let mut ticks = 0;
    while env.has_active_thread() && ticks < config.max_ticks {
        env.exec();
        ticks += 1;
    }
    let freed = env.collect_strings()?;
    log::info!("ran {ticks} ticks, freed {freed} strings");
    if env.has_active_thread() {
        log::warn!("scripts still active after {ticks} ticks");
    }

    if let Some(path) = &args.save {
        let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut w = BufWriter::new(file);
        env.save_state(&mut w)?;
        w.flush()?;
        log::info!("saved state to {}", path.display());
    }
    Ok(())
}
