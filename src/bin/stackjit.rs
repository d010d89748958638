//! Command-line driver for the stackjit translator.
//!
//! Usage:
//!   `stackjit translate <file> [--ref-debug] [--trace-refs] [--count-allocs] [--no-verify] [--stats]`
//!   `stackjit run <file> --func <name> [--arg <int>]...`
//!   `stackjit check-layout [--trace-refs] [--count-allocs]`

use bumpalo::Bump;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process;

use stackjit::asm::parse_module;
use stackjit::core::{CompilationSession, TranslatorConfig};
use stackjit::ir::Module;
use stackjit::layout::LayoutProbe;
use stackjit::lower::{CodeUnit, Translator};
use stackjit::sim::SimRuntime;

#[derive(Parser, Debug)]
#[command(name = "stackjit")]
#[command(about = "Translate stack bytecode listings into CFG IR")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate every code unit of a listing and print the IR module
    Translate {
        /// Bytecode listing
        file: PathBuf,

        #[command(flatten)]
        modes: Modes,

        /// Skip the IR verifier
        #[arg(long = "no-verify")]
        no_verify: bool,

        /// Print session statistics after the module
        #[arg(long)]
        stats: bool,
    },

    /// Translate one code unit and execute it on the simulated host
    Run {
        /// Bytecode listing
        file: PathBuf,

        /// Code unit to execute
        #[arg(long = "func")]
        func: String,

        /// Integer positional argument (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<i64>,

        #[command(flatten)]
        modes: Modes,
    },

    /// Print the host layout table and check it against the simulated host
    CheckLayout {
        #[command(flatten)]
        modes: Modes,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct Modes {
    /// Maintain the debug reference total
    #[arg(long = "ref-debug")]
    ref_debug: bool,

    /// Assume the trace-refs object header
    #[arg(long = "trace-refs")]
    trace_refs: bool,

    /// Assume the count-allocs type object tail
    #[arg(long = "count-allocs")]
    count_allocs: bool,
}

impl Modes {
    /// Environment defaults overridden by any flag given.
    fn config(self) -> TranslatorConfig {
        let mut config = TranslatorConfig::from_env();
        if self.ref_debug {
            config = config.with_ref_debug(true);
        }
        if self.trace_refs {
            config = config.with_trace_refs(true);
        }
        if self.count_allocs {
            config = config.with_count_allocs(true);
        }
        config
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let status = match cli.command {
        Command::Translate {
            file,
            modes,
            no_verify,
            stats,
        } => translate(&file, modes.config().with_verify(!no_verify), stats),
        Command::Run {
            file,
            func,
            args,
            modes,
        } => run(&file, modes.config().with_ref_debug(true), &func, &args),
        Command::CheckLayout { modes } => check_layout(modes.config()),
    };
    process::exit(status);
}

fn load_units(file: &PathBuf) -> Result<Vec<CodeUnit>, i32> {
    let text = fs::read_to_string(file).map_err(|err| {
        log::error!("failed to read {}: {}", file.display(), err);
        1
    })?;
    parse_module(&text).map_err(|err| {
        log::error!("{}: {}", file.display(), err);
        1
    })
}

fn module_name(file: &PathBuf) -> String {
    file.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "module".to_string())
}

fn translate(file: &PathBuf, config: TranslatorConfig, stats: bool) -> i32 {
    let units = match load_units(file) {
        Ok(units) => units,
        Err(status) => return status,
    };

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let translator = Translator::new(config);
    let mut module = Module::new(&module_name(file));

    let mut failed = 0;
    for unit in &units {
        if let Err(err) = translator.translate(&session, &mut module, unit) {
            eprintln!("error: {}: {}", unit.name, err);
            failed += 1;
        }
    }

    print!("{}", module);
    if stats {
        eprint!("{}", session.stats());
    }
    if failed > 0 {
        1
    } else {
        0
    }
}

fn run(file: &PathBuf, config: TranslatorConfig, func: &str, args: &[i64]) -> i32 {
    let units = match load_units(file) {
        Ok(units) => units,
        Err(status) => return status,
    };
    let Some(unit) = units.iter().find(|unit| unit.name == func) else {
        log::error!("no code unit named {} in {}", func, file.display());
        return 1;
    };

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let translator = Translator::new(config);
    let mut module = Module::new(&module_name(file));
    if let Err(err) = translator.translate(&session, &mut module, unit) {
        eprintln!("error: {}: {}", unit.name, err);
        return 1;
    }

    let outcome = SimRuntime::new(&config).and_then(|mut sim| {
        let globals = sim.new_dict()?;
        let mut objects = Vec::with_capacity(args.len());
        for &arg in args {
            objects.push(sim.new_int(arg)?);
        }
        let outcome = sim.run_unit(&module, unit, globals, &objects)?;
        for object in objects {
            sim.release(object)?;
        }
        sim.release(globals)?;
        for violation in sim.violations() {
            eprintln!("violation: {}", violation);
        }
        Ok(outcome)
    });

    match outcome {
        Ok(outcome) => {
            println!("{}", outcome.summary());
            println!("{}", outcome.balance.to_string().trim_end());
            if outcome.balance.is_balanced() {
                0
            } else {
                2
            }
        }
        Err(err) => {
            eprintln!("error: {}", err);
            1
        }
    }
}

fn check_layout(config: TranslatorConfig) -> i32 {
    let translator = Translator::new(config);
    let layout = translator.layout();
    println!("host layout {}", layout.version);
    for (field, value) in layout.checked_fields() {
        println!("  {:<32} {:>6}", field, value);
    }

    let sim = match SimRuntime::new(&config) {
        Ok(sim) => sim,
        Err(err) => {
            eprintln!("error: {}", err);
            return 1;
        }
    };
    match layout.validate(&LayoutProbe::from_layout(sim.layout())) {
        Ok(()) => {
            println!("self-check: ok");
            0
        }
        Err(err) => {
            println!("self-check: {}", err);
            1
        }
    }
}
