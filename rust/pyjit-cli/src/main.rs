//! pyjit: inspect and compile stack-machine bytecode with Cranelift.

mod colors;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};
use pyjit_bytecode::{verify, BytecodeError, CodeUnit};
use pyjit_codegen::context::target_triple;
use pyjit_codegen::emit::emit_to_file;
use pyjit_codegen::{
    compile_units, render_ir, CodegenError, JitConfig, LayoutRegistry, RuntimeFn, RuntimeGlobal,
    TargetDataLayout,
};
use strum::IntoEnumIterator;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use colors::{bold, cyan, gray, green, red, status_label, yellow};

const DEFAULT_LOG_FILTER: &str = "pyjit=info";

#[derive(ClapParser)]
#[command(name = "pyjit", version, about = "Cranelift JIT for stack-machine bytecode")]
struct Cli {
    /// JIT configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `pyjit=debug` (takes precedence over RUST_LOG)
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Cranelift IR of every code unit in a JSON file
    Ir {
        /// A code unit or an array of code units
        #[arg()]
        file: PathBuf,
    },
    /// Verify code units and report their maximum stack depth
    Check {
        #[arg()]
        file: PathBuf,
    },
    /// Print what lowering each instruction emitted, as JSON lines
    Trace {
        #[arg()]
        file: PathBuf,
    },
    /// Compile code units to a native object file
    Emit {
        #[arg()]
        file: PathBuf,

        /// Output path (default: the input path with an `.o` extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the runtime entry points and globals generated code may reference
    Symbols,
    /// Print the resolved field offsets of every runtime structure
    Layout,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("reading '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: BytecodeError,
    },
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error("encoding trace: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{failed} of {total} code units failed verification")]
    CheckFailed { failed: usize, total: usize },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", red("error:"), e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(directives: Option<&str>) {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => {
            debug!(path = %path.display(), "loading JIT configuration");
            JitConfig::load(path)?
        }
        None => JitConfig::default(),
    };

    match cli.command {
        Commands::Ir { file } => cmd_ir(&config, &file),
        Commands::Check { file } => cmd_check(&file),
        Commands::Trace { file } => cmd_trace(&config, &file),
        Commands::Emit { file, output } => cmd_emit(&config, &file, output),
        Commands::Symbols => {
            cmd_symbols();
            Ok(())
        }
        Commands::Layout => cmd_layout(&config),
    }
}

fn load_units(path: &Path) -> Result<Vec<CodeUnit>, CliError> {
    let json = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    CodeUnit::load_all(&json).map_err(|source| CliError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn cmd_ir(config: &JitConfig, file: &Path) -> Result<(), CliError> {
    for unit in load_units(file)? {
        println!("{}", gray(&format!("; code unit {}", unit.name)));
        print!("{}", render_ir(config, &unit)?);
        println!();
    }
    Ok(())
}

fn cmd_check(file: &Path) -> Result<(), CliError> {
    let units = load_units(file)?;
    let mut failed = 0;
    for unit in &units {
        match verify(unit) {
            Ok(profile) => println!(
                "{} {} {}",
                green("✓"),
                bold(&unit.name),
                gray(&format!("{} instructions, max stack depth {}", unit.len(), profile.max_depth))
            ),
            Err(e) => {
                failed += 1;
                println!("{} {} {}", red("✗"), bold(&unit.name), e);
            }
        }
    }
    if failed > 0 {
        return Err(CliError::CheckFailed {
            failed,
            total: units.len(),
        });
    }
    Ok(())
}

fn cmd_trace(config: &JitConfig, file: &Path) -> Result<(), CliError> {
    let units = load_units(file)?;
    let compiled = compile_units(config, &units)?;
    for function in &compiled.functions {
        for entry in &function.trace {
            let mut line = serde_json::to_value(entry)?;
            line["unit"] = serde_json::Value::from(function.name.as_str());
            println!("{line}");
        }
        let stats = function.stats;
        eprintln!(
            "{} {} {}",
            status_label("Lowered"),
            function.name,
            gray(&format!(
                "({} pushes, {} pops, {} acquires, {} releases, {} runtime calls)",
                stats.pushes, stats.pops, stats.acquires, stats.releases, stats.runtime_calls
            ))
        );
    }
    Ok(())
}

fn cmd_emit(config: &JitConfig, file: &Path, output: Option<PathBuf>) -> Result<(), CliError> {
    let units = load_units(file)?;
    let output = output.unwrap_or_else(|| file.with_extension("o"));

    println!("{} {}", status_label("Compiling"), file.display());
    let compiled = compile_units(config, &units)?;
    for function in &compiled.functions {
        println!(
            "{} {} {}",
            status_label("Lowered"),
            function.name,
            gray(&format!("({} instructions)", function.trace.len()))
        );
    }

    emit_to_file(compiled.module, &output)?;
    println!("{} {}", status_label("Emitted"), output.display());
    Ok(())
}

fn cmd_symbols() {
    println!("{}", bold("Entry points"));
    for function in RuntimeFn::iter() {
        println!("  {}", function.prototype());
    }
    println!();
    println!("{}", bold("Globals"));
    for global in RuntimeGlobal::iter() {
        let access = if global.writable() {
            yellow("rw")
        } else {
            gray("ro")
        };
        println!(
            "  {} {:<28} {}",
            access,
            cyan(global.name()),
            gray(global.description())
        );
    }
}

fn cmd_layout(config: &JitConfig) -> Result<(), CliError> {
    let triple = target_triple(&config.codegen)?;
    let mut registry = LayoutRegistry::new(TargetDataLayout::from_triple(&triple)?, config.runtime);
    println!("{} {}", status_label("Target"), triple);

    for layout in registry.resolve_all()? {
        println!(
            "{} {}",
            bold(layout.name()),
            gray(&format!("size {}, align {}", layout.size, layout.align))
        );
        for field in &layout.fields {
            println!(
                "  {:>5}  {:<24} {}",
                field.offset,
                cyan(field.name),
                gray(&format!("{:?}", field.ty))
            );
        }
    }
    Ok(())
}
