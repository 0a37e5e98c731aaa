/// Etch CLI.
/// Runs, inspects, and summarizes compiled bytecode. The language front end
/// (lexer/parser/checker) links in from outside the core; this driver works
/// with .etchb files it produces.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result};

use etch::cffi::CffiRegistry;
use etch::conf::EtchConf;
use etch::replay::{self, Recorder};
use etch::serializer;
use etch::vm::{ExecStatus, Executor};

// 64 MB stack for the worker; the VM keeps frames on the heap but deeply
// nested compilation fixtures can still recurse.
const STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(ClapParser)]
#[command(
    name = "etch",
    version,
    about = "The Etch register VM",
    long_about = "etch — execute, disassemble, and inspect compiled Etch bytecode (.etchb)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a compiled bytecode file
    Exec {
        path: PathBuf,
        /// Trace every dispatched opcode to stderr
        #[arg(long)]
        trace: bool,
        /// Print dispatch statistics on exit
        #[arg(short, long)]
        verbose: bool,
        /// RNG seed override
        #[arg(long)]
        seed: Option<u64>,
        /// Record the run and write a replay session here (.etchreplay);
        /// snapshot cadence comes from the snapshot_interval property
        #[arg(long, value_name = "PATH")]
        record: Option<PathBuf>,
    },
    /// Print the instruction listing, constants, and function table
    Disasm {
        path: PathBuf,
    },
    /// Summarize a recorded replay session (.etchreplay)
    Replay {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let handle = std::thread::Builder::new()
        .name("etch-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(move || run(cli))
        .expect("failed to spawn etch worker thread");
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(miette::miette!("internal error: worker thread panicked")),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        // ----------------------------------------------------------------
        // etch exec <file.etchb>
        // ----------------------------------------------------------------
        Commands::Exec { path, trace, verbose, seed, record } => {
            let conf = EtchConf::load(path.parent());
            let program = serializer::load_file(&path)
                .map_err(|e| miette::miette!("cannot load '{}': {}", path.display(), e))?;
            let source_file = program.source_file.clone();

            let mut exec = Executor::new(Arc::new(program), Arc::new(CffiRegistry::new()));
            exec.trace = trace || conf.trace;
            exec.set_seed(seed.unwrap_or(conf.seed));
            if record.is_some() {
                exec.recorder = Some(Recorder::new(&source_file, conf.snapshot_interval));
            }

            let status = exec.execute();
            if let (Some(out_path), Some(rec)) = (&record, exec.recorder.as_ref()) {
                std::fs::write(out_path, rec.serialize_session())
                    .map_err(|e| miette::miette!("cannot write '{}': {}", out_path.display(), e))?;
                eprintln!(
                    "[etch] recorded {} statements ({} snapshots) to {}",
                    rec.statement_count(),
                    rec.snapshot_count(),
                    out_path.display()
                );
            }
            if verbose || conf.verbose {
                eprint!("{}", exec.stats.report(10));
                eprintln!("[etch] {}", exec.stats.summary());
            }
            match status {
                ExecStatus::Done => Ok(()),
                ExecStatus::Paused => {
                    // No debugger attached here; a pause without one is a
                    // stray sentinel worth surfacing.
                    Err(miette::miette!("execution paused with no debugger attached"))
                }
                ExecStatus::Fatal(code) => {
                    std::process::exit(code);
                }
            }
        }

        // ----------------------------------------------------------------
        // etch disasm <file.etchb>
        // ----------------------------------------------------------------
        Commands::Disasm { path } => {
            let program = serializer::load_file(&path)
                .map_err(|e| miette::miette!("cannot load '{}': {}", path.display(), e))?;
            print!("{}", program.disassemble());
            Ok(())
        }

        // ----------------------------------------------------------------
        // etch replay <file.etchreplay>
        // ----------------------------------------------------------------
        Commands::Replay { path } => {
            let bytes = std::fs::read(&path).into_diagnostic()?;
            let session = replay::load_session(&bytes)
                .map_err(|e| miette::miette!("cannot load '{}': {}", path.display(), e))?;
            println!("{} {}", "session".green().bold(), session.source_file);
            println!("  statements: {}", session.total_statements);
            println!("  interval:   {}", session.snapshot_interval);
            println!("  duration:   {:.3}s", session.duration);
            println!("  snapshots:  {}", session.snapshots.len());
            for snap in &session.snapshots {
                println!(
                    "    #{:<6} line {:<5} pc {:<6} frames {:<3} t+{:.4}s",
                    snap.statement_index,
                    snap.line,
                    snap.pc,
                    snap.frames.len(),
                    snap.timestamp
                );
            }
            Ok(())
        }
    }
}
