//! Lox CLI.
//!
//! `lox` with no argument enters the REPL; `lox <path>` runs a script.
//! Exit codes: 0 on success, 65 on compile errors, 70 on runtime errors,
//! 74 when a file or the terminal cannot be used.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use rustyline::DefaultEditor;

use lox_vm::{InterpretError, Vm, VmOptions};

mod config;
use config::Config;

const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox bytecode interpreter", long_about = None)]
struct Cli {
    /// Script to run; omit to enter the REPL
    path: Option<PathBuf>,

    /// Runtime configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trace every instruction and the stack to stderr
    #[arg(long)]
    trace_execution: bool,

    /// Dump each compiled function's bytecode to stderr
    #[arg(long)]
    print_code: bool,

    /// Run the garbage collector at every opportunity
    #[arg(long)]
    stress_gc: bool,

    /// Log allocations, frees, and collection cycles to stderr
    #[arg(long)]
    log_gc: bool,

    /// Treat 0 and "" as falsy in addition to nil and false
    #[arg(long)]
    extended_falseness: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Bad invocations print usage and exit 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            process::exit(if error.use_stderr() { 1 } else { 0 });
        }
    };
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Error: {}", error);
            process::exit(EX_IOERR);
        }
    };

    let options = VmOptions {
        trace_execution: config.trace_execution || cli.trace_execution,
        print_code: config.print_code || cli.print_code,
        stress_gc: config.stress_gc || cli.stress_gc,
        log_gc: config.log_gc || cli.log_gc,
        extended_falseness: config.extended_falseness || cli.extended_falseness,
    };

    match cli.path {
        Some(path) => run_file(&path, options),
        None => repl(options),
    }
}

fn run_file(path: &Path, options: VmOptions) -> ! {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not open file \"{}\": {}", path.display(), error);
            process::exit(EX_IOERR);
        }
    };

    let mut vm = Vm::new(options);
    match vm.interpret(&source, false) {
        Ok(()) => process::exit(0),
        Err(InterpretError::Compile(errors)) => {
            for error in errors {
                eprintln!("{}", error);
            }
            process::exit(EX_DATAERR);
        }
        Err(InterpretError::Runtime(error)) => {
            eprintln!("{}", error);
            process::exit(EX_SOFTWARE);
        }
    }
}

fn repl(options: VmOptions) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Error: {}", error);
            process::exit(EX_IOERR);
        }
    };

    let mut vm = Vm::new(options);
    loop {
        match editor.readline(">>> ") {
            Ok(line) => {
                if line == "exit" {
                    break;
                }
                if line == "reset" {
                    // A fresh VM: new heap, empty globals, lambda counter
                    // back to zero.
                    vm = Vm::new(options);
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                if let Err(error) = vm.interpret(&line, true) {
                    eprintln!("{}", error);
                }
            }
            // Ctrl-C / Ctrl-D end the session.
            Err(_) => break,
        }
    }
}
