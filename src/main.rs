//! Grimoire runtime entry point.
//!
//! Runs a precompiled Grimoire bytecode file (`.grimb`) to completion:
//! load the artifact, register the built-in libraries, seed `main`, then
//! drive scheduling rounds until no coroutine remains.
//!
//! Behavior summary:
//! - With `-h/--help`, print usage.
//! - With `-v/--version`, print build-target + version.
//! - With a `.grimb` path, load the bytecode from disk and execute it.
//! - Everything after the path (optionally behind a literal `--`) is
//!   handed to the program through its `args` string-array global, if
//!   the bytecode declares one.
//!
//! A VM panic prints the panic message to stderr and exits 1 so shells
//! and scripts can detect failure. Set `RUST_LOG=grimoire_runtime=debug`
//! (or `trace`) to watch scheduling and unwinding decisions.

use std::cell::RefCell;
use std::env;
use std::fs;
use std::process::ExitCode;
use std::rc::Rc;

use tracing_subscriber::EnvFilter;

mod bytecode;
mod error;
mod value;
mod vm;

use bytecode::Bytecode;
use error::HostError;
use value::Obj;
use vm::primitives;
use vm::Vm;

/// Human-facing runtime version string, printed by `--version`.
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> String {
    format!(
        r#"Grimoire Runtime v{0}

Usage:
    grimoire <program.grimb> [-- args...]

Arguments:
    <program.grimb>
        Path to a compiled Grimoire bytecode file to execute.
    [args...]
        Passed to the program through its `args` string-array global.

Options:
    -h, --help
        Show this help message and exit.
    -v, --version
        Show runtime version."#,
        VERSION
    )
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() == 1 || args[1] == "-h" || args[1] == "--help" {
        println!("{}", usage());
        return ExitCode::SUCCESS;
    }

    if args[1] == "-v" || args[1] == "--version" {
        println!(
            "grimoire-runtime-build-{}-{}: v{}",
            env::consts::OS,
            env::consts::ARCH,
            VERSION
        );
        return ExitCode::SUCCESS;
    }

    let bc_path = &args[1];

    // Program arguments follow the path; skip a leading `--` if present.
    let program_args: &[String] = if args.len() > 2 {
        if args[2] == "--" {
            &args[3..]
        } else {
            &args[2..]
        }
    } else {
        &[]
    };

    let image = match fs::read(bc_path) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("failed to read {}: {}", bc_path, err);
            return ExitCode::FAILURE;
        }
    };

    let code = match Bytecode::read(&image) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new();
    vm.add_library(&primitives::CORE);
    vm.add_library(&primitives::FILE);

    if let Err(err) = vm.load(code).and_then(|_| vm.spawn()) {
        eprintln!("{}", err);
        return ExitCode::FAILURE;
    }

    // Programs that take arguments declare an `args` string-array global.
    let argv = Obj::StringArray(Rc::new(RefCell::new(program_args.to_vec())));
    match vm.set_object_variable("args", argv) {
        Ok(()) | Err(HostError::UnknownVariable(_)) => {}
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    }

    while vm.has_coroutines() && vm.is_running {
        vm.process();
    }

    if vm.is_panicking() {
        eprintln!("{}", vm.panic_message());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
