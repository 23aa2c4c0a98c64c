//! lpm - run a built-in program on the LPM execution core

use anyhow::{Context, Result};
use lpm_core::config::{usage_message, OPTIONS_ENV_VAR};
use lpm_core::engine::ShutdownHandle;
use lpm_core::interpreter::programs;
use lpm_core::perf::format_seconds;
use lpm_core::runtime::{fatal_error, ClockProfiler};
use lpm_core::{init_logging, Collaborators, ConfigError, RunSummary, Runtime, RuntimeOptions};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

fn print_help() {
    println!("lpm - logic-programming machine runtime v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  lpm [OPTIONS] [RUNTIME OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help              Print this help message");
    println!("  -v, --version           Print version information");
    println!("  --config <file>         Load runtime options from a JSON file");
    println!("  --print-options         Print the resolved runtime options as JSON");
    println!("  --program <name>        succeed | fail | between:LO:HI (default: succeed)");
    println!();
    println!("RUNTIME OPTIONS:");
    println!("  Read from {} first, then from the command line.", OPTIONS_ENV_VAR);
    println!("  -a -c -C<kb> -d<x> -D<i|e> -p -P<n> -r<n> -s<z><kb> -t -T<r|v|p> -x -z<z><kb>");
}

fn config_failure(err: &ConfigError) -> ! {
    eprintln!("lpm: {}", err);
    eprintln!("{}", usage_message());
    std::process::exit(1);
}

struct Invocation {
    config: Option<String>,
    print_options: bool,
    program: String,
    runtime_args: Vec<String>,
}

fn parse_args() -> Invocation {
    let mut invocation = Invocation {
        config: None,
        print_options: false,
        program: "succeed".to_string(),
        runtime_args: Vec::new(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("lpm {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--print-options" => invocation.print_options = true,
            "--config" | "--program" => {
                let Some(value) = args.next() else {
                    eprintln!("error: '{}' requires a value", arg);
                    eprintln!("Run 'lpm --help' for usage information.");
                    std::process::exit(1);
                };
                if arg == "--config" {
                    invocation.config = Some(value);
                } else {
                    invocation.program = value;
                }
            }
            _ => invocation.runtime_args.push(arg),
        }
    }
    invocation
}

fn resolve_options(invocation: &Invocation) -> Result<RuntimeOptions, ConfigError> {
    let base = match &invocation.config {
        Some(path) => RuntimeOptions::from_json_file(path)?,
        None => RuntimeOptions::default(),
    };
    let base = match std::env::var(OPTIONS_ENV_VAR) {
        Ok(env) => base.with_option_string(&env)?,
        Err(_) => base,
    };
    Ok(base.with_args(&invocation.runtime_args)?.normalized())
}

fn execute(
    mut runtime: Runtime,
    shutdown: Arc<OnceLock<ShutdownHandle>>,
) -> lpm_core::Result<(RunSummary, i32)> {
    runtime.init()?;
    if let Some(handle) = runtime.shutdown_handle() {
        let _ = shutdown.set(handle);
    }
    let summary = runtime.run()?;
    info!(metrics = %runtime.metrics(), "Runtime counters");
    let status = runtime.terminate()?;
    Ok((summary, status))
}

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = parse_args();
    let options = match resolve_options(&invocation) {
        Ok(options) => options,
        Err(e) => config_failure(&e),
    };

    if invocation.print_options {
        println!("{}", serde_json::to_string_pretty(&options)?);
        return Ok(());
    }

    init_logging();
    let program = programs::by_name(&invocation.program)
        .with_context(|| format!("cannot load program '{}'", invocation.program))?;

    let use_own_timer = options.use_own_timer;
    let collaborators = Collaborators {
        profiler: Arc::new(ClockProfiler::new()),
        ..Collaborators::default()
    };
    let runtime = Runtime::new(options, program, collaborators);
    let shutdown = Arc::new(OnceLock::new());
    let mut work = tokio::task::spawn_blocking({
        let shutdown = shutdown.clone();
        move || execute(runtime, shutdown)
    });

    let outcome = tokio::select! {
        joined = &mut work => joined.context("runtime thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down engine pool");
            if let Some(handle) = shutdown.get() {
                handle.shutdown();
            }
            std::process::exit(130);
        }
    };

    match outcome {
        Ok((summary, status)) => {
            if let Some(ms) = summary.user_time_ms {
                println!("{}", format_seconds(ms));
            }
            info!(
                found = summary.found_solution(),
                solutions = summary.solutions(),
                repeats = summary.repeats(),
                "Done"
            );
            if status != 0 {
                std::process::exit(status);
            }
            Ok(())
        }
        Err(e) if e.is_fatal() => fatal_error(&e),
        Err(e) => {
            eprintln!("lpm: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
