//! graft CLI — injector front end.

mod process;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use graft_inject::{inject, InjectOutcome};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "graft")]
#[command(version, about = "Redirect and instrument running code", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a library into a running process
    Inject {
        /// Target process id or process name
        target: String,

        /// Library to load
        library: PathBuf,

        /// Bound on the remote wait, in seconds
        #[arg(long, default_value_t = 10, help_heading = "Behavior")]
        timeout: u64,

        /// Inject into every process matching a name
        #[arg(long, help_heading = "Behavior")]
        all: bool,

        /// Emit a machine-readable JSON report
        #[arg(long, help_heading = "Output")]
        json: bool,
    },

    /// List the modules mapped in a target process
    List {
        /// Target process id or process name
        target: String,
    },
}

#[derive(Serialize)]
struct InjectReport {
    pid: u32,
    library: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("graft: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Inject {
            target,
            library,
            timeout,
            all,
            json,
        } => run_inject(&target, &library, Duration::from_secs(timeout), all, json),
        Commands::List { target } => run_list(&target),
    }
}

fn run_inject(
    target: &str,
    library: &std::path::Path,
    timeout: Duration,
    all: bool,
    json: bool,
) -> Result<i32> {
    let pids = process::resolve_targets(target, all)?;

    let mut reports = Vec::with_capacity(pids.len());
    let mut hard_failures = 0usize;

    for pid in pids {
        let report = match inject(pid, library, timeout) {
            Ok(InjectOutcome::Loaded { handle }) => InjectReport {
                pid,
                library: library.display().to_string(),
                status: "loaded",
                handle: Some(handle),
                error: None,
            },
            // A timeout is a soft status: the load may have completed
            // anyway, so it does not fail the run.
            Ok(InjectOutcome::TimedOut) => InjectReport {
                pid,
                library: library.display().to_string(),
                status: "timed-out",
                handle: None,
                error: None,
            },
            Err(e) => {
                hard_failures += 1;
                InjectReport {
                    pid,
                    library: library.display().to_string(),
                    status: "failed",
                    handle: None,
                    error: Some(e.to_string()),
                }
            }
        };
        reports.push(report);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for r in &reports {
            match r.status {
                "loaded" => println!("pid {}: loaded ({:#x})", r.pid, r.handle.unwrap_or(0)),
                "timed-out" => println!(
                    "pid {}: no confirmation before timeout (load may still have completed)",
                    r.pid
                ),
                _ => eprintln!("pid {}: {}", r.pid, r.error.as_deref().unwrap_or("failed")),
            }
        }
    }

    Ok(if hard_failures == 0 { 0 } else { 1 })
}

fn run_list(target: &str) -> Result<i32> {
    for pid in process::resolve_targets(target, false)? {
        println!("pid {pid}:");
        for module in process::list_modules(pid)? {
            println!("  {:#014x}  {}", module.base, module.path);
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn inject_arguments_parse() {
        let cli = Cli::parse_from([
            "graft", "inject", "1234", "/tmp/a.so", "--timeout", "3", "--json",
        ]);
        match cli.command {
            Commands::Inject {
                target,
                library,
                timeout,
                all,
                json,
            } => {
                assert_eq!(target, "1234");
                assert_eq!(library, PathBuf::from("/tmp/a.so"));
                assert_eq!(timeout, 3);
                assert!(!all);
                assert!(json);
            }
            _ => panic!("expected inject subcommand"),
        }
    }

    #[test]
    fn list_arguments_parse() {
        let cli = Cli::parse_from(["graft", "-v", "list", "sshd"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::List { ref target } if target == "sshd"));
    }
}
