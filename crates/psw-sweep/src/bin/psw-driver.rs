#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use psw_sweep::driver::{default_experiments, run_captured, select, tally, ExperimentResult};

/// Runs every default experiment as a `psw-sweep` child process, one at a time.
#[derive(Debug, Parser)]
#[command(name = "psw-driver")]
struct Args {
    /// Sweep binary; defaults to `psw-sweep` next to this executable.
    #[arg(long, env = "PSW_SWEEP_BIN")]
    sweep_bin: Option<PathBuf>,

    /// Run only the named experiments (`<backbone>-<dataset>-<mode>`). Repeatable.
    #[arg(long)]
    only: Vec<String>,

    #[arg(long, env = "PSW_DATA_ROOT")]
    data_root: Option<PathBuf>,

    #[arg(long, env = "PSW_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, env = "PSW_EPOCHS")]
    epochs: Option<usize>,

    /// `random`, `imagenet` or a weights file, forwarded to every sweep.
    #[arg(long, env = "PSW_WEIGHTS")]
    weights: Option<String>,

    /// Forwarded as `--overwrite`.
    #[arg(long, env = "PSW_OVERWRITE", default_value_t = false)]
    overwrite: bool,

    /// Print the experiment names and exit.
    #[arg(long, default_value_t = false)]
    list: bool,
}

fn default_sweep_bin() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cannot derive bin dir from {}", exe.display()))?;
    Ok(dir.join(format!("psw-sweep{}", std::env::consts::EXE_SUFFIX)))
}

fn passthrough(args: &Args) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(p) = &args.data_root {
        out.push("--data-root".to_string());
        out.push(p.display().to_string());
    }
    if let Some(p) = &args.checkpoint_dir {
        out.push("--checkpoint-dir".to_string());
        out.push(p.display().to_string());
    }
    if let Some(n) = args.epochs {
        out.push("--epochs".to_string());
        out.push(n.to_string());
    }
    if let Some(w) = &args.weights {
        out.push("--weights".to_string());
        out.push(w.clone());
    }
    if args.overwrite {
        out.push("--overwrite".to_string());
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    psw_observe::logging::init_tracing();
    let args = Args::parse();

    let experiments = select(default_experiments(), &args.only);
    if args.list {
        for e in &experiments {
            println!("{}", e.name());
        }
        return Ok(());
    }
    if experiments.is_empty() {
        anyhow::bail!("no experiments match --only {:?}", args.only);
    }

    let sweep_bin = match &args.sweep_bin {
        Some(p) => p.clone(),
        None => default_sweep_bin()?,
    };
    let extra = passthrough(&args);
    info!(
        sweep_bin = %sweep_bin.display(),
        experiments = experiments.len(),
        "starting driver"
    );

    let started = Instant::now();
    let mut results = Vec::with_capacity(experiments.len());
    let mut interrupted = false;
    for experiment in &experiments {
        let name = experiment.name();
        let mut child_args = experiment.args();
        child_args.extend(extra.iter().cloned());
        info!(experiment = %name, "running experiment");

        let out = tokio::select! {
            res = run_captured(&sweep_bin, &child_args) => res,
            _ = signal::ctrl_c() => {
                warn!(experiment = %name, "ctrl-c received; stopping driver");
                interrupted = true;
                break;
            }
        };

        let result = match out {
            Ok(out) => {
                for line in out.stdout.lines() {
                    println!("{name}| {line}");
                }
                if out.success {
                    info!(experiment = %name, elapsed_ms = out.elapsed_ms, "experiment succeeded");
                } else {
                    error!(
                        experiment = %name,
                        code = ?out.code,
                        elapsed_ms = out.elapsed_ms,
                        stderr = %out.stderr.trim_end(),
                        "experiment failed"
                    );
                }
                ExperimentResult {
                    name,
                    success: out.success,
                    code: out.code,
                    elapsed_ms: out.elapsed_ms,
                }
            }
            Err(err) => {
                error!(experiment = %name, error = %format!("{err:#}"), "experiment did not start");
                ExperimentResult {
                    name,
                    success: false,
                    code: None,
                    elapsed_ms: 0,
                }
            }
        };
        results.push(result);
    }

    let (ok, failed) = tally(&results);
    for r in &results {
        println!(
            "[psw-driver] {} {} code={:?} elapsed_ms={}",
            if r.success { "ok  " } else { "FAIL" },
            r.name,
            r.code,
            r.elapsed_ms
        );
    }
    info!(
        succeeded = ok,
        failed,
        skipped = experiments.len() - results.len(),
        elapsed_ms = psw_observe::time::elapsed_ms(started),
        "driver complete"
    );

    if interrupted {
        std::process::exit(130);
    }
    if failed > 0 || results.len() < experiments.len() {
        std::process::exit(1);
    }
    Ok(())
}
