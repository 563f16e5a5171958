use anyhow::{bail, Result};
use clap::Args;
use runner::Target;
use std::collections::HashSet;
use std::thread;
use tracing::{error, info};

use super::{run_target, PackageArgs, TargetRun};

#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Target as DIST:VERSION or DIST:VERSION:ARCH; may be repeated
    #[arg(long = "target", value_name = "DIST:VERSION[:ARCH]", required = true, value_parser = parse_target)]
    pub targets: Vec<Target>,

    #[command(flatten)]
    pub package: PackageArgs,
}

pub fn parse_target(raw: &str) -> Result<Target, String> {
    let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
    match parts.as_slice() {
        [dist, version] if !dist.is_empty() && !version.is_empty() => {
            Ok(Target::new(*dist, *version, "x86_64"))
        }
        [dist, version, arch] if !dist.is_empty() && !version.is_empty() && !arch.is_empty() => {
            Ok(Target::new(*dist, *version, *arch))
        }
        _ => Err(format!("expected DIST:VERSION[:ARCH], got '{}'", raw)),
    }
}

/// Targets share one task id, so a repeated target would collide on environment names.
fn first_duplicate(targets: &[Target]) -> Option<&Target> {
    let mut seen = HashSet::new();
    targets.iter().find(|target| !seen.insert(*target))
}

/// Each target is driven on its own thread; the config is shared read-only.
pub fn run(args: MatrixArgs, verbose: bool) -> Result<()> {
    if let Some(target) = first_duplicate(&args.targets) {
        bail!("Target {} is given more than once", target);
    }
    let config = args.package.load_config()?;
    let task_id = args.package.task_id();
    info!("Running {} targets for {}", args.targets.len(), args.package.package);

    let runs: Vec<TargetRun> = thread::scope(|scope| {
        let handles: Vec<_> = args
            .targets
            .iter()
            .cloned()
            .map(|target| {
                let config = config.clone();
                let package = &args.package;
                let task_id = task_id.as_str();
                let label = target.clone();
                let handle =
                    scope.spawn(move || run_target(config, package, target, task_id, verbose));
                (label, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(target, handle)| {
                handle.join().unwrap_or_else(|_| {
                    error!("Worker for {} panicked", target);
                    TargetRun {
                        target,
                        env_name: None,
                        report: None,
                        error: Some("worker thread panicked".to_string()),
                    }
                })
            })
            .collect()
    });

    for run in &runs {
        run.print();
    }

    let failed = runs.iter().filter(|r| !r.passed()).count();
    if failed > 0 {
        bail!("{} of {} targets failed", failed, runs.len());
    }
    println!("All {} targets passed", runs.len());
    Ok(())
}
