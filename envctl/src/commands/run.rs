use anyhow::{bail, Result};
use clap::Args;
use runner::Target;

use super::{run_target, PackageArgs};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Distribution name, e.g. debian or almalinux
    #[arg(long)]
    pub dist: String,

    /// Distribution version, e.g. 11 or 9
    #[arg(long = "version", value_name = "VERSION")]
    pub dist_version: String,

    /// Target architecture
    #[arg(long, default_value = "x86_64")]
    pub arch: String,

    #[command(flatten)]
    pub package: PackageArgs,
}

pub fn run(args: RunArgs, verbose: bool) -> Result<()> {
    let config = args.package.load_config()?;
    let target = Target::new(args.dist, args.dist_version, args.arch);
    let task_id = args.package.task_id();

    let outcome = run_target(config, &args.package, target, &task_id, verbose);
    outcome.print();

    if !outcome.passed() {
        bail!("Run for {} failed", outcome.target);
    }
    Ok(())
}
