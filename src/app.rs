use crate::{config::Config, prelude::*, process::Pid, run};
use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_LEDGER_CAPACITY: &str = "4096";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Trace exec() calls system-wide, below a process, or below a command",
    override_usage = "extrace [-deflqt] [-o FILE] [-p PID|CMD...]"
)]
pub struct Cli {
    /// Print the working directory of each process
    #[arg(short = 'd')]
    pub show_cwd: bool,

    /// Print the environment of each process
    #[arg(short = 'e')]
    pub show_env: bool,

    /// Flat output, no indentation by process depth
    #[arg(short = 'f')]
    pub flat: bool,

    /// Print the full path of the executable instead of argv[0]
    #[arg(short = 'l')]
    pub full_path: bool,

    /// Do not print the arguments
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Also report process exits, with their status and duration
    #[arg(short = 't')]
    pub show_exit: bool,

    /// Write the trace to FILE instead of standard output
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Only trace descendants of PID
    #[arg(
        short = 'p',
        value_name = "PID",
        value_parser = clap::value_parser!(Pid).range(1..),
        conflicts_with = "command"
    )]
    pub pid: Option<Pid>,

    /// Obsolete, ignored
    #[arg(short = 'w', hide = true)]
    pub wide: bool,

    /// Maximum number of processes remembered to report their exit
    #[arg(
        long,
        env = "EXTRACE_LEDGER_CAPACITY",
        hide = true,
        default_value = DEFAULT_LEDGER_CAPACITY
    )]
    pub ledger_capacity: usize,

    /// Command to run and trace, extrace exits once it and its descendants are done
    #[arg(trailing_var_arg = true, value_name = "CMD")]
    pub command: Vec<String>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::try_from(cli)?;
    debug!("Starting with {config:?}");

    run::run(config)
}
