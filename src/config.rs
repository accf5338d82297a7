use crate::app::Cli;
use crate::prelude::*;
use crate::process::Pid;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// What goes into each trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
    pub show_cwd: bool,
    pub show_env: bool,
    /// No indentation by ancestry depth
    pub flat: bool,
    /// Resolved executable path instead of `argv[0]`
    pub full_path: bool,
    pub show_args: bool,
    /// Report exits (and re-execs) with the elapsed time
    pub show_exit: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            show_cwd: false,
            show_env: false,
            flat: false,
            full_path: false,
            show_args: true,
            show_exit: false,
        }
    }
}

/// Which processes are traced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every process on the host, rooted at init
    System,
    /// Descendants of an existing process
    Pid(Pid),
    /// Descendants of a command spawned by the tracer
    Command(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

impl OutputTarget {
    pub fn open(&self) -> Result<Box<dyn Write>> {
        match self {
            OutputTarget::Stdout => Ok(Box::new(std::io::stdout())),
            OutputTarget::File(path) => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to open output file {}", path.display()))?;
                Ok(Box::new(BufWriter::new(file)))
            }
        }
    }
}

/// Tracer configuration, built once from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub display: DisplayOptions,
    pub scope: Scope,
    pub output: OutputTarget,
    /// Maximum number of processes remembered for exit lines
    pub ledger_capacity: usize,
}

impl TryFrom<Cli> for Config {
    type Error = Error;
    fn try_from(cli: Cli) -> Result<Self> {
        if cli.ledger_capacity == 0 {
            bail!("The ledger capacity must be at least 1");
        }

        let scope = match (cli.pid, cli.command.is_empty()) {
            (Some(_), false) => bail!("A pid and a command cannot be traced at the same time"),
            (Some(pid), true) => Scope::Pid(pid),
            (None, false) => Scope::Command(cli.command),
            (None, true) => Scope::System,
        };

        Ok(Self {
            display: DisplayOptions {
                show_cwd: cli.show_cwd,
                show_env: cli.show_env,
                flat: cli.flat,
                full_path: cli.full_path,
                show_args: !cli.quiet,
                show_exit: cli.show_exit,
            },
            scope,
            output: cli
                .output
                .map_or(OutputTarget::Stdout, OutputTarget::File),
            ledger_capacity: cli.ledger_capacity,
        })
    }
}
