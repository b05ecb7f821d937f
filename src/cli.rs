use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "leasehold", version, about, long_about = None)]
pub struct Cli {
    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Runs a simulated fleet sharing leases over an in-memory coordinator,
    /// disturbing it between rounds and printing who holds what
    Demo {
        /// Number of simulated processes
        #[arg(short, long, default_value_t = 3)]
        members: usize,
        /// Number of leases to balance
        #[arg(short, long, default_value_t = 12)]
        resources: usize,
        /// Rounds of disturbance followed by re-checks
        #[arg(long, default_value_t = 5)]
        rounds: usize,
    },
    /// Prints the hash ring assignment of resources to members
    Ring {
        /// Member names
        #[arg(required = true)]
        members: Vec<String>,
        /// Number of resources to map
        #[arg(short, long, default_value_t = 20)]
        resources: usize,
    },
}

impl Cli {
    /// Log filter matching the requested verbosity
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
