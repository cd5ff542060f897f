#![deny(unsafe_code)]

//! A distributed map-reduce runner for embarrassingly-parallel
//! per-file jobs.

use clap::Parser;
use kestrel_common::{prelude::*, tracing_support::initialize_tracing};

mod backend;
mod cmd;
mod coordinator;
mod dashboard;
mod opts;

/// Command-line options, parsed using `clap`.
#[derive(Debug, Parser)]
#[command(
    about = "A distributed map-reduce runner for per-file batch jobs.",
    version
)]
enum Opt {
    /// Run a job with mapper processes on this host.
    #[command(name = "local-run")]
    LocalRun {
        #[command(flatten)]
        job: opts::JobOpt,
    },

    /// Run a job with mappers on provisioned cloud instances.
    #[command(name = "remote-run")]
    RemoteRun {
        #[command(flatten)]
        job: opts::JobOpt,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();
    let opt = Opt::parse();
    debug!("Args: {:?}", opt);

    match opt {
        Opt::LocalRun { ref job } => cmd::local_run::run(job).await,
        Opt::RemoteRun { ref job } => cmd::remote_run::run(job).await,
    }
}
