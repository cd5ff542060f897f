#![deny(unsafe_code)]

//! `kestrel-reduce`: the reducer worker.
//!
//! Reads one record per line on stdin and pipes them to the user reduce
//! command, which writes the final artifact to stdout when its input is
//! drained; the coordinator points our stdout at the artifact file.
//! On end-of-stream or an aborting signal we half-close the command's
//! stdin, so it finalizes exactly once, and we exit with its status.
//! With no reduce command configured, records are copied through
//! unchanged and a `done` diagnostic is printed.

use std::{env, process::Stdio};

use kestrel_common::{
    manifest::JobManifest,
    prelude::*,
    tracing_support::initialize_worker_tracing,
};
use tokio::{
    io::{self, AsyncWriteExt},
    process::Command,
    signal::unix::{signal, SignalKind},
};

/// Instructions on how to use this program.
const USAGE: &str = "Usage: kestrel-reduce <config>";

/// Our main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    initialize_worker_tracing();

    // Parse our arguments (manually, so we don't need to drag in a ton
    // of libraries).
    let args = env::args().collect::<Vec<_>>();
    if args.len() != 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }
    if args[1] == "--version" {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    } else if args[1] == "--help" {
        println!("{}", USAGE);
        std::process::exit(0);
    }
    let manifest = JobManifest::load(Path::new(&args[1]))?;

    if manifest.reduce_command.is_empty() {
        run_default().await?;
        std::process::exit(0);
    }

    let mut child = spawn_reduce_command(&manifest.reduce_command)?;
    let mut child_stdin = child
        .stdin
        .take()
        .expect("child should always have a stdin");
    let mut terminate = signal(SignalKind::terminate())
        .context("could not install signal handler")?;

    {
        let mut records = io::stdin();
        let copy = tokio::io::copy(&mut records, &mut child_stdin);
        tokio::pin!(copy);
        tokio::select! {
            result = &mut copy => {
                if let Err(err) = result {
                    warn!("error forwarding records to reduce command: {}", err);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                error!("reduce worker {} aborted", std::process::id());
            }
            _ = terminate.recv() => {
                error!("reduce worker {} aborted", std::process::id());
            }
        }
    }

    // Half-close the command's stdin; it finalizes and writes the
    // artifact now, even if we were interrupted.
    drop(child_stdin);
    let status = child
        .wait()
        .await
        .context("error waiting for reduce command")?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

/// Spawn the user reduce command with our stdout as its stdout.
fn spawn_reduce_command(argv: &[String]) -> Result<tokio::process::Child> {
    Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("could not run {:?}", argv[0]))
}

/// The built-in reducer: copy records through and report `done`.
async fn run_default() -> Result<()> {
    let mut records = io::stdin();
    let mut artifact = io::stdout();
    tokio::io::copy(&mut records, &mut artifact)
        .await
        .context("error copying records")?;
    artifact.flush().await.context("error flushing artifact")?;
    eprintln!("done");
    Ok(())
}
