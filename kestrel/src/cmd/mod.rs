//! Subcommand implementations.

use std::{env, sync::Arc, time::Instant};

use kestrel_common::{
    manifest::JobManifest, prelude::*, progress::ProgressTracker,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{local::sibling_program, MapperBackend},
    coordinator::{run_job, Job, Outcome},
    opts::JobOpt,
};

pub mod local_run;
pub mod remote_run;

/// Build the job value shared by both run subcommands.
fn prepare_job(opt: &JobOpt, manifest: JobManifest) -> Job {
    let manifest = Arc::new(manifest);
    let output_path = manifest.output_path(&opt.config, chrono::Utc::now());
    Job {
        manifest,
        progress: ProgressTracker::new(),
        abort: CancellationToken::new(),
        output_path,
        reducer_command: vec![
            sibling_program("kestrel-reduce"),
            opt.config.display().to_string(),
        ],
    }
}

/// Export manifest credentials so the object store SDK's environment
/// chain picks them up, here and in local mapper children.
fn export_cloud_credentials(manifest: &JobManifest) {
    if let Some(access_key) = &manifest.cloud.access_key {
        env::set_var("AWS_ACCESS_KEY_ID", access_key);
    }
    if let Some(secret_key) = &manifest.cloud.secret_key {
        env::set_var("AWS_SECRET_ACCESS_KEY", secret_key);
    }
    if let Some(region) = &manifest.cloud.region {
        env::set_var("AWS_REGION", region);
    }
}

/// Run the job against a backend, always shutting the backend down, and
/// turn the outcome into messages and an exit status.
async fn run_and_finish(
    job: &Job,
    backend: &mut dyn MapperBackend,
) -> Result<()> {
    let started = Instant::now();
    let result = run_job(job, backend).await;
    if let Err(err) = backend.shutdown().await {
        error!("could not release backend resources: {:?}", err);
    }
    let outcome = result?;
    let elapsed = format_elapsed(started.elapsed());
    let output = job.output_path.display();

    match outcome {
        Outcome::Success => {
            let failed = job.progress.snapshot().files_failed;
            if failed > 0 {
                eprintln!("done with {} failed files. elapsed time: {}", failed, elapsed);
                eprintln!("partial results are in {}", output);
                std::process::exit(1);
            }
            eprintln!("done. elapsed time: {}", elapsed);
            eprintln!("results are in {}", output);
            Ok(())
        }
        Outcome::UserAborted => {
            eprintln!("user aborted. elapsed time: {}", elapsed);
            eprintln!("partial results are in {}", output);
            std::process::exit(1);
        }
        Outcome::WorkerFailed => {
            eprintln!("a map process failed. elapsed time: {}", elapsed);
            eprintln!("partial results are in {}", output);
            std::process::exit(1);
        }
        Outcome::ReducerFailed => {
            eprintln!("the reduce process failed. elapsed time: {}", elapsed);
            eprintln!("partial results are in {}", output);
            std::process::exit(1);
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_seconds = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formats_as_hours_minutes_seconds() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "0:01:01");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1:02:03");
    }
}
