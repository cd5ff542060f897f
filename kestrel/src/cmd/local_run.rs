//! The `local-run` subcommand.

use kestrel_common::prelude::*;

use crate::{backend::local::LocalBackend, opts::JobOpt};

/// Run a job with mapper processes on this host.
pub async fn run(opt: &JobOpt) -> Result<()> {
    let manifest = opt.load_manifest()?;
    if manifest.workers == 0 {
        return Err(format_err!("local-run requires at least one worker"));
    }
    super::export_cloud_credentials(&manifest);

    let job = super::prepare_job(opt, manifest);
    let mut backend = LocalBackend::new(&job.manifest, &opt.config);
    super::run_and_finish(&job, &mut backend).await
}
