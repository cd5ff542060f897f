//! The `remote-run` subcommand.

use kestrel_common::prelude::*;

use crate::{backend::ec2::Ec2Backend, opts::JobOpt};

/// Run a job with mappers on provisioned cloud instances.
pub async fn run(opt: &JobOpt) -> Result<()> {
    let manifest = opt.load_manifest()?;
    if manifest.workers == 0 {
        return Err(format_err!("remote-run requires at least one mapper slot"));
    }
    if manifest.cloud.workers == 0 {
        return Err(format_err!(
            "remote-run requires cloud.workers (or --cloud-workers) > 0"
        ));
    }
    super::export_cloud_credentials(&manifest);

    let job = super::prepare_job(opt, manifest);
    let mut backend = Ec2Backend::new(job.manifest.clone())?;
    super::run_and_finish(&job, &mut backend).await
}
