//! Command-line options shared by `local-run` and `remote-run`.

use chrono::NaiveDate;
use clap::Args;
use kestrel_common::{manifest::JobManifest, prelude::*};

/// Flags accepted by both run subcommands. Every flag overrides the
/// matching job-manifest field; unset flags leave the manifest alone.
#[derive(Args, Debug)]
pub struct JobOpt {
    /// Path to the job manifest.
    pub config: PathBuf,

    /// Number of mapper processes per host.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Where to write the final artifact.
    #[arg(long)]
    pub output_filename: Option<String>,

    /// Show the progress dashboard.
    #[arg(long, overrides_with = "no_output_job_progress")]
    pub output_job_progress: bool,

    /// Do not show the progress dashboard.
    #[arg(long)]
    pub no_output_job_progress: bool,

    /// How many times a failing file may be attempted.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Access key for the object store and compute provider.
    #[arg(long)]
    pub cloud_access_key: Option<String>,

    /// Secret key for the object store and compute provider.
    #[arg(long)]
    pub cloud_secret_key: Option<String>,

    /// Region to provision instances in.
    #[arg(long)]
    pub cloud_region: Option<String>,

    /// Machine image for provisioned instances.
    #[arg(long)]
    pub cloud_image: Option<String>,

    /// Instance type for provisioned instances.
    #[arg(long)]
    pub cloud_instance_type: Option<String>,

    /// Security group applied to provisioned instances. Repeatable.
    #[arg(long = "cloud-security-group")]
    pub cloud_security_group: Vec<String>,

    /// User name for shell connections to instances.
    #[arg(long)]
    pub cloud_ssh_username: Option<String>,

    /// How many instances to provision.
    #[arg(long)]
    pub cloud_workers: Option<usize>,

    /// Where the manifest is copied on each instance.
    #[arg(long)]
    pub cloud_remote_config_path: Option<String>,

    /// Command run on each instance before mappers start. Repeatable.
    #[arg(long = "cloud-initialization-commands")]
    pub cloud_initialization_commands: Vec<String>,

    /// Seconds between CPU usage samples.
    #[arg(long)]
    pub cpu_usage_interval: Option<f64>,

    /// Seconds between dashboard redraws.
    #[arg(long)]
    pub screen_refresh_interval: Option<f64>,

    /// First day substituted into date macros (YYYY-MM-DD).
    #[arg(long)]
    pub start_date: Option<NaiveDate>,

    /// Last day substituted into date macros (YYYY-MM-DD).
    #[arg(long)]
    pub end_date: Option<NaiveDate>,

    /// Number of days to expand, counting back from the end date.
    #[arg(long)]
    pub date_range: Option<i64>,
}

impl JobOpt {
    /// Load the job manifest and apply every flag override.
    pub fn load_manifest(&self) -> Result<JobManifest> {
        let mut manifest = JobManifest::load(&self.config)?;
        self.apply_to(&mut manifest);
        Ok(manifest)
    }

    fn apply_to(&self, manifest: &mut JobManifest) {
        if let Some(workers) = self.workers {
            manifest.workers = workers;
        }
        if let Some(output_filename) = &self.output_filename {
            manifest.output_filename = Some(output_filename.clone());
        }
        if self.no_output_job_progress {
            manifest.output_job_progress = false;
        } else if self.output_job_progress {
            manifest.output_job_progress = true;
        }
        if let Some(max_retries) = self.max_retries {
            manifest.max_retries = max_retries;
        }
        if let Some(key) = &self.cloud_access_key {
            manifest.cloud.access_key = Some(key.clone());
        }
        if let Some(secret) = &self.cloud_secret_key {
            manifest.cloud.secret_key = Some(secret.clone());
        }
        if let Some(region) = &self.cloud_region {
            manifest.cloud.region = Some(region.clone());
        }
        if let Some(image) = &self.cloud_image {
            manifest.cloud.image = Some(image.clone());
        }
        if let Some(instance_type) = &self.cloud_instance_type {
            manifest.cloud.instance_type = Some(instance_type.clone());
        }
        if !self.cloud_security_group.is_empty() {
            manifest.cloud.security_groups = self.cloud_security_group.clone();
        }
        if let Some(username) = &self.cloud_ssh_username {
            manifest.cloud.ssh_username = username.clone();
        }
        if let Some(workers) = self.cloud_workers {
            manifest.cloud.workers = workers;
        }
        if let Some(path) = &self.cloud_remote_config_path {
            manifest.cloud.remote_config_path = path.clone();
        }
        if !self.cloud_initialization_commands.is_empty() {
            manifest.cloud.initialization_commands =
                self.cloud_initialization_commands.clone();
        }
        if let Some(seconds) = self.cpu_usage_interval {
            manifest.dashboard.cpu_usage_interval = Duration::from_secs_f64(seconds);
        }
        if let Some(seconds) = self.screen_refresh_interval {
            manifest.dashboard.screen_refresh_interval =
                Duration::from_secs_f64(seconds);
        }
        if let Some(start_date) = self.start_date {
            manifest.start_date = Some(start_date);
        }
        if let Some(end_date) = self.end_date {
            manifest.end_date = Some(end_date);
        }
        if let Some(date_range) = self.date_range {
            manifest.date_range = Some(date_range);
        }
    }
}
