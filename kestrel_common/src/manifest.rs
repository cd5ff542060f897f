//! The job manifest: what to run, on what input, and where.
//!
//! A manifest is a JSON document created by the user and loaded once at
//! startup; it is read-only for the lifetime of the job. Command-line
//! flags may override individual fields before the job starts. User
//! map/reduce code is reached by subprocess: `map_command` runs once per
//! input file with the downloaded path and the original URI appended to
//! its argv, and `reduce_command` runs once for the whole job, reading
//! records on stdin and writing the final artifact to stdout.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::Deserializer;

use crate::prelude::*;

/// A parsed job manifest.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JobManifest {
    /// The input URI set. Accepts a single string or a list of strings.
    #[serde(default, deserialize_with = "one_or_many")]
    pub input: Vec<String>,

    /// The user map command. Run as `argv… <local_path> <uri>`; its
    /// stdout lines are the `DATA` records for that file, and a nonzero
    /// exit is a per-file failure.
    pub map_command: Vec<String>,

    /// The user reduce command. Run exactly once; records are piped to
    /// its stdin one per line, and it must write the final artifact to
    /// its stdout once stdin is drained. When empty, records are copied
    /// through unchanged and a `done` diagnostic is printed at the end.
    #[serde(default)]
    pub reduce_command: Vec<String>,

    /// How many mapper processes to run per host.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Where to write the final artifact. Defaults to
    /// `results/<config-stem>.<timestamp>.out`.
    #[serde(default)]
    pub output_filename: Option<String>,

    /// Whether to render the progress dashboard.
    #[serde(default = "default_true")]
    pub output_job_progress: bool,

    /// How many times a failing file may be attempted before the job
    /// gives up on it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Extra packages installed on each remote instance with
    /// `sudo pip install <pkg>`.
    #[serde(default)]
    pub pip_requirements: Vec<String>,

    /// First day substituted into `{year}/{month}/{day}` input macros.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    /// Last day substituted into date macros (inclusive).
    #[serde(default)]
    pub end_date: Option<NaiveDate>,

    /// Number of days to expand, counting back from `end_date`.
    /// Overrides `start_date`.
    #[serde(default)]
    pub date_range: Option<i64>,

    /// Cloud provider settings, used by `remote-run` and for object
    /// store credentials.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Dashboard tuning.
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

/// Cloud provider settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    /// Access key for the object store and compute provider. Exported
    /// to the SDK's environment credential chain at startup.
    #[serde(default)]
    pub access_key: Option<String>,

    /// Secret key matching `access_key`.
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Region to provision instances in.
    #[serde(default)]
    pub region: Option<String>,

    /// Machine image for provisioned instances.
    #[serde(default)]
    pub image: Option<String>,

    /// Instance type for provisioned instances.
    #[serde(default)]
    pub instance_type: Option<String>,

    /// Security groups applied to provisioned instances.
    #[serde(default)]
    pub security_groups: Vec<String>,

    /// User name for shell connections to instances.
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,

    /// How many instances to provision. `0` means local-only.
    #[serde(default)]
    pub workers: usize,

    /// Where the manifest is copied on each instance.
    #[serde(default = "default_remote_config_path")]
    pub remote_config_path: String,

    /// Commands run on each instance before mappers start. Each must
    /// exit zero.
    #[serde(default = "default_initialization_commands")]
    pub initialization_commands: Vec<String>,
}

/// Dashboard tuning values.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DashboardConfig {
    /// How often the screen is redrawn.
    #[serde(with = "humantime_serde", default = "default_screen_refresh")]
    pub screen_refresh_interval: Duration,

    /// How often per-worker CPU usage is sampled.
    #[serde(with = "humantime_serde", default = "default_cpu_usage")]
    pub cpu_usage_interval: Duration,
}

impl Default for DashboardConfig {
    fn default() -> DashboardConfig {
        DashboardConfig {
            screen_refresh_interval: default_screen_refresh(),
            cpu_usage_interval: default_cpu_usage(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_ssh_username() -> String {
    "ubuntu".to_owned()
}

fn default_remote_config_path() -> String {
    "/tmp/kestrel-job.json".to_owned()
}

fn default_initialization_commands() -> Vec<String> {
    // The injected key is written by cloud-init, so nothing useful can
    // run until it finishes.
    vec!["while pgrep cloud-init > /dev/null; do sleep 1; done".to_owned()]
}

fn default_screen_refresh() -> Duration {
    Duration::from_secs(1)
}

fn default_cpu_usage() -> Duration {
    Duration::from_secs(2)
}

/// Deserialize either `"uri"` or `["uri", …]` into a `Vec<String>`.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(uri) => Ok(vec![uri]),
        OneOrMany::Many(uris) => Ok(uris),
    }
}

impl JobManifest {
    /// Load a manifest from `path`.
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<JobManifest> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("could not read job manifest {}", path.display()))?;
        let manifest: JobManifest = serde_json::from_str(&json)
            .with_context(|| format!("could not parse job manifest {}", path.display()))?;
        if manifest.map_command.is_empty() {
            return Err(format_err!(
                "job manifest {} has an empty map_command",
                path.display()
            ));
        }
        Ok(manifest)
    }

    /// Where to write the final artifact.
    ///
    /// Defaults to `results/<config-stem>.<UTC timestamp>.out` next to
    /// the current directory; `output_filename` overrides it verbatim.
    pub fn output_path(&self, config_path: &Path, now: DateTime<Utc>) -> PathBuf {
        if let Some(name) = &self.output_filename {
            return PathBuf::from(name);
        }
        let stem = config_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_owned());
        PathBuf::from("results").join(format!(
            "{}.{}.out",
            stem,
            now.format("%Y%m%d-%H%M%S")
        ))
    }

    /// The date window for macro expansion, if the manifest defines one.
    ///
    /// `date_range` counts back from `end_date` and overrides
    /// `start_date`. Both ends are inclusive.
    pub fn date_window(&self) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let end = match self.end_date {
            Some(end) => end,
            None => return Ok(None),
        };
        let start = match self.date_range {
            Some(range) => {
                if range < 1 {
                    return Err(format_err!("date_range must be at least 1, got {}", range));
                }
                end - chrono::Duration::days(range - 1)
            }
            None => self.start_date.unwrap_or(end),
        };
        if start > end {
            return Err(format_err!(
                "start_date {} is after end_date {}",
                start,
                end
            ));
        }
        Ok(Some((start, end)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn parse(json: &str) -> JobManifest {
        serde_json::from_str(json).expect("manifest should parse")
    }

    #[test]
    fn minimal_manifest_gets_defaults() {
        let manifest = parse(r#"{"input": "file:///data", "map_command": ["wc", "-w"]}"#);
        assert_eq!(manifest.input, vec!["file:///data"]);
        assert_eq!(manifest.workers, 4);
        assert_eq!(manifest.max_retries, 5);
        assert!(manifest.output_job_progress);
        assert!(manifest.reduce_command.is_empty());
        assert_eq!(manifest.cloud.ssh_username, "ubuntu");
        assert_eq!(manifest.cloud.workers, 0);
        assert_eq!(
            manifest.dashboard.screen_refresh_interval,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn input_accepts_a_list() {
        let manifest = parse(
            r#"{"input": ["s3://b/a/", "s3://b/b/"], "map_command": ["true"]}"#,
        );
        assert_eq!(manifest.input.len(), 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<JobManifest>(
            r#"{"input": "file:///d", "map_command": ["true"], "bogus": 1}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn durations_parse_humantime() {
        let manifest = parse(
            r#"{
                "input": "file:///d",
                "map_command": ["true"],
                "dashboard": {"screen_refresh_interval": "500ms", "cpu_usage_interval": "3s"}
            }"#,
        );
        assert_eq!(
            manifest.dashboard.screen_refresh_interval,
            Duration::from_millis(500)
        );
        assert_eq!(
            manifest.dashboard.cpu_usage_interval,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn output_path_is_templated() {
        let manifest = parse(r#"{"input": "file:///d", "map_command": ["true"]}"#);
        let now = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            manifest.output_path(Path::new("jobs/word_count.json"), now),
            PathBuf::from("results/word_count.20200102-030405.out")
        );
    }

    #[test]
    fn output_path_honors_override() {
        let manifest = parse(
            r#"{"input": "file:///d", "map_command": ["true"], "output_filename": "/tmp/out"}"#,
        );
        let now = Utc::now();
        assert_eq!(
            manifest.output_path(Path::new("job.json"), now),
            PathBuf::from("/tmp/out")
        );
    }

    #[test]
    fn date_range_overrides_start_date() {
        let manifest = parse(
            r#"{
                "input": "file:///d",
                "map_command": ["true"],
                "start_date": "2019-06-01",
                "end_date": "2020-01-03",
                "date_range": 3
            }"#,
        );
        let (start, end) = manifest.date_window().unwrap().unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2020, 1, 3).unwrap());
    }

    #[test]
    fn missing_dates_mean_no_window() {
        let manifest = parse(r#"{"input": "file:///d", "map_command": ["true"]}"#);
        assert!(manifest.date_window().unwrap().is_none());
    }
}
