//! Input URI resolution.
//!
//! The resolver turns the manifest's input URI set into the job's work
//! list: date macros are substituted first, then each expanded URI is
//! listed by its scheme handler, and the results are concatenated in
//! manifest order.

use chrono::{Datelike, NaiveDate};

use crate::{manifest::JobManifest, prelude::*, storage::CloudStorage};

/// One file to process: a URI plus its byte size.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkItem {
    /// Where the file lives.
    pub uri: String,
    /// Its size in bytes.
    pub size: u64,
}

/// The resolved input of a job.
#[derive(Clone, Debug)]
pub struct ResolvedInput {
    /// The sum of all item sizes.
    pub bytes_total: u64,
    /// The files to process, in listing order.
    pub items: Vec<WorkItem>,
}

/// Resolve the manifest's input URIs into a work list.
///
/// Fails with [`RunnerError::InputMissing`] if the manifest defines no
/// URIs, and with [`RunnerError::BackendUnavailable`] if listing fails.
/// An empty result is not an error here; the coordinator treats it as a
/// fatal pre-flight condition.
#[instrument(skip_all, level = "debug")]
pub async fn resolve(manifest: &JobManifest) -> Result<ResolvedInput> {
    if manifest.input.is_empty() {
        return Err(RunnerError::InputMissing.into());
    }
    let window = manifest.date_window()?;

    let mut items = Vec::new();
    for uri in &manifest.input {
        for expanded in expand_date_macros(uri, window) {
            let storage = <dyn CloudStorage>::for_uri(&expanded).await?;
            let listed = storage.list(&expanded).await.context(
                RunnerError::BackendUnavailable {
                    uri: expanded.clone(),
                },
            )?;
            items.extend(listed);
        }
    }

    let bytes_total = items.iter().map(|item| item.size).sum();
    Ok(ResolvedInput { bytes_total, items })
}

/// Substitute `{year}`, `{month}`, and `{day}` over the date window.
///
/// Returns one URI per day, both ends inclusive, with the integer values
/// substituted without zero padding; callers wanting `01` encode the
/// leading zero in the prefix. A URI without macros, or a job without a
/// date window, passes through unchanged.
pub fn expand_date_macros(
    uri: &str,
    window: Option<(NaiveDate, NaiveDate)>,
) -> Vec<String> {
    let has_macros = uri.contains("{year}")
        || uri.contains("{month}")
        || uri.contains("{day}");
    let (start, end) = match window {
        Some(window) if has_macros => window,
        _ => return vec![uri.to_owned()],
    };

    let mut expanded = Vec::new();
    let mut day = start;
    while day <= end {
        expanded.push(
            uri.replace("{year}", &day.year().to_string())
                .replace("{month}", &day.month().to_string())
                .replace("{day}", &day.day().to_string()),
        );
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    expanded
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn window(start: (i32, u32, u32), end: (i32, u32, u32)) -> Option<(NaiveDate, NaiveDate)> {
        Some((
            NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
        ))
    }

    #[test]
    fn expands_one_uri_per_day_inclusive() {
        let expanded = expand_date_macros(
            "s3://b/logs/{year}/{month}/{day}/",
            window((2020, 1, 1), (2020, 1, 3)),
        );
        assert_eq!(
            expanded,
            vec![
                "s3://b/logs/2020/1/1/",
                "s3://b/logs/2020/1/2/",
                "s3://b/logs/2020/1/3/",
            ]
        );
    }

    #[test]
    fn substitutions_are_not_zero_padded() {
        let expanded =
            expand_date_macros("s3://b/{year}-{month}-{day}", window((2019, 12, 31), (2020, 1, 1)));
        assert_eq!(expanded, vec!["s3://b/2019-12-31", "s3://b/2020-1-1"]);
    }

    #[test]
    fn uris_without_macros_pass_through() {
        let expanded =
            expand_date_macros("s3://b/static/", window((2020, 1, 1), (2020, 1, 3)));
        assert_eq!(expanded, vec!["s3://b/static/"]);
    }

    #[test]
    fn macros_without_a_window_pass_through() {
        let expanded = expand_date_macros("s3://b/{year}/", None);
        assert_eq!(expanded, vec!["s3://b/{year}/"]);
    }

    fn manifest_for(input: Vec<String>) -> JobManifest {
        serde_json::from_str::<JobManifest>(
            r#"{"input": [], "map_command": ["true"]}"#,
        )
        .map(|mut manifest| {
            manifest.input = input;
            manifest
        })
        .unwrap()
    }

    #[tokio::test]
    async fn empty_input_is_missing_input() {
        let err = resolve(&manifest_for(vec![])).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<RunnerError>(),
            Some(&RunnerError::InputMissing)
        );
    }

    #[tokio::test]
    async fn resolves_local_directories_with_totals() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        fs::write(dir.path().join("b.txt"), "beta\n").unwrap();

        let manifest =
            manifest_for(vec![format!("file://{}", dir.path().display())]);
        let resolved = resolve(&manifest).await.unwrap();
        assert_eq!(resolved.items.len(), 2);
        assert_eq!(resolved.bytes_total, 11);
    }

    #[tokio::test]
    async fn resolving_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        fs::write(dir.path().join("b.txt"), "beta\n").unwrap();

        let manifest =
            manifest_for(vec![format!("file://{}", dir.path().display())]);
        let first = resolve(&manifest).await.unwrap();

        // Feeding the resolved list back in yields the same list.
        let again = manifest_for(
            first.items.iter().map(|item| item.uri.clone()).collect(),
        );
        let second = resolve(&again).await.unwrap();
        assert_eq!(first.items, second.items);
        assert_eq!(first.bytes_total, second.bytes_total);
    }
}
