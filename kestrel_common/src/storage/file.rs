//! Support for local filesystem input.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use walkdir::WalkDir;

use super::CloudStorage;
use crate::{prelude::*, resolver::WorkItem};

/// Backend for input that already lives on the local filesystem.
///
/// URIs are either bare absolute paths or `file:///absolute/path`;
/// listed work items are always normalized to the `file://` form.
#[derive(Debug)]
pub struct FileStorage;

#[async_trait]
impl CloudStorage for FileStorage {
    #[instrument(skip_all, fields(uri = %uri), level = "trace")]
    async fn list(&self, uri: &str) -> Result<Vec<WorkItem>> {
        trace!("listing {}", uri);

        let root = parse_file_uri(uri)?.to_owned();
        // Directory walking is synchronous; a listing is short-lived
        // and happens once per job, before any workers start.
        let items = tokio::task::spawn_blocking(move || -> Result<Vec<WorkItem>> {
            let mut items = Vec::new();
            for entry in WalkDir::new(&root) {
                let entry = entry
                    .with_context(|| format!("error listing directory {}", root))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let metadata = entry.metadata().with_context(|| {
                    format!("could not stat {}", entry.path().display())
                })?;
                items.push(WorkItem {
                    uri: format!("file://{}", entry.path().display()),
                    size: metadata.len(),
                });
            }
            Ok(items)
        })
        .await
        .context("listing task panicked")??;

        Ok(items)
    }

    #[instrument(skip_all, fields(uri = %uri, local_path = %local_path.display()), level = "trace")]
    async fn download(&self, uri: &str, local_path: &Path) -> Result<()> {
        let source = parse_file_uri(uri)?;
        tokio::fs::copy(source, local_path).await.with_context(|| {
            format!("could not copy {} to {}", source, local_path.display())
        })?;
        Ok(())
    }
}

/// Does this URI name a local path?
pub fn is_file_uri(uri: &str) -> bool {
    parse_file_uri(uri).is_ok()
}

/// Parse a filesystem URI, returning the absolute path inside it.
fn parse_file_uri(uri: &str) -> Result<&str> {
    lazy_static! {
        static ref RE: Regex = Regex::new("^(?i)(?:file://)?(?P<path>/.*)$")
            .expect("couldn't parse built-in regex");
    }

    let caps = RE
        .captures(uri)
        .ok_or_else(|| format_err!("the URI {:?} is not a local path", uri))?;
    Ok(caps.name("path").expect("missing hard-coded capture???").as_str())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn uri_parsing() {
        assert_eq!(parse_file_uri("/data/in.csv").unwrap(), "/data/in.csv");
        assert_eq!(
            parse_file_uri("file:///data/in.csv").unwrap(),
            "/data/in.csv"
        );
        assert!(parse_file_uri("s3://bucket/key").is_err());
        assert!(parse_file_uri("relative/path").is_err());
    }

    #[tokio::test]
    async fn lists_files_recursively_with_sizes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "beta-long\n").unwrap();

        let uri = format!("file://{}", dir.path().display());
        let mut items = FileStorage.list(&uri).await.unwrap();
        items.sort_by(|a, b| a.uri.cmp(&b.uri));

        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].uri,
            format!("file://{}/a.txt", dir.path().display())
        );
        assert_eq!(items[0].size, 6);
        assert_eq!(
            items[1].uri,
            format!("file://{}/sub/b.txt", dir.path().display())
        );
        assert_eq!(items[1].size, 10);
    }

    #[tokio::test]
    async fn listing_a_single_file_yields_itself() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("only.txt");
        fs::write(&path, "x\n").unwrap();

        let items = FileStorage
            .list(&format!("file://{}", path.display()))
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].uri, format!("file://{}", path.display()));
        assert_eq!(items[0].size, 2);
    }

    #[tokio::test]
    async fn downloads_by_copying() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, "payload").unwrap();

        FileStorage
            .download(&format!("file://{}", src.display()), &dst)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");
    }
}
