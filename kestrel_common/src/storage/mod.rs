//! Input storage backends.
//!
//! A backend knows how to list the files under an input URI (producing
//! one work item per file, with its byte size) and how to download a
//! single file. The coordinator only lists; mappers only download.

use async_trait::async_trait;

use crate::{prelude::*, resolver::WorkItem};

pub mod file;
pub mod s3;

/// Abstract interface to the places input files can live.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// List every file at or under `uri`, returning one work item per
    /// file with its byte size. Listing a URI that points at a single
    /// file returns just that file.
    async fn list(&self, uri: &str) -> Result<Vec<WorkItem>>;

    /// Download the file at `uri` to `local_path`, replacing anything
    /// already there.
    async fn download(&self, uri: &str, local_path: &Path) -> Result<()>;
}

impl dyn CloudStorage {
    /// Get the storage backend for the specified URI.
    ///
    /// Scheme handlers are tried in order and the leftmost match wins:
    /// `s3://bucket[/prefix]`, then `[file://]/absolute/path`.
    pub async fn for_uri(uri: &str) -> Result<Box<dyn CloudStorage>> {
        if s3::is_s3_uri(uri) {
            Ok(Box::new(s3::S3Storage::new().await?))
        } else if file::is_file_uri(uri) {
            Ok(Box::new(file::FileStorage))
        } else {
            Err(format_err!("cannot find storage backend for {}", uri))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_schemes_are_rejected() {
        assert!(<dyn CloudStorage>::for_uri("gs://bucket/key").await.is_err());
        assert!(<dyn CloudStorage>::for_uri("relative/path").await.is_err());
    }
}
