//! Support for AWS S3 storage using the native AWS SDK.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::{io::AsyncWriteExt, sync::OnceCell};

use super::CloudStorage;
use crate::{prelude::*, resolver::WorkItem};

/// One shared S3 client for the whole process, so listing and
/// downloading many keys does not re-authenticate per key.
static SHARED_CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Backend for talking to AWS S3 using the native AWS SDK.
///
/// Credentials are read from the environment via the standard AWS
/// credential chain: `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
/// `AWS_REGION`, and optionally `AWS_ENDPOINT_URL` for S3-compatible
/// services like MinIO. The `--cloud-access-key`/`--cloud-secret-key`
/// flags export these variables before the SDK loads.
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Create a new `S3Storage` backend, reusing the process-wide
    /// client.
    #[instrument(skip_all, level = "trace")]
    pub async fn new() -> Result<S3Storage> {
        let client = SHARED_CLIENT
            .get_or_init(|| async {
                let config =
                    aws_config::defaults(BehaviorVersion::latest()).load().await;
                Client::new(&config)
            })
            .await
            .clone();
        Ok(S3Storage { client })
    }

    /// Download a single object to a local path.
    #[instrument(skip_all, fields(bucket = %bucket, key = %key, local_path = %local_path.display()), level = "trace")]
    async fn download_object(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to get object s3://{}/{}", bucket, key))?;

        let mut file =
            tokio::fs::File::create(local_path).await.with_context(|| {
                format!("failed to create local file {}", local_path.display())
            })?;

        let mut stream = response.body.into_async_read();
        tokio::io::copy(&mut stream, &mut file)
            .await
            .with_context(|| {
                format!(
                    "failed to write s3://{}/{} to {}",
                    bucket,
                    key,
                    local_path.display()
                )
            })?;

        file.flush().await?;
        Ok(())
    }
}

impl fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Storage").finish()
    }
}

#[async_trait]
impl CloudStorage for S3Storage {
    #[instrument(skip_all, fields(uri = %uri), level = "trace")]
    async fn list(&self, uri: &str) -> Result<Vec<WorkItem>> {
        trace!("listing {}", uri);

        let (bucket, prefix) = parse_s3_url(uri)?;

        let mut items = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request =
                self.client.list_objects_v2().bucket(bucket).prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("failed to list objects in {}", uri))?;

            if let Some(contents) = response.contents {
                for obj in contents {
                    if let Some(obj_key) = obj.key {
                        // Zero-byte keys ending in `/` are directory
                        // placeholders, not files.
                        if obj_key.ends_with('/') {
                            continue;
                        }
                        let size = obj.size.unwrap_or(0).max(0) as u64;
                        items.push(WorkItem {
                            uri: format!("s3://{}/{}", bucket, obj_key),
                            size,
                        });
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(items)
    }

    #[instrument(skip_all, fields(uri = %uri, local_path = %local_path.display()), level = "trace")]
    async fn download(&self, uri: &str, local_path: &Path) -> Result<()> {
        trace!("downloading {} to {}", uri, local_path.display());
        let (bucket, key) = parse_s3_url(uri)?;
        if key.is_empty() {
            return Err(format_err!("cannot download bucket root {}", uri));
        }
        self.download_object(bucket, key, local_path).await
    }
}

/// Does this URI name an S3 object or prefix?
pub fn is_s3_uri(uri: &str) -> bool {
    parse_s3_url(uri).is_ok()
}

/// Parse an S3 URL.
fn parse_s3_url(url: &str) -> Result<(&str, &str)> {
    lazy_static! {
        static ref RE: Regex = Regex::new("^s3://(?P<bucket>[^/]+)(?:/(?P<key>.*))?$")
            .expect("couldn't parse built-in regex");
    }

    let caps = RE
        .captures(url)
        .ok_or_else(|| format_err!("the URL {:?} could not be parsed", url))?;
    let bucket = caps
        .name("bucket")
        .expect("missing hard-coded capture???")
        .as_str();
    let key = caps.name("key").map(|m| m.as_str()).unwrap_or("");

    Ok((bucket, key))
}

#[test]
fn url_parsing() {
    assert_eq!(parse_s3_url("s3://top-level").unwrap(), ("top-level", ""));
    assert_eq!(parse_s3_url("s3://top-level/").unwrap(), ("top-level", ""));
    assert_eq!(
        parse_s3_url("s3://top-level/path").unwrap(),
        ("top-level", "path")
    );
    assert_eq!(
        parse_s3_url("s3://top-level/path/").unwrap(),
        ("top-level", "path/")
    );
    assert!(parse_s3_url("gs://foo/").is_err());
    assert!(parse_s3_url("/local/path").is_err());
}
