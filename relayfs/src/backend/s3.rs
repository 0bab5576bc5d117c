//! S3 adapter: conditional HeadObject / ListObjectsV2 for metadata and a
//! streamed GetObject body for reads.

use super::{Metadata, MetadataReply, ReadSource, RemoteBackend, digest_token};
use crate::error::BackendError;
use crate::path;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use serde::Deserialize;
use tracing::debug;

/// S3 backend options.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix the mounted tree lives under, without a trailing slash.
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint (MinIO, rustfs, ...); enables path-style addressing.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

enum Status {
    NotModified,
    NotFound,
    Transient(String),
    Other(String),
}

fn classify<E: std::fmt::Display>(err: &SdkError<E, HttpResponse>) -> Status {
    if let SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) = err {
        return Status::Transient(err.to_string());
    }
    match err.raw_response().map(|resp| resp.status().as_u16()) {
        Some(304) => Status::NotModified,
        Some(404) => Status::NotFound,
        Some(code) if code >= 500 || code == 429 => Status::Transient(format!("http {code}")),
        _ => Status::Other(err.to_string()),
    }
}

impl S3Backend {
    pub async fn new(config: &S3Config) -> Self {
        let mut loader = aws_config::ConfigLoader::default().credentials_provider(
            aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
        );
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let conf = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(config.endpoint.is_some())
            .build();
        Self {
            client: Client::from_conf(s3_conf),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        }
    }

    /// Wrap an already configured client.
    pub fn with_client(client: Client, bucket: impl Into<String>, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn key_for(&self, remote: &str) -> String {
        let rel = remote.trim_start_matches('/');
        match (self.prefix.is_empty(), rel.is_empty()) {
            (true, _) => rel.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, rel),
        }
    }

    fn remote_for(&self, key: &str) -> String {
        let rel = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        };
        path::normalize(rel)
    }

    async fn head_file(
        &self,
        remote: &str,
        hash: Option<&str>,
    ) -> Result<Option<MetadataReply>, BackendError> {
        let mut req = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key_for(remote));
        if let Some(etag) = hash {
            req = req.if_none_match(etag);
        }
        match req.send().await {
            Ok(out) => {
                let bytes = out.content_length().unwrap_or(0).max(0) as u64;
                let etag = out.e_tag().map(|s| s.to_string());
                Ok(Some(MetadataReply::Modified(Metadata::file(remote, bytes, etag))))
            }
            Err(e) => match classify(&e) {
                Status::NotModified => Ok(Some(MetadataReply::NotModified)),
                Status::NotFound => Ok(None),
                Status::Transient(msg) => Err(BackendError::Transient(msg)),
                Status::Other(msg) => Err(BackendError::Other(msg)),
            },
        }
    }

    async fn list_dir(
        &self,
        remote: &str,
        hash: Option<&str>,
    ) -> Result<MetadataReply, BackendError> {
        let key = self.key_for(remote);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };

        let mut children = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| match classify(&e) {
                    Status::Transient(msg) => BackendError::Transient(msg),
                    Status::NotFound => BackendError::NotFound(remote.to_string()),
                    Status::NotModified => BackendError::Other("unexpected 304 on listing".into()),
                    Status::Other(msg) => BackendError::Other(msg),
                })?;

            for object in out.contents() {
                let Some(k) = object.key() else { continue };
                // directory marker objects
                if k == prefix {
                    continue;
                }
                let size = object.size().unwrap_or(0).max(0) as u64;
                let etag = object.e_tag().map(|s| s.to_string());
                children.push(Metadata::file(self.remote_for(k), size, etag));
            }
            for common in out.common_prefixes() {
                if let Some(p) = common.prefix() {
                    children.push(Metadata::dir(self.remote_for(p), None, None));
                }
            }

            match out.next_continuation_token() {
                Some(next) if out.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        if children.is_empty() && remote != "/" {
            return Err(BackendError::NotFound(remote.to_string()));
        }
        children.sort_by(|a, b| a.path.cmp(&b.path));

        let parts: Vec<Vec<u8>> = children
            .iter()
            .map(|c| format!("{}:{}", c.path, c.hash.as_deref().unwrap_or("/")).into_bytes())
            .collect();
        let token = digest_token(parts.iter().map(|p| p.as_slice()));
        if hash == Some(token.as_str()) {
            return Ok(MetadataReply::NotModified);
        }
        Ok(MetadataReply::Modified(Metadata::dir(
            remote,
            Some(token),
            Some(children),
        )))
    }
}

#[async_trait]
impl RemoteBackend for S3Backend {
    async fn metadata(
        &self,
        remote: &str,
        hash: Option<&str>,
    ) -> Result<MetadataReply, BackendError> {
        if remote != "/" {
            if let Some(reply) = self.head_file(remote, hash).await? {
                return Ok(reply);
            }
            debug!(path = remote, "no object at key, trying as prefix");
        }
        self.list_dir(remote, hash).await
    }

    async fn open_read_stream(&self, remote: &str) -> Result<ReadSource, BackendError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(remote))
            .send()
            .await
            .map_err(|e| match classify(&e) {
                Status::NotFound => BackendError::NotFound(remote.to_string()),
                Status::Transient(msg) => BackendError::Transient(msg),
                Status::NotModified => BackendError::Other("unexpected 304 on read".into()),
                Status::Other(msg) => BackendError::Other(msg),
            })?;
        Ok(Box::pin(out.body.into_async_read()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Region};

    fn offline_backend(prefix: &str) -> S3Backend {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3Backend::with_client(Client::from_conf(conf), "bucket", prefix)
    }

    #[test]
    fn test_key_mapping_without_prefix() {
        let backend = offline_backend("");
        assert_eq!(backend.key_for("/"), "");
        assert_eq!(backend.key_for("/a/b.txt"), "a/b.txt");
        assert_eq!(backend.remote_for("a/b.txt"), "/a/b.txt");
        assert_eq!(backend.remote_for("a/sub/"), "/a/sub");
    }

    #[test]
    fn test_key_mapping_with_prefix() {
        let backend = offline_backend("/mnt/data/");
        assert_eq!(backend.key_for("/"), "mnt/data");
        assert_eq!(backend.key_for("/x"), "mnt/data/x");
        assert_eq!(backend.remote_for("mnt/data/x/y"), "/x/y");
    }
}
