//! Helper structures for dealing with S3-compatible object stores.

use anyhow::{anyhow, Error, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use bytes::Bytes;
use globset::Glob;
use tracing::{debug, error};
use url::Url;

use crate::fs::{FileInfo, FileSystem};

#[derive(Debug)]
pub struct BucketKey {
    pub bucket: String,
    pub key: String,
}

/// Retrieves a bucket and key for a given path. The path must carry the
/// s3 protocol. Glob characters in the key are preserved.
pub fn path_to_bucket_key(path: &str) -> Result<BucketKey, Error> {
    let s3_url = Url::parse(path).map_err(|e| anyhow!("could not parse path given: {}", e))?;

    if s3_url.scheme() != "s3" {
        return Err(anyhow!("protocol of path is not S3"));
    }

    let bucket = s3_url
        .domain()
        .ok_or(anyhow!("something went wrong trying to retrieve bucket"))?;

    let mut key = "";
    if !s3_url.path().is_empty() {
        key = &s3_url.path()[1..]; // we slice out the first `/` character
    }

    Ok(BucketKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// id
    pub access_key_id: String,

    /// password
    pub secret_access_key: String,

    /// object store region
    pub region: String,

    /// custom endpoint, e.g. a minio url; empty selects the AWS default
    pub endpoint: String,
}

impl ClientConfig {
    /// Build a client config from the standard AWS environment variables.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        let mut region = var("AWS_REGION");
        if region.is_empty() {
            region = "us-east-1".to_string();
        }
        Self {
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            region,
            endpoint: var("AWS_ENDPOINT_URL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client: s3::Client,
}

impl Client {
    pub fn from_conf(cfg: ClientConfig) -> Self {
        let region = s3::config::Region::new(cfg.region);
        let mut conf_builder = s3::config::Builder::new()
            .region(region)
            .behavior_version_latest();

        if !cfg.access_key_id.is_empty() {
            let cred = s3::config::Credentials::new(
                cfg.access_key_id,
                cfg.secret_access_key,
                None,
                None,
                "static provider",
            );
            conf_builder = conf_builder.credentials_provider(cred);
        }
        if !cfg.endpoint.is_empty() {
            conf_builder = conf_builder.endpoint_url(cfg.endpoint).force_path_style(true);
        }

        Self {
            client: s3::Client::from_conf(conf_builder.build()),
        }
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, Error> {
        let data = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?
            .body
            .collect()
            .await?
            .into_bytes();
        Ok(data)
    }

    /// Ranged read. A range starting past the end of the object comes back
    /// empty instead of surfacing S3's InvalidRange, matching the local
    /// filesystem behavior.
    pub async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, Error> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(err) => {
                if err.as_service_error().and_then(|e| e.code()) == Some("InvalidRange") {
                    return Ok(Bytes::new());
                }
                return Err(err.into());
            }
        };
        Ok(output.body.collect().await?.into_bytes())
    }

    pub async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), Error> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<u64, Error> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        Ok(head.content_length().unwrap_or(0) as u64)
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    /// Lists objects under the given prefix, with their sizes.
    pub async fn list_objects_in_dir(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<(String, u64)>, Error> {
        let mut response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = vec![];
        while let Some(result) = response.next().await {
            match result {
                Ok(output) => {
                    for object in output.contents() {
                        let key = object.key.clone().unwrap_or_default();
                        let size = object.size().unwrap_or(0) as u64;
                        objects.push((key, size));
                    }
                }
                Err(err) => {
                    error!("{err:?}");
                    return Err(err.into());
                }
            }
        }

        Ok(objects)
    }
}

/// Object-store implementation of the driver's filesystem contract.
///
/// Paths are `s3://bucket/key` URIs. Globs are matched against listed keys
/// after narrowing the listing to the literal prefix of the pattern.
#[derive(Debug, Clone)]
pub struct S3FileSystem {
    client: Client,
}

impl S3FileSystem {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_env() -> Self {
        Self::new(Client::from_conf(ClientConfig::from_env()))
    }
}

/// Literal prefix of a key pattern, up to its first glob metacharacter.
fn glob_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?', '[']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

#[async_trait]
impl FileSystem for S3FileSystem {
    async fn list(&self, pattern: &str) -> Result<Vec<FileInfo>> {
        let BucketKey { bucket, key } = path_to_bucket_key(pattern)?;
        let prefix = glob_prefix(&key);

        let matcher = Glob::new(&key)
            .map_err(|e| anyhow!("bad glob pattern {:?}: {}", key, e))?
            .compile_matcher();

        let mut infos: Vec<FileInfo> = self
            .client
            .list_objects_in_dir(&bucket, prefix)
            .await?
            .into_iter()
            .filter(|(name, _)| matcher.is_match(name))
            .map(|(name, size)| FileInfo {
                name: format!("s3://{}/{}", bucket, name),
                size,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("listed {} objects for {:?}", infos.len(), pattern);
        Ok(infos)
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        let size = self.client.head_object(&bucket, &key).await?;
        Ok(FileInfo {
            name: path.to_string(),
            size,
        })
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        self.client
            .get_object_range(&bucket, &key, offset, length)
            .await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        self.client.get_object(&bucket, &key).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        self.client.put_object(&bucket, &key, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        self.client.delete_object(&bucket, &key).await
    }

    fn join(&self, base: &str, elem: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), elem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        let bk = path_to_bucket_key("s3://data/inputs/part-0.txt").unwrap();
        assert_eq!(bk.bucket, "data");
        assert_eq!(bk.key, "inputs/part-0.txt");

        assert!(path_to_bucket_key("file:///tmp/x").is_err());
    }

    #[test]
    fn keeps_glob_characters_in_key() {
        let bk = path_to_bucket_key("s3://data/w/job0/output-*").unwrap();
        assert_eq!(bk.key, "w/job0/output-*");
        assert_eq!(glob_prefix(&bk.key), "w/job0/output-");
    }
}
