//! Object-store backend exposed as a read-only [`VirtualFs`]
//!
//! Target URLs look like `s3://user:password@bucket[.endpoint][/prefix]?region=...`.
//! Missing credentials mean anonymous access; a dotted host splits into the
//! bucket name and a custom endpoint (path-style addressing).

use crate::fileserver::{FileMeta, FileStream, FsError, VirtualFs};
use async_trait::async_trait;
use chrono::DateTime;
use futures::stream;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::time::SystemTime;
use url::Url;

pub struct S3Fs {
    bucket: Box<Bucket>,
    prefix: String,
}

impl S3Fs {
    pub fn from_target(target: &Url) -> anyhow::Result<Self> {
        let credentials = match target.password() {
            Some(secret) => Credentials::new(
                Some(target.username()),
                Some(secret),
                None,
                None,
                None,
            )?,
            None => Credentials::anonymous()?,
        };

        let host = match (target.host_str().unwrap_or_default(), target.port()) {
            (h, Some(port)) => format!("{}:{}", h, port),
            (h, None) => h.to_string(),
        };
        let region_name = target
            .query_pairs()
            .find(|(k, _)| k == "region")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| "us-east-1".to_string());

        let (bucket_name, region) = match host.split_once('.') {
            Some((bucket, endpoint)) => (
                bucket.to_string(),
                Region::Custom {
                    region: region_name,
                    endpoint: format!("https://{}", endpoint),
                },
            ),
            None => (
                host.to_string(),
                region_name.parse().unwrap_or(Region::UsEast1),
            ),
        };

        let custom_endpoint = matches!(region, Region::Custom { .. });
        let mut bucket = Bucket::new(&bucket_name, region, credentials)?;
        if custom_endpoint {
            bucket = bucket.with_path_style();
        }

        let prefix = target.path().trim_matches('/').to_string();
        Ok(Self { bucket, prefix })
    }

    fn key(&self, path: &str) -> String {
        let rel = path.trim_matches('/');
        match (self.prefix.is_empty(), rel.is_empty()) {
            (true, _) => rel.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, rel),
        }
    }
}

#[async_trait]
impl VirtualFs for S3Fs {
    async fn stat(&self, path: &str) -> Result<FileMeta, FsError> {
        let key = self.key(path);
        if key.is_empty() {
            return Ok(dir_meta(""));
        }

        if let Ok((head, code)) = self.bucket.head_object(&key).await {
            if code == 200 {
                return Ok(FileMeta {
                    name: base_name(&key),
                    size: head.content_length.unwrap_or(0).max(0) as u64,
                    is_dir: false,
                    modified: head.last_modified.as_deref().and_then(parse_timestamp),
                    created: None,
                });
            }
        }

        // not an object; a non-empty listing under `key/` makes it a prefix
        let results = self
            .bucket
            .list(format!("{}/", key), Some("/".to_string()))
            .await
            .map_err(|e| FsError::Backend(e.to_string()))?;
        let occupied = results
            .iter()
            .any(|r| !r.contents.is_empty() || r.common_prefixes.as_ref().is_some_and(|p| !p.is_empty()));
        if occupied {
            Ok(dir_meta(&base_name(&key)))
        } else {
            Err(FsError::NotFound(path.to_string()))
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileMeta>, FsError> {
        let key = self.key(path);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        };

        let results = self
            .bucket
            .list(prefix.clone(), Some("/".to_string()))
            .await
            .map_err(|e| FsError::Backend(e.to_string()))?;

        let mut entries = Vec::new();
        for result in results {
            for object in result.contents {
                let name = object.key.trim_start_matches(&prefix).to_string();
                if name.is_empty() || name.ends_with('/') {
                    continue; // placeholder object for the prefix itself
                }
                entries.push(FileMeta {
                    name,
                    size: object.size,
                    is_dir: false,
                    modified: parse_timestamp(&object.last_modified),
                    created: None,
                });
            }
            for common in result.common_prefixes.unwrap_or_default() {
                let name = common
                    .prefix
                    .trim_start_matches(&prefix)
                    .trim_end_matches('/')
                    .to_string();
                if !name.is_empty() {
                    entries.push(dir_meta(&name));
                }
            }
        }
        Ok(entries)
    }

    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<FileStream, FsError> {
        if length == 0 {
            return Ok(Box::pin(stream::empty::<std::io::Result<bytes::Bytes>>()));
        }
        let key = self.key(path);
        let data = self
            .bucket
            .get_object_range(&key, offset, Some(offset + length - 1))
            .await
            .map_err(|e| FsError::Backend(e.to_string()))?;
        match data.status_code() {
            200 | 206 => {
                let bytes = data.bytes().clone();
                Ok(Box::pin(stream::once(async move {
                    Ok::<_, std::io::Error>(bytes)
                })))
            }
            404 => Err(FsError::NotFound(path.to_string())),
            code => Err(FsError::Backend(format!(
                "object store returned status {}",
                code
            ))),
        }
    }
}

fn dir_meta(name: &str) -> FileMeta {
    FileMeta {
        name: name.to_string(),
        size: 0,
        is_dir: true,
        modified: None,
        created: None,
    }
}

fn base_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

fn parse_timestamp(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(SystemTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_for(url: &str) -> S3Fs {
        S3Fs::from_target(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_bucket_and_endpoint_split() {
        let fs = fs_for("s3://mybucket.minio.local:9000/data?region=eu-west-1");
        assert_eq!(fs.bucket.name(), "mybucket");
        assert_eq!(fs.prefix, "data");
    }

    #[test]
    fn test_plain_bucket_no_endpoint() {
        let fs = fs_for("s3://mybucket?region=eu-central-1");
        assert_eq!(fs.bucket.name(), "mybucket");
        assert_eq!(fs.prefix, "");
    }

    #[test]
    fn test_anonymous_when_no_password() {
        // must not panic; anonymous credentials carry no keys
        let fs = fs_for("s3://public-bucket");
        assert_eq!(fs.bucket.name(), "public-bucket");
    }

    #[test]
    fn test_key_mapping() {
        let fs = fs_for("s3://b/pre");
        assert_eq!(fs.key("/"), "pre");
        assert_eq!(fs.key("/x.txt"), "pre/x.txt");
        assert_eq!(fs.key("/a/b"), "pre/a/b");

        let fs = fs_for("s3://b");
        assert_eq!(fs.key("/"), "");
        assert_eq!(fs.key("/x.txt"), "x.txt");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2023-01-15T10:30:00.000Z").is_some());
        assert!(parse_timestamp("Sun, 15 Jan 2023 10:30:00 GMT").is_some());
        assert!(parse_timestamp("garbage").is_none());
    }
}
