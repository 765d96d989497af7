//! S3-compatible backend (AWS S3, MinIO, Ceph RGW and friends).
//!
//! Requests are signed with SigV4. Every write carries the configured
//! server-side encryption header and a `Content-MD5` integrity check. The
//! bucket is created on first use when `create_bucket` is set.

mod signer;
mod xml;

use super::{BlobStat, ByteStream, StorageBackend, StorageError, StorageResult, ensure_path_safe};
use crate::config::S3Config;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{
    Client, Method, Response, StatusCode, Url,
    header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED},
};
use signer::{Signer, sha256_hex};
use std::{io, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, info};

const SSE_HEADER: &str = "x-amz-server-side-encryption";
const CONTENT_MD5: &str = "content-md5";

pub struct S3Backend {
    config: S3Config,
    endpoint: Url,
    client: Client,
    bucket_ready: OnceCell<()>,
}

impl S3Backend {
    pub fn new(config: S3Config) -> StorageResult<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|err| StorageError::Config(format!("endpoint `{}`: {err}", config.endpoint)))?;
        if endpoint.host_str().is_none() {
            return Err(StorageError::Config(format!(
                "endpoint `{}` has no host",
                config.endpoint
            )));
        }
        if config.bucket.is_empty() {
            return Err(StorageError::Config("bucket name is empty".into()));
        }
        Ok(Self {
            config,
            endpoint,
            client: Client::new(),
            bucket_ready: OnceCell::new(),
        })
    }

    fn signer(&self) -> Signer<'_> {
        Signer {
            access_key: &self.config.access_key_id,
            secret_key: &self.config.secret_access_key,
            region: &self.config.region,
        }
    }

    /// Base URL of the bucket, without a trailing slash in path-style mode.
    fn bucket_url(&self) -> StorageResult<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let raw = if self.config.path_style {
            format!("{base}/{}", self.config.bucket)
        } else {
            let host = signer::host_header(&self.endpoint);
            format!(
                "{}://{}.{host}/",
                self.endpoint.scheme(),
                self.config.bucket
            )
        };
        Url::parse(&raw).map_err(|err| StorageError::Config(format!("bucket url `{raw}`: {err}")))
    }

    fn object_url(&self, path: &str) -> StorageResult<Url> {
        ensure_path_safe(path)?;
        let encoded = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let bucket = self.bucket_url()?;
        let raw = format!("{}/{encoded}", bucket.as_str().trim_end_matches('/'));
        Url::parse(&raw).map_err(|err| StorageError::Config(format!("object url `{raw}`: {err}")))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> StorageResult<Response> {
        let payload_hash = sha256_hex(&body);
        self.signer()
            .sign(method.as_str(), &url, &mut headers, &payload_hash, Utc::now())?;
        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn ensure_bucket(&self) -> StorageResult<()> {
        if !self.config.create_bucket {
            return Ok(());
        }
        self.bucket_ready
            .get_or_try_init(|| async {
                let url = self.bucket_url()?;
                let head = self
                    .send(Method::HEAD, url.clone(), HeaderMap::new(), Bytes::new())
                    .await?;
                if head.status().is_success() {
                    return Ok(());
                }
                if head.status() != StatusCode::NOT_FOUND {
                    return Err(http_error(head).await);
                }

                let body = if self.config.region == "us-east-1" {
                    Bytes::new()
                } else {
                    Bytes::from(xml::create_bucket_body(&self.config.region))
                };
                let created = self.send(Method::PUT, url, HeaderMap::new(), body).await?;
                if created.status().is_success() || created.status() == StatusCode::CONFLICT {
                    info!(bucket = %self.config.bucket, "created storage bucket");
                    Ok(())
                } else {
                    Err(http_error(created).await)
                }
            })
            .await?;
        Ok(())
    }

    async fn head(&self, path: &str) -> StorageResult<Option<HeaderMap>> {
        let url = self.object_url(path)?;
        let response = self
            .send(Method::HEAD, url, HeaderMap::new(), Bytes::new())
            .await?;
        match response.status() {
            status if status.is_success() => Ok(Some(response.headers().clone())),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(http_error(response).await),
        }
    }
}

async fn http_error(response: Response) -> StorageError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StorageError::Http { status, body }
}

fn header_value(value: &str) -> StorageResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| StorageError::Config(format!("invalid header value `{value}`: {err}")))
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn store(&self, path: &str, data: Bytes, mime_type: &str) -> StorageResult<()> {
        self.ensure_bucket().await?;
        let url = self.object_url(path)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(mime_type)?);
        headers.insert(
            HeaderName::from_static(CONTENT_MD5),
            header_value(&BASE64.encode(md5::compute(&data).0))?,
        );
        if let Some(sse) = &self.config.server_side_encryption {
            headers.insert(HeaderName::from_static(SSE_HEADER), header_value(sse)?);
        }

        let size = data.len();
        let response = self.send(Method::PUT, url, headers, data).await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        debug!(path, bytes = size, bucket = %self.config.bucket, "stored object");
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<ByteStream> {
        let url = self.object_url(path)?;
        let response = self
            .send(Method::GET, url, HeaderMap::new(), Bytes::new())
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes_stream()
                .map_err(io::Error::other)
                .boxed()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound {
                path: path.to_string(),
            }),
            _ => Err(http_error(response).await),
        }
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let url = self.object_url(path)?;
        let response = self
            .send(Method::DELETE, url, HeaderMap::new(), Bytes::new())
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(path, "object already missing");
                Ok(())
            }
            _ => Err(http_error(response).await),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.head(path).await?.is_some())
    }

    async fn stat(&self, path: &str) -> StorageResult<BlobStat> {
        let headers = self.head(path).await?.ok_or_else(|| StorageError::NotFound {
            path: path.to_string(),
        })?;
        let text = |name| headers.get(name).and_then(|v: &HeaderValue| v.to_str().ok());
        Ok(BlobStat {
            path: path.to_string(),
            size: text(CONTENT_LENGTH)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            mime_type: text(CONTENT_TYPE).map(str::to_string),
            modified_at: text(LAST_MODIFIED).and_then(parse_http_date),
        })
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobStat>> {
        self.ensure_bucket().await?;
        let mut out = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut url = self.bucket_url()?;
            // Path-style bucket URLs need the trailing slash before the query.
            if !url.path().ends_with('/') {
                url.set_path(&format!("{}/", url.path()));
            }
            let mut query = format!("list-type=2&prefix={}", urlencoding::encode(prefix));
            if let Some(token) = &token {
                query.push_str("&continuation-token=");
                query.push_str(&urlencoding::encode(token));
            }
            url.set_query(Some(&query));

            let response = self
                .send(Method::GET, url, HeaderMap::new(), Bytes::new())
                .await?;
            if !response.status().is_success() {
                return Err(http_error(response).await);
            }
            let body = response.text().await?;
            let page = xml::parse_list(&body)?;

            out.extend(page.contents.into_iter().map(|entry| BlobStat {
                path: entry.key,
                size: entry.size,
                mime_type: None,
                modified_at: entry
                    .last_modified
                    .as_deref()
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|d| d.with_timezone(&Utc)),
            }));

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(next)) => token = Some(next),
                _ => break,
            }
        }

        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn presigned_url(&self, path: &str, ttl: Duration) -> StorageResult<Option<String>> {
        let url = self.object_url(path)?;
        let signed = self.signer().presign("GET", &url, ttl, Utc::now())?;
        Ok(Some(signed.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
