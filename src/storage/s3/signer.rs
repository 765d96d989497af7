//! AWS Signature Version 4 for S3 requests.

use crate::storage::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{
    Url,
    header::{AUTHORIZATION, HOST, HeaderMap, HeaderValue},
};
use sha2::{Digest, Sha256};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
pub const X_AMZ_DATE: &str = "x-amz-date";
pub const X_AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";

pub struct Signer<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &str) -> StorageResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| StorageError::Config(format!("signing key rejected: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `Host` header value as reqwest will send it.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Raw query pairs sorted by key then value. Callers percent-encode
/// components before placing them in the URL, so no re-encoding happens here.
fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(&str, &str)> = url
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

impl Signer<'_> {
    fn scope(&self, now: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            now.format("%Y%m%d"),
            self.region,
            SERVICE
        )
    }

    fn signature(&self, now: DateTime<Utc>, canonical_request: &str) -> StorageResult<String> {
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{}\n{}",
            now.format("%Y%m%dT%H%M%SZ"),
            self.scope(now),
            sha256_hex(canonical_request.as_bytes())
        );
        let k_date = hmac(
            format!("AWS4{}", self.secret_key).as_bytes(),
            &now.format("%Y%m%d").to_string(),
        )?;
        let k_region = hmac(&k_date, self.region)?;
        let k_service = hmac(&k_region, SERVICE)?;
        let k_signing = hmac(&k_service, "aws4_request")?;
        Ok(hex::encode(hmac(&k_signing, &string_to_sign)?))
    }

    /// Add `host`, `x-amz-date`, `x-amz-content-sha256` and `authorization`
    /// to `headers`. Every header already present is signed.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &mut HeaderMap,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|err| StorageError::Config(format!("invalid header value: {err}")))
        };
        headers.insert(HOST, header(&host_header(url))?);
        headers.insert(X_AMZ_DATE, header(&now.format("%Y%m%dT%H%M%SZ").to_string())?);
        headers.insert(X_AMZ_CONTENT_SHA256, header(payload_hash)?);
        headers.remove(AUTHORIZATION);

        let mut entries: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).trim().to_string(),
                )
            })
            .collect();
        entries.sort();

        let canonical_headers: String = entries
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = entries
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            url.path(),
            canonical_query(url),
        );
        let signature = self.signature(now, &canonical_request)?;

        let authorization = format!(
            "{ALGORITHM} Credential={}/{},SignedHeaders={signed_headers},Signature={signature}",
            self.access_key,
            self.scope(now)
        );
        headers.insert(AUTHORIZATION, header(&authorization)?);
        Ok(())
    }

    /// Query-string signed URL valid for `ttl`. Only `host` is signed.
    pub fn presign(
        &self,
        method: &str,
        url: &Url,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<Url> {
        let credential = format!("{}/{}", self.access_key, self.scope(now));
        let mut query = url.query().map(str::to_string).unwrap_or_default();
        for (key, value) in [
            ("X-Amz-Algorithm", ALGORITHM.to_string()),
            ("X-Amz-Credential", credential),
            ("X-Amz-Date", now.format("%Y%m%dT%H%M%SZ").to_string()),
            ("X-Amz-Expires", ttl.as_secs().to_string()),
            ("X-Amz-SignedHeaders", "host".to_string()),
        ] {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(key);
            query.push('=');
            query.push_str(&urlencoding::encode(&value));
        }

        let mut signed = url.clone();
        signed.set_query(Some(&query));

        let canonical_request = format!(
            "{method}\n{}\n{}\nhost:{}\n\nhost\n{UNSIGNED_PAYLOAD}",
            signed.path(),
            canonical_query(&signed),
            host_header(&signed),
        );
        let signature = self.signature(now, &canonical_request)?;
        query.push_str("&X-Amz-Signature=");
        query.push_str(&signature);
        signed.set_query(Some(&query));
        Ok(signed)
    }
}
