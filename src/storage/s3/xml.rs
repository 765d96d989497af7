//! S3 XML payloads.

use crate::storage::{StorageError, StorageResult};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListBucketResult {
    #[serde(default)]
    pub contents: Vec<ListEntry>,
    #[serde(default)]
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

pub fn parse_list(body: &str) -> StorageResult<ListBucketResult> {
    quick_xml::de::from_str(body)
        .map_err(|err| StorageError::Protocol(format!("ListObjectsV2 response: {err}")))
}

/// Body for `PUT /{bucket}` outside us-east-1.
pub fn create_bucket_body(region: &str) -> String {
    format!(
        "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <LocationConstraint>{region}</LocationConstraint>\
         </CreateBucketConfiguration>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_result() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>vault</Name>
  <Prefix>personal/</Prefix>
  <KeyCount>2</KeyCount>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok-1</NextContinuationToken>
  <Contents>
    <Key>personal/a/1</Key>
    <LastModified>2024-01-02T03:04:05.000Z</LastModified>
    <ETag>"abc"</ETag>
    <Size>12</Size>
  </Contents>
  <Contents>
    <Key>personal/b/2</Key>
    <Size>3</Size>
  </Contents>
</ListBucketResult>"#;
        let parsed = parse_list(body).unwrap();
        assert!(parsed.is_truncated);
        assert_eq!(parsed.next_continuation_token.as_deref(), Some("tok-1"));
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[0].key, "personal/a/1");
        assert_eq!(parsed.contents[0].size, 12);
        assert!(parsed.contents[1].last_modified.is_none());
    }

    #[test]
    fn test_parse_empty_list() {
        let body = "<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>";
        let parsed = parse_list(body).unwrap();
        assert!(parsed.contents.is_empty());
        assert!(!parsed.is_truncated);
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        assert!(matches!(
            parse_list("<ListBucketResult><Contents><Size>x</Size>"),
            Err(StorageError::Protocol(_))
        ));
    }
}
