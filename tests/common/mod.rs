#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;
use vault_store::{
    config::{EngineConfig, S3Config},
    db::{
        self, FileRecordRepository, SqliteContentRepository, SqliteFileRecordRepository,
        SqliteUsageRepository,
    },
    models::{ContentHash, FileRecord, FileRecordUpdate, NewFileRecord, Scope, Visibility},
    services::{
        ledger::{ContentLedger, LedgerSettings},
        quota::QuotaEnforcer,
        vault::{UploadRequest, VaultLimits, VaultService},
    },
    storage::{BlobStat, ByteStream, LocalBackend, StorageBackend, StorageError, StorageResult},
};

/// Local backend that counts calls and can be told to fail.
pub struct CountingBackend {
    inner: LocalBackend,
    pub stores: AtomicUsize,
    pub deletes: AtomicUsize,
    pub fail_stores: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl CountingBackend {
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            inner: LocalBackend::new(root).unwrap(),
            stores: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            fail_stores: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    fn injected(operation: &str) -> StorageError {
        StorageError::Http {
            status: 503,
            body: format!("injected {operation} failure"),
        }
    }
}

#[async_trait]
impl StorageBackend for CountingBackend {
    async fn store(&self, path: &str, data: Bytes, mime_type: &str) -> StorageResult<()> {
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(Self::injected("store"));
        }
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(path, data, mime_type).await
    }

    async fn get(&self, path: &str) -> StorageResult<ByteStream> {
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.inner.exists(path).await
    }

    async fn stat(&self, path: &str) -> StorageResult<BlobStat> {
        self.inner.stat(path).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobStat>> {
        self.inner.list(prefix).await
    }

    async fn presigned_url(&self, path: &str, ttl: Duration) -> StorageResult<Option<String>> {
        self.inner.presigned_url(path, ttl).await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}

/// File repository whose inserts can be made to fail.
pub struct FlakyFiles {
    inner: SqliteFileRecordRepository,
    pub fail_inserts: AtomicBool,
}

#[async_trait]
impl FileRecordRepository for FlakyFiles {
    async fn insert(&self, record: &NewFileRecord) -> Result<FileRecord, sqlx::Error> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        self.inner.insert(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<FileRecord>, sqlx::Error> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: Uuid) -> Result<Option<FileRecord>, sqlx::Error> {
        self.inner.delete(id).await
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, sqlx::Error> {
        self.inner.list_by_owner(owner_id, folder_id).await
    }

    async fn update(
        &self,
        id: Uuid,
        update: &FileRecordUpdate,
    ) -> Result<Option<FileRecord>, sqlx::Error> {
        self.inner.update(id, update).await
    }

    async fn increment_downloads(&self, id: Uuid) -> Result<(), sqlx::Error> {
        self.inner.increment_downloads(id).await
    }

    async fn get_by_share_token(&self, token: &str) -> Result<Option<FileRecord>, sqlx::Error> {
        self.inner.get_by_share_token(token).await
    }

    async fn reference_counts(&self) -> Result<Vec<(ContentHash, i64)>, sqlx::Error> {
        self.inner.reference_counts().await
    }

    async fn usage_by_owner(&self) -> Result<Vec<(String, i64)>, sqlx::Error> {
        self.inner.usage_by_owner().await
    }
}

pub struct Harness {
    pub vault: VaultService,
    pub backend: Arc<CountingBackend>,
    pub files: Arc<FlakyFiles>,
    pub pool: SqlitePool,
    pub dir: TempDir,
}

pub fn test_engine() -> EngineConfig {
    EngineConfig {
        default_quota_bytes: 1024 * 1024,
        max_upload_bytes: 64 * 1024,
        storage_timeout: Duration::from_secs(5),
        content_wait_timeout: Duration::from_secs(10),
        claim_lease: Duration::from_secs(10),
    }
}

/// File-backed database and counting local backend in a temp dir.
pub async fn setup_harness(engine: EngineConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("meta/vault.db").display());
    let pool = db::connect(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let backend = Arc::new(CountingBackend::new(&dir.path().join("blobs")));
    let files = Arc::new(FlakyFiles {
        inner: SqliteFileRecordRepository::new(pool.clone()),
        fail_inserts: AtomicBool::new(false),
    });
    let ledger = ContentLedger::new(
        Arc::new(SqliteContentRepository::new(pool.clone())),
        backend.clone(),
        LedgerSettings {
            storage_timeout: engine.storage_timeout,
            wait_timeout: engine.content_wait_timeout,
            claim_lease: engine.claim_lease,
        },
    );
    let quota = QuotaEnforcer::new(
        Arc::new(SqliteUsageRepository::new(pool.clone())),
        engine.default_quota_bytes,
    );
    let vault = VaultService::new(
        ledger,
        quota,
        files.clone(),
        backend.clone(),
        VaultLimits {
            max_upload_bytes: engine.max_upload_bytes,
            storage_timeout: engine.storage_timeout,
        },
    );

    Harness {
        vault,
        backend,
        files,
        pool,
        dir,
    }
}

pub fn upload_request(owner: &str, name: &str, data: &[u8]) -> UploadRequest {
    UploadRequest {
        owner_id: owner.to_string(),
        scope: Scope::Personal,
        folder_id: None,
        display_name: name.to_string(),
        mime_type: Some("text/plain".into()),
        visibility: Visibility::Private,
        data: Bytes::copy_from_slice(data),
    }
}

/// Reference count of `hash`, `None` when the ledger has no row.
pub async fn ref_count(vault: &VaultService, hash: &ContentHash) -> Option<i64> {
    vault
        .ledger()
        .repository()
        .get(hash)
        .await
        .unwrap()
        .map(|r| r.reference_count)
}

pub async fn read_all(stream: ByteStream) -> Vec<u8> {
    vault_store::storage::collect_stream(stream)
        .await
        .unwrap()
        .to_vec()
}

// ---------------------------------------------------------------------------
// In-memory S3 stand-in, path-style only.
// ---------------------------------------------------------------------------

struct FakeObject {
    body: Bytes,
    content_type: String,
    modified_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct FakeS3 {
    objects: Mutex<BTreeMap<String, FakeObject>>,
    bucket_created: AtomicBool,
    pub unsigned_requests: AtomicUsize,
    pub unencrypted_puts: AtomicUsize,
    pub page_size: usize,
}

impl FakeS3 {
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|o| o.body.clone())
    }

    pub fn bucket_created(&self) -> bool {
        self.bucket_created.load(Ordering::SeqCst)
    }
}

/// Serve a fake S3 endpoint on an ephemeral port.
pub async fn spawn_fake_s3() -> (String, Arc<FakeS3>) {
    let state = Arc::new(FakeS3 {
        page_size: 2,
        ..FakeS3::default()
    });
    let app = Router::new()
        .fallback(fake_s3_handler)
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

pub fn s3_config(endpoint: &str) -> S3Config {
    S3Config {
        endpoint: endpoint.to_string(),
        region: "us-east-1".into(),
        bucket: "vault".into(),
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "secret".into(),
        path_style: true,
        server_side_encryption: Some("AES256".into()),
        create_bucket: true,
    }
}

async fn fake_s3_handler(
    State(s3): State<Arc<FakeS3>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signed = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    if !signed {
        s3.unsigned_requests.fetch_add(1, Ordering::SeqCst);
        return StatusCode::FORBIDDEN.into_response();
    }

    let path = uri.path().trim_start_matches('/');
    let (bucket, raw_key) = path.split_once('/').unwrap_or((path, ""));
    if bucket != "vault" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let key = urlencoding::decode(raw_key).unwrap().into_owned();

    if key.is_empty() {
        return match method {
            Method::HEAD if s3.bucket_created() => StatusCode::OK.into_response(),
            Method::HEAD => StatusCode::NOT_FOUND.into_response(),
            Method::PUT => {
                s3.bucket_created.store(true, Ordering::SeqCst);
                StatusCode::OK.into_response()
            }
            Method::GET if query.get("list-type").map(String::as_str) == Some("2") => {
                list_objects(&s3, &query)
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }
    if !s3.bucket_created() {
        return (StatusCode::NOT_FOUND, "NoSuchBucket").into_response();
    }

    match method {
        Method::PUT => {
            let expected_md5 = BASE64.encode(md5::compute(&body).0);
            let sent_md5 = headers.get("content-md5").and_then(|v| v.to_str().ok());
            if sent_md5 != Some(expected_md5.as_str()) {
                return (StatusCode::BAD_REQUEST, "BadDigest").into_response();
            }
            if !headers.contains_key("x-amz-server-side-encryption") {
                s3.unencrypted_puts.fetch_add(1, Ordering::SeqCst);
            }
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            s3.objects.lock().unwrap().insert(
                key,
                FakeObject {
                    body,
                    content_type,
                    modified_at: Utc::now(),
                },
            );
            StatusCode::OK.into_response()
        }
        Method::GET => match s3.objects.lock().unwrap().get(&key) {
            Some(object) => (
                [(header::CONTENT_TYPE, object.content_type.clone())],
                object.body.clone(),
            )
                .into_response(),
            None => (StatusCode::NOT_FOUND, "NoSuchKey").into_response(),
        },
        Method::HEAD => match s3.objects.lock().unwrap().get(&key) {
            Some(object) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, object.body.len())
                .header(header::CONTENT_TYPE, object.content_type.clone())
                .header(header::LAST_MODIFIED, object.modified_at.to_rfc2822())
                .body(Body::empty())
                .unwrap(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::DELETE => {
            s3.objects.lock().unwrap().remove(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// ListObjectsV2 with `page_size` keys per page; the continuation token is
/// the last key returned.
fn list_objects(s3: &FakeS3, query: &HashMap<String, String>) -> Response {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let after = query.get("continuation-token").cloned();
    let objects = s3.objects.lock().unwrap();

    let mut matching = objects
        .iter()
        .filter(|(key, _)| key.starts_with(&prefix))
        .filter(|(key, _)| after.as_ref().is_none_or(|a| key.as_str() > a.as_str()));
    let page: Vec<_> = matching.by_ref().take(s3.page_size).collect();
    let truncated = matching.next().is_some();

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"><Name>vault</Name>",
    );
    xml.push_str(&format!("<IsTruncated>{truncated}</IsTruncated>"));
    if truncated {
        if let Some((last, _)) = page.last() {
            xml.push_str(&format!("<NextContinuationToken>{last}</NextContinuationToken>"));
        }
    }
    for (key, object) in &page {
        xml.push_str(&format!(
            "<Contents><Key>{key}</Key><LastModified>{}</LastModified><Size>{}</Size></Contents>",
            object
                .modified_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            object.body.len()
        ));
    }
    xml.push_str("</ListBucketResult>");
    ([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}
