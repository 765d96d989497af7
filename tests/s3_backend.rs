mod common;

use bytes::Bytes;
use common::{read_all, ref_count, s3_config, spawn_fake_s3, test_engine, upload_request};
use std::{sync::atomic::Ordering, time::Duration};
use vault_store::{
    db,
    services::vault::VaultService,
    storage::{S3Backend, StorageBackend, StorageError},
};

#[tokio::test]
async fn test_s3_round_trip() {
    let (endpoint, fake) = spawn_fake_s3().await;
    let backend = S3Backend::new(s3_config(&endpoint)).unwrap();

    backend
        .store("personal/alice/abc", Bytes::from_static(b"hello s3"), "text/plain")
        .await
        .unwrap();
    assert!(fake.bucket_created());
    assert_eq!(fake.object("personal/alice/abc").unwrap().as_ref(), b"hello s3");

    let body = read_all(backend.get("personal/alice/abc").await.unwrap()).await;
    assert_eq!(body, b"hello s3");
    assert!(backend.exists("personal/alice/abc").await.unwrap());
    let stat = backend.stat("personal/alice/abc").await.unwrap();
    assert_eq!(stat.mime_type.as_deref(), Some("text/plain"));
    assert!(stat.modified_at.is_some());

    backend.delete("personal/alice/abc").await.unwrap();
    assert!(!backend.exists("personal/alice/abc").await.unwrap());
    assert!(matches!(
        backend.get("personal/alice/abc").await,
        Err(StorageError::NotFound { .. })
    ));
    // Deleting a missing object is not an error.
    backend.delete("personal/alice/abc").await.unwrap();

    assert_eq!(fake.unsigned_requests.load(Ordering::SeqCst), 0);
    assert_eq!(fake.unencrypted_puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_s3_list_follows_continuation() {
    let (endpoint, _fake) = spawn_fake_s3().await;
    let backend = S3Backend::new(s3_config(&endpoint)).unwrap();
    for key in ["acme/a/1", "acme/b/2", "acme/c/3", "personal/d/4", "acme/e/5"] {
        backend
            .store(key, Bytes::from_static(b"xy"), "application/octet-stream")
            .await
            .unwrap();
    }

    let listed = backend.list("acme/").await.unwrap();
    let paths: Vec<_> = listed.iter().map(|b| b.path.as_str()).collect();
    assert_eq!(paths, ["acme/a/1", "acme/b/2", "acme/c/3", "acme/e/5"]);
    assert!(listed.iter().all(|b| b.size == 2 && b.modified_at.is_some()));
    assert_eq!(backend.list("").await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_s3_presigned_url_points_at_object() {
    let (endpoint, _fake) = spawn_fake_s3().await;
    let backend = S3Backend::new(s3_config(&endpoint)).unwrap();

    let url = backend
        .presigned_url("personal/alice/abc", Duration::from_secs(300))
        .await
        .unwrap()
        .unwrap();
    assert!(url.starts_with(&format!("{endpoint}/vault/personal/alice/abc?")));
    assert!(url.contains("X-Amz-Expires=300"));
    assert!(url.contains("X-Amz-Signature="));
}

#[tokio::test]
async fn test_vault_over_s3_deduplicates() {
    let (endpoint, fake) = spawn_fake_s3().await;
    let backend = std::sync::Arc::new(S3Backend::new(s3_config(&endpoint)).unwrap());
    let pool = db::connect_in_memory().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let vault = VaultService::from_pool(pool, backend, &test_engine());

    let a = vault
        .upload_content(upload_request("user-a", "a.txt", b"over the wire"))
        .await
        .unwrap();
    let b = vault
        .upload_content(upload_request("user-b", "b.txt", b"over the wire"))
        .await
        .unwrap();
    assert_eq!(ref_count(&vault, &a.content_hash).await, Some(2));
    let key = format!("personal/user-a/{}", a.content_hash);
    assert!(fake.object(&key).is_some());

    let download = vault.download_content(b.id).await.unwrap();
    assert_eq!(read_all(download.stream).await, b"over the wire");
    assert!(
        vault
            .presigned_download_url(b.id, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some()
    );

    vault.delete_content(a.id, "user-a").await.unwrap();
    vault.delete_content(b.id, "user-b").await.unwrap();
    assert!(fake.object(&key).is_none());
    assert_eq!(ref_count(&vault, &a.content_hash).await, None);
}
