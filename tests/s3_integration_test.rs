/*!
 * Integration tests against a live S3-compatible endpoint
 *
 * Ignored by default. To run against MinIO:
 * ```bash
 * docker run -p 9000:9000 minio/minio server /data
 * STOWAGE_S3_TESTS=1 STOWAGE_S3_ENDPOINT=http://localhost:9000 \
 *   STOWAGE_S3_BUCKET=stowage-test AWS_ACCESS_KEY_ID=minioadmin \
 *   AWS_SECRET_ACCESS_KEY=minioadmin cargo test --test s3_integration_test -- --ignored
 * ```
 */

use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;
use std::sync::Arc;
use stowage::{
    store::{ClientConfigBuilder, S3StoreProvider},
    ClientConfig, TransferCoordinator, TransferRequest,
};
use tempfile::TempDir;

struct Env {
    bucket: String,
    client: ClientConfig,
}

/// Connection settings from the environment, `None` unless enabled
fn env() -> Option<Env> {
    if std::env::var("STOWAGE_S3_TESTS").ok().as_deref() != Some("1") {
        eprintln!("STOWAGE_S3_TESTS != 1, skipping");
        return None;
    }
    let bucket = std::env::var("STOWAGE_S3_BUCKET").unwrap_or_else(|_| "stowage-test".to_string());
    let mut builder = ClientConfigBuilder::new()
        .region(std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()));
    if let Ok(endpoint) = std::env::var("STOWAGE_S3_ENDPOINT") {
        builder = builder.endpoint(endpoint).force_path_style(true);
    }
    if let (Ok(key), Ok(secret)) = (
        std::env::var("AWS_ACCESS_KEY_ID"),
        std::env::var("AWS_SECRET_ACCESS_KEY"),
    ) {
        builder = builder.credentials(key, secret);
    }
    Some(Env {
        bucket,
        client: builder.build().expect("valid client configuration"),
    })
}

fn run_prefix() -> String {
    format!("stowage-it/{}", Utc::now().format("%Y%m%d%H%M%S%f"))
}

fn request(env: &Env, prefix: &str, local: &Path) -> TransferRequest {
    TransferRequest::new(env.bucket.clone(), prefix, local).with_client(env.client.clone())
}

#[tokio::test]
#[ignore] // Requires S3 endpoint
async fn test_s3_directory_round_trip() {
    let Some(env) = env() else { return };
    let coordinator = TransferCoordinator::new(Arc::new(S3StoreProvider::new()));
    let prefix = run_prefix();
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
    std::fs::create_dir_all(src.path().join("sub")).unwrap();
    std::fs::write(src.path().join("sub/b.txt"), b"bravo").unwrap();

    let up = coordinator
        .upload_directory(&request(&env, &prefix, src.path()))
        .await
        .unwrap();
    assert!(up.all_succeeded(), "{:?}", up.outcomes);

    let down = coordinator
        .download_directory(&request(&env, &prefix, dst.path()))
        .await
        .unwrap();
    assert!(down.all_succeeded(), "{:?}", down.outcomes);
    assert_eq!(std::fs::read(dst.path().join("sub/b.txt")).unwrap(), b"bravo");

    let deleted = coordinator
        .delete_directory(&request(&env, &prefix, src.path()))
        .await
        .unwrap();
    assert_eq!(deleted, 2);
}

#[tokio::test]
#[ignore] // Requires S3 endpoint
async fn test_s3_multipart_upload() {
    let Some(env) = env() else { return };
    let coordinator = TransferCoordinator::new(Arc::new(S3StoreProvider::new()));
    let key = format!("{}/large.bin", run_prefix());
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("large.bin");
    let data: Vec<u8> = (0..12 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
    std::fs::write(&path, &data).unwrap();

    let req = request(&env, &key, &path).with_multipart_threshold(6 * 1024 * 1024);
    coordinator.upload_file(&req).await.unwrap();

    let meta = coordinator.validate_file(&req, data.len() as u64).await.unwrap();
    assert_eq!(meta.size, data.len() as u64);

    let url = coordinator
        .generate_presigned_get_url(&env.bucket, &key, Utc::now() + ChronoDuration::minutes(5), &req)
        .await
        .unwrap();
    assert!(url.contains("X-Amz-Signature") || url.contains("x-amz-signature"));

    coordinator.delete_file(&req).await.unwrap();
    assert!(coordinator.get_object_metadata(&req).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires S3 endpoint
async fn test_s3_reaper_runs() {
    let Some(env) = env() else { return };
    let coordinator = TransferCoordinator::new(Arc::new(S3StoreProvider::new()));
    let dir = TempDir::new().unwrap();

    // Nothing in a test bucket should be a week old, but the sweep must succeed
    let threshold = Utc::now() - ChronoDuration::days(7);
    coordinator
        .abort_stale_multipart_uploads(&request(&env, "", dir.path()), threshold)
        .await
        .unwrap();
}
