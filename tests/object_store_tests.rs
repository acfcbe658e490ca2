use std::time::Duration;

use bytes::Bytes;
use docstore::object_store::{
    content_type_for, AccessKeyRequest, AuthOps, Bucket, LocalStore, ObjectStoreError,
    PutObjectInput, SignerType,
};

fn store() -> (tempfile::TempDir, LocalStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_local_store_put_get() {
    let (_dir, store) = store();

    let data = Bytes::from("hello world");
    let info = store
        .put_object(PutObjectInput::new("doc/pages/p1.json", data.clone()))
        .await
        .unwrap();
    assert!(!info.version_id.is_empty());

    let retrieved = store.get_object("doc/pages/p1.json").await.unwrap();
    assert_eq!(retrieved, data);
}

#[tokio::test]
async fn test_local_store_get_not_found() {
    let (_dir, store) = store();

    let result = store.get_object("missing").await;
    assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
}

#[tokio::test]
async fn test_overwrite_keeps_every_version() {
    let (_dir, store) = store();

    let first = store
        .put_object(PutObjectInput::new("key", "first"))
        .await
        .unwrap();
    let second = store
        .put_object(PutObjectInput::new("key", "second"))
        .await
        .unwrap();
    assert_ne!(first.version_id, second.version_id);

    assert_eq!(store.get_object("key").await.unwrap(), Bytes::from("second"));
    assert_eq!(
        store
            .get_object_version("key", &first.version_id)
            .await
            .unwrap(),
        Bytes::from("first")
    );

    let info = store.get_object_info("key").await.unwrap();
    assert_eq!(info.version_id, second.version_id);
    assert_eq!(info.size, 6);
}

#[tokio::test]
async fn test_rejects_escaping_keys() {
    let (_dir, store) = store();

    for key in ["", "/", "../x", "a/../../b", "a//b"] {
        let result = store.put_object(PutObjectInput::new(key, "x")).await;
        assert!(
            matches!(result, Err(ObjectStoreError::InvalidKey(_))),
            "{key:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_list_and_copy_directory() {
    let (_dir, store) = store();
    for key in ["src/a.json", "src/nested/b.json", "srcx/c.json", "other/d.json"] {
        store
            .put_object(PutObjectInput::new(key, key.to_string()))
            .await
            .unwrap();
    }

    assert_eq!(
        store.list_objects("src/").await.unwrap(),
        vec!["src/a.json", "src/nested/b.json"]
    );

    let copied = store.copy_directory("src", "dest/").await.unwrap();
    assert_eq!(copied, 2);
    assert_eq!(
        store.get_object("dest/nested/b.json").await.unwrap(),
        Bytes::from("src/nested/b.json")
    );
    assert!(store.get_object("dest/c.json").await.is_err());

    assert!(matches!(
        store.copy_directory("/", "dest").await,
        Err(ObjectStoreError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_read_only_credential_is_scoped() {
    let (_dir, store) = store();
    store
        .put_object(PutObjectInput::new("abc/pages/p1.json", "{}"))
        .await
        .unwrap();
    store
        .put_object(PutObjectInput::new("xyz/pages/p1.json", "{}"))
        .await
        .unwrap();

    let request = AccessKeyRequest::new("abc/*", AuthOps::READ, Duration::from_secs(3600));
    let key = store.generate_access_key(&request).await.unwrap();
    assert_eq!(key.signer_type, SignerType::Local);
    assert!(key.expires_at <= chrono::Utc::now() + chrono::Duration::seconds(3600));

    // Reading inside the prefix works.
    assert!(store
        .get_object_as(&key.session_token, "abc/pages/p1.json")
        .await
        .is_ok());

    // Writing inside the prefix does not.
    let write = store
        .put_object_as(
            &key.session_token,
            PutObjectInput::new("abc/pages/p1.json", "tampered"),
        )
        .await;
    assert!(matches!(write, Err(ObjectStoreError::AccessDenied(_))));
    assert_eq!(
        store.get_object("abc/pages/p1.json").await.unwrap(),
        Bytes::from("{}")
    );

    // Nothing outside the prefix is readable, including look-alike prefixes.
    for outside in ["xyz/pages/p1.json", "abcd/pages/p1.json"] {
        let read = store.get_object_as(&key.session_token, outside).await;
        assert!(matches!(read, Err(ObjectStoreError::AccessDenied(_))), "{outside}");
    }
}

#[tokio::test]
async fn test_tampered_or_foreign_tokens_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::with_signing_secret(dir.path().join("a"), b"secret-a").unwrap();
    let other = LocalStore::with_signing_secret(dir.path().join("b"), b"secret-b").unwrap();

    let request = AccessKeyRequest::new("abc/*", AuthOps::ALL, Duration::from_secs(60));
    let key = store.generate_access_key(&request).await.unwrap();

    assert!(store
        .authorize(&key.session_token, AuthOps::PUT_OBJECT, "abc/x")
        .is_ok());
    assert!(other
        .authorize(&key.session_token, AuthOps::GET_OBJECT, "abc/x")
        .is_err());

    let mut forged = key.session_token.clone();
    forged.insert(3, 'A');
    assert!(store
        .authorize(&forged, AuthOps::GET_OBJECT, "abc/x")
        .is_err());
}

#[tokio::test]
async fn test_access_key_requests_are_validated() {
    let (_dir, store) = store();

    for request in [
        AccessKeyRequest::new("*", AuthOps::READ, Duration::from_secs(60)),
        AccessKeyRequest::new("abc/*", AuthOps::empty(), Duration::from_secs(60)),
        AccessKeyRequest::new("abc/*", AuthOps::READ, Duration::from_secs(13 * 3600)),
    ] {
        assert!(matches!(
            store.generate_access_key(&request).await,
            Err(ObjectStoreError::InvalidRequest(_))
        ));
    }
}

#[test]
fn test_content_type_inference() {
    assert_eq!(content_type_for("doc/document-meta.json"), "application/json");
    assert_eq!(content_type_for("doc/medias/logo.png"), "image/png");
    assert_eq!(content_type_for("doc/medias/blob"), "application/octet-stream");
}
