//! Unit tests for the encrypted key-share store

use crate::support::{FixedPresence, SCRIPTED_PUBLIC_KEY};
use mpc_keyshare_core::{
    crypto::{Scheme, SimulatedSecureElement},
    storage::{
        FileSecureStorage, KeyShareStore, MemorySecureStorage, PresenceOutcome, Protection,
        SecureStorage,
    },
    Algorithm, Error, KeyShare, StoreConfig,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn share() -> KeyShare {
    KeyShare::new(
        b"opaque engine share".to_vec(),
        &hex::decode(SCRIPTED_PUBLIC_KEY).unwrap(),
        Algorithm::Ecdsa,
    )
    .unwrap()
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let original = share();

    {
        let store = KeyShareStore::new(Arc::new(FileSecureStorage::new(dir.path()).unwrap()));
        store.store(&original, "p1").await.unwrap();
        assert_eq!(store.encryption_scheme().await.unwrap(), Scheme::Software);
    }

    // A fresh store over the same directory finds the same key
    let store = KeyShareStore::new(Arc::new(FileSecureStorage::new(dir.path()).unwrap()));
    let loaded = store.require("p1").await.unwrap();
    assert_eq!(loaded, original);
    assert_eq!(loaded.share_data, original.share_data);

    let meta = store.metadata("p1").await.unwrap().unwrap();
    assert_eq!(meta.key_id, original.key_id);
    assert_eq!(meta.address, original.address);
    assert_eq!(meta.algorithm, Algorithm::Ecdsa);
}

#[tokio::test]
async fn test_corrupted_file_ciphertext_is_integrity_failure() {
    let dir = tempfile::tempdir().unwrap();
    let vault = FileSecureStorage::new(dir.path()).unwrap();
    let store = KeyShareStore::new(Arc::new(vault.clone()));
    store.store(&share(), "p1").await.unwrap();

    let account = "mpc.wallet.keyshare.p1";
    let mut raw = vault.read(account).await.unwrap().unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    vault
        .write(account, &raw, Protection::UserPresence)
        .await
        .unwrap();

    assert!(store.exists("p1").await.unwrap());
    let err = store.retrieve("p1").await.unwrap_err();
    assert!(matches!(err, Error::DecryptionFailure(_)));
    assert!(err.is_integrity_failure());
}

#[tokio::test]
async fn test_hardware_scheme_is_sticky() {
    let vault = MemorySecureStorage::new();
    let element = Arc::new(SimulatedSecureElement::new());
    let original = share();

    let store = KeyShareStore::new(Arc::new(vault.clone())).with_secure_element(element.clone());
    store.store(&original, "p1").await.unwrap();
    assert_eq!(store.encryption_scheme().await.unwrap(), Scheme::Hardware);

    // No software key is ever created on a hardware device
    assert!(!vault.accounts().iter().any(|a| a.ends_with(".encryption.key")));

    // Restarted with the element present: still readable
    let store = KeyShareStore::new(Arc::new(vault.clone())).with_secure_element(element.clone());
    assert_eq!(store.require("p1").await.unwrap(), original);

    // Restarted without it: the device does not silently switch schemes
    element.set_available(false);
    let store = KeyShareStore::new(Arc::new(vault.clone())).with_secure_element(element);
    assert!(matches!(
        store.retrieve("p1").await,
        Err(Error::EncryptionFailure(_))
    ));

    let store = KeyShareStore::new(Arc::new(vault));
    assert!(matches!(
        store.retrieve("p1").await,
        Err(Error::EncryptionFailure(_))
    ));
}

#[tokio::test]
async fn test_presence_prompt_only_for_existing_share() {
    let gate = Arc::new(FixedPresence::new(PresenceOutcome::Granted));
    let store = KeyShareStore::new(Arc::new(MemorySecureStorage::new()))
        .with_presence_gate(gate.clone());

    assert!(store.retrieve("p1").await.unwrap().is_none());
    assert!(!store.exists("p1").await.unwrap());
    assert_eq!(gate.prompts.load(Ordering::SeqCst), 0);

    store.store(&share(), "p1").await.unwrap();
    assert!(store.metadata("p1").await.unwrap().is_some());
    assert_eq!(gate.prompts.load(Ordering::SeqCst), 0);

    store.retrieve("p1").await.unwrap();
    assert_eq!(gate.prompts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_presence_leaves_records() {
    let vault = MemorySecureStorage::new();
    let seeded = KeyShareStore::new(Arc::new(vault.clone()));
    seeded.store(&share(), "p1").await.unwrap();
    let before = vault.accounts();

    let store = KeyShareStore::new(Arc::new(vault.clone()))
        .with_presence_gate(Arc::new(FixedPresence::new(PresenceOutcome::Cancelled)));
    assert!(matches!(
        store.retrieve("p1").await,
        Err(Error::NotAuthorized(_))
    ));
    assert_eq!(vault.accounts(), before);
    assert!(seeded.retrieve("p1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let vault = MemorySecureStorage::new();
    let a = KeyShareStore::new(Arc::new(vault.clone()))
        .with_config(StoreConfig::default().with_namespace("app.a"));
    let b = KeyShareStore::new(Arc::new(vault.clone()))
        .with_config(StoreConfig::default().with_namespace("app.b"));

    a.store(&share(), "p1").await.unwrap();
    assert!(a.exists("p1").await.unwrap());
    assert!(!b.exists("p1").await.unwrap());

    b.delete("p1").await.unwrap();
    assert!(a.exists("p1").await.unwrap());
}

#[tokio::test]
async fn test_delete_then_store_starts_fresh_metadata() {
    let store = KeyShareStore::new(Arc::new(MemorySecureStorage::new()));
    store.store(&share(), "p1").await.unwrap();
    store.delete("p1").await.unwrap();
    store.delete("p1").await.unwrap();
    assert!(store.metadata("p1").await.unwrap().is_none());
    assert!(matches!(
        store.require("p1").await,
        Err(Error::KeyShareNotFound(_))
    ));

    store.store(&share(), "p1").await.unwrap();
    let meta = store.metadata("p1").await.unwrap().unwrap();
    assert!(meta.last_rotated.is_none());
}
