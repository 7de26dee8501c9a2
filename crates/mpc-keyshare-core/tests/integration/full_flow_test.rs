//! Integration tests for the full wallet flow
//!
//! Every test runs the loopback engine against an in-process cosigner:
//! keygen, signing, rotation and deletion through `MpcWallet`.

use crate::support::{loopback_wallet, profile_records, FlakyStorage};
use mpc_keyshare_core::{
    engine::{loopback::verify_signature, CosignerFault, LoopbackCosigner, LoopbackEngine},
    keccak256_hash,
    storage::{FileSecureStorage, KeyShareStore, Protection, SecureStorage},
    Algorithm, Error, MessageType, MpcWallet, SessionManager, SessionManagerConfig,
    TransportError, WalletConfig,
};
use std::sync::Arc;

#[tokio::test]
async fn test_ecdsa_keygen_scenario() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, vault) = loopback_wallet(cosigner.clone());

    let share = wallet
        .generate_wallet(Algorithm::Ecdsa, "alice")
        .await
        .unwrap();

    assert!(!share.share_data.is_empty());
    assert!(share.public_key.len() <= 66);
    assert_eq!(share.address.len(), 42);
    assert!(share.address.starts_with("0x"));
    assert_eq!(share.address, share.address.to_lowercase());
    assert!(cosigner.holds_key(&share.public_key));

    assert_eq!(
        profile_records(&vault, "alice"),
        vec![
            "mpc.wallet.keyshare.alice".to_string(),
            "mpc.wallet.metadata.alice".to_string()
        ]
    );
    assert_eq!(
        vault.protection("mpc.wallet.keyshare.alice"),
        Some(Protection::UserPresence)
    );
}

#[tokio::test]
async fn test_sign_and_verify_many_digests() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, _) = loopback_wallet(cosigner);
    let share = wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();
    let public_key = share.public_key_bytes().unwrap();

    for i in 0u8..5 {
        let digest = keccak256_hash(&[i; 40]);
        let signature = wallet.sign("alice", Algorithm::Ecdsa, &digest).await.unwrap();
        assert_eq!(signature.algorithm, Algorithm::Ecdsa);
        assert!(verify_signature(&public_key, &digest, &signature.bytes));

        let other = keccak256_hash(&[i.wrapping_add(1); 40]);
        assert!(!verify_signature(&public_key, &other, &signature.bytes));
    }
}

#[tokio::test]
async fn test_signing_rejection_at_round_two() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, _) = loopback_wallet(cosigner.clone());
    wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();

    cosigner.inject(CosignerFault::Tamper {
        message_type: MessageType::Sign,
        round: 2,
    });
    let err = wallet
        .sign("alice", Algorithm::Ecdsa, &[0x11; 32])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SigningFailed(_)));
    assert!(matches!(err.root_cause(), Error::ProtocolRejected(_)));
    assert_eq!(wallet.sessions().active_session_count(), 0);

    // Fault consumed: the next attempt is a fresh session and succeeds
    wallet.sign("alice", Algorithm::Ecdsa, &[0x11; 32]).await.unwrap();
}

#[tokio::test]
async fn test_stale_replay_is_absorbed() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, _) = loopback_wallet(cosigner.clone());
    let share = wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();

    cosigner.inject(CosignerFault::ReplayStale {
        message_type: MessageType::Sign,
        round: 3,
        times: 2,
    });
    let digest = [0x22; 32];
    let signature = wallet.sign("alice", Algorithm::Ecdsa, &digest).await.unwrap();
    assert!(verify_signature(
        &share.public_key_bytes().unwrap(),
        &digest,
        &signature.bytes
    ));
}

#[tokio::test]
async fn test_skip_ahead_is_fatal() {
    let cosigner = Arc::new(LoopbackCosigner::new().with_fault(CosignerFault::SkipAhead {
        message_type: MessageType::Keygen,
        round: 1,
    }));
    let (wallet, vault) = loopback_wallet(cosigner);

    let err = wallet
        .generate_wallet(Algorithm::Ecdsa, "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        Error::ProtocolDesync {
            expected: 1,
            received: 2,
            ..
        }
    ));
    assert!(profile_records(&vault, "alice").is_empty());
}

#[tokio::test]
async fn test_eddsa_is_not_supported_by_loopback() {
    let (wallet, vault) = loopback_wallet(Arc::new(LoopbackCosigner::new()));
    let err = wallet
        .generate_wallet(Algorithm::Eddsa, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeyGenerationFailed(_)));
    assert!(matches!(err.root_cause(), Error::Internal(_)));
    assert!(profile_records(&vault, "alice").is_empty());
}

#[tokio::test]
async fn test_rotation_refreshes_share_and_keeps_address() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, vault) = loopback_wallet(cosigner.clone());
    let first = wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();
    let early_digest = [0x32; 32];
    let early = wallet.sign("alice", Algorithm::Ecdsa, &early_digest).await.unwrap();

    let rotated = wallet.rotate_wallet("alice").await.unwrap();
    assert_eq!(rotated.public_key, first.public_key);
    assert_eq!(rotated.address, first.address);
    assert_ne!(rotated.key_id, first.key_id);
    assert_ne!(rotated.share_data, first.share_data);
    assert_eq!(profile_records(&vault, "alice").len(), 2);
    assert_eq!(cosigner.key_count(), 1);

    let stored = wallet.store().require("alice").await.unwrap();
    assert_eq!(stored.key_id, rotated.key_id);

    // Signatures from before the rotation still verify under the same key
    let public_key = rotated.public_key_bytes().unwrap();
    assert!(verify_signature(&public_key, &early_digest, &early.bytes));

    let digest = [0x33; 32];
    let signature = wallet.sign("alice", Algorithm::Ecdsa, &digest).await.unwrap();
    assert!(verify_signature(&public_key, &digest, &signature.bytes));
    assert_eq!(cosigner.generation_count(&rotated.public_key), 1);
}

#[tokio::test]
async fn test_repeated_rotation_keeps_address() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, _) = loopback_wallet(cosigner.clone());
    let first = wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();

    for i in 0u8..3 {
        let rotated = wallet.rotate_wallet("alice").await.unwrap();
        assert_eq!(rotated.address, first.address);
        wallet.sign("alice", Algorithm::Ecdsa, &[i; 32]).await.unwrap();
    }
    let meta = wallet.wallet_metadata("alice").await.unwrap().unwrap();
    assert_eq!(meta.address, first.address);
    assert!(meta.last_rotated.is_some());
}

#[tokio::test]
async fn test_rotation_without_wallet() {
    let (wallet, _) = loopback_wallet(Arc::new(LoopbackCosigner::new()));
    assert!(matches!(
        wallet.rotate_wallet("nobody").await,
        Err(Error::KeyShareNotFound(_))
    ));
}

#[tokio::test]
async fn test_storage_failure_persists_nothing() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let vault = FlakyStorage::new();
    vault.fail_writes_to(".metadata.");
    let wallet = MpcWallet::new(
        SessionManager::new(
            Arc::new(LoopbackEngine::new()),
            cosigner.clone(),
            SessionManagerConfig::default(),
        ),
        KeyShareStore::new(Arc::new(vault.clone())),
        cosigner.public_key(),
    );

    let err = wallet
        .generate_wallet(Algorithm::Ecdsa, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StorageFailure { .. }));
    assert!(!wallet.has_wallet("alice").await.unwrap());
    assert!(vault
        .inner
        .accounts()
        .iter()
        .all(|a| !a.ends_with(".alice")));

    vault.heal();
    wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();
    assert!(wallet.has_wallet("alice").await.unwrap());
}

#[tokio::test]
async fn test_file_backed_wallet_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let cosigner = Arc::new(LoopbackCosigner::new());
    let config_path = dir.path().join("wallet.json");
    std::fs::write(
        &config_path,
        format!(
            r#"{{"cosigner_public_key": "{}", "store": {{"namespace": "demo.app"}}}}"#,
            cosigner.public_key_hex()
        ),
    )
    .unwrap();

    let config = WalletConfig::from_file(&config_path).unwrap();
    let vault = FileSecureStorage::new(dir.path().join("vault")).unwrap();
    let wallet = MpcWallet::from_config(
        &config,
        Arc::new(LoopbackEngine::new()),
        cosigner,
        Arc::new(vault.clone()),
    )
    .unwrap();

    let share = wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();
    assert!(vault.contains("demo.app.keyshare.alice").await.unwrap());

    let digest = keccak256_hash(b"file backed");
    let signature = wallet
        .sign_message("alice", Algorithm::Ecdsa, b"file backed")
        .await
        .unwrap();
    assert!(verify_signature(
        &share.public_key_bytes().unwrap(),
        &digest,
        &signature.bytes
    ));

    wallet.delete_wallet("alice").await.unwrap();
    wallet.delete_wallet("alice").await.unwrap();
    assert!(!vault.contains("demo.app.keyshare.alice").await.unwrap());
    assert!(!vault.contains("demo.app.metadata.alice").await.unwrap());
}

#[tokio::test]
async fn test_cosigner_shutdown_is_not_retryable() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, _) = loopback_wallet(cosigner.clone());
    wallet.generate_wallet(Algorithm::Ecdsa, "alice").await.unwrap();

    cosigner.shutdown();
    let err = wallet
        .sign("alice", Algorithm::Ecdsa, &[0x44; 32])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SigningFailed(_)));
    assert!(matches!(
        err.root_cause(),
        Error::Transport(TransportError::Closed)
    ));
    assert!(!err.is_retryable());
    assert_eq!(wallet.sessions().active_session_count(), 0);
    assert!(wallet.has_wallet("alice").await.unwrap());
}
