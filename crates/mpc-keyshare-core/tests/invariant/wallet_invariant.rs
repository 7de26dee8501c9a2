//! Invariant tests for the MPC key-share wallet
//!
//! These tests verify guarantees that must hold however a session ends:
//! - A failed keygen or rotation never leaves new records behind
//! - Every session leaves the registry when it ends
//! - A profile holds at most one key share
//! - Share and metadata records exist together or not at all
//! - Rotation keeps the joint public key
//! - Stored shares read back identical in every field

use crate::support::{loopback_manager, loopback_wallet, profile_records, FlakyStorage};
use mpc_keyshare_core::{
    engine::{CosignerFault, LoopbackCosigner},
    storage::KeyShareStore,
    Algorithm, Error, MessageType, MpcWallet,
};
use std::sync::Arc;

fn every_fault(message_type: MessageType) -> Vec<CosignerFault> {
    let mut faults = Vec::new();
    for round in 1..=3 {
        faults.push(CosignerFault::Tamper {
            message_type,
            round,
        });
        faults.push(CosignerFault::SkipAhead {
            message_type,
            round,
        });
        faults.push(CosignerFault::ReplayStale {
            message_type,
            round,
            times: 4,
        });
    }
    faults
}

// ============================================================================
// Persistence Invariants
// ============================================================================

/// INVARIANT: Failed key generation persists nothing
#[tokio::test]
async fn invariant_failed_keygen_leaves_no_records() {
    for fault in every_fault(MessageType::Keygen) {
        let cosigner = Arc::new(LoopbackCosigner::new().with_fault(fault));
        let (wallet, vault) = loopback_wallet(cosigner);

        let result = wallet.generate_wallet(Algorithm::Ecdsa, "p1").await;
        assert!(result.is_err(), "{fault:?} unexpectedly succeeded");
        assert!(
            profile_records(&vault, "p1").is_empty(),
            "{fault:?} left records behind"
        );
        assert!(!wallet.has_wallet("p1").await.unwrap());
        assert_eq!(wallet.sessions().active_session_count(), 0);
    }
}

/// INVARIANT: Failed rotation leaves the previous share untouched
#[tokio::test]
async fn invariant_failed_rotation_keeps_previous_share() {
    for fault in every_fault(MessageType::Rotation) {
        let cosigner = Arc::new(LoopbackCosigner::new());
        let (wallet, _) = loopback_wallet(cosigner.clone());
        let original = wallet.generate_wallet(Algorithm::Ecdsa, "p1").await.unwrap();
        let metadata = wallet.wallet_metadata("p1").await.unwrap();

        cosigner.inject(fault);
        assert!(wallet.rotate_wallet("p1").await.is_err(), "{fault:?}");

        assert_eq!(wallet.store().require("p1").await.unwrap(), original);
        assert_eq!(wallet.wallet_metadata("p1").await.unwrap(), metadata);
        assert_eq!(wallet.sessions().active_session_count(), 0);
    }
}

// ============================================================================
// Session Invariants
// ============================================================================

/// INVARIANT: No session outlives its outcome
#[tokio::test]
async fn invariant_signing_sessions_always_removed() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, _) = loopback_wallet(cosigner.clone());
    wallet.generate_wallet(Algorithm::Ecdsa, "p1").await.unwrap();

    for fault in every_fault(MessageType::Sign) {
        cosigner.inject(fault);
        let _ = wallet.sign("p1", Algorithm::Ecdsa, &[5u8; 32]).await;
        assert_eq!(wallet.sessions().active_session_count(), 0, "{fault:?}");
        assert!(wallet.sessions().active_session_ids().is_empty());
    }

    // Faults are consumed; the share still signs
    wallet.sign("p1", Algorithm::Ecdsa, &[5u8; 32]).await.unwrap();
}

/// INVARIANT: Protocol failures surface as session-outcome errors
#[tokio::test]
async fn invariant_failures_are_wrapped() {
    for fault in every_fault(MessageType::Sign) {
        let cosigner = Arc::new(LoopbackCosigner::new());
        let (wallet, _) = loopback_wallet(cosigner.clone());
        wallet.generate_wallet(Algorithm::Ecdsa, "p1").await.unwrap();

        cosigner.inject(fault);
        let err = wallet
            .sign("p1", Algorithm::Ecdsa, &[6u8; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SigningFailed(_)), "{fault:?}: {err}");
        assert!(matches!(
            err.root_cause(),
            Error::ProtocolRejected(_) | Error::ProtocolDesync { .. }
        ));
    }
}

// ============================================================================
// Storage Invariants
// ============================================================================

/// INVARIANT: One key share slot per profile
#[tokio::test]
async fn invariant_single_slot_per_profile() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, vault) = loopback_wallet(cosigner);

    wallet.generate_wallet(Algorithm::Ecdsa, "p1").await.unwrap();
    for _ in 0..3 {
        wallet.rotate_wallet("p1").await.unwrap();
        assert_eq!(profile_records(&vault, "p1").len(), 2);
    }
    assert!(matches!(
        wallet.generate_wallet(Algorithm::Ecdsa, "p1").await,
        Err(Error::WalletAlreadyExists(_))
    ));
}

/// INVARIANT: A failed delete leaves both records in place
#[tokio::test]
async fn invariant_failed_delete_keeps_pair() {
    for marker in [".metadata.", ".keyshare."] {
        let cosigner = Arc::new(LoopbackCosigner::new());
        let vault = FlakyStorage::new();
        let wallet = MpcWallet::new(
            loopback_manager(cosigner.clone()),
            KeyShareStore::new(Arc::new(vault.clone())),
            cosigner.public_key(),
        );
        let share = wallet.generate_wallet(Algorithm::Ecdsa, "p1").await.unwrap();

        vault.fail_removes_of(marker);
        let err = wallet.delete_wallet("p1").await.unwrap_err();
        assert!(matches!(err, Error::StorageFailure { .. }), "{marker}");

        assert!(wallet.has_wallet("p1").await.unwrap(), "{marker}");
        let meta = wallet.wallet_metadata("p1").await.unwrap();
        assert_eq!(meta.map(|m| m.key_id), Some(share.key_id.clone()));
        assert_eq!(profile_records(&vault.inner, "p1").len(), 2);
        wallet.sign("p1", Algorithm::Ecdsa, &[9u8; 32]).await.unwrap();

        vault.heal();
        wallet.delete_wallet("p1").await.unwrap();
        assert!(!wallet.has_wallet("p1").await.unwrap());
        assert!(wallet.wallet_metadata("p1").await.unwrap().is_none());
    }
}

/// INVARIANT: Rotation never changes the public key or address
#[tokio::test]
async fn invariant_rotation_preserves_joint_key() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, _) = loopback_wallet(cosigner.clone());
    let original = wallet.generate_wallet(Algorithm::Ecdsa, "p1").await.unwrap();

    for fault in every_fault(MessageType::Rotation) {
        let _ = wallet.rotate_wallet("p1").await.unwrap();
        cosigner.inject(fault);
        assert!(wallet.rotate_wallet("p1").await.is_err(), "{fault:?}");

        let stored = wallet.store().require("p1").await.unwrap();
        assert_eq!(stored.public_key, original.public_key);
        assert_eq!(stored.address, original.address);
        // The share that survived a failed rotation still signs
        wallet.sign("p1", Algorithm::Ecdsa, &[7u8; 32]).await.unwrap();
    }
}

/// INVARIANT: Stored shares read back identical, and delete is idempotent
#[tokio::test]
async fn invariant_store_roundtrip_and_idempotent_delete() {
    let cosigner = Arc::new(LoopbackCosigner::new());
    let (wallet, vault) = loopback_wallet(cosigner);

    for profile in ["p1", "p2", "p3"] {
        let share = wallet.generate_wallet(Algorithm::Ecdsa, profile).await.unwrap();
        let loaded = wallet.store().require(profile).await.unwrap();
        assert_eq!(loaded.key_id, share.key_id);
        assert_eq!(loaded.share_data, share.share_data);
        assert_eq!(loaded.public_key, share.public_key);
        assert_eq!(loaded.address, share.address);
        assert_eq!(loaded.algorithm, share.algorithm);
        assert_eq!(loaded.created_at, share.created_at);
    }

    for _ in 0..2 {
        wallet.delete_wallet("p2").await.unwrap();
        assert!(!wallet.has_wallet("p2").await.unwrap());
        assert!(profile_records(&vault, "p2").is_empty());
    }
    assert!(wallet.has_wallet("p1").await.unwrap());
    assert!(wallet.has_wallet("p3").await.unwrap());
}
