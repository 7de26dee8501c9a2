//! Unit tests for shared types

use crate::support::SCRIPTED_PUBLIC_KEY;
use mpc_keyshare_core::{
    derive_address, types::ADDRESS_LEN, Algorithm, KeyShare, KeyShareMetadata, Signature,
};

#[test]
fn test_key_share_json_shape() {
    let share = KeyShare::new(
        vec![0xFF, 0x00, 0x10],
        &hex::decode(SCRIPTED_PUBLIC_KEY).unwrap(),
        Algorithm::Ecdsa,
    )
    .unwrap();

    let json = serde_json::to_value(&share).unwrap();
    assert_eq!(json["share_data"], "/wAQ");
    assert_eq!(json["algorithm"], "ecdsa");
    assert_eq!(json["public_key"], SCRIPTED_PUBLIC_KEY);
    assert_eq!(json["address"], share.address.as_str());

    let back: KeyShare = serde_json::from_value(json).unwrap();
    assert_eq!(back, share);
}

#[test]
fn test_metadata_mirrors_share() {
    let share = KeyShare::new(
        vec![1; 16],
        &hex::decode(SCRIPTED_PUBLIC_KEY).unwrap(),
        Algorithm::Ecdsa,
    )
    .unwrap();
    let meta: KeyShareMetadata = share.metadata("p1", None);

    assert_eq!(meta.profile_id, "p1");
    assert_eq!(meta.key_id, share.key_id);
    assert_eq!(meta.public_key, share.public_key);
    assert_eq!(meta.address, share.address);
    assert_eq!(meta.created_at, share.created_at);

    // Metadata never carries share bytes
    let json = serde_json::to_string(&meta).unwrap();
    assert!(!json.contains("share_data"));
}

#[test]
fn test_key_ids_are_unique() {
    let pk = hex::decode(SCRIPTED_PUBLIC_KEY).unwrap();
    let a = KeyShare::new(vec![1], &pk, Algorithm::Ecdsa).unwrap();
    let b = KeyShare::new(vec![1], &pk, Algorithm::Ecdsa).unwrap();
    assert_ne!(a.key_id, b.key_id);
    assert_eq!(a.address, b.address);
}

#[test]
fn test_uncompressed_key_address() {
    let address = derive_address(&format!("04{}", "ab".repeat(64))).unwrap();
    assert_eq!(address.len(), ADDRESS_LEN);
}

#[test]
fn test_signature_hex() {
    let signature = Signature::new(Algorithm::Ecdsa, vec![0xde, 0xad]);
    assert_eq!(signature.to_hex(), "0xdead");
}
