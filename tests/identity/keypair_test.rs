use postmesh::identity::{Keypair, KeypairError, PublicKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// Test: Each generated keypair should be unique
#[test]
fn test_keypairs_are_unique() {
    let keypair1 = Keypair::generate();
    let keypair2 = Keypair::generate();

    assert_ne!(
        keypair1.public_key().as_bytes(),
        keypair2.public_key().as_bytes(),
        "Two generated keypairs should have different public keys"
    );
}

/// Test: Can serialize keypair to bytes and restore it
#[test]
fn test_keypair_serialization() {
    let original = Keypair::generate();
    let restored = Keypair::from_bytes(&original.to_bytes()).expect("Should deserialize keypair from bytes");

    assert_eq!(original.public_key(), restored.public_key());
}

/// Test: Public key survives a bytes round trip
#[test]
fn test_public_key_serialization() {
    let public_key = Keypair::generate().public_key();
    let restored = PublicKey::from_bytes(public_key.as_bytes()).expect("Should deserialize public key from bytes");

    assert_eq!(public_key, restored);
}

#[test]
fn test_wrong_lengths_are_rejected() {
    assert_eq!(
        Keypair::from_bytes(&[0u8; 10]).unwrap_err(),
        KeypairError::InvalidLength { expected: 32, got: 10 }
    );
    assert_eq!(
        PublicKey::from_bytes(&[0u8; 16]).unwrap_err(),
        KeypairError::InvalidLength {
            expected: PUBLIC_KEY_LEN,
            got: 16
        }
    );
}

#[test]
fn test_signature_verifies_only_for_signed_message() {
    let keypair = Keypair::generate();
    let signature = keypair.sign(b"hello mesh");

    assert_eq!(signature.len(), SIGNATURE_LEN);
    assert!(keypair.public_key().verify(b"hello mesh", &signature));
    assert!(!keypair.public_key().verify(b"hello mesh!", &signature));
    assert!(!Keypair::generate().public_key().verify(b"hello mesh", &signature));
}

#[test]
fn test_truncated_signature_fails() {
    let keypair = Keypair::generate();
    let signature = keypair.sign(b"msg");
    assert!(!keypair.public_key().verify(b"msg", &signature[..32]));
}

#[test]
fn test_signing_is_deterministic() {
    let keypair = Keypair::generate();
    assert_eq!(keypair.sign(b"same"), keypair.sign(b"same"));
}

#[test]
fn test_debug_hides_secret() {
    let keypair = Keypair::generate();
    let secret_hex = hex::encode(keypair.to_bytes());
    assert!(!format!("{:?}", keypair).contains(&secret_hex));
}
