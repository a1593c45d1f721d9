use chatseal_crypto::cipher::{decrypt, encrypt, generate_keypair, sign, verify};
use chatseal_crypto::{CryptoError, KeyType, PublicKey, SecretKey};

fn flip_bit(bytes: &[u8], bit: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out[bit / 8] ^= 1 << (bit % 8);
    out
}

#[test]
fn roundtrip_across_sizes() {
    let (public, secret) = generate_keypair(KeyType::Encryption).unwrap();
    // Hybrid scheme: no modulus-bound limit on plaintext size.
    for len in [0usize, 1, 190, 191, 4096, 256 * 1024] {
        let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let ct = encrypt(&public, &plaintext).unwrap();
        let pt = decrypt(&secret, &ct).unwrap();
        assert_eq!(pt.as_slice(), plaintext.as_slice(), "len {len}");
    }
}

#[test]
fn any_ciphertext_bit_flip_fails_to_decrypt() {
    let (public, secret) = generate_keypair(KeyType::Encryption).unwrap();
    let ct = encrypt(&public, b"attack at dawn").unwrap();
    for bit in (0..ct.len() * 8).step_by(7) {
        let tampered = flip_bit(&ct, bit);
        assert!(
            matches!(decrypt(&secret, &tampered), Err(CryptoError::Decrypt)),
            "bit {bit} accepted"
        );
    }
}

#[test]
fn signature_rejects_single_bit_mutations() {
    let (public, secret) = generate_keypair(KeyType::Signing).unwrap();
    let message = b"meet me at the usual place".to_vec();
    let signature = sign(&secret, &message).unwrap();
    assert!(verify(&public, &message, &signature));

    for bit in 0..message.len() * 8 {
        assert!(!verify(&public, &flip_bit(&message, bit), &signature));
    }
    for bit in 0..signature.len() * 8 {
        assert!(!verify(&public, &message, &flip_bit(&signature, bit)));
    }
}

#[test]
fn exported_keys_reload() {
    let (public, secret) = generate_keypair(KeyType::Encryption).unwrap();
    let public = PublicKey::decode(&public.encode()).unwrap();
    let secret = SecretKey::decode(&secret.encode()).unwrap();
    let ct = encrypt(&public, b"later").unwrap();
    assert_eq!(decrypt(&secret, &ct).unwrap().as_slice(), b"later");
}

#[test]
fn signature_from_other_key_rejected() {
    let (_, secret) = generate_keypair(KeyType::Signing).unwrap();
    let (other_public, _) = generate_keypair(KeyType::Signing).unwrap();
    let sig = sign(&secret, b"m").unwrap();
    assert!(!verify(&other_public, b"m", &sig));
}
