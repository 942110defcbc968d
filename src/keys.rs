use anyhow::Context;
use md5::Md5;
use russh::keys::{
    ssh_key::private::{Ed25519Keypair, KeypairData},
    PrivateKey, PublicKey,
};
use sha2::{Digest, Sha256};

/// Build the server's Ed25519 host key. A non-empty seed produces the
/// same key on every start, so clients keep seeing one host identity
/// across restarts; without a seed the key material is random.
pub fn generate_key(seed: Option<&str>) -> anyhow::Result<PrivateKey> {
    let secret: [u8; 32] = match seed {
        Some(seed) if !seed.is_empty() => Sha256::digest(seed.as_bytes()).into(),
        _ => rand::random(),
    };
    let keypair = Ed25519Keypair::from_seed(&secret);
    PrivateKey::new(KeypairData::Ed25519(keypair), "")
        .with_context(|| "Error assembling host key")
}

/// Printable digest of a host public key, as MD5 colon-hex over the
/// wire-format key blob. This is the format tunnel clients display for
/// out-of-band verification.
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Md5::digest(key.to_bytes().unwrap_or_default());
    digest
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}
