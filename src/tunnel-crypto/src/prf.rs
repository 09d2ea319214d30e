//! TLS 1.2 pseudo-random function (RFC 5246 section 5).
//!
//! `P_hash(secret, seed)` is iterated HMAC; every derivation in the session
//! (master secret, key block, exported keying material) goes through it with
//! the hash negotiated by the cipher suite.

use crate::{Result, SessionError};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384};
use zeroize::Zeroizing;

/// Label for deriving the master secret from the pre-master secret.
pub const MASTER_SECRET_LABEL: &str = "master secret";
/// Label for the RFC 7627 extended master secret.
pub const EXTENDED_MASTER_SECRET_LABEL: &str = "extended master secret";
/// Label for expanding the master secret into write keys.
pub const KEY_EXPANSION_LABEL: &str = "key expansion";
/// Label for the client Finished verify data.
pub const CLIENT_FINISHED_LABEL: &str = "client finished";
/// Label for the server Finished verify data.
pub const SERVER_FINISHED_LABEL: &str = "server finished";

/// Length of the master secret in bytes.
pub const MASTER_SECRET_LENGTH: usize = 48;

/// Hash function a cipher suite uses for its PRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    /// Digest size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }
}

/// `P_hash(secret, seed)` truncated to `len` bytes.
pub fn p_hash(secret: &[u8], seed: &[u8], len: usize, hash: HashAlgorithm) -> Result<Vec<u8>> {
    match hash {
        HashAlgorithm::Sha256 => p_hash_with::<Hmac<Sha256>>(secret, seed, len),
        HashAlgorithm::Sha384 => p_hash_with::<Hmac<Sha384>>(secret, seed, len),
    }
}

fn p_hash_with<M: Mac + KeyInit + Clone>(secret: &[u8], seed: &[u8], len: usize) -> Result<Vec<u8>> {
    let keyed = <M as KeyInit>::new_from_slice(secret)
        .map_err(|e| SessionError::InvalidKey(format!("PRF secret: {e}")))?;

    // A(1) = HMAC(secret, seed)
    let mut a = {
        let mut mac = keyed.clone();
        mac.update(seed);
        Zeroizing::new(mac.finalize().into_bytes().to_vec())
    };

    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let mut mac = keyed.clone();
        mac.update(&a);
        mac.update(seed);
        out.extend_from_slice(&mac.finalize().into_bytes());

        let mut mac = keyed.clone();
        mac.update(&a);
        a = Zeroizing::new(mac.finalize().into_bytes().to_vec());
    }
    out.truncate(len);
    Ok(out)
}

/// `PRF(secret, label, seed) = P_hash(secret, label || seed)`.
pub fn prf(
    secret: &[u8],
    label: &str,
    seed: &[u8],
    len: usize,
    hash: HashAlgorithm,
) -> Result<Vec<u8>> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);
    p_hash(secret, &full_seed, len, hash)
}

/// Master secret from the pre-master secret and both hello randoms.
pub fn master_secret(
    pre_master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    hash: HashAlgorithm,
) -> Result<Vec<u8>> {
    let mut seed = Vec::with_capacity(client_random.len() + server_random.len());
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    prf(
        pre_master_secret,
        MASTER_SECRET_LABEL,
        &seed,
        MASTER_SECRET_LENGTH,
        hash,
    )
}

/// Extended master secret bound to the handshake transcript hash.
pub fn extended_master_secret(
    pre_master_secret: &[u8],
    session_hash: &[u8],
    hash: HashAlgorithm,
) -> Result<Vec<u8>> {
    prf(
        pre_master_secret,
        EXTENDED_MASTER_SECRET_LABEL,
        session_hash,
        MASTER_SECRET_LENGTH,
        hash,
    )
}

/// Write keys and implicit IVs for both directions of a connection.
pub struct EncryptionKeys {
    pub client_write_key: Zeroizing<Vec<u8>>,
    pub server_write_key: Zeroizing<Vec<u8>>,
    pub client_write_iv: Zeroizing<Vec<u8>>,
    pub server_write_iv: Zeroizing<Vec<u8>>,
}

/// Expand the master secret into the key block and slice it into write keys.
///
/// AEAD suites carry no MAC keys, so the block is
/// `client_key || server_key || client_iv || server_iv`.
pub fn encryption_keys(
    master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    key_len: usize,
    iv_len: usize,
    hash: HashAlgorithm,
) -> Result<EncryptionKeys> {
    let mut seed = Vec::with_capacity(client_random.len() + server_random.len());
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);

    let block = Zeroizing::new(prf(
        master_secret,
        KEY_EXPANSION_LABEL,
        &seed,
        2 * key_len + 2 * iv_len,
        hash,
    )?);

    let (client_write_key, rest) = block.split_at(key_len);
    let (server_write_key, rest) = rest.split_at(key_len);
    let (client_write_iv, server_write_iv) = rest.split_at(iv_len);

    Ok(EncryptionKeys {
        client_write_key: Zeroizing::new(client_write_key.to_vec()),
        server_write_key: Zeroizing::new(server_write_key.to_vec()),
        client_write_iv: Zeroizing::new(client_write_iv.to_vec()),
        server_write_iv: Zeroizing::new(server_write_iv.to_vec()),
    })
}
