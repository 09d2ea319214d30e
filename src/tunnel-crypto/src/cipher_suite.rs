//! Cipher suite registry and AEAD record transforms.
//!
//! A suite is looked up by its 16-bit identifier. Lookup never fails: an
//! identifier this build does not implement yields an [`UnsupportedCipherSuite`]
//! placeholder whose every cryptographic operation reports
//! [`SessionError::UnknownCipherSuite`]. That keeps session restore total and
//! surfaces a bad identifier at first use.

use crate::prf::{self, HashAlgorithm};
use crate::record::{RecordHeader, RECORD_HEADER_SIZE};
use crate::{Result, SessionError};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// AEAD authentication tag length for every supported suite.
pub const AEAD_TAG_LENGTH: usize = 16;
/// Explicit nonce carried in GCM records.
pub const GCM_EXPLICIT_NONCE_LENGTH: usize = 8;

/// IANA cipher suite identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CipherSuiteId(pub u16);

impl CipherSuiteId {
    /// No suite negotiated yet.
    pub const NULL: Self = Self(0x0000);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xc02b);
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xc02f);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: Self = Self(0xc02c);
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0xc030);
    pub const TLS_PSK_WITH_AES_128_GCM_SHA256: Self = Self(0x00a8);
    pub const TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xcca9);
    pub const TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: Self = Self(0xcca8);

    /// Every identifier with a concrete implementation.
    pub const SUPPORTED: [CipherSuiteId; 7] = [
        Self::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        Self::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        Self::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        Self::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        Self::TLS_PSK_WITH_AES_128_GCM_SHA256,
        Self::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        Self::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ];

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            Self::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            Self::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            Self::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            Self::TLS_PSK_WITH_AES_128_GCM_SHA256 => "TLS_PSK_WITH_AES_128_GCM_SHA256",
            Self::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"
            }
            Self::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"
            }
            _ => return None,
        })
    }
}

impl fmt::Display for CipherSuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown({:#06x})", self.0),
        }
    }
}

/// A negotiated cipher suite and, once initialized, its record transform.
pub trait CipherSuite: Send + Sync {
    fn id(&self) -> CipherSuiteId;

    /// Hash used by the PRF for this suite.
    fn hash_algorithm(&self) -> Result<HashAlgorithm>;

    fn is_initialized(&self) -> bool;

    /// Derive write keys from the master secret.
    ///
    /// Randoms are always passed in `client, server` order; `is_client`
    /// selects which side of the key block this endpoint writes with.
    fn init(
        &mut self,
        master_secret: &[u8],
        client_random: &[u8],
        server_random: &[u8],
        is_client: bool,
    ) -> Result<()>;

    /// Protect `payload` and return the full record including header.
    fn encrypt(&self, header: &RecordHeader, payload: &[u8]) -> Result<Vec<u8>>;

    /// Authenticate and decrypt a full record.
    fn decrypt(&self, record: &[u8]) -> Result<(RecordHeader, Vec<u8>)>;
}

/// Look up the implementation for `id`.
pub fn cipher_suite_for_id(id: CipherSuiteId) -> Box<dyn CipherSuite> {
    let aead = match id {
        CipherSuiteId::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        | CipherSuiteId::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        | CipherSuiteId::TLS_PSK_WITH_AES_128_GCM_SHA256 => AeadAlgorithm::Aes128Gcm,
        CipherSuiteId::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        | CipherSuiteId::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => AeadAlgorithm::Aes256Gcm,
        CipherSuiteId::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
        | CipherSuiteId::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
            AeadAlgorithm::ChaCha20Poly1305
        }
        _ => return Box::new(UnsupportedCipherSuite { id }),
    };
    Box::new(AeadCipherSuite {
        id,
        algorithm: aead,
        keys: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    fn key_len(&self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm => 16,
            AeadAlgorithm::Aes256Gcm | AeadAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Implicit IV length from the key block.
    fn iv_len(&self) -> usize {
        match self {
            AeadAlgorithm::Aes128Gcm | AeadAlgorithm::Aes256Gcm => 4,
            AeadAlgorithm::ChaCha20Poly1305 => 12,
        }
    }

    fn hash(&self) -> HashAlgorithm {
        match self {
            AeadAlgorithm::Aes256Gcm => HashAlgorithm::Sha384,
            AeadAlgorithm::Aes128Gcm | AeadAlgorithm::ChaCha20Poly1305 => HashAlgorithm::Sha256,
        }
    }

    fn uses_explicit_nonce(&self) -> bool {
        !matches!(self, AeadAlgorithm::ChaCha20Poly1305)
    }
}

enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    fn new(algorithm: AeadAlgorithm, key: &[u8]) -> Result<Self> {
        let invalid = || SessionError::InvalidKey(format!("{algorithm:?} key length {}", key.len()));
        Ok(match algorithm {
            AeadAlgorithm::Aes128Gcm => AeadCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|_| invalid())?,
            )),
            AeadAlgorithm::Aes256Gcm => AeadCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| invalid())?,
            )),
            AeadAlgorithm::ChaCha20Poly1305 => AeadCipher::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| invalid())?,
            )),
        })
    }

    fn seal(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let nonce = GenericArray::from_slice(nonce);
        match self {
            AeadCipher::Aes128(c) => c.encrypt(nonce, payload),
            AeadCipher::Aes256(c) => c.encrypt(nonce, payload),
            AeadCipher::ChaCha(c) => c.encrypt(nonce, payload),
        }
        .map_err(|e| SessionError::Encrypt(e.to_string()))
    }

    fn open(&self, nonce: &[u8; 12], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        let nonce = GenericArray::from_slice(nonce);
        match self {
            AeadCipher::Aes128(c) => c.decrypt(nonce, payload),
            AeadCipher::Aes256(c) => c.decrypt(nonce, payload),
            AeadCipher::ChaCha(c) => c.decrypt(nonce, payload),
        }
        .map_err(|_| SessionError::Decrypt("record authentication failed".into()))
    }
}

struct DirectionalKeys {
    local: AeadCipher,
    remote: AeadCipher,
    local_iv: Zeroizing<Vec<u8>>,
    remote_iv: Zeroizing<Vec<u8>>,
}

/// GCM and ChaCha20-Poly1305 suites.
struct AeadCipherSuite {
    id: CipherSuiteId,
    algorithm: AeadAlgorithm,
    keys: Option<DirectionalKeys>,
}

impl AeadCipherSuite {
    fn keys(&self) -> Result<&DirectionalKeys> {
        self.keys
            .as_ref()
            .ok_or(SessionError::CipherSuiteNotInitialized)
    }

    fn nonce(&self, iv: &[u8], header: &RecordHeader) -> [u8; 12] {
        let seq = header.sequence_bytes();
        let mut nonce = [0u8; 12];
        if self.algorithm.uses_explicit_nonce() {
            nonce[..4].copy_from_slice(iv);
            nonce[4..].copy_from_slice(&seq);
        } else {
            nonce.copy_from_slice(iv);
            for (n, s) in nonce[4..].iter_mut().zip(seq.iter()) {
                *n ^= s;
            }
        }
        nonce
    }
}

impl CipherSuite for AeadCipherSuite {
    fn id(&self) -> CipherSuiteId {
        self.id
    }

    fn hash_algorithm(&self) -> Result<HashAlgorithm> {
        Ok(self.algorithm.hash())
    }

    fn is_initialized(&self) -> bool {
        self.keys.is_some()
    }

    fn init(
        &mut self,
        master_secret: &[u8],
        client_random: &[u8],
        server_random: &[u8],
        is_client: bool,
    ) -> Result<()> {
        let keys = prf::encryption_keys(
            master_secret,
            client_random,
            server_random,
            self.algorithm.key_len(),
            self.algorithm.iv_len(),
            self.algorithm.hash(),
        )?;

        let client = AeadCipher::new(self.algorithm, &keys.client_write_key)?;
        let server = AeadCipher::new(self.algorithm, &keys.server_write_key)?;

        self.keys = Some(if is_client {
            DirectionalKeys {
                local: client,
                remote: server,
                local_iv: keys.client_write_iv,
                remote_iv: keys.server_write_iv,
            }
        } else {
            DirectionalKeys {
                local: server,
                remote: client,
                local_iv: keys.server_write_iv,
                remote_iv: keys.client_write_iv,
            }
        });
        Ok(())
    }

    fn encrypt(&self, header: &RecordHeader, payload: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys()?;
        let nonce = self.nonce(&keys.local_iv, header);
        let aad = header.additional_data(payload.len());
        let sealed = keys.local.seal(&nonce, payload, &aad)?;

        let explicit = if self.algorithm.uses_explicit_nonce() {
            &nonce[4..]
        } else {
            &[][..]
        };
        let fragment_len = explicit.len() + sealed.len();

        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + fragment_len);
        out.extend_from_slice(&header.marshal(fragment_len)?);
        out.extend_from_slice(explicit);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, record: &[u8]) -> Result<(RecordHeader, Vec<u8>)> {
        let keys = self.keys()?;
        let (header, fragment_len) = RecordHeader::unmarshal(record)?;
        let fragment = &record[RECORD_HEADER_SIZE..];
        if fragment.len() != fragment_len {
            return Err(SessionError::InvalidRecord(format!(
                "fragment length mismatch: header says {fragment_len}, got {}",
                fragment.len()
            )));
        }

        let (nonce, ciphertext) = if self.algorithm.uses_explicit_nonce() {
            if fragment.len() < GCM_EXPLICIT_NONCE_LENGTH + AEAD_TAG_LENGTH {
                return Err(SessionError::InvalidRecord("GCM record too short".into()));
            }
            let mut nonce = [0u8; 12];
            nonce[..4].copy_from_slice(&keys.remote_iv);
            nonce[4..].copy_from_slice(&fragment[..GCM_EXPLICIT_NONCE_LENGTH]);
            (nonce, &fragment[GCM_EXPLICIT_NONCE_LENGTH..])
        } else {
            if fragment.len() < AEAD_TAG_LENGTH {
                return Err(SessionError::InvalidRecord(
                    "ChaCha20-Poly1305 record too short".into(),
                ));
            }
            (self.nonce(&keys.remote_iv, &header), fragment)
        };

        let aad = header.additional_data(ciphertext.len() - AEAD_TAG_LENGTH);
        let plaintext = keys.remote.open(&nonce, ciphertext, &aad)?;
        Ok((header, plaintext))
    }
}

/// Stand-in for an identifier without an implementation.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedCipherSuite {
    id: CipherSuiteId,
}

impl CipherSuite for UnsupportedCipherSuite {
    fn id(&self) -> CipherSuiteId {
        self.id
    }

    fn hash_algorithm(&self) -> Result<HashAlgorithm> {
        Err(SessionError::UnknownCipherSuite(self.id.0))
    }

    fn is_initialized(&self) -> bool {
        false
    }

    fn init(&mut self, _: &[u8], _: &[u8], _: &[u8], _: bool) -> Result<()> {
        Ok(())
    }

    fn encrypt(&self, _: &RecordHeader, _: &[u8]) -> Result<Vec<u8>> {
        Err(SessionError::UnknownCipherSuite(self.id.0))
    }

    fn decrypt(&self, _: &[u8]) -> Result<(RecordHeader, Vec<u8>)> {
        Err(SessionError::UnknownCipherSuite(self.id.0))
    }
}
