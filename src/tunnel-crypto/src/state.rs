//! Resumable secure-session state.
//!
//! [`SessionState`] tracks everything one endpoint of a datagram TLS session
//! needs to protect records and to resume the session after a restart:
//! per-epoch sequence counters, both hello randoms, the master secret and the
//! negotiated cipher suite.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> RandomsSet -> MasterSecretSet -> CipherSuiteInitialized
//!         -> EpochAdvanced (repeatable) -> { exported | serialized }
//! ```
//!
//! Only the fields needed to resume are persisted (see [`SerializedState`]);
//! handshake scratch data is dropped. A restored state must run
//! [`SessionState::init_cipher_suite`] before first use, which
//! [`SessionState::unmarshal_binary`] does for you.

use crate::cipher_suite::{cipher_suite_for_id, CipherSuite, CipherSuiteId};
use crate::prf::{self, CLIENT_FINISHED_LABEL, KEY_EXPANSION_LABEL, MASTER_SECRET_LABEL,
    SERVER_FINISHED_LABEL};
use crate::random::{HandshakeRandom, RANDOM_BYTES_LENGTH, RANDOM_LENGTH};
use crate::record::{ContentType, RecordHeader, MAX_SEQUENCE_NUMBER};
use crate::{Result, SessionError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use tracing::debug;
use zeroize::Zeroizing;

/// Labels the handshake itself uses; exporting under them would leak
/// handshake secrets.
pub const RESERVED_EXPORT_LABELS: [&str; 4] = [
    CLIENT_FINISHED_LABEL,
    SERVER_FINISHED_LABEL,
    MASTER_SECRET_LABEL,
    KEY_EXPANSION_LABEL,
];

/// Upper bound on an encoded session record.
const MAX_MARSHALED_SIZE: usize = 1 << 20;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Created,
    RandomsSet,
    MasterSecretSet,
    CipherSuiteInitialized,
    EpochAdvanced,
}

/// Handshake-in-progress data. Never persisted.
#[derive(Default)]
pub struct HandshakeScratch {
    pub pre_master_secret: Zeroizing<Vec<u8>>,
    pub extended_master_secret: bool,
    pub cookie: Vec<u8>,
    pub server_name: String,
    pub peer_supported_protocols: Vec<String>,
    pub handshake_send_sequence: u16,
    pub handshake_recv_sequence: u16,
    pub remote_requested_certificate: bool,
    pub peer_certificates_verified: bool,
}

/// State of one secure-channel session.
pub struct SessionState {
    local_epoch: AtomicU16,
    remote_epoch: AtomicU16,
    /// 48-bit counters indexed by epoch
    local_sequence_number: RwLock<Vec<AtomicU64>>,
    local_random: HandshakeRandom,
    remote_random: HandshakeRandom,
    master_secret: Zeroizing<Vec<u8>>,
    cipher_suite: Option<Box<dyn CipherSuite>>,
    srtp_protection_profile: AtomicU16,
    is_client: bool,

    pub peer_certificates: Vec<Vec<u8>>,
    pub identity_hint: Vec<u8>,
    pub session_id: Vec<u8>,
    /// Application protocol agreed during the handshake
    pub negotiated_protocol: Option<String>,
    pub handshake: HandshakeScratch,
}

/// Fixed-shape record of the fields needed to resume a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedState {
    pub local_epoch: u16,
    pub remote_epoch: u16,
    #[serde(with = "b64_random")]
    pub local_random: [u8; RANDOM_LENGTH],
    #[serde(with = "b64_random")]
    pub remote_random: [u8; RANDOM_LENGTH],
    pub cipher_suite_id: u16,
    #[serde(with = "b64")]
    pub master_secret: Vec<u8>,
    /// Sequence number of the current local epoch only
    pub sequence_number: u64,
    pub srtp_protection_profile: u16,
    #[serde(with = "b64_list")]
    pub peer_certificates: Vec<Vec<u8>>,
    #[serde(with = "b64")]
    pub identity_hint: Vec<u8>,
    #[serde(with = "b64")]
    pub session_id: Vec<u8>,
    pub is_client: bool,
}

impl SessionState {
    /// Fresh state for one connection attempt.
    pub fn new(is_client: bool) -> Self {
        Self {
            local_epoch: AtomicU16::new(0),
            remote_epoch: AtomicU16::new(0),
            local_sequence_number: RwLock::new(vec![AtomicU64::new(0)]),
            local_random: HandshakeRandom::default(),
            remote_random: HandshakeRandom::default(),
            master_secret: Zeroizing::new(Vec::new()),
            cipher_suite: None,
            srtp_protection_profile: AtomicU16::new(0),
            is_client,
            peer_certificates: Vec::new(),
            identity_hint: Vec::new(),
            session_id: Vec::new(),
            negotiated_protocol: None,
            handshake: HandshakeScratch::default(),
        }
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn local_epoch(&self) -> u16 {
        self.local_epoch.load(Ordering::Acquire)
    }

    pub fn remote_epoch(&self) -> u16 {
        self.remote_epoch.load(Ordering::Acquire)
    }

    pub fn local_random(&self) -> &HandshakeRandom {
        &self.local_random
    }

    pub fn remote_random(&self) -> &HandshakeRandom {
        &self.remote_random
    }

    pub fn set_local_random(&mut self, random: HandshakeRandom) {
        self.local_random = random;
    }

    pub fn set_remote_random(&mut self, random: HandshakeRandom) {
        self.remote_random = random;
    }

    /// Generate and store the local hello random.
    pub fn generate_local_random(&mut self) -> HandshakeRandom {
        self.local_random = HandshakeRandom::generate();
        self.local_random
    }

    /// The 28 random bytes of the peer's hello random.
    pub fn remote_random_bytes(&self) -> [u8; RANDOM_BYTES_LENGTH] {
        self.remote_random.random_bytes
    }

    pub fn master_secret(&self) -> &[u8] {
        &self.master_secret
    }

    /// Set the master secret. It is derived once per session and never replaced.
    pub fn set_master_secret(&mut self, secret: &[u8]) -> Result<()> {
        if !self.master_secret.is_empty() {
            return Err(SessionError::MasterSecretAlreadySet);
        }
        self.master_secret = Zeroizing::new(secret.to_vec());
        Ok(())
    }

    /// Derive the master secret from a pre-master secret.
    ///
    /// With `session_hash` the RFC 7627 extended master secret is used.
    pub fn derive_master_secret(
        &mut self,
        pre_master_secret: &[u8],
        session_hash: Option<&[u8]>,
    ) -> Result<()> {
        let hash = self
            .cipher_suite
            .as_ref()
            .ok_or(SessionError::MissingInput("cipher suite"))?
            .hash_algorithm()?;
        if self.local_random.is_zero() || self.remote_random.is_zero() {
            return Err(SessionError::MissingInput("hello randoms"));
        }

        let (client, server) = self.randoms_in_client_order();
        let secret = match session_hash {
            Some(transcript) => prf::extended_master_secret(pre_master_secret, transcript, hash)?,
            None => prf::master_secret(pre_master_secret, &client, &server, hash)?,
        };
        self.handshake.pre_master_secret = Zeroizing::new(pre_master_secret.to_vec());
        self.handshake.extended_master_secret = session_hash.is_some();
        self.set_master_secret(&secret)
    }

    /// Choose the cipher suite. The suite starts uninitialized.
    pub fn set_cipher_suite(&mut self, id: CipherSuiteId) {
        self.cipher_suite = Some(cipher_suite_for_id(id));
    }

    /// Negotiated suite, or [`CipherSuiteId::NULL`] before negotiation.
    pub fn cipher_suite_id(&self) -> CipherSuiteId {
        self.cipher_suite
            .as_ref()
            .map(|s| s.id())
            .unwrap_or(CipherSuiteId::NULL)
    }

    pub fn is_cipher_suite_initialized(&self) -> bool {
        self.cipher_suite
            .as_ref()
            .map(|s| s.is_initialized())
            .unwrap_or(false)
    }

    /// Derive record keys. A suite that is already initialized is left alone.
    pub fn init_cipher_suite(&mut self) -> Result<()> {
        let is_client = self.is_client;
        let (client, server) = self.randoms_in_client_order();
        let master_secret = self.master_secret.clone();

        let suite = self
            .cipher_suite
            .as_mut()
            .ok_or(SessionError::MissingInput("cipher suite"))?;
        if suite.is_initialized() {
            return Ok(());
        }
        if master_secret.is_empty() && CipherSuiteId::SUPPORTED.contains(&suite.id()) {
            return Err(SessionError::MissingInput("master secret"));
        }

        suite.init(&master_secret, &client, &server, is_client)?;
        debug!(suite = %suite.id(), is_client, "cipher suite initialized");
        Ok(())
    }

    /// Move to the next local epoch and start its sequence counter at zero.
    pub fn advance_local_epoch(&self) -> Result<u16> {
        let next = self
            .local_epoch()
            .checked_add(1)
            .ok_or(SessionError::EpochExhausted)?;
        self.ensure_sequence_table(next);
        self.local_epoch.store(next, Ordering::Release);
        debug!(epoch = next, "local epoch advanced");
        Ok(next)
    }

    pub fn advance_remote_epoch(&self) -> Result<u16> {
        let next = self
            .remote_epoch()
            .checked_add(1)
            .ok_or(SessionError::EpochExhausted)?;
        self.remote_epoch.store(next, Ordering::Release);
        Ok(next)
    }

    /// Sequence number the next record of `epoch` will carry.
    pub fn local_sequence_number(&self, epoch: u16) -> u64 {
        self.local_sequence_number
            .read()
            .get(epoch as usize)
            .map(|n| n.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Claim the next sequence number of the current local epoch.
    pub fn next_sequence_number(&self) -> Result<u64> {
        let epoch = self.local_epoch();
        self.ensure_sequence_table(epoch);
        let table = self.local_sequence_number.read();
        let counter = &table[epoch as usize];
        let seq = counter.fetch_add(1, Ordering::AcqRel);
        if seq > MAX_SEQUENCE_NUMBER {
            counter.store(MAX_SEQUENCE_NUMBER + 1, Ordering::Release);
            return Err(SessionError::SequenceExhausted(epoch));
        }
        Ok(seq)
    }

    fn ensure_sequence_table(&self, epoch: u16) {
        if self.local_sequence_number.read().len() > epoch as usize {
            return;
        }
        let mut table = self.local_sequence_number.write();
        while table.len() <= epoch as usize {
            table.push(AtomicU64::new(0));
        }
    }

    pub fn srtp_protection_profile(&self) -> u16 {
        self.srtp_protection_profile.load(Ordering::Acquire)
    }

    pub fn set_srtp_protection_profile(&self, profile: u16) {
        self.srtp_protection_profile.store(profile, Ordering::Release);
    }

    /// Current lifecycle phase, derived from what is set.
    pub fn phase(&self) -> SessionPhase {
        if self.is_cipher_suite_initialized() {
            if self.local_epoch() > 0 {
                SessionPhase::EpochAdvanced
            } else {
                SessionPhase::CipherSuiteInitialized
            }
        } else if !self.master_secret.is_empty() {
            SessionPhase::MasterSecretSet
        } else if !self.local_random.is_zero() && !self.remote_random.is_zero() {
            SessionPhase::RandomsSet
        } else {
            SessionPhase::Created
        }
    }

    /// Protect `payload` as the next record of the current local epoch.
    pub fn seal_record(&self, content_type: ContentType, payload: &[u8]) -> Result<Vec<u8>> {
        let suite = self.initialized_suite()?;
        let header = RecordHeader::new(content_type, self.local_epoch(), self.next_sequence_number()?);
        suite.encrypt(&header, payload)
    }

    /// Authenticate and decrypt a record from the peer's current epoch.
    pub fn open_record(&self, record: &[u8]) -> Result<(RecordHeader, Vec<u8>)> {
        let suite = self.initialized_suite()?;
        let (header, plaintext) = suite.decrypt(record)?;
        if header.epoch != self.remote_epoch() {
            return Err(SessionError::InvalidRecord(format!(
                "record epoch {} does not match remote epoch {}",
                header.epoch,
                self.remote_epoch()
            )));
        }
        Ok((header, plaintext))
    }

    fn initialized_suite(&self) -> Result<&dyn CipherSuite> {
        let suite = self
            .cipher_suite
            .as_deref()
            .ok_or(SessionError::CipherSuiteNotInitialized)?;
        // An unknown suite reports itself on use; anything else must be keyed.
        if !suite.is_initialized() && CipherSuiteId::SUPPORTED.contains(&suite.id()) {
            return Err(SessionError::CipherSuiteNotInitialized);
        }
        Ok(suite)
    }

    /// Exported keying material as defined in RFC 5705.
    ///
    /// Pure with respect to the session: the same master secret, randoms,
    /// role and suite always give the same bytes for `(label, length)`.
    pub fn export_keying_material(
        &self,
        label: &str,
        context: &[u8],
        length: usize,
    ) -> Result<Vec<u8>> {
        if self.local_epoch() == 0 {
            return Err(SessionError::HandshakeNotComplete);
        }
        if !context.is_empty() {
            return Err(SessionError::ContextUnsupported);
        }
        if RESERVED_EXPORT_LABELS.contains(&label) {
            return Err(SessionError::ReservedLabel(label.to_string()));
        }

        let suite = self.initialized_suite()?;
        let hash = suite.hash_algorithm()?;

        let (client, server) = self.randoms_in_client_order();
        let mut seed = Vec::with_capacity(label.len() + 2 * RANDOM_LENGTH);
        seed.extend_from_slice(label.as_bytes());
        seed.extend_from_slice(&client);
        seed.extend_from_slice(&server);
        prf::p_hash(&self.master_secret, &seed, length, hash)
    }

    /// Local random first for the initiator, remote first for the responder.
    fn randoms_in_client_order(&self) -> ([u8; RANDOM_LENGTH], [u8; RANDOM_LENGTH]) {
        let local = self.local_random.marshal_fixed();
        let remote = self.remote_random.marshal_fixed();
        if self.is_client {
            (local, remote)
        } else {
            (remote, local)
        }
    }

    /// Capture the resumable fields.
    pub fn serialize(&self) -> SerializedState {
        let epoch = self.local_epoch();
        SerializedState {
            local_epoch: epoch,
            remote_epoch: self.remote_epoch(),
            local_random: self.local_random.marshal_fixed(),
            remote_random: self.remote_random.marshal_fixed(),
            cipher_suite_id: self.cipher_suite_id().0,
            master_secret: self.master_secret.to_vec(),
            sequence_number: self.local_sequence_number(epoch),
            srtp_protection_profile: self.srtp_protection_profile(),
            peer_certificates: self.peer_certificates.clone(),
            identity_hint: self.identity_hint.clone(),
            session_id: self.session_id.clone(),
            is_client: self.is_client,
        }
    }

    /// Rebuild a state from a serialized record.
    ///
    /// Sequence counters of epochs below the restored one start at zero. The
    /// cipher suite is looked up but not initialized.
    pub fn deserialize(serialized: &SerializedState) -> Self {
        let mut state = Self::new(serialized.is_client);
        let epoch = serialized.local_epoch;

        state.local_epoch.store(epoch, Ordering::Release);
        state.remote_epoch.store(serialized.remote_epoch, Ordering::Release);
        state.ensure_sequence_table(epoch);

        state.local_random = HandshakeRandom::unmarshal_fixed(&serialized.local_random);
        state.remote_random = HandshakeRandom::unmarshal_fixed(&serialized.remote_random);
        state.master_secret = Zeroizing::new(serialized.master_secret.clone());
        state.cipher_suite = Some(cipher_suite_for_id(CipherSuiteId(serialized.cipher_suite_id)));

        state.local_sequence_number.read()[epoch as usize]
            .store(serialized.sequence_number, Ordering::Release);
        state.set_srtp_protection_profile(serialized.srtp_protection_profile);

        state.peer_certificates = serialized.peer_certificates.clone();
        state.identity_hint = serialized.identity_hint.clone();
        state.session_id = serialized.session_id.clone();
        state
    }

    /// Independent copy of the resumable fields.
    pub fn clone_state(&self) -> Self {
        Self::deserialize(&self.serialize())
    }

    /// Length-prefixed encoding of [`SessionState::serialize`].
    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(&self.serialize())?;
        if body.len() > MAX_MARSHALED_SIZE {
            return Err(SessionError::Serialization(format!(
                "session record too large: {} bytes",
                body.len()
            )));
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a record from [`SessionState::marshal_binary`] and initialize
    /// its cipher suite.
    ///
    /// A record taken before the master secret was set restores with the
    /// suite chosen but uninitialized.
    pub fn unmarshal_binary(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(SessionError::Serialization(
                "session record shorter than length prefix".into(),
            ));
        }
        let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if declared > MAX_MARSHALED_SIZE || data.len() - 4 != declared {
            return Err(SessionError::Serialization(format!(
                "session record length mismatch: declared {declared}, got {}",
                data.len() - 4
            )));
        }
        let serialized: SerializedState = serde_json::from_slice(&data[4..])?;
        let mut state = Self::deserialize(&serialized);
        if !state.master_secret.is_empty() {
            state.init_cipher_suite()?;
        }
        Ok(state)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("is_client", &self.is_client)
            .field("local_epoch", &self.local_epoch())
            .field("remote_epoch", &self.remote_epoch())
            .field("cipher_suite", &self.cipher_suite_id())
            .field("phase", &self.phase())
            .field("master_secret", &"<redacted>")
            .finish()
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod b64_random {
    use crate::random::RANDOM_LENGTH;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; RANDOM_LENGTH], s: S) -> Result<S::Ok, S::Error> {
        super::b64::serialize(bytes, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; RANDOM_LENGTH], D::Error> {
        let bytes = super::b64::deserialize(d)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!("random must be {RANDOM_LENGTH} bytes, got {}", v.len()))
        })
    }
}

mod b64_list {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(items.iter().map(|item| STANDARD.encode(item)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
