pub mod cipher_suite;
pub mod error;
pub mod prf;
pub mod random;
pub mod record;
pub mod rng;
pub mod seal;
pub mod state;

pub use cipher_suite::{cipher_suite_for_id, CipherSuite, CipherSuiteId};
pub use error::{Result, SessionError};
pub use prf::HashAlgorithm;
pub use random::HandshakeRandom;
pub use record::{ContentType, RecordHeader};
pub use seal::{SealFormat, SealIdentity, SealRecipient};
pub use state::{SerializedState, SessionPhase, SessionState, RESERVED_EXPORT_LABELS};
