//! Sealing of diagnostic bundles with [age](https://age-encryption.org/).
//!
//! Feedback uploads are encrypted to a recipient key published with the
//! client configuration, so only the operator holding the matching
//! identity can read them. Output is binary age by default; [`SealFormat::Armored`]
//! produces the PEM-style text encoding for transports that need it.

use crate::{Result, SessionError};
use age::{
    armor::{ArmoredReader, ArmoredWriter, Format},
    secrecy::ExposeSecret,
    x25519, Decryptor, Encryptor,
};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Output encoding of a sealed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SealFormat {
    #[default]
    Binary,
    Armored,
}

/// Public key that feedback bundles are sealed to (`age1...`).
#[derive(Clone)]
pub struct SealRecipient {
    recipient: x25519::Recipient,
}

impl FromStr for SealRecipient {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        let recipient = s
            .trim()
            .parse::<x25519::Recipient>()
            .map_err(|e| SessionError::InvalidKey(format!("age recipient: {e}")))?;
        Ok(Self { recipient })
    }
}

impl fmt::Display for SealRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.recipient)
    }
}

impl fmt::Debug for SealRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SealRecipient").field(&self.to_string()).finish()
    }
}

impl SealRecipient {
    /// Encrypt `plaintext` for this recipient.
    pub fn seal(&self, plaintext: &[u8], format: SealFormat) -> Result<Vec<u8>> {
        let encryptor = Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| SessionError::Encrypt("no age recipients".into()))?;

        let armor = match format {
            SealFormat::Binary => Format::Binary,
            SealFormat::Armored => Format::AsciiArmor,
        };

        let mut sealed = Vec::with_capacity(plaintext.len() + 256);
        let output = ArmoredWriter::wrap_output(&mut sealed, armor)
            .map_err(|e| SessionError::Encrypt(format!("armor: {e}")))?;
        let mut writer = encryptor
            .wrap_output(output)
            .map_err(|e| SessionError::Encrypt(e.to_string()))?;
        writer.write_all(plaintext)?;
        writer
            .finish()
            .and_then(|armored| armored.finish())
            .map_err(|e| SessionError::Encrypt(e.to_string()))?;

        Ok(sealed)
    }
}

/// Private key able to open sealed bundles (`AGE-SECRET-KEY-1...`).
///
/// Clients never hold one; it exists for operator tooling and tests.
pub struct SealIdentity {
    identity: x25519::Identity,
}

impl SealIdentity {
    pub fn generate() -> Self {
        Self {
            identity: x25519::Identity::generate(),
        }
    }

    pub fn recipient(&self) -> SealRecipient {
        SealRecipient {
            recipient: self.identity.to_public(),
        }
    }

    /// Secret key in age text form.
    pub fn to_secret_string(&self) -> String {
        self.identity.to_string().expose_secret().to_string()
    }

    /// Decrypt a bundle in either binary or armored form.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let decryptor = match Decryptor::new(ArmoredReader::new(sealed))
            .map_err(|e| SessionError::Decrypt(e.to_string()))?
        {
            Decryptor::Recipients(d) => d,
            Decryptor::Passphrase(_) => {
                return Err(SessionError::Decrypt(
                    "bundle is passphrase-encrypted".into(),
                ))
            }
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| SessionError::Decrypt(e.to_string()))?;
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext)?;
        Ok(plaintext)
    }
}

impl FromStr for SealIdentity {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        let identity = s
            .trim()
            .parse::<x25519::Identity>()
            .map_err(|_| SessionError::InvalidKey("invalid age identity".into()))?;
        Ok(Self { identity })
    }
}
