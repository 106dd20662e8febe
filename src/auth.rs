//! Stanza authentication.
//!
//! Every stanza arriving from the network passes an [`Authenticator`] before
//! the engine stores or delivers it. Stanzas that fail are dropped.

use crate::error::{Result, SyncError};
use crate::types::Stanza;
use sha2::{Digest, Sha256};

/// Verifies stanza signatures.
pub trait Authenticator: Send + Sync {
    /// `Ok(())` if the stanza is authentic, `SyncError::Authentication` otherwise.
    fn verify(&self, stanza: &Stanza) -> Result<()>;
}

/// Accepts everything. For transports that authenticate before delivery.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustAll;

impl Authenticator for TrustAll {
    fn verify(&self, _stanza: &Stanza) -> Result<()> {
        Ok(())
    }
}

/// Checks that the signature is the hex SHA-256 of the stanza's unsigned body.
///
/// This is an integrity check, not an identity proof: it catches corrupted or
/// tampered stanzas but not forged ones.
#[derive(Clone, Copy, Debug, Default)]
pub struct DigestAuthenticator;

impl DigestAuthenticator {
    /// The digest a correctly signed stanza carries.
    pub fn digest(stanza: &Stanza) -> Result<String> {
        let mut unsigned = stanza.clone();
        unsigned.signature.clear();
        let body = serde_json::to_vec(&unsigned)?;

        let mut hasher = Sha256::new();
        hasher.update(&body);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Fill in the stanza's signature.
    pub fn sign(stanza: &mut Stanza) -> Result<()> {
        stanza.signature = Self::digest(stanza)?;
        Ok(())
    }
}

impl Authenticator for DigestAuthenticator {
    fn verify(&self, stanza: &Stanza) -> Result<()> {
        let reject = |reason: &str| SyncError::Authentication {
            stream: stanza.stream.clone(),
            seq: stanza.seq,
            reason: reason.to_string(),
        };

        if stanza.signature.is_empty() {
            return Err(reject("missing signature"));
        }
        if Self::digest(stanza)? != stanza.signature {
            return Err(reject("signature does not match body"));
        }
        Ok(())
    }
}
