//! Trust signatures: a registered user vouches for another user's key.
//!
//! The server only checks that the message names the signee's key and that
//! the signer really signed it. Everything else in the message is opaque and
//! stored verbatim so third parties can re-verify it later. Edges are not
//! traversed here; callers interpret them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::crypto::{self, PublicKey};
use crate::error::{Error, Result};
use crate::store::{NewSignature, SignatureRecord, Store, User};

/// The statement a signer signs about a signee's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyMessage {
    /// Signee's key, canonical PEM.
    pub public_key: String,
    pub start_time: i64,
    pub end_time: i64,
    pub check_server: String,
    pub message_key: String,
    pub modifiers: String,
}

impl VerifyMessage {
    /// Exact bytes that are signed: the fields concatenated in declaration
    /// order, integers in decimal.
    pub fn canonical(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            self.public_key,
            self.start_time,
            self.end_time,
            self.check_server,
            self.message_key,
            self.modifiers
        )
    }

    pub fn to_storage_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Public identity of a signer, resolved when signatures are listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignerIdentity {
    pub public_key: String,
    pub name: String,
    pub organization: String,
}

#[derive(Debug, Clone)]
pub struct Vouch {
    pub signer: SignerIdentity,
    pub signature: Vec<u8>,
    pub message: String,
}

pub struct TrustService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl TrustService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Binding check plus signature check. Both failures are
    /// `InvalidSignature`.
    pub fn check(
        signer: &User,
        signee: &User,
        message: &VerifyMessage,
        signature: &[u8],
    ) -> Result<()> {
        if signee.public_key_pem()? != message.public_key {
            return Err(Error::InvalidSignature);
        }
        if !crypto::verify(&signer.public_key, message.canonical().as_bytes(), signature) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    pub async fn create(
        &self,
        signer: &User,
        signee: &User,
        message: &VerifyMessage,
        signature: &[u8],
    ) -> Result<SignatureRecord> {
        Self::check(signer, signee, message, signature)?;

        let record = self
            .store
            .create_signature(NewSignature {
                signer_id: signer.id,
                signee_id: signee.id,
                message: message.to_storage_string()?,
                signature: signature.to_vec(),
                created_at: self.clock.now(),
            })
            .await?;

        info!(signer = %signer.name, signee = %signee.name, id = %record.id, "recorded trust signature");
        Ok(record)
    }

    /// Every signature naming `signee_key` as signee, with the signer's
    /// current identity. Signatures whose signer cannot be resolved are left out.
    pub async fn list_by_signee(&self, signee_key: &PublicKey) -> Result<Vec<Vouch>> {
        let signee = self
            .store
            .user_by_public_key(signee_key)
            .await?
            .ok_or(Error::NotFound("user"))?;

        let records = self.store.signatures_by_signee(signee.id).await?;
        let mut vouches = Vec::with_capacity(records.len());
        for record in records {
            let signer = match self.store.user_by_id(record.signer_id).await {
                Ok(Some(signer)) => signer,
                Ok(None) => {
                    warn!(id = %record.id, "signer of signature no longer exists");
                    continue;
                }
                Err(e) => {
                    warn!(id = %record.id, "could not resolve signer: {}", e);
                    continue;
                }
            };
            let Ok(public_key) = signer.public_key_pem() else {
                continue;
            };

            vouches.push(Vouch {
                signer: SignerIdentity {
                    public_key,
                    name: signer.name,
                    organization: signer.organization,
                },
                signature: record.signature,
                message: record.message,
            });
        }

        Ok(vouches)
    }
}
