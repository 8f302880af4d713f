//! Persistent storage of users and trust signatures.
//!
//! The rest of the crate only sees the [`Store`] trait. Each call is
//! expected to either fully succeed or fail.

mod firestore;
mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::crypto::PublicKey;
use crate::error::Result;

pub use self::firestore::FirestoreStore;
pub use self::memory::MemoryStore;

/// A registered party. Identity is the public key.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub created_at: u64,
    pub name: String,
    pub organization: String,
    pub public_key: PublicKey,
    pub active: bool,
}

impl User {
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key.to_pem()
    }

    /// Case-insensitive substring match on name or organization. `query`
    /// must already be lowercase.
    pub fn matches(&self, query: &str) -> bool {
        self.name.to_lowercase().contains(query) || self.organization.to_lowercase().contains(query)
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub organization: String,
    pub public_key: PublicKey,
    pub created_at: u64,
}

/// A stored trust edge signer -> signee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub id: Uuid,
    pub created_at: u64,
    pub signer_id: Uuid,
    pub signee_id: Uuid,
    /// Serialized verify message, exactly as it was checked.
    pub message: String,
    pub signature: Vec<u8>,
    /// Reserved for revocation; never set.
    pub revoked_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NewSignature {
    pub signer_id: Uuid,
    pub signee_id: Uuid,
    pub message: String,
    pub signature: Vec<u8>,
    pub created_at: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn user_by_public_key(&self, public_key: &PublicKey) -> Result<Option<User>>;

    /// Fails with `Conflict` when the public key is already registered.
    async fn create_user(&self, user: NewUser) -> Result<User>;

    async fn users(&self) -> Result<Vec<User>>;

    /// Users whose name or organization contains `query`, ignoring case.
    async fn users_matching(&self, query: &str) -> Result<Vec<User>>;

    async fn create_signature(&self, signature: NewSignature) -> Result<SignatureRecord>;

    async fn signatures_by_signee(&self, signee_id: Uuid) -> Result<Vec<SignatureRecord>>;
}

#[cfg(test)]
pub(crate) fn test_user(name: &str, organization: &str) -> User {
    User {
        id: Uuid::new_v4(),
        created_at: 0,
        name: name.to_string(),
        organization: organization.to_string(),
        public_key: crate::crypto::test_keypair().public_key().clone(),
        active: true,
    }
}
