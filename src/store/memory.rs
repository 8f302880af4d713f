//! In-process store used when no Firestore project is configured.

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{NewSignature, NewUser, SignatureRecord, Store, User};
use crate::crypto::PublicKey;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    signatures: Vec<SignatureRecord>,
}

/// Rows are kept in insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    async fn user_by_public_key(&self, public_key: &PublicKey) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .iter()
            .find(|u| &u.public_key == public_key)
            .cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let mut tables = self.tables.write().await;
        if tables.users.iter().any(|u| u.public_key == user.public_key) {
            return Err(Error::Conflict("already registered".to_string()));
        }

        let user = User {
            id: Uuid::new_v4(),
            created_at: user.created_at,
            name: user.name,
            organization: user.organization,
            public_key: user.public_key,
            active: true,
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn users(&self) -> Result<Vec<User>> {
        Ok(self.tables.read().await.users.clone())
    }

    async fn users_matching(&self, query: &str) -> Result<Vec<User>> {
        let query = query.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .iter()
            .filter(|u| u.matches(&query))
            .cloned()
            .collect())
    }

    async fn create_signature(&self, signature: NewSignature) -> Result<SignatureRecord> {
        let record = SignatureRecord {
            id: Uuid::new_v4(),
            created_at: signature.created_at,
            signer_id: signature.signer_id,
            signee_id: signature.signee_id,
            message: signature.message,
            signature: signature.signature,
            revoked_at: None,
        };
        self.tables.write().await.signatures.push(record.clone());
        Ok(record)
    }

    async fn signatures_by_signee(&self, signee_id: Uuid) -> Result<Vec<SignatureRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .signatures
            .iter()
            .filter(|s| s.signee_id == signee_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keypair;

    fn new_user(name: &str, organization: &str, public_key: &PublicKey) -> NewUser {
        NewUser {
            name: name.to_string(),
            organization: organization.to_string(),
            public_key: public_key.clone(),
            created_at: 10,
        }
    }

    #[tokio::test]
    async fn create_and_find_user() {
        let store = MemoryStore::new();
        let keys = test_keypair();
        let created = store
            .create_user(new_user("Alice", "Acme", keys.public_key()))
            .await
            .unwrap();

        assert!(created.active);
        assert_eq!(created.created_at, 10);
        assert_eq!(store.user_by_id(created.id).await.unwrap(), Some(created.clone()));
        assert_eq!(
            store.user_by_public_key(keys.public_key()).await.unwrap(),
            Some(created)
        );
        assert_eq!(
            store
                .user_by_public_key(test_keypair().public_key())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn duplicate_key_conflicts() {
        let store = MemoryStore::new();
        let keys = test_keypair();
        store
            .create_user(new_user("Alice", "", keys.public_key()))
            .await
            .unwrap();
        let err = store
            .create_user(new_user("Mallory", "", keys.public_key()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn query_matches_name_or_organization() {
        let store = MemoryStore::new();
        for (name, org) in [("Alice", "Acme"), ("Bob", "Globex"), ("Carol", "ACME Labs")] {
            store
                .create_user(new_user(name, org, test_keypair().public_key()))
                .await
                .unwrap();
        }

        let names = |users: Vec<User>| users.into_iter().map(|u| u.name).collect::<Vec<_>>();
        assert_eq!(names(store.users_matching("acme").await.unwrap()), ["Alice", "Carol"]);
        assert_eq!(names(store.users_matching("BO").await.unwrap()), ["Bob"]);
        assert!(store.users_matching("initech").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn signatures_filter_by_signee() {
        let store = MemoryStore::new();
        let signer = Uuid::new_v4();
        let signee = Uuid::new_v4();
        for target in [signee, Uuid::new_v4(), signee] {
            store
                .create_signature(NewSignature {
                    signer_id: signer,
                    signee_id: target,
                    message: "{}".to_string(),
                    signature: vec![1, 2, 3],
                    created_at: 5,
                })
                .await
                .unwrap();
        }

        let found = store.signatures_by_signee(signee).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.signer_id == signer && s.revoked_at.is_none()));
    }
}
