use std::path::Path;

use ::firestore::{FirestoreDb, FirestoreDbOptions, path};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{NewSignature, NewUser, SignatureRecord, Store, User};
use crate::crypto::{self, PublicKey};
use crate::error::{Error, Result};

const USERS: &str = "users";
const SIGNATURES: &str = "signatures";

/// User documents are keyed by the compact public key, so creating a second
/// document for the same key is rejected by Firestore itself.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct UserDocument {
    id: String,
    timestamp: i64,
    name: String,
    organization: String,
    public_key: String,
    active: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SignatureDocument {
    id: String,
    timestamp: i64,
    signer_id: String,
    signee_id: String,
    message: String,
    signature: String,
    revoked_at: Option<i64>,
}

impl TryFrom<UserDocument> for User {
    type Error = Error;

    fn try_from(doc: UserDocument) -> Result<Self> {
        Ok(User {
            id: parse_id(&doc.id)?,
            created_at: doc.timestamp.max(0) as u64,
            name: doc.name,
            organization: doc.organization,
            public_key: PublicKey::from_compact(&doc.public_key)?,
            active: doc.active,
        })
    }
}

impl TryFrom<SignatureDocument> for SignatureRecord {
    type Error = Error;

    fn try_from(doc: SignatureDocument) -> Result<Self> {
        Ok(SignatureRecord {
            id: parse_id(&doc.id)?,
            created_at: doc.timestamp.max(0) as u64,
            signer_id: parse_id(&doc.signer_id)?,
            signee_id: parse_id(&doc.signee_id)?,
            message: doc.message,
            signature: crypto::decode_base64(&doc.signature)?,
            revoked_at: doc.revoked_at.map(|t| t.max(0) as u64),
        })
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|e| Error::Internal(format!("stored id {id}: {e}")))
}

/// Rows that fail to decode are skipped with a warning.
fn decode_all<D, T>(docs: Vec<D>) -> Vec<T>
where
    T: TryFrom<D, Error = Error>,
{
    docs.into_iter()
        .filter_map(|doc| match T::try_from(doc) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!("skipping unreadable document: {}", e);
                None
            }
        })
        .collect()
}

pub struct FirestoreStore {
    client: FirestoreDb,
}

impl FirestoreStore {
    pub async fn new(project_id: &str, service_account_key: &Path) -> Result<FirestoreStore> {
        let client = FirestoreDb::with_options_service_account_key_file(
            FirestoreDbOptions::new(project_id.to_string()),
            service_account_key.to_path_buf(),
        )
        .await?;
        Ok(FirestoreStore { client })
    }
}

#[async_trait]
impl Store for FirestoreStore {
    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let docs: Vec<UserDocument> = self
            .client
            .fluent()
            .select()
            .from(USERS)
            .filter(|q| q.field(path!(UserDocument::id)).eq(id.to_string()))
            .limit(1)
            .obj()
            .query()
            .await?;

        docs.into_iter().next().map(User::try_from).transpose()
    }

    async fn user_by_public_key(&self, public_key: &PublicKey) -> Result<Option<User>> {
        let doc: Option<UserDocument> = self
            .client
            .fluent()
            .select()
            .by_id_in(USERS)
            .obj()
            .one(&public_key.to_compact()?)
            .await?;

        doc.map(User::try_from).transpose()
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let compact = user.public_key.to_compact()?;
        let doc = UserDocument {
            id: Uuid::new_v4().to_string(),
            timestamp: user.created_at as i64,
            name: user.name,
            organization: user.organization,
            public_key: compact.clone(),
            active: true,
        };
        debug!(id = %doc.id, "inserting user");

        let stored: UserDocument = self
            .client
            .fluent()
            .insert()
            .into(USERS)
            .document_id(&compact)
            .object(&doc)
            .execute()
            .await?;

        User::try_from(stored)
    }

    async fn users(&self) -> Result<Vec<User>> {
        let docs: Vec<UserDocument> = self
            .client
            .fluent()
            .select()
            .from(USERS)
            .obj()
            .query()
            .await?;

        Ok(decode_all(docs))
    }

    async fn users_matching(&self, query: &str) -> Result<Vec<User>> {
        // Firestore has no substring operator.
        let query = query.to_lowercase();
        let users = self.users().await?;
        Ok(users.into_iter().filter(|u| u.matches(&query)).collect())
    }

    async fn create_signature(&self, signature: NewSignature) -> Result<SignatureRecord> {
        let doc = SignatureDocument {
            id: Uuid::new_v4().to_string(),
            timestamp: signature.created_at as i64,
            signer_id: signature.signer_id.to_string(),
            signee_id: signature.signee_id.to_string(),
            message: signature.message,
            signature: crypto::encode_base64(&signature.signature),
            revoked_at: None,
        };

        let stored: SignatureDocument = self
            .client
            .fluent()
            .insert()
            .into(SIGNATURES)
            .document_id(&doc.id)
            .object(&doc)
            .execute()
            .await?;

        SignatureRecord::try_from(stored)
    }

    async fn signatures_by_signee(&self, signee_id: Uuid) -> Result<Vec<SignatureRecord>> {
        let docs: Vec<SignatureDocument> = self
            .client
            .fluent()
            .select()
            .from(SIGNATURES)
            .filter(|q| q.field(path!(SignatureDocument::signee_id)).eq(signee_id.to_string()))
            .obj()
            .query()
            .await?;

        Ok(decode_all(docs))
    }
}
