//! Request sequencing for the authentication and trust endpoints.
//!
//! Each request and response is an explicit structure. Requests reject
//! unknown fields. [`Authority`] drives the registries, the store and the
//! trust service in the order each flow requires.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::challenge::{ChallengeKind, ChallengeRegistry};
use crate::clock::Clock;
use crate::crypto::{self, PublicKey};
use crate::error::{Error, Result};
use crate::maintainer::Maintainer;
use crate::session::{self, SessionRegistry};
use crate::store::{NewUser, Store, User};
use crate::trust::{SignerIdentity, TrustService, VerifyMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublicKeyRequest {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionIdRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionChallengeRequest {
    /// Base64 signature over the decrypted nonce.
    pub signature: String,
    pub index: u64,
    pub port: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterChallengeRequest {
    pub signature: String,
    pub index: u64,
    pub name: String,
    #[serde(default)]
    pub organization: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddSignatureRequest {
    pub signature: String,
    pub message: VerifyMessage,
    pub signer_public_key: String,
    pub signee_public_key: String,
}

/// `message` is the nonce encrypted for the requester, base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub message: String,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
}

impl Success {
    pub const OK: Success = Success { success: true };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub signature: String,
    pub message: String,
    pub signer: SignerEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerEntry {
    pub public_key: String,
    pub name: String,
    pub organization: String,
}

impl From<SignerIdentity> for SignerEntry {
    fn from(identity: SignerIdentity) -> Self {
        SignerEntry {
            public_key: identity.public_key,
            name: identity.name,
            organization: identity.organization,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturesResponse {
    pub signatures: Vec<SignatureEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub name: String,
    pub organization: String,
    pub ip: String,
    pub port: u16,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub organization: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysResponse {
    pub users: Vec<UserEntry>,
}

/// The server's own public identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub host_name: String,
    pub public_key: String,
}

pub struct Authority {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    challenges: Arc<ChallengeRegistry>,
    sessions: Arc<SessionRegistry>,
    trust: TrustService,
    identity: IdentityResponse,
}

impl Authority {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        challenges: Arc<ChallengeRegistry>,
        sessions: Arc<SessionRegistry>,
        identity: IdentityResponse,
    ) -> Self {
        let trust = TrustService::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            challenges,
            sessions,
            trust,
            identity,
        }
    }

    pub fn identity(&self) -> &IdentityResponse {
        &self.identity
    }

    pub fn sessions_registry(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn challenges_registry(&self) -> &ChallengeRegistry {
        &self.challenges
    }

    /// A sweeper over this authority's registries.
    pub fn maintainer(&self) -> Maintainer {
        Maintainer::new(self.challenges.clone(), self.sessions.clone())
    }

    async fn registered(&self, public_key: &PublicKey) -> Result<Option<User>> {
        self.store.user_by_public_key(public_key).await
    }

    fn challenge(&self, public_key: PublicKey, kind: ChallengeKind) -> Result<ChallengeResponse> {
        let issued = self.challenges.issue(public_key, kind)?;
        Ok(ChallengeResponse {
            message: issued.encrypted_nonce,
            index: issued.index,
        })
    }

    /// Issue a start_session challenge for a registered key.
    pub async fn start_session(&self, req: PublicKeyRequest) -> Result<ChallengeResponse> {
        let public_key = PublicKey::from_pem(&req.public_key)?;
        let user = self
            .registered(&public_key)
            .await?
            .ok_or(Error::NotFound("user"))?;
        self.challenge(user.public_key, ChallengeKind::StartSession)
    }

    /// Answer a start_session challenge and open a session at `ip`.
    pub async fn complete_session(
        &self,
        req: SessionChallengeRequest,
        ip: IpAddr,
    ) -> Result<SessionStarted> {
        let port = session::parse_port(req.port)?;
        let signature = crypto::decode_base64(&req.signature)?;
        let challenge = self
            .challenges
            .redeem(req.index, ChallengeKind::StartSession, &signature)?;

        let user = self
            .registered(&challenge.public_key)
            .await?
            .ok_or(Error::NotFound("user"))?;
        let session = self.sessions.create(user, ip, i64::from(port))?;

        Ok(SessionStarted {
            session_id: session.id,
        })
    }

    pub fn refresh_session(&self, req: SessionIdRequest) -> Result<Success> {
        self.sessions.refresh(&req.session_id)?;
        Ok(Success::OK)
    }

    pub fn stop_session(&self, req: SessionIdRequest) -> Success {
        self.sessions.delete(&req.session_id);
        Success::OK
    }

    /// Issue a register challenge for a key that is not registered yet.
    pub async fn begin_registration(&self, req: PublicKeyRequest) -> Result<ChallengeResponse> {
        let public_key = PublicKey::from_pem(&req.public_key)?;
        if self.registered(&public_key).await?.is_some() {
            return Err(Error::Conflict("already registered".to_string()));
        }
        self.challenge(public_key, ChallengeKind::Register)
    }

    /// Answer a register challenge and create the user.
    pub async fn complete_registration(&self, req: RegisterChallengeRequest) -> Result<Success> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(Error::invalid("name cannot be empty"));
        }
        let signature = crypto::decode_base64(&req.signature)?;
        let challenge = self
            .challenges
            .redeem(req.index, ChallengeKind::Register, &signature)?;

        let user = self
            .store
            .create_user(NewUser {
                name: name.to_string(),
                organization: req.organization.trim().to_string(),
                public_key: challenge.public_key,
                created_at: self.clock.now(),
            })
            .await?;
        info!(id = %user.id, name = %user.name, "registered user");

        Ok(Success::OK)
    }

    /// Record a trust signature. The signer proves nothing beyond holding a
    /// registered key: the signature itself is the proof.
    pub async fn add_signature(&self, req: AddSignatureRequest) -> Result<Success> {
        let signer_key = PublicKey::from_pem(&req.signer_public_key)
            .map_err(|_| Error::invalid("invalid signer public key"))?;
        let signee_key = PublicKey::from_pem(&req.signee_public_key)
            .map_err(|_| Error::invalid("invalid signee public key"))?;
        let signer = self
            .registered(&signer_key)
            .await?
            .ok_or(Error::NotFound("signer"))?;
        let signee = self
            .registered(&signee_key)
            .await?
            .ok_or(Error::NotFound("signee"))?;
        let signature = crypto::decode_base64(&req.signature)?;

        self.trust
            .create(&signer, &signee, &req.message, &signature)
            .await?;
        Ok(Success::OK)
    }

    pub async fn signatures(&self, key: &str) -> Result<SignaturesResponse> {
        let public_key = PublicKey::from_pem(key)?;
        let vouches = self.trust.list_by_signee(&public_key).await?;
        Ok(SignaturesResponse {
            signatures: vouches
                .into_iter()
                .map(|vouch| SignatureEntry {
                    signature: crypto::encode_base64(&vouch.signature),
                    message: vouch.message,
                    signer: vouch.signer.into(),
                })
                .collect(),
        })
    }

    pub fn sessions(&self, query: Option<&str>) -> SessionsResponse {
        let sessions = self
            .sessions
            .list(query)
            .into_iter()
            .filter_map(|session| {
                let public_key = session.user.public_key_pem().ok()?;
                Some(SessionEntry {
                    name: session.user.name,
                    organization: session.user.organization,
                    ip: session.ip.to_string(),
                    port: session.port,
                    public_key,
                })
            })
            .collect();
        SessionsResponse { sessions }
    }

    pub async fn keys(&self, query: Option<&str>) -> Result<KeysResponse> {
        let users = match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(query) => self.store.users_matching(query).await?,
            None => self.store.users().await?,
        };
        let users = users
            .into_iter()
            .filter_map(|user| {
                let public_key = user.public_key_pem().ok()?;
                Some(UserEntry {
                    name: user.name,
                    organization: user.organization,
                    public_key,
                })
            })
            .collect();
        Ok(KeysResponse { users })
    }
}

#[cfg(test)]
pub(crate) fn test_authority(clock: Arc<crate::clock::ManualClock>) -> Authority {
    let store = Arc::new(crate::store::MemoryStore::new());
    let challenges = Arc::new(ChallengeRegistry::new(clock.clone()));
    let sessions = Arc::new(SessionRegistry::new(clock.clone()));
    Authority::new(
        store,
        clock,
        challenges,
        sessions,
        IdentityResponse {
            host_name: "keys.test".to_string(),
            public_key: String::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::{KeyPair, test_keypair};

    const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

    struct Harness {
        clock: Arc<ManualClock>,
        authority: Authority,
        maintainer: Maintainer,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let authority = test_authority(clock.clone());
        let maintainer = authority.maintainer();
        Harness {
            clock,
            authority,
            maintainer,
        }
    }

    fn pem(keys: &KeyPair) -> String {
        keys.public_key().to_pem().unwrap()
    }

    fn answer(keys: &KeyPair, challenge: &ChallengeResponse) -> String {
        let nonce = keys.decrypt_from_base64(&challenge.message).unwrap();
        crypto::encode_base64(&keys.sign(&nonce).unwrap())
    }

    async fn register(h: &Harness, keys: &KeyPair, name: &str, organization: &str) {
        let challenge = h
            .authority
            .begin_registration(PublicKeyRequest { public_key: pem(keys) })
            .await
            .unwrap();
        h.authority
            .complete_registration(RegisterChallengeRequest {
                signature: answer(keys, &challenge),
                index: challenge.index,
                name: name.to_string(),
                organization: organization.to_string(),
            })
            .await
            .unwrap();
    }

    async fn login(h: &Harness, keys: &KeyPair, port: i64) -> Result<SessionStarted> {
        let challenge = h
            .authority
            .start_session(PublicKeyRequest { public_key: pem(keys) })
            .await?;
        h.authority
            .complete_session(
                SessionChallengeRequest {
                    signature: answer(keys, &challenge),
                    index: challenge.index,
                    port,
                },
                CLIENT_IP,
            )
            .await
    }

    #[tokio::test]
    async fn registration_creates_user_and_consumes_challenge() {
        let h = harness();
        let keys = test_keypair();
        let challenge = h
            .authority
            .begin_registration(PublicKeyRequest { public_key: pem(&keys) })
            .await
            .unwrap();
        let req = RegisterChallengeRequest {
            signature: answer(&keys, &challenge),
            index: challenge.index,
            name: " Alice ".to_string(),
            organization: "Acme".to_string(),
        };

        h.authority.complete_registration(req.clone()).await.unwrap();
        let keys_listed = h.authority.keys(None).await.unwrap();
        assert_eq!(keys_listed.users.len(), 1);
        assert_eq!(keys_listed.users[0].name, "Alice");
        assert_eq!(keys_listed.users[0].public_key, pem(&keys));

        let replay = h.authority.complete_registration(req).await.unwrap_err();
        assert!(matches!(replay, Error::InvalidSignature));
    }

    #[tokio::test]
    async fn registration_rejects_empty_name_and_known_keys() {
        let h = harness();
        let keys = test_keypair();
        let challenge = h
            .authority
            .begin_registration(PublicKeyRequest { public_key: pem(&keys) })
            .await
            .unwrap();
        let err = h
            .authority
            .complete_registration(RegisterChallengeRequest {
                signature: answer(&keys, &challenge),
                index: challenge.index,
                name: "   ".to_string(),
                organization: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(h.authority.challenges_registry().lookup(challenge.index).is_some());

        register(&h, &keys, "Alice", "").await;
        let err = h
            .authority
            .begin_registration(PublicKeyRequest { public_key: pem(&keys) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let h = harness();
        let keys = test_keypair();
        register(&h, &keys, "Alice", "Acme").await;

        let started = login(&h, &keys, 7000).await.unwrap();
        let session_id = started.session_id.clone();
        let request = || SessionIdRequest {
            session_id: session_id.clone(),
        };
        assert!(h.authority.refresh_session(request()).is_ok());

        let live = h.authority.sessions(Some("acme"));
        assert_eq!(live.sessions.len(), 1);
        assert_eq!(live.sessions[0].ip, "192.0.2.7");
        assert_eq!(live.sessions[0].port, 7000);
        assert!(h.authority.sessions(Some("globex")).sessions.is_empty());

        h.clock.advance(3601);
        h.maintainer.tick();
        assert!(h.authority.sessions_registry().get(&session_id).is_none());
        assert!(matches!(
            h.authority.refresh_session(request()),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_session_is_idempotent() {
        let h = harness();
        let keys = test_keypair();
        register(&h, &keys, "Alice", "").await;
        let started = login(&h, &keys, 7000).await.unwrap();

        let req = SessionIdRequest {
            session_id: started.session_id.clone(),
        };
        assert_eq!(h.authority.stop_session(req.clone()), Success::OK);
        assert_eq!(h.authority.stop_session(req), Success::OK);
        assert!(h.authority.sessions(None).sessions.is_empty());
    }

    #[tokio::test]
    async fn session_requires_registration() {
        let h = harness();
        let keys = test_keypair();
        let err = login(&h, &keys, 7000).await.unwrap_err();
        assert!(matches!(err, Error::NotFound("user")));
    }

    #[tokio::test]
    async fn session_rejects_bad_input() {
        let h = harness();
        let keys = test_keypair();
        register(&h, &keys, "Alice", "").await;

        let err = login(&h, &keys, 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let challenge = h
            .authority
            .start_session(PublicKeyRequest { public_key: pem(&keys) })
            .await
            .unwrap();
        let err = h
            .authority
            .complete_session(
                SessionChallengeRequest {
                    signature: "%%%".to_string(),
                    index: challenge.index,
                    port: 7000,
                },
                CLIENT_IP,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn late_answers_fail() {
        let h = harness();
        let keys = test_keypair();
        register(&h, &keys, "Alice", "").await;

        let challenge = h
            .authority
            .start_session(PublicKeyRequest { public_key: pem(&keys) })
            .await
            .unwrap();
        h.clock.advance(6);
        let err = h
            .authority
            .complete_session(
                SessionChallengeRequest {
                    signature: answer(&keys, &challenge),
                    index: challenge.index,
                    port: 7000,
                },
                CLIENT_IP,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
    }

    #[tokio::test]
    async fn register_challenge_cannot_open_session() {
        let h = harness();
        let keys = test_keypair();
        register(&h, &keys, "Alice", "").await;

        let other = test_keypair();
        let challenge = h
            .authority
            .begin_registration(PublicKeyRequest { public_key: pem(&other) })
            .await
            .unwrap();
        let err = h
            .authority
            .complete_session(
                SessionChallengeRequest {
                    signature: answer(&other, &challenge),
                    index: challenge.index,
                    port: 7000,
                },
                CLIENT_IP,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
    }

    #[tokio::test]
    async fn trust_signature_round_trip() {
        let h = harness();
        let alice = test_keypair();
        let bob = test_keypair();
        register(&h, &alice, "Alice", "Acme").await;
        register(&h, &bob, "Bob", "Globex").await;

        let message = VerifyMessage {
            public_key: pem(&bob),
            start_time: 1_700_000_000,
            end_time: 1_800_000_000,
            check_server: "keys.test".to_string(),
            message_key: "k1".to_string(),
            modifiers: String::new(),
        };
        let signature = crypto::encode_base64(&alice.sign(message.canonical().as_bytes()).unwrap());
        h.authority
            .add_signature(AddSignatureRequest {
                signature,
                message,
                signer_public_key: pem(&alice),
                signee_public_key: pem(&bob),
            })
            .await
            .unwrap();

        let listed = h.authority.signatures(&pem(&bob)).await.unwrap();
        assert_eq!(listed.signatures.len(), 1);
        assert_eq!(
            listed.signatures[0].signer,
            SignerEntry {
                public_key: pem(&alice),
                name: "Alice".to_string(),
                organization: "Acme".to_string(),
            }
        );
        assert!(h.authority.signatures(&pem(&alice)).await.unwrap().signatures.is_empty());
    }

    #[tokio::test]
    async fn trust_signature_needs_registered_parties() {
        let h = harness();
        let alice = test_keypair();
        let stranger = test_keypair();
        register(&h, &alice, "Alice", "").await;

        let message = VerifyMessage {
            public_key: pem(&stranger),
            start_time: 0,
            end_time: 0,
            check_server: String::new(),
            message_key: String::new(),
            modifiers: String::new(),
        };
        let signature = crypto::encode_base64(&alice.sign(message.canonical().as_bytes()).unwrap());
        let err = h
            .authority
            .add_signature(AddSignatureRequest {
                signature,
                message,
                signer_public_key: pem(&alice),
                signee_public_key: pem(&stranger),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound("signee")));
    }

    #[tokio::test]
    async fn keys_filter_by_query() {
        let h = harness();
        register(&h, &test_keypair(), "Alice", "Acme").await;
        register(&h, &test_keypair(), "Bob", "Globex").await;

        assert_eq!(h.authority.keys(Some("")).await.unwrap().users.len(), 2);
        let found = h.authority.keys(Some("glob")).await.unwrap();
        assert_eq!(found.users.len(), 1);
        assert_eq!(found.users[0].name, "Bob");
    }

    #[test]
    fn requests_reject_unknown_fields() {
        let ok = r#"{"signature":"c2ln","index":5,"port":80}"#;
        assert!(serde_json::from_str::<SessionChallengeRequest>(ok).is_ok());

        let extra = r#"{"signature":"c2ln","index":5,"port":80,"admin":true}"#;
        assert!(serde_json::from_str::<SessionChallengeRequest>(extra).is_err());

        let missing = r#"{"signature":"c2ln","index":5}"#;
        assert!(serde_json::from_str::<SessionChallengeRequest>(missing).is_err());

        let no_org = r#"{"signature":"c2ln","index":5,"name":"Alice"}"#;
        let parsed: RegisterChallengeRequest = serde_json::from_str(no_org).unwrap();
        assert_eq!(parsed.organization, "");
    }
}
