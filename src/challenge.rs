//! Proof-of-possession challenges.
//!
//! A challenge holds a random nonce that is handed to the requester encrypted
//! under the public key being proven. Only the holder of the private key can
//! recover it and sign it. Challenges live for a few seconds, are keyed by a
//! random index and are single-use: a successful [`ChallengeRegistry::redeem`]
//! removes the entry in the same step that checks it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::crypto::{self, PublicKey};
use crate::error::{Error, Result};

/// Seconds a challenge may be answered after it was issued.
pub const CHALLENGE_TTL_SECS: u64 = 5;

/// Largest index handed out; keeps indices exact as JSON numbers.
const MAX_INDEX: u64 = (1 << 53) - 1;

const MAX_ATTEMPTS: usize = 64;

const NONCE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    StartSession,
    Register,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::StartSession => "start_session",
            ChallengeKind::Register => "register",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start_session" => Ok(ChallengeKind::StartSession),
            "register" => Ok(ChallengeKind::Register),
            other => Err(Error::invalid(format!("invalid challenge type: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub index: u64,
    pub public_key: PublicKey,
    pub kind: ChallengeKind,
    pub created_at: u64,
    pub expires_at: u64,
    nonce: String,
}

impl Challenge {
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    fn accepts(&self, signature: &[u8], now: u64) -> bool {
        !self.is_expired(now) && crypto::verify(&self.public_key, self.nonce.as_bytes(), signature)
    }
}

/// What the requester receives: the index to answer under and the nonce
/// encrypted for their key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChallenge {
    pub index: u64,
    pub encrypted_nonce: String,
}

/// Pending challenges keyed by index.
#[derive(Debug)]
pub struct ChallengeRegistry {
    challenges: DashMap<u64, Challenge>,
    clock: Arc<dyn Clock>,
    ttl: u64,
}

impl ChallengeRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, CHALLENGE_TTL_SECS)
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: u64) -> Self {
        Self {
            challenges: DashMap::new(),
            clock,
            ttl,
        }
    }

    /// Issue a challenge for `public_key`. The entry is visible to
    /// [`validate`](Self::validate) and [`redeem`](Self::redeem) before
    /// this returns.
    pub fn issue(&self, public_key: PublicKey, kind: ChallengeKind) -> Result<IssuedChallenge> {
        let nonce = crypto::random_token(NONCE_LEN);
        let encrypted_nonce = crypto::encrypt_to_base64(&public_key, nonce.as_bytes())?;
        let now = self.clock.now();

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ATTEMPTS {
            let index = rng.gen_range(1..=MAX_INDEX);
            if let Entry::Vacant(slot) = self.challenges.entry(index) {
                slot.insert(Challenge {
                    index,
                    public_key,
                    kind,
                    created_at: now,
                    expires_at: now + self.ttl,
                    nonce,
                });
                debug!(index, %kind, "issued challenge");
                return Ok(IssuedChallenge {
                    index,
                    encrypted_nonce,
                });
            }
        }

        Err(Error::Internal("no free challenge index".to_string()))
    }

    /// True iff the challenge exists, has not expired and `signature` signs
    /// its nonce. Leaves the challenge in place.
    pub fn validate(&self, index: u64, signature: &[u8]) -> bool {
        let now = self.clock.now();
        self.challenges
            .get(&index)
            .is_some_and(|challenge| challenge.accepts(signature, now))
    }

    /// Validate and consume in one step. Fails with `InvalidSignature` for
    /// every failure cause (unknown, expired, wrong kind, wrong signature);
    /// a failed attempt leaves the challenge untouched.
    pub fn redeem(&self, index: u64, kind: ChallengeKind, signature: &[u8]) -> Result<Challenge> {
        let now = self.clock.now();
        let redeemed = self.challenges.remove_if(&index, |_, challenge| {
            challenge.kind == kind && challenge.accepts(signature, now)
        });

        match redeemed {
            Some((_, challenge)) => Ok(challenge),
            None => {
                debug!(index, "challenge redemption failed");
                Err(Error::InvalidSignature)
            }
        }
    }

    pub fn lookup(&self, index: u64) -> Option<Challenge> {
        self.challenges.get(&index).map(|c| c.clone())
    }

    /// Remove a challenge. Removing an unknown index is a no-op.
    pub fn consume(&self, index: u64) -> Option<Challenge> {
        self.challenges.remove(&index).map(|(_, c)| c)
    }

    /// Drop every expired challenge, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.challenges.retain(|_, challenge| {
            let keep = !challenge.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}
