//! Periodic eviction of expired challenges and sessions.
//!
//! This is the only thing bounding the memory of both registries. Logical
//! expiry and reclamation are at most one period apart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::challenge::ChallengeRegistry;
use crate::session::SessionRegistry;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub challenges: usize,
    pub sessions: usize,
}

pub struct Maintainer {
    challenges: Arc<ChallengeRegistry>,
    sessions: Arc<SessionRegistry>,
    period: Duration,
}

impl Maintainer {
    pub fn new(challenges: Arc<ChallengeRegistry>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            challenges,
            sessions,
            period: SWEEP_INTERVAL,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// One sweep over both registries.
    pub fn tick(&self) -> SweepStats {
        let stats = SweepStats {
            challenges: self.challenges.sweep(),
            sessions: self.sessions.sweep(),
        };
        if stats.challenges > 0 || stats.sessions > 0 {
            debug!(
                challenges = stats.challenges,
                sessions = stats.sessions,
                "evicted expired entries"
            );
        }
        stats
    }

    /// Run [`tick`](Self::tick) every period until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            info!(period_secs = self.period.as_secs(), "maintainer started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("maintainer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::challenge::ChallengeKind;
    use crate::clock::ManualClock;
    use crate::crypto::test_keypair;
    use crate::store::test_user;

    fn maintainer() -> (Arc<ManualClock>, Arc<ChallengeRegistry>, Arc<SessionRegistry>, Maintainer) {
        let clock = Arc::new(ManualClock::new(0));
        let challenges = Arc::new(ChallengeRegistry::new(clock.clone()));
        let sessions = Arc::new(SessionRegistry::new(clock.clone()));
        let maintainer = Maintainer::new(challenges.clone(), sessions.clone());
        (clock, challenges, sessions, maintainer)
    }

    #[test]
    fn tick_sweeps_both_registries() {
        let (clock, challenges, sessions, maintainer) = maintainer();
        let keys = test_keypair();
        challenges
            .issue(keys.public_key().clone(), ChallengeKind::Register)
            .unwrap();
        let session = sessions
            .create(test_user("Alice", ""), IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
            .unwrap();

        assert_eq!(maintainer.tick(), SweepStats::default());

        clock.advance(10);
        assert_eq!(
            maintainer.tick(),
            SweepStats {
                challenges: 1,
                sessions: 0
            }
        );

        clock.advance(3600);
        assert_eq!(maintainer.tick().sessions, 1);
        assert!(sessions.get(&session.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_sweeps_and_stops() {
        let (clock, challenges, _, maintainer) = maintainer();
        let keys = test_keypair();
        challenges
            .issue(keys.public_key().clone(), ChallengeKind::Register)
            .unwrap();
        clock.advance(10);

        let (stop, shutdown) = watch::channel(false);
        let handle = maintainer.with_period(Duration::from_secs(5)).spawn(shutdown);

        time::sleep(Duration::from_secs(6)).await;
        assert!(challenges.is_empty());

        stop.send(true).unwrap();
        handle.await.unwrap();
    }
}
