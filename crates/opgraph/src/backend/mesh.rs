//! Rendezvous between participants of a distributed execution.
//!
//! The core only needs a barrier that also exchanges a payload per participant. Real deployments
//! plug in a networked implementation; [`LocalMesh`] serves threads inside one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};

pub trait MeshClient: Send + Sync {
    fn address(&self) -> &str;

    /// Blocks until every participant reached `tag`, then returns all payloads ordered by
    /// participant ordinal.
    fn rendezvous(&self, ordinal: usize, tag: &str, payload: &[u8]) -> Result<Vec<Vec<u8>>>;
}

#[derive(Default)]
struct Round {
    payloads: BTreeMap<usize, Vec<u8>>,
    released: Option<Vec<Vec<u8>>>,
    departed: usize,
}

/// In-process mesh where every participant is a thread.
pub struct LocalMesh {
    address: String,
    participants: usize,
    timeout: Option<Duration>,
    rounds: Mutex<HashMap<String, Round>>,
    cv: Condvar,
}

impl LocalMesh {
    pub fn new(participants: usize) -> Self {
        Self {
            address: "local".to_string(),
            participants: participants.max(1),
            timeout: None,
            rounds: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn participants(&self) -> usize {
        self.participants
    }
}

impl MeshClient for LocalMesh {
    fn address(&self) -> &str {
        &self.address
    }

    fn rendezvous(&self, ordinal: usize, tag: &str, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        if ordinal >= self.participants {
            bail!(
                "rendezvous ordinal {ordinal} out of range for {} participants",
                self.participants
            );
        }
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut rounds = self
            .rounds
            .lock()
            .map_err(|_| anyhow!("mesh state poisoned"))?;

        // A previous round under the same tag may still be draining.
        while rounds
            .get(tag)
            .is_some_and(|round| round.released.is_some())
        {
            let (guard, expired) = wait_on(&self.cv, rounds, deadline)?;
            rounds = guard;
            if expired {
                bail!("rendezvous '{tag}' timed out waiting for the previous round");
            }
        }

        let round = rounds.entry(tag.to_string()).or_default();
        if round.payloads.insert(ordinal, payload.to_vec()).is_some() {
            bail!("participant {ordinal} joined rendezvous '{tag}' twice");
        }
        tracing::trace!(tag, ordinal, arrived = round.payloads.len(), "rendezvous arrival");
        if round.payloads.len() == self.participants {
            let payloads = std::mem::take(&mut round.payloads);
            round.released = Some(payloads.into_values().collect());
            self.cv.notify_all();
        }

        loop {
            let round = rounds
                .get_mut(tag)
                .ok_or_else(|| anyhow!("rendezvous '{tag}' vanished"))?;
            if let Some(released) = &round.released {
                let result = released.clone();
                round.departed += 1;
                if round.departed == self.participants {
                    rounds.remove(tag);
                    self.cv.notify_all();
                }
                return Ok(result);
            }
            let (guard, expired) = wait_on(&self.cv, rounds, deadline)?;
            rounds = guard;
            if expired {
                // Withdraw so a retry under the same tag starts clean.
                if let Some(round) = rounds.get_mut(tag) {
                    round.payloads.remove(&ordinal);
                    if round.payloads.is_empty() && round.released.is_none() {
                        rounds.remove(tag);
                    }
                }
                tracing::warn!(tag, ordinal, "rendezvous timed out");
                bail!("rendezvous '{tag}' timed out");
            }
        }
    }
}

/// Waits for a notification; the flag is set once `deadline` has passed.
fn wait_on<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> Result<(MutexGuard<'a, T>, bool)> {
    match deadline {
        None => {
            let guard = cv.wait(guard).map_err(|_| anyhow!("mesh state poisoned"))?;
            Ok((guard, false))
        }
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok((guard, true));
            }
            let (guard, _) = cv
                .wait_timeout(guard, remaining)
                .map_err(|_| anyhow!("mesh state poisoned"))?;
            Ok((guard, false))
        }
    }
}
