//! Process-group seam for multi-replica runs.
//!
//! Only the control flow that must agree across replicas lives here (the
//! early-stop decision). Gradients are not all-reduced.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{TrainError, TrainResult};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a rank waits in [`Collective::broadcast_stop`] for its peers.
pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(600);

pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// Every rank returns rank 0's `stop`; other ranks' inputs are ignored.
    fn broadcast_stop(&self, stop: bool) -> TrainResult<bool>;

    /// Tells the peers this rank is leaving on an error, so they fail instead of
    /// waiting for it.
    fn abort(&self, _reason: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast_stop(&self, stop: bool) -> TrainResult<bool> {
        Ok(stop)
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    stop: bool,
    /// Decision of the last completed round.
    decided: bool,
    aborted: Option<String>,
}

/// Rendezvous shared by the threads of one [`LocalGroup`].
#[derive(Debug)]
pub struct LocalHub {
    world_size: usize,
    joined: Mutex<usize>,
    all_joined: Condvar,
    round: Mutex<Round>,
    round_done: Condvar,
    broadcast_timeout: Duration,
}

impl LocalHub {
    pub fn new(world_size: usize) -> Arc<Self> {
        Self::with_broadcast_timeout(world_size, DEFAULT_BROADCAST_TIMEOUT)
    }

    pub fn with_broadcast_timeout(world_size: usize, broadcast_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            world_size: world_size.max(1),
            joined: Mutex::new(0),
            all_joined: Condvar::new(),
            round: Mutex::new(Round::default()),
            round_done: Condvar::new(),
            broadcast_timeout,
        })
    }

    fn lock_round(&self) -> TrainResult<MutexGuard<'_, Round>> {
        self.round
            .lock()
            .map_err(|_| TrainError::Collective("broadcast lock poisoned".into()))
    }
}

/// Thread-backed group member.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    hub: Arc<LocalHub>,
}

impl LocalGroup {
    /// Joins `hub` as `rank` and waits until every member has joined or `timeout`
    /// elapses.
    pub fn join(hub: Arc<LocalHub>, rank: usize, timeout: Duration) -> TrainResult<Self> {
        if rank >= hub.world_size {
            return Err(TrainError::Collective(format!(
                "rank {rank} outside world of {}",
                hub.world_size
            )));
        }
        let deadline = Instant::now() + timeout;
        let mut joined = hub
            .joined
            .lock()
            .map_err(|_| TrainError::Collective("handshake lock poisoned".into()))?;
        *joined += 1;
        hub.all_joined.notify_all();
        while *joined < hub.world_size {
            let now = Instant::now();
            if now >= deadline {
                return Err(TrainError::Collective(format!(
                    "handshake timed out after {:?}: {}/{} ranks joined",
                    timeout, *joined, hub.world_size
                )));
            }
            let (guard, _) = hub
                .all_joined
                .wait_timeout(joined, deadline - now)
                .map_err(|_| TrainError::Collective("handshake lock poisoned".into()))?;
            joined = guard;
        }
        drop(joined);
        log::debug!("rank {rank} joined local group of {}", hub.world_size);
        Ok(Self { rank, hub })
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.hub.world_size
    }

    /// Generation-counted rendezvous: the last rank to arrive publishes rank 0's
    /// decision and opens the next round. Fails on a peer abort or on timeout.
    fn broadcast_stop(&self, stop: bool) -> TrainResult<bool> {
        let hub = &self.hub;
        let deadline = Instant::now() + hub.broadcast_timeout;
        let mut round = hub.lock_round()?;
        if let Some(reason) = &round.aborted {
            return Err(TrainError::Collective(format!("peer aborted: {reason}")));
        }
        if self.rank == 0 {
            round.stop = stop;
        }
        let generation = round.generation;
        round.arrived += 1;
        if round.arrived == hub.world_size {
            round.decided = round.stop;
            round.arrived = 0;
            round.generation += 1;
            hub.round_done.notify_all();
            return Ok(round.decided);
        }
        loop {
            if let Some(reason) = &round.aborted {
                return Err(TrainError::Collective(format!("peer aborted: {reason}")));
            }
            if round.generation != generation {
                return Ok(round.decided);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TrainError::Collective(format!(
                    "rank {} timed out after {:?} waiting for stop broadcast ({}/{} arrived)",
                    self.rank, hub.broadcast_timeout, round.arrived, hub.world_size
                )));
            }
            let (guard, _) = hub
                .round_done
                .wait_timeout(round, deadline - now)
                .map_err(|_| TrainError::Collective("broadcast lock poisoned".into()))?;
            round = guard;
        }
    }

    fn abort(&self, reason: &str) {
        match self.hub.round.lock() {
            Ok(mut round) => {
                if round.aborted.is_none() {
                    round.aborted = Some(format!("rank {}: {reason}", self.rank));
                }
                self.hub.round_done.notify_all();
            }
            Err(_) => log::warn!("rank {} could not signal abort: lock poisoned", self.rank),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_process_passes_through() {
        let c = SingleProcess;
        assert!(c.is_main());
        assert!(c.broadcast_stop(true).unwrap());
        assert!(!c.broadcast_stop(false).unwrap());
    }

    #[test]
    fn every_rank_sees_rank_zero_decision() {
        let world = 4;
        let hub = LocalHub::new(world);
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let hub = hub.clone();
                thread::spawn(move || {
                    let group = LocalGroup::join(hub, rank, Duration::from_secs(5)).unwrap();
                    // only rank 0 wants to stop in round one, only rank 3 in round two
                    let first = group.broadcast_stop(rank == 0).unwrap();
                    let second = group.broadcast_stop(rank == 3).unwrap();
                    (first, second)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), (true, false));
        }
    }

    #[test]
    fn handshake_times_out_when_a_rank_is_missing() {
        let hub = LocalHub::new(2);
        let err = LocalGroup::join(hub, 0, Duration::from_millis(50)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn aborting_rank_releases_its_peer() {
        let hub = LocalHub::new(2);
        let waiter = {
            let hub = hub.clone();
            thread::spawn(move || {
                let group = LocalGroup::join(hub, 1, Duration::from_secs(5)).unwrap();
                group.broadcast_stop(false)
            })
        };
        let failing = LocalGroup::join(hub, 0, Duration::from_secs(5)).unwrap();
        failing.abort("validation failed");
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, TrainError::Collective(_)));
        assert!(err.to_string().contains("validation failed"), "{err}");
    }

    #[test]
    fn silent_peer_times_out_instead_of_hanging() {
        let hub = LocalHub::with_broadcast_timeout(2, Duration::from_millis(100));
        let silent = {
            let hub = hub.clone();
            // joins, then leaves without ever broadcasting
            thread::spawn(move || LocalGroup::join(hub, 0, Duration::from_secs(5)).map(|_| ()))
        };
        let group = LocalGroup::join(hub, 1, Duration::from_secs(5)).unwrap();
        silent.join().unwrap().unwrap();
        let started = Instant::now();
        let err = group.broadcast_stop(false).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
