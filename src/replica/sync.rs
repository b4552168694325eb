//! The leader's per-tick housekeeping: Berkeley clock synchronization and
//! log reconciliation. Both run inside the leader's monitor loop slot, once
//! per heartbeat interval.

use super::clock::average_offset;
use super::message::{self, Ack, Request, Response};
use super::node::Replica;
use super::{Pid, ELECTION_TIMEOUT};
use crate::error::Result;

use log::{debug, info, warn};

impl Replica {
    /// One Berkeley round: sample every reachable peer's network time,
    /// estimate its offset from ours using half the round-trip time, shift
    /// our own clock by the cluster average, and send each peer the delta
    /// that lands it on the same average.
    pub(super) fn sync_time(&self) -> Result<()> {
        let mut samples = Vec::new();
        for (pid, addr) in self.addrs().peers(self.pid()) {
            let before = self.clock().now()?;
            let reply = match message::call(addr, ELECTION_TIMEOUT, &Request::GetTime) {
                Ok(Response::Time(utc)) => utc,
                Ok(response) => {
                    warn!("unexpected time reply from {pid}: {response:?}");
                    continue;
                }
                Err(e) => {
                    debug!("replica {pid} unreachable for time sync: {e}");
                    continue;
                }
            };
            let after = self.clock().now()?;
            let flight = (after - before) / 2;
            let predicted = reply + flight;
            samples.push((pid, addr.clone(), predicted - after));
        }
        if samples.is_empty() {
            debug!("no peers reachable for time sync");
            return Ok(());
        }

        let deltas: Vec<_> = samples.iter().map(|(_, _, delta)| *delta).collect();
        let avg = average_offset(&deltas);
        self.clock().adjust(avg)?;
        debug!("synced time with {} peers, adjusted by {avg}", samples.len());

        for (pid, addr, delta) in samples {
            let correction = avg - delta;
            let Some(delta_us) = correction.num_microseconds() else {
                warn!("clock correction for {pid} overflows, skipping");
                continue;
            };
            if let Err(e) = message::call(&addr, ELECTION_TIMEOUT, &Request::AdjustTime { delta_us })
            {
                debug!("replica {pid} unreachable for time update: {e}");
            }
        }
        Ok(())
    }

    /// One reconcile pass: compare every reachable peer's log index with
    /// ours. Peers that are behind get the full log; peers that are ahead
    /// (stale state from a previous leadership) are wiped and re-seeded.
    pub(super) fn reconcile(&self) -> Result<()> {
        let local = self.log_index()?;
        for (pid, addr) in self.addrs().peers(self.pid()) {
            let peer_index = match message::call(addr, ELECTION_TIMEOUT, &Request::LogStatus) {
                Ok(Response::LogStatus { log_index }) => log_index,
                Ok(response) => {
                    warn!("unexpected log status from {pid}: {response:?}");
                    continue;
                }
                Err(e) => {
                    debug!("replica {pid} unreachable for reconciliation: {e}");
                    continue;
                }
            };

            if peer_index < local {
                info!("replica {pid} is behind ({peer_index} < {local}), catching up");
                self.catch_up_peer(pid);
            } else if peer_index > local {
                info!("replica {pid} has diverged ({peer_index} > {local}), replacing its log");
                match message::call(addr, ELECTION_TIMEOUT, &Request::EraseLogs) {
                    Ok(Response::Ack(Ack { success: true, .. })) => self.catch_up_peer(pid),
                    Ok(response) => warn!("replica {pid} refused to erase its log: {response:?}"),
                    Err(e) => warn!("erasing logs on replica {pid} failed: {e}"),
                }
            } else {
                debug!("replica {pid} is up to date");
            }
        }
        Ok(())
    }

    /// Ships the full log to one peer, logging the outcome.
    fn catch_up_peer(&self, pid: Pid) {
        match self.catchup(pid) {
            Ok(Response::Pid(-1)) => info!("replica {pid} caught up"),
            Ok(response) => warn!("catch-up of replica {pid} returned {response:?}"),
            Err(e) => warn!("catch-up of replica {pid} failed: {e}"),
        }
    }
}
