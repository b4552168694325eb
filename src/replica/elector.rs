//! The bully elector and failure detector.
//!
//! Every replica runs the monitor loop. Non-leaders probe the believed
//! leader once per interval with a tight deadline and call an election on
//! any failure; the leader uses the same loop slot for its housekeeping
//! (clock sync and log reconciliation) instead, since it cannot probe
//! itself. The election itself is the classic bully exchange: the highest
//! live PID always wins.

use super::message::{self, Request, Response, STATUS_OK};
use super::node::Replica;
use super::{
    DETECTOR_TIMEOUT, ELECTION_TIMEOUT, ELECTION_WAIT, HEARTBEAT_INTERVAL, REPLICATION_TIMEOUT,
};
use crate::error::Result;

use log::{debug, error, info, warn};

impl Replica {
    /// The heartbeat monitor loop. Runs for the lifetime of the process.
    pub fn monitor(&self) {
        loop {
            if self.leader_alive() {
                debug!("leader {} is online", self.leader_id());
                std::thread::sleep(HEARTBEAT_INTERVAL);
                continue;
            }
            if let Err(e) = self.elect() {
                error!("election failed: {e}");
                std::thread::sleep(HEARTBEAT_INTERVAL);
            }
        }
    }

    /// Probes the believed leader. On the leader itself this instead runs
    /// the per-tick housekeeping and always succeeds, since a leader cannot
    /// detect its own failure.
    fn leader_alive(&self) -> bool {
        if self.is_leader() {
            if let Err(e) = self.sync_time() {
                warn!("clock sync failed: {e}");
            }
            if let Err(e) = self.reconcile() {
                warn!("log reconciliation failed: {e}");
            }
            return true;
        }

        let leader = self.leader_id();
        let Ok(addr) = self.addrs().get(leader) else {
            // No known leader to probe yet; treat as down and elect.
            return false;
        };
        match message::call(addr, DETECTOR_TIMEOUT, &Request::Status) {
            Ok(Response::Ack(ack)) if ack.message == STATUS_OK => true,
            Ok(response) => {
                info!("leader {leader} down: unexpected status reply {response:?}");
                false
            }
            Err(e) => {
                info!("leader {leader} down: {e}");
                false
            }
        }
    }

    /// Runs a bully election. The highest PID in the cluster announces
    /// itself leader outright. Anyone else challenges all higher PIDs,
    /// waits, and either takes over (nobody answered) or stands down and
    /// expects the winner's LEADER announcement within the next interval.
    pub(super) fn elect(&self) -> Result<()> {
        self.set_electing(true);
        info!("calling election");

        if self.pid() == self.addrs().max_pid() {
            self.set_leader(self.pid());
            self.set_electing(false);
            self.announce_leadership();
            self.push_leader_address()?;
            return Ok(());
        }

        let mut bullied = false;
        for (pid, addr) in self.addrs().peers(self.pid()).filter(|(pid, _)| *pid > self.pid()) {
            match message::call(addr, ELECTION_TIMEOUT, &Request::Election { from: self.pid() }) {
                Ok(Response::Ack(ack)) if ack.last_index != -1 => {
                    debug!("bullied by replica {pid}");
                    bullied = true;
                }
                Ok(_) => {}
                Err(e) => info!("replica {pid} is offline: {e}"),
            }
        }
        std::thread::sleep(ELECTION_WAIT);

        if !bullied {
            // No higher replica is alive: take over.
            self.set_leader(self.pid());
            self.announce_leadership();
            self.set_electing(false);
            self.push_leader_address()?;
        } else {
            // A higher replica responded; give it time to announce itself.
            std::thread::sleep(ELECTION_WAIT);
            self.set_electing(false);
        }
        Ok(())
    }

    /// Broadcasts a LEADER announcement to every peer. Unreachable peers are
    /// skipped; they will learn of us when they next probe or elect.
    fn announce_leadership(&self) {
        info!("announcing leadership to all peers");
        for (pid, addr) in self.addrs().peers(self.pid()) {
            if let Err(e) =
                message::call(addr, ELECTION_TIMEOUT, &Request::Leader { from: self.pid() })
            {
                info!("replica {pid} unreachable for leader announcement: {e}");
            }
        }
    }

    /// The startup sequence, run once after the RPC listener is up: find the
    /// current leader by probing every peer's PID, ask it to stream us its
    /// log, and take over if our own PID outranks it.
    pub fn startup(&self) {
        let mut leader = -1;
        for (pid, addr) in self.addrs().peers(self.pid()) {
            match message::call(addr, ELECTION_TIMEOUT, &Request::GetPid) {
                Ok(Response::Pid(peer_pid)) => leader = leader.max(peer_pid),
                Ok(response) => warn!("unexpected PID reply from {pid}: {response:?}"),
                Err(e) => debug!("replica {pid} unreachable during startup: {e}"),
            }
        }
        if leader == -1 {
            // Nobody else is up; we're it.
            self.set_leader(self.pid());
            info!("no live peers, assuming leadership");
            return;
        }
        self.set_leader(leader);
        info!("current leader is {leader}");

        // Ask the leader to bring our log up to date before serving.
        if let Ok(addr) = self.addrs().get(leader) {
            match message::call(addr, REPLICATION_TIMEOUT, &Request::Catchup { id: self.pid() }) {
                Ok(Response::Pid(-1)) => info!("caught up from leader {leader}"),
                Ok(response) => warn!("unexpected catch-up reply: {response:?}"),
                Err(e) => warn!("initial catch-up from leader {leader} failed: {e}"),
            }
        }

        if self.leader_id() < self.pid() {
            if let Err(e) = self.elect() {
                error!("startup election failed: {e}");
            }
        }
    }
}
