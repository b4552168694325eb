use super::log::{Entry, Index, Log};
use super::message::{self, Ack, Request, Response};
use super::{
    AddressBook, Clock, Pid, ReplicaAddr, REPLICATION_TIMEOUT, STEERING_PORT, STEERING_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::store::{
    Account, ChatMessage, Credentials, Store, Value, INSERT_CONTACT, INSERT_MESSAGE, INSERT_USER,
};
use crate::{errdata, errinput};

use chrono::TimeDelta;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A replica: the long-lived state of one cluster member, shared between the
/// RPC server, the heartbeat monitor, and any election or replication
/// threads in flight.
///
/// Locking is deliberately coarse: the store mutex doubles as the handler
/// mutex serializing every state-mutating request (client writes on the
/// leader, replicated entries on a backup), and the log has its own mutex
/// serializing appends. Both are only ever taken in store-then-log order.
pub struct Replica {
    /// This replica's PID, immutable after start.
    pid: Pid,
    /// The static address list; includes our own address at index pid.
    addrs: AddressBook,
    /// The believed leader's PID, -1 if unknown. Changed only by an election
    /// outcome or a LEADER announcement.
    leader_id: AtomicI64,
    /// True while an election is in progress on this replica.
    electing: AtomicBool,
    /// The loosely synchronized clock.
    clock: Clock,
    /// The append-only command log.
    log: Mutex<Log>,
    /// The materialized state store; also the handler mutex.
    store: Mutex<Store>,
}

impl Replica {
    /// Creates a new replica from its parts. The PID must index into the
    /// address book.
    pub fn new(
        pid: Pid,
        addrs: AddressBook,
        store: Store,
        log: Log,
        clock: Clock,
    ) -> Result<Self> {
        addrs.get(pid)?;
        Ok(Replica {
            pid,
            addrs,
            leader_id: AtomicI64::new(-1),
            electing: AtomicBool::new(false),
            clock,
            log: Mutex::new(log),
            store: Mutex::new(store),
        })
    }

    /// Returns this replica's PID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns this replica's own address.
    pub fn addr(&self) -> Result<&ReplicaAddr> {
        self.addrs.get(self.pid)
    }

    /// Returns the address book.
    pub fn addrs(&self) -> &AddressBook {
        &self.addrs
    }

    /// Returns the believed leader's PID, -1 if unknown.
    pub fn leader_id(&self) -> Pid {
        self.leader_id.load(Ordering::SeqCst)
    }

    /// Adopts a new leader.
    pub(super) fn set_leader(&self, pid: Pid) {
        self.leader_id.store(pid, Ordering::SeqCst)
    }

    /// Returns true if this replica believes itself leader.
    pub fn is_leader(&self) -> bool {
        self.leader_id() == self.pid
    }

    /// Returns true while an election is in progress here.
    pub(super) fn electing(&self) -> bool {
        self.electing.load(Ordering::SeqCst)
    }

    pub(super) fn set_electing(&self, electing: bool) {
        self.electing.store(electing, Ordering::SeqCst)
    }

    /// Returns the clock.
    pub(super) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Returns the current log index.
    pub fn log_index(&self) -> Result<Index> {
        Ok(self.log.lock()?.last_index())
    }

    /// Records the address of a client that has connected to us.
    pub(super) fn cache_ip(&self, host: &str) -> Result<()> {
        self.store.lock()?.cache_ip(host)
    }

    /// Heartbeat probe.
    pub fn status(&self) -> Result<Response> {
        Ok(Response::Ack(Ack::status_ok()))
    }

    /// Reports the current log index to the leader's reconcile pass.
    pub fn log_status(&self) -> Result<Response> {
        Ok(Response::LogStatus { log_index: self.log.lock()?.last_index() })
    }

    /// Samples our network time for the Berkeley pass.
    pub fn get_time(&self) -> Result<Response> {
        Ok(Response::Time(self.clock.now()?))
    }

    /// Applies a clock correction from the leader.
    pub fn adjust_time(&self, delta_us: i64) -> Result<Response> {
        self.clock.adjust(TimeDelta::microseconds(delta_us))?;
        Ok(Response::Ok)
    }

    /// Applies a batch of replicated entries (the backup path). Entries are
    /// sorted and applied in index order; entries at or below our index are
    /// skipped, which makes redelivery idempotent. A batch that starts past
    /// our next index is applied anyway with the index jumping forward; the
    /// leader's reconcile pass delivers the missing prefix later.
    pub fn apply_entries(&self, mut entries: Vec<Entry>) -> Result<Response> {
        debug!("received {} entries for replication", entries.len());
        if self.is_leader() {
            return Err(Error::NotAuthoritative);
        }
        entries.sort_by_key(|e| e.index);

        let store = self.store.lock()?;
        let mut log = self.log.lock()?;
        for entry in entries {
            if entry.index <= log.last_index() {
                debug!("skipping duplicate entry {}", entry.index);
                continue;
            }
            if entry.index > log.last_index() + 1 {
                warn!(
                    "log gap: expected {}, got {}; jumping forward",
                    log.last_index() + 1,
                    entry.index
                );
            }
            store.execute(&entry.sql, &entry.args)?;
            log.write_entry(&entry)?;
            debug!("applied entry {}", entry.index);
        }
        Ok(Response::Ack(Ack {
            success: true,
            last_index: log.last_index() as i64,
            message: String::new(),
        }))
    }

    /// Wipes the command log (divergence repair). Refused on the leader,
    /// whose log is the authoritative copy.
    pub fn erase_logs(&self) -> Result<Response> {
        if self.is_leader() {
            return Err(Error::NotAuthoritative);
        }
        self.log.lock()?.erase_all()?;
        info!("erased command log");
        Ok(Response::Ack(Ack { success: true, last_index: 0, message: String::new() }))
    }

    /// Ships the complete on-disk log to the given replica. Invoked on the
    /// leader, both via RPC by a freshly started backup and directly by the
    /// reconcile pass.
    pub fn catchup(&self, peer: Pid) -> Result<Response> {
        let entries = self.log.lock()?.read_all()?;
        let addr = self.addrs.get(peer)?;
        info!("shipping {} entries to replica {peer}", entries.len());
        match message::call(addr, REPLICATION_TIMEOUT, &Request::ApplyEntries(entries))? {
            Response::Ack(ack) if ack.success => Ok(Response::Pid(-1)),
            response => errdata!("unexpected catch-up response {response:?}"),
        }
    }

    /// Handles a LEADER announcement: adopt the sender and stand down from
    /// any election in progress.
    pub fn handle_leader(&self, from: Pid) -> Result<Response> {
        info!("replica {from} announced itself leader");
        self.set_leader(from);
        self.set_electing(false);
        Ok(Response::Ack(Ack { success: true, last_index: -1, message: String::new() }))
    }

    /// Handles an ELECTION message. If the sender has a lower PID we bully
    /// it by answering with our own PID, and start our own election unless
    /// one is already running. The election runs in a fresh thread so the
    /// handler returns (and releases its connection) before any network I/O.
    pub fn handle_election(self: Arc<Self>, from: Pid) -> Result<Response> {
        let mut ack = Ack { success: true, last_index: -1, message: String::new() };
        if from < self.pid {
            ack.last_index = self.pid;
            if !self.electing() {
                let replica = Arc::clone(&self);
                std::thread::spawn(move || {
                    if let Err(e) = replica.elect() {
                        error!("election failed: {e}");
                    }
                });
            }
        }
        Ok(Response::Ack(ack))
    }

    /// Creates a user account: apply locally, log, fan out (the leader write
    /// path). Returns the new user's row ID.
    pub fn create_account(self: Arc<Self>, account: Account) -> Result<Response> {
        if !self.is_leader() {
            return Err(Error::NotAuthoritative);
        }
        let args: Vec<Value> = vec![
            account.password.into(),
            account.email.into(),
            account.firstname.into(),
            account.lastname.into(),
            account.descr.into(),
        ];
        let store = self.store.lock()?;
        let user_id = store.execute(INSERT_USER, &args)?;
        let entry = self.log.lock()?.append(INSERT_USER, args, self.clock.now()?)?;
        drop(store);
        self.replicate(entry);
        info!("created user {user_id}");
        Ok(Response::UserId(user_id))
    }

    /// Stores a chat message (leader write path).
    pub fn save_message(self: Arc<Self>, message: ChatMessage) -> Result<Response> {
        if !self.is_leader() {
            return Err(Error::NotAuthoritative);
        }
        let args: Vec<Value> = vec![
            message.from.into(),
            message.to.into(),
            message.message.into(),
            message.timestamp.into(),
            message.acked.into(),
        ];
        let store = self.store.lock()?;
        store.execute(INSERT_MESSAGE, &args)?;
        let entry = self.log.lock()?.append(INSERT_MESSAGE, args, self.clock.now()?)?;
        drop(store);
        self.replicate(entry);
        Ok(Response::Ok)
    }

    /// Adds a contact pair (leader write path). The two directions are
    /// inserted in one local transaction but logged as two entries; a single
    /// fan-out ships both, since every shipment carries the full log.
    pub fn add_contact(self: Arc<Self>, user_id: i64, contact_id: i64) -> Result<Response> {
        if !self.is_leader() {
            return Err(Error::NotAuthoritative);
        }
        let mut store = self.store.lock()?;
        if store.contact_exists(user_id, contact_id)? || store.contact_exists(contact_id, user_id)?
        {
            return errinput!("contact already exists");
        }
        store.add_contact(user_id, contact_id)?;

        let now = self.clock.now()?;
        let mut log = self.log.lock()?;
        log.append(INSERT_CONTACT, vec![user_id.into(), contact_id.into()], now)?;
        let entry = log.append(INSERT_CONTACT, vec![contact_id.into(), user_id.into()], now)?;
        drop(log);
        drop(store);
        self.replicate(entry);
        Ok(Response::Ok)
    }

    /// Verifies credentials against the local store.
    pub fn login(&self, credentials: Credentials) -> Result<Response> {
        Ok(Response::Profile(self.store.lock()?.login(&credentials)?))
    }

    /// Lists a user's contacts from the local store.
    pub fn contacts(&self, user_id: i64) -> Result<Response> {
        Ok(Response::Contacts(self.store.lock()?.contacts_of(user_id)?))
    }

    /// Lists all users from the local store.
    pub fn all_users(&self) -> Result<Response> {
        Ok(Response::Contacts(self.store.lock()?.all_users()?))
    }

    /// Lists the message history between two users from the local store.
    pub fn messages(&self, user_id: i64, contact_id: i64) -> Result<Response> {
        Ok(Response::Messages(self.store.lock()?.messages_between(user_id, contact_id)?))
    }

    /// Ships the entire on-disk log, with the given entry appended, to every
    /// peer in fire-and-forget threads. Failures are logged and left for the
    /// next reconcile pass; the client's write never blocks on a backup.
    fn replicate(self: Arc<Self>, entry: Entry) {
        let replica = self;
        std::thread::spawn(move || {
            let read = replica.log.lock().map_err(Error::from).and_then(|log| log.read_all());
            let mut entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    error!("failed to read log for replication: {e}");
                    return;
                }
            };
            entries.push(entry);
            for (pid, addr) in replica.addrs.peers(replica.pid) {
                let addr = addr.clone();
                let request = Request::ApplyEntries(entries.clone());
                std::thread::spawn(move || {
                    match message::call(&addr, REPLICATION_TIMEOUT, &request) {
                        Ok(Response::Ack(ack)) if ack.success => {
                            debug!("replica {pid} acked entries up to {}", ack.last_index)
                        }
                        Ok(response) => {
                            warn!("unexpected replication response from {pid}: {response:?}")
                        }
                        Err(e) => warn!("replication to replica {pid} failed: {e}"),
                    }
                });
            }
        });
    }

    /// Pushes this replica's address to every cached client on the steering
    /// port, after winning an election. Offline clients are skipped; they
    /// will rediscover the leader on their next call.
    pub(super) fn push_leader_address(&self) -> Result<()> {
        let clients = self.store.lock()?.client_ips()?;
        info!("pushing leader address to {} cached clients", clients.len());
        let addr = self.addr()?.clone();
        for host in clients {
            let target = ReplicaAddr { host, port: STEERING_PORT };
            let request = Request::LeaderAddress(addr.clone());
            std::thread::spawn(move || {
                if let Err(e) = message::call(&target, STEERING_TIMEOUT, &request) {
                    debug!("client {target} unreachable for leader update: {e}");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Builds a two-replica book where the peer ports are unreachable, so
    /// fan-out threads fail fast and harmlessly.
    fn test_replica(pid: Pid) -> (Arc<Replica>, tempfile::TempDir) {
        let dir = tempfile::TempDir::with_prefix("mechat-node").expect("tempdir failed");
        let addrs = AddressBook::parse("127.0.0.1:26090\n127.0.0.1:26091").expect("bad addrs");
        let store = Store::open_memory().expect("store failed");
        let log = Log::new(dir.path().join("log")).expect("log failed");
        let clock = Clock::new(TimeDelta::zero());
        let replica =
            Arc::new(Replica::new(pid, addrs, store, log, clock).expect("replica failed"));
        (replica, dir)
    }

    fn user_entry(index: Index, email: &str) -> Entry {
        Entry {
            index,
            sql: INSERT_USER.into(),
            args: vec![
                "hash".into(),
                email.into(),
                "Ada".into(),
                "L".into(),
                String::new().into(),
            ],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn apply_entries_is_ordered_and_idempotent() -> Result<()> {
        let (replica, _dir) = test_replica(0);
        replica.set_leader(1);

        // Deliver out of order; application must sort by index.
        let batch = vec![user_entry(2, "b@b"), user_entry(1, "a@a")];
        let response = replica.apply_entries(batch.clone())?;
        assert_eq!(
            response,
            Response::Ack(Ack { success: true, last_index: 2, message: String::new() })
        );
        assert_eq!(replica.log_index()?, 2);

        // Redelivery leaves both the log and the store unchanged.
        replica.apply_entries(batch)?;
        assert_eq!(replica.log_index()?, 2);
        let Response::Contacts(users) = replica.all_users()? else {
            panic!("unexpected response")
        };
        assert_eq!(users.len(), 2);
        Ok(())
    }

    #[test]
    fn apply_entries_jumps_over_gaps() -> Result<()> {
        let (replica, _dir) = test_replica(0);
        replica.set_leader(1);
        replica.apply_entries(vec![user_entry(1, "a@a"), user_entry(5, "e@e")])?;
        assert_eq!(replica.log_index()?, 5);
        Ok(())
    }

    #[test]
    fn leader_refuses_replicated_writes() {
        let (replica, _dir) = test_replica(0);
        replica.set_leader(0);
        assert_eq!(
            replica.apply_entries(vec![user_entry(1, "a@a")]),
            Err(Error::NotAuthoritative)
        );
        assert_eq!(replica.erase_logs(), Err(Error::NotAuthoritative));
    }

    #[test]
    fn erase_logs_resets_backup() -> Result<()> {
        let (replica, _dir) = test_replica(0);
        replica.set_leader(1);
        replica.apply_entries(vec![user_entry(1, "a@a")])?;
        assert_eq!(replica.log_index()?, 1);
        replica.erase_logs()?;
        assert_eq!(replica.log_index()?, 0);
        Ok(())
    }

    #[test]
    fn writes_require_leadership() {
        let (replica, _dir) = test_replica(0);
        replica.set_leader(1);
        let account = Account {
            email: "a@b".into(),
            password: "hash".into(),
            firstname: "Ada".into(),
            lastname: "L".into(),
            descr: String::new(),
        };
        assert_eq!(replica.clone().create_account(account), Err(Error::NotAuthoritative));
        assert_eq!(replica.add_contact(1, 2), Err(Error::NotAuthoritative));
    }

    #[test]
    fn leader_write_applies_and_logs() -> Result<()> {
        let (replica, dir) = test_replica(0);
        replica.set_leader(0);
        let account = Account {
            email: "a@b".into(),
            password: "hash".into(),
            firstname: "Ada".into(),
            lastname: "L".into(),
            descr: String::new(),
        };
        assert_eq!(replica.clone().create_account(account)?, Response::UserId(1));
        assert_eq!(replica.log_index()?, 1);
        assert!(dir.path().join("log").join("log-1.json").try_exists()?);

        let credentials = Credentials { email: "a@b".into(), password: "hash".into() };
        let Response::Profile(profile) = replica.login(credentials)? else {
            panic!("unexpected response")
        };
        assert_eq!(profile.user_id, 1);
        Ok(())
    }

    #[test]
    fn add_contact_logs_both_directions() -> Result<()> {
        let (replica, _dir) = test_replica(0);
        replica.set_leader(0);
        replica.clone().add_contact(1, 2)?;
        assert_eq!(replica.log_index()?, 2);
        assert_eq!(replica.add_contact(2, 1), errinput!("contact already exists"));
        Ok(())
    }

    #[test]
    fn election_message_from_lower_pid_is_bullied() -> Result<()> {
        let (replica, _dir) = test_replica(1);
        replica.set_leader(1); // suppress the spawned election's side effects
        let Response::Ack(ack) = replica.handle_election(0)? else {
            panic!("unexpected response")
        };
        assert_eq!(ack.last_index, 1);

        // A higher sender is not bullied.
        let (replica, _dir) = test_replica(0);
        let Response::Ack(ack) = replica.handle_election(1)? else {
            panic!("unexpected response")
        };
        assert_eq!(ack.last_index, -1);
        Ok(())
    }

    #[test]
    fn leader_announcement_is_adopted() -> Result<()> {
        let (replica, _dir) = test_replica(0);
        replica.set_electing(true);
        replica.handle_leader(1)?;
        assert_eq!(replica.leader_id(), 1);
        assert!(!replica.electing());
        Ok(())
    }
}
