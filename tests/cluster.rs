//! End-to-end cluster tests. These run real replica processes using the
//! built mechat binary in a temporary directory, one subdirectory per node,
//! and drive them through the gateway client. Processes are killed and the
//! directory removed on drop.
//!
//! Replication, elections, and repair all run on second-scale timers, so
//! the assertions poll with generous deadlines rather than sleeping for
//! fixed intervals.

use mechat::replica::{call, AddressBook, Entry, Pid, ReplicaAddr, Request, Response};
use mechat::store::Profile;
use mechat::{Error, Gateway};

use chrono::Utc;
use rand::Rng as _;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Timeout for node readiness after spawn.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for cluster convergence (replication, elections, repair).
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout for a single probe RPC.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

type TestResult = Result<(), Box<dyn StdError>>;

/// A mechat cluster of child processes.
struct TestCluster {
    servers: BTreeMap<Pid, TestServer>,
    base_port: u16,
    dir: tempfile::TempDir, // deleted when dropped
}

impl TestCluster {
    /// Runs a cluster with the given number of nodes on consecutive ports
    /// above a randomized base, and waits for every node to serve RPCs. The
    /// random base keeps concurrently running tests on disjoint port ranges,
    /// below the ephemeral range the outbound connections draw from.
    fn run(nodes: u8) -> Result<Self, Box<dyn StdError>> {
        let base_port = rand::thread_rng().gen_range(20000..30000);
        let dir = tempfile::TempDir::with_prefix("mechat")?;

        let mut addrs = String::new();
        for id in 0..nodes {
            writeln!(addrs, "127.0.0.1:{}", base_port + id as u16)?;
        }
        std::fs::write(dir.path().join("replica_addrs.txt"), addrs)?;

        let mut cluster = Self { servers: BTreeMap::new(), base_port, dir };
        for id in 0..nodes as Pid {
            cluster.start(id)?;
        }
        cluster.wait_ready()?;
        Ok(cluster)
    }

    /// Starts (or restarts) the given node.
    fn start(&mut self, id: Pid) -> TestResult {
        self.start_skewed(id, 0)
    }

    /// Starts (or restarts) the given node with an initial clock offset.
    fn start_skewed(&mut self, id: Pid, clock_offset: i64) -> TestResult {
        let server = TestServer::run(
            id,
            clock_offset,
            self.dir.path().join(format!("node-{id}")),
            self.dir.path().join("replica_addrs.txt"),
        )?;
        self.servers.insert(id, server);
        Ok(())
    }

    /// Stops the given node.
    fn stop(&mut self, id: Pid) {
        self.servers.remove(&id);
    }

    /// Returns the RPC address of the given node.
    fn addr(&self, id: Pid) -> ReplicaAddr {
        ReplicaAddr { host: "127.0.0.1".into(), port: self.base_port + id as u16 }
    }

    /// Returns the command log directory of the given node.
    fn log_dir(&self, id: Pid) -> PathBuf {
        self.dir.path().join(format!("node-{id}")).join(format!("logs-node-{id}"))
    }

    /// Returns a gateway over the cluster's address file.
    fn gateway(&self) -> Result<Gateway, Box<dyn StdError>> {
        let addrs = AddressBook::load(self.dir.path().join("replica_addrs.txt"))?;
        Ok(Gateway::new(addrs))
    }

    /// Waits for every running node to answer a PID probe.
    fn wait_ready(&mut self) -> TestResult {
        let started = Instant::now();
        let ids: Vec<Pid> = self.servers.keys().copied().collect();
        for id in ids {
            loop {
                match call(&self.addr(id), PROBE_TIMEOUT, &Request::GetPid) {
                    Ok(Response::Pid(pid)) if pid == id => break,
                    Ok(response) => return Err(format!("unexpected reply {response:?}").into()),
                    Err(error) => {
                        self.servers.get_mut(&id).expect("node not running").assert_alive();
                        if started.elapsed() >= READY_TIMEOUT {
                            return Err(error.into());
                        }
                        std::thread::sleep(Duration::from_millis(200));
                    }
                }
            }
        }
        Ok(())
    }

    /// Registers an account through the gateway, retrying until the cluster
    /// has settled on a leader that accepts writes.
    fn register(&self, gateway: &Gateway, email: &str) -> Result<Profile, Box<dyn StdError>> {
        let deadline = Instant::now() + CONVERGE_TIMEOUT;
        loop {
            match gateway.create_account(email, "secret", "Test", "User", "") {
                Ok(profile) => return Ok(profile),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(200))
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Waits until the given node's log index reaches the expected value.
    fn wait_for_log_index(&self, id: Pid, expected: u64) -> TestResult {
        let deadline = Instant::now() + CONVERGE_TIMEOUT;
        loop {
            match call(&self.addr(id), PROBE_TIMEOUT, &Request::LogStatus) {
                Ok(Response::LogStatus { log_index }) if log_index == expected => return Ok(()),
                Ok(_) | Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(200))
                }
                Ok(response) => {
                    return Err(format!("node {id} stuck at {response:?}, want {expected}").into())
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Counts the persisted log entry files of the given node.
    fn log_file_count(&self, id: Pid) -> Result<usize, Box<dyn StdError>> {
        let mut count = 0;
        for file in std::fs::read_dir(self.log_dir(id))? {
            let name = file?.file_name().to_string_lossy().into_owned();
            if name.starts_with("log-") && name.ends_with(".json") {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// A mechat server process.
struct TestServer {
    id: Pid,
    child: std::process::Child,
}

impl TestServer {
    /// Builds and runs a replica in the given working directory, where it
    /// keeps its log directory and database.
    fn run(
        id: Pid,
        clock_offset: i64,
        dir: PathBuf,
        addr_file: PathBuf,
    ) -> Result<Self, Box<dyn StdError>> {
        std::fs::create_dir_all(&dir)?;
        let build = escargot::CargoBuild::new().bin("mechat").run()?;
        let child = build
            .command()
            .args([id.to_string(), clock_offset.to_string()])
            .arg("--addrs")
            .arg(&addr_file)
            .args(["--log-level", "error"])
            .current_dir(&dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        Ok(Self { id, child })
    }

    /// Asserts that the process is still running.
    fn assert_alive(&mut self) {
        if let Some(status) = self.child.try_wait().expect("failed to check exit status") {
            panic!("node {id} exited with status {status}", id = self.id)
        }
    }
}

impl Drop for TestServer {
    // Kills the child process when dropped.
    fn drop(&mut self) {
        self.child.kill().expect("failed to kill node");
        self.child.wait().expect("failed to wait for node to terminate");
    }
}

#[test]
fn replicates_writes_to_backups() -> TestResult {
    let cluster = TestCluster::run(2)?;
    let gateway = cluster.gateway()?;

    let profile = cluster.register(&gateway, "a@b")?;
    assert_eq!(profile.user_id, 1);

    // The leader (highest PID) has the entry; the backup receives it within
    // a replication fan-out or at worst one reconcile tick.
    cluster.wait_for_log_index(1, 1)?;
    cluster.wait_for_log_index(0, 1)?;

    let entry: Entry =
        serde_json::from_slice(&std::fs::read(cluster.log_dir(0).join("log-1.json"))?)?;
    assert_eq!(entry.index, 1);
    assert!(entry.sql.contains("INSERT INTO users"));

    // The materialized row is queryable on the leader.
    let profile = gateway.login("a@b", "secret")?;
    assert_eq!(profile.user_id, 1);
    Ok(())
}

#[test]
fn catches_up_lagging_replica() -> TestResult {
    let mut cluster = TestCluster::run(3)?;
    let gateway = cluster.gateway()?;

    cluster.register(&gateway, "u1@test")?;
    cluster.stop(0);

    for email in ["u2@test", "u3@test", "u4@test", "u5@test"] {
        cluster.register(&gateway, email)?;
    }
    cluster.wait_for_log_index(2, 5)?;

    // The restarted node recovers all five entries via catch-up.
    cluster.start(0)?;
    cluster.wait_for_log_index(0, 5)?;
    assert_eq!(cluster.log_file_count(0)?, 5);
    Ok(())
}

#[test]
fn elects_next_replica_on_leader_crash() -> TestResult {
    let mut cluster = TestCluster::run(3)?;
    let gateway = cluster.gateway()?;

    cluster.register(&gateway, "a@b")?;
    cluster.wait_for_log_index(1, 1)?;
    cluster.wait_for_log_index(0, 1)?;
    cluster.stop(2);

    // The next write forces rediscovery; it only succeeds once replica 1 has
    // detected the crash and won the election.
    cluster.register(&gateway, "c@d")?;
    assert_eq!(gateway.find_leader()?, cluster.addr(1));

    // The new leader fans out to the surviving backup, which accepts the
    // entries exactly because it considers replica 1 the leader now.
    cluster.wait_for_log_index(0, 2)?;
    Ok(())
}

#[test]
fn replaces_diverged_backup_log() -> TestResult {
    let mut cluster = TestCluster::run(2)?;
    let gateway = cluster.gateway()?;

    cluster.register(&gateway, "a@b")?;
    cluster.stop(0);
    for email in ["b@c", "c@d"] {
        cluster.register(&gateway, email)?;
    }
    cluster.wait_for_log_index(1, 3)?;

    // Fabricate a rogue log on node 0, longer than the leader's, as if
    // carried over from a previous leadership. Wipe its database so the
    // replayed entries apply cleanly.
    std::fs::remove_dir_all(cluster.log_dir(0))?;
    std::fs::create_dir_all(cluster.log_dir(0))?;
    std::fs::remove_file(cluster.dir.path().join("node-0").join("mechat0.sqlite"))?;
    for index in 1..=9u64 {
        let entry = Entry {
            index,
            sql: "INSERT INTO users (password, email, firstname, lastname, descr) \
                  VALUES (?, ?, ?, ?, ?)"
                .into(),
            args: vec![
                "hash".into(),
                format!("rogue{index}@test").into(),
                "Rogue".into(),
                "User".into(),
                "".into(),
            ],
            timestamp: Utc::now(),
        };
        std::fs::write(
            cluster.log_dir(0).join(format!("log-{index}.json")),
            serde_json::to_vec_pretty(&entry)?,
        )?;
    }

    // On restart the leader finds the longer log, erases it, and re-seeds
    // it with its own three entries.
    cluster.start(0)?;
    cluster.wait_for_log_index(0, 3)?;
    assert_eq!(cluster.log_file_count(0)?, 3);

    // The rogue entries are gone for good.
    assert!(!cluster.log_dir(0).join("log-9.json").try_exists()?);
    Ok(())
}

#[test]
fn synchronizes_skewed_clocks() -> TestResult {
    let mut cluster = TestCluster::run(2)?;
    let gateway = cluster.gateway()?;
    cluster.register(&gateway, "a@b")?;

    // Rejoin node 0 with an hour of skew. The Berkeley passes converge the
    // two clocks onto their mutual average, so the skew between them (not
    // the skew from UTC) shrinks to sampling noise.
    cluster.stop(0);
    cluster.start_skewed(0, 3600)?;

    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    loop {
        if Instant::now() >= deadline {
            return Err("clocks did not converge".into());
        }
        std::thread::sleep(Duration::from_millis(500));

        let times = (
            call(&cluster.addr(0), PROBE_TIMEOUT, &Request::GetTime),
            call(&cluster.addr(1), PROBE_TIMEOUT, &Request::GetTime),
        );
        let (Ok(Response::Time(t0)), Ok(Response::Time(t1))) = times else {
            continue;
        };
        if (t0 - t1).abs() < chrono::TimeDelta::seconds(2) {
            return Ok(());
        }
    }
}

#[test]
fn backup_refuses_direct_writes() -> TestResult {
    let cluster = TestCluster::run(2)?;
    let gateway = cluster.gateway()?;
    cluster.register(&gateway, "a@b")?;

    // Once node 0 has accepted the replicated entry it has converged on
    // node 1 as leader, so a client write against it must be refused.
    cluster.wait_for_log_index(0, 1)?;
    let request = Request::SaveMessage(mechat::store::ChatMessage {
        message: "hi".into(),
        timestamp: "12:00".into(),
        from: 1,
        to: 1,
        acked: 1,
    });
    assert_eq!(call(&cluster.addr(0), PROBE_TIMEOUT, &request), Err(Error::NotAuthoritative));
    Ok(())
}
