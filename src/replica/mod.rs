//! The replication core: replica state, the append-only command log, the
//! bully elector and failure detector, Berkeley clock synchronization, and
//! the RPC server tying them together.

mod addrs;
mod clock;
mod elector;
mod log;
mod message;
mod node;
mod server;
mod sync;

pub use addrs::{AddressBook, ReplicaAddr};
pub use clock::Clock;
pub use log::{Entry, Index, Log};
pub use message::{call, Ack, Request, Response, STATUS_OK};
pub use node::Replica;
pub use server::Server;

use std::time::Duration;

/// A replica ID: the zero-based index into the static address list. Kept
/// signed so that -1 can mean "unknown" in leader bookkeeping and on the
/// wire.
pub type Pid = i64;

/// Upper bound for one-way message transmission.
const TRANSMISSION_BOUND: Duration = Duration::from_millis(100);

/// Upper bound for request processing on a healthy replica.
const PROCESSING_BOUND: Duration = Duration::from_millis(25);

/// Heartbeat probe timeout: a reply to a status probe should arrive within
/// two transmissions plus one processing interval.
pub const DETECTOR_TIMEOUT: Duration = Duration::from_millis(
    2 * TRANSMISSION_BOUND.as_millis() as u64 + PROCESSING_BOUND.as_millis() as u64,
);

/// Interval between heartbeat probes (and between leader reconcile passes).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Dial timeout for shipping log entries to a backup.
pub const REPLICATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Dial timeout for election and leader announcements, and for the
/// reconcile/time-sync probes.
pub const ELECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// How long an elector waits for a higher replica to take over.
pub const ELECTION_WAIT: Duration = Duration::from_secs(1);

/// Dial timeout for pushing the leader address to a cached client.
pub const STEERING_TIMEOUT: Duration = Duration::from_secs(2);

/// The fixed port on which gateways listen for leader address pushes.
pub const STEERING_PORT: u16 = 59999;
