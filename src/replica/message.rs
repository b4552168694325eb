use super::log::{Entry, Index};
use super::{Pid, ReplicaAddr};
use crate::encoding::Value as _;
use crate::error::Result;
use crate::store::{Account, ChatMessage, Credentials, Profile};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::io::Write as _;
use std::net::TcpStream;
use std::time::Duration;

/// The literal heartbeat reply token.
pub const STATUS_OK: &str = "STATUSOK";

/// A request to a replica. The whole RPC surface is one tagged union,
/// dispatched by a single match in the server: replication and repair,
/// bully election, clock synchronization, and the chat API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Heartbeat probe; answered with the STATUSOK token.
    Status,
    /// Identity probe; answered with the replica's PID.
    GetPid,
    /// Asks for the replica's current log index.
    LogStatus,
    /// Ships a batch of log entries for a backup to apply.
    ApplyEntries(Vec<Entry>),
    /// Asks a backup to wipe its log (divergence repair).
    EraseLogs,
    /// Asks the leader to ship its full log to the given replica.
    Catchup { id: Pid },
    /// A bully ELECTION message from a lower replica.
    Election { from: Pid },
    /// A bully LEADER announcement.
    Leader { from: Pid },
    /// Samples the replica's network time.
    GetTime,
    /// Tells the replica to shift its clock offset by the given amount.
    AdjustTime { delta_us: i64 },

    // The chat API, entering through the gateway. Writes are only accepted
    // by the leader; reads are served from the local store.
    CreateAccount(Account),
    Login(Credentials),
    SaveMessage(ChatMessage),
    AddContact { user_id: i64, contact_id: i64 },
    Contacts { user_id: i64 },
    AllUsers,
    Messages { user_id: i64, contact_id: i64 },

    /// A new leader pushing its address to a gateway's steering port. Only
    /// ever handled by gateways, never by replicas.
    LeaderAddress(ReplicaAddr),
}

/// A response from a replica. Variants correspond to the requests above;
/// handler errors travel as the Err arm of the Result<Response> reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// A replication/election acknowledgement.
    Ack(Ack),
    /// The replica's PID.
    Pid(Pid),
    /// The replica's current log index.
    LogStatus { log_index: Index },
    /// The replica's network time.
    Time(DateTime<Utc>),
    /// A registered or logged-in user.
    Profile(Profile),
    /// The row ID of a freshly created user.
    UserId(i64),
    /// A contact or user listing.
    Contacts(Vec<Profile>),
    /// A message history.
    Messages(Vec<ChatMessage>),
    /// Generic success without a payload.
    Ok,
}

/// A replication acknowledgement, also reused by the heartbeat and election
/// exchanges: a status probe answers with last_index -1 and the STATUSOK
/// token, and an election reply carries the responder's PID in last_index
/// (-1 meaning the sender was not bullied).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub last_index: i64,
    pub message: String,
}

impl Ack {
    /// The heartbeat acknowledgement.
    pub fn status_ok() -> Self {
        Ack { success: true, last_index: -1, message: STATUS_OK.into() }
    }
}

impl crate::encoding::Value for Request {}
impl crate::encoding::Value for Response {}

/// Dials a replica and performs a single request/response call. The timeout
/// bounds the dial as well as every read and write on the connection, and
/// the connection is dropped after the reply; there are no per-call retries
/// anywhere in the core, reconciliation is the retry mechanism.
pub fn call(addr: &ReplicaAddr, timeout: Duration, request: &Request) -> Result<Response> {
    let stream = TcpStream::connect_timeout(&addr.socket_addr()?, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let mut writer = std::io::BufWriter::new(stream.try_clone()?);
    let mut reader = std::io::BufReader::new(stream);
    request.encode_into(&mut writer)?;
    writer.flush()?;
    Result::<Response>::decode_from(&mut reader)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::error::Error;
    use crate::store::Value;

    #[test]
    fn request_round_trip() -> Result<()> {
        let request = Request::ApplyEntries(vec![Entry {
            index: 3,
            sql: "INSERT INTO users (email) VALUES (?)".into(),
            args: vec![Value::Text("a@b".into()), Value::Integer(-1), Value::Null],
            timestamp: Utc::now(),
        }]);
        assert_eq!(Request::decode(&request.encode()?)?, request);
        Ok(())
    }

    #[test]
    fn result_response_round_trip() -> Result<()> {
        let ok: Result<Response> = Ok(Response::Ack(Ack::status_ok()));
        let encoded = ok.encode()?;
        assert_eq!(Result::<Response>::decode(&encoded)?, ok);

        let err: Result<Response> = Err(Error::NotAuthoritative);
        let encoded = err.encode()?;
        assert_eq!(Result::<Response>::decode(&encoded)?, err);
        Ok(())
    }

    #[test]
    fn status_ack_token() {
        let ack = Ack::status_ok();
        assert!(ack.success);
        assert_eq!(ack.last_index, -1);
        assert_eq!(ack.message, STATUS_OK);
    }
}
