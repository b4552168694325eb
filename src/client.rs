//! The gateway-side client.
//!
//! A gateway is stateless apart from the cached address of the current
//! leader. It finds the leader by probing every replica for its PID and
//! adopting the highest responder, rediscovers it the same way whenever a
//! call fails, and accepts proactive leader-address pushes on the steering
//! port after elections. Chat requests are issued against the leader;
//! passwords are hashed here so plaintext never crosses the wire.

use crate::encoding::Value as _;
use crate::errdata;
use crate::error::{Error, Result};
use crate::replica::{
    call, AddressBook, Pid, ReplicaAddr, Request, Response, STEERING_PORT,
};
use crate::store::{Account, ChatMessage, Credentials, Profile};

use chrono::Utc;
use log::{debug, info, warn};
use sha2::{Digest as _, Sha256};
use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Probe timeout during leader rediscovery. Deliberately tight: a scan
/// visits every replica, most of which may be down.
const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for regular gateway calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// A chat gateway.
pub struct Gateway {
    /// The static replica address list.
    addrs: AddressBook,
    /// The cached current-leader address, if known.
    leader: Mutex<Option<ReplicaAddr>>,
}

impl Gateway {
    /// Creates a gateway over the given replica addresses.
    pub fn new(addrs: AddressBook) -> Self {
        Gateway { addrs, leader: Mutex::new(None) }
    }

    /// One rediscovery scan: probe every replica for its PID and adopt the
    /// highest responder as leader. Fails with NoLeader if nobody answers.
    pub fn find_leader(&self) -> Result<ReplicaAddr> {
        let mut leader: Option<(Pid, ReplicaAddr)> = None;
        for (pid, addr) in self.addrs.iter() {
            match call(addr, DISCOVERY_TIMEOUT, &Request::GetPid) {
                Ok(Response::Pid(reply)) => {
                    if leader.as_ref().map_or(true, |(best, _)| reply > *best) {
                        leader = Some((reply, addr.clone()));
                    }
                }
                Ok(response) => warn!("unexpected PID reply from {pid}: {response:?}"),
                Err(e) => debug!("replica {pid} unreachable: {e}"),
            }
        }
        let Some((pid, addr)) = leader else {
            return Err(Error::NoLeader);
        };
        info!("leader is replica {pid} at {addr}");
        *self.leader.lock()? = Some(addr.clone());
        Ok(addr)
    }

    /// Blocks until some replica responds, retrying the scan indefinitely
    /// with no backoff.
    fn discover(&self) -> Result<ReplicaAddr> {
        loop {
            match self.find_leader() {
                Ok(addr) => return Ok(addr),
                Err(Error::NoLeader) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Performs a call against the current leader. On a transport failure,
    /// or when the callee turns out not to be the leader anymore, the leader
    /// is rediscovered and the request retried there; the client sees at
    /// most one such hiccup per call.
    pub fn call(&self, request: &Request) -> Result<Response> {
        let addr = match self.leader.lock()?.clone() {
            Some(addr) => addr,
            None => self.discover()?,
        };
        match call(&addr, CALL_TIMEOUT, request) {
            Err(Error::IO(_)) | Err(Error::NotAuthoritative) => {
                let addr = self.discover()?;
                call(&addr, CALL_TIMEOUT, request)
            }
            result => result,
        }
    }

    /// Runs the steering listener: accepts leader-address pushes on the
    /// fixed steering port and updates the cached leader. Returns the
    /// listener thread's handle.
    pub fn listen_for_leader(self: Arc<Self>) -> Result<std::thread::JoinHandle<()>> {
        let listener = TcpListener::bind(("0.0.0.0", STEERING_PORT))?;
        info!("listening for leader updates on {}", listener.local_addr()?);
        Ok(std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                if let Err(e) = self.steering_session(stream) {
                    debug!("steering session failed: {e}");
                }
            }
        }))
    }

    /// Serves one steering connection from a freshly elected leader.
    fn steering_session(&self, stream: TcpStream) -> Result<()> {
        let mut reader = std::io::BufReader::new(stream.try_clone()?);
        let mut writer = std::io::BufWriter::new(stream);
        while let Some(request) = Request::maybe_decode_from(&mut reader)? {
            let response = match request {
                Request::LeaderAddress(addr) => {
                    info!("new leader announced itself at {addr}");
                    *self.leader.lock()? = Some(addr);
                    Ok(Response::Ok)
                }
                request => errdata!("unexpected steering request {request:?}"),
            };
            response.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Hashes a password for the wire.
    fn hash_password(password: &str) -> String {
        hex::encode(Sha256::digest(password))
    }

    /// Registers a new account and returns its profile.
    pub fn create_account(
        &self,
        email: &str,
        password: &str,
        firstname: &str,
        lastname: &str,
        descr: &str,
    ) -> Result<Profile> {
        let account = Account {
            email: email.into(),
            password: Self::hash_password(password),
            firstname: firstname.into(),
            lastname: lastname.into(),
            descr: descr.into(),
        };
        match self.call(&Request::CreateAccount(account.clone()))? {
            Response::UserId(user_id) => Ok(Profile {
                user_id,
                email: account.email,
                firstname: account.firstname,
                lastname: account.lastname,
                descr: account.descr,
            }),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Logs in and returns the user's profile.
    pub fn login(&self, email: &str, password: &str) -> Result<Profile> {
        let credentials =
            Credentials { email: email.into(), password: Self::hash_password(password) };
        match self.call(&Request::Login(credentials))? {
            Response::Profile(profile) => Ok(profile),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Sends a chat message.
    pub fn send_message(&self, from: i64, to: i64, text: &str) -> Result<()> {
        let message = ChatMessage {
            message: text.into(),
            timestamp: Utc::now().to_rfc3339(),
            from,
            to,
            acked: 1,
        };
        match self.call(&Request::SaveMessage(message))? {
            Response::Ok => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Adds a mutual contact between two users.
    pub fn add_contact(&self, user_id: i64, contact_id: i64) -> Result<()> {
        match self.call(&Request::AddContact { user_id, contact_id })? {
            Response::Ok => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Lists a user's contacts.
    pub fn contacts(&self, user_id: i64) -> Result<Vec<Profile>> {
        match self.call(&Request::Contacts { user_id })? {
            Response::Contacts(contacts) => Ok(contacts),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Lists all registered users.
    pub fn all_users(&self) -> Result<Vec<Profile>> {
        match self.call(&Request::AllUsers)? {
            Response::Contacts(users) => Ok(users),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Lists the message history between two users.
    pub fn messages(&self, user_id: i64, contact_id: i64) -> Result<Vec<ChatMessage>> {
        match self.call(&Request::Messages { user_id, contact_id })? {
            Response::Messages(messages) => Ok(messages),
            response => errdata!("unexpected response {response:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hashing_is_stable_hex() {
        let hash = Gateway::hash_password("hunter2");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, Gateway::hash_password("hunter2"));
        assert_ne!(hash, Gateway::hash_password("hunter3"));
    }

    #[test]
    fn rediscovery_fails_without_replicas() -> Result<()> {
        // Nothing listens on these ports, so the scan comes back empty.
        let gateway = Gateway::new(AddressBook::parse("127.0.0.1:1\n127.0.0.1:2")?);
        assert_eq!(gateway.find_leader(), Err(Error::NoLeader));
        Ok(())
    }
}
