use super::message::{Request, Response};
use super::node::Replica;
use crate::encoding::Value as _;
use crate::errdata;
use crate::error::Result;

use log::{debug, error, info, warn};
use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// The replica RPC server: accepts connections, dispatches requests against
/// the shared replica state, and writes Result<Response> replies. One thread
/// per accepted connection; the single tagged Request union is routed by one
/// match.
pub struct Server {
    replica: Arc<Replica>,
}

impl Server {
    /// Creates a server around the given replica.
    pub fn new(replica: Arc<Replica>) -> Self {
        Server { replica }
    }

    /// Serves connections on the given listener, forever. Once the listener
    /// is bound, the startup sequence (leader discovery and initial
    /// catch-up) and the heartbeat monitor run in a background thread.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        info!("replica {} listening on {}", self.replica.pid(), listener.local_addr()?);

        let replica = Arc::clone(&self.replica);
        std::thread::spawn(move || {
            // Give the other replicas a moment to bind before probing them.
            std::thread::sleep(super::HEARTBEAT_INTERVAL);
            replica.startup();
            replica.monitor();
        });

        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {e}");
                    continue;
                }
            };
            let replica = Arc::clone(&self.replica);
            std::thread::spawn(move || {
                debug!("connection from {peer}");
                if let Err(e) = Self::session(replica, stream) {
                    warn!("session with {peer} failed: {e}");
                }
                debug!("connection from {peer} closed");
            });
        }
    }

    /// Serves one connection: cache the caller's address for leader
    /// steering, then answer requests until the peer hangs up. Handler
    /// errors travel back to the caller inside the reply; only transport
    /// failures tear down the session.
    fn session(replica: Arc<Replica>, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?;
        if let Err(e) = replica.cache_ip(&peer.ip().to_string()) {
            warn!("failed to cache client address {}: {e}", peer.ip());
        }
        let mut reader = std::io::BufReader::new(stream.try_clone()?);
        let mut writer = std::io::BufWriter::new(stream);
        while let Some(request) = Request::maybe_decode_from(&mut reader)? {
            let response = Self::dispatch(&replica, request);
            if let Err(ref e) = response {
                debug!("request from {peer} failed: {e}");
            }
            response.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Routes one request to its handler.
    fn dispatch(replica: &Arc<Replica>, request: Request) -> Result<Response> {
        match request {
            Request::Status => replica.status(),
            Request::GetPid => Ok(Response::Pid(replica.pid())),
            Request::LogStatus => replica.log_status(),
            Request::ApplyEntries(entries) => replica.apply_entries(entries),
            Request::EraseLogs => replica.erase_logs(),
            Request::Catchup { id } => replica.catchup(id),
            Request::Election { from } => Arc::clone(replica).handle_election(from),
            Request::Leader { from } => replica.handle_leader(from),
            Request::GetTime => replica.get_time(),
            Request::AdjustTime { delta_us } => replica.adjust_time(delta_us),
            Request::CreateAccount(account) => Arc::clone(replica).create_account(account),
            Request::Login(credentials) => replica.login(credentials),
            Request::SaveMessage(message) => Arc::clone(replica).save_message(message),
            Request::AddContact { user_id, contact_id } => {
                Arc::clone(replica).add_contact(user_id, contact_id)
            }
            Request::Contacts { user_id } => replica.contacts(user_id),
            Request::AllUsers => replica.all_users(),
            Request::Messages { user_id, contact_id } => replica.messages(user_id, contact_id),
            Request::LeaderAddress(_) => errdata!("steering messages are not served by replicas"),
        }
    }
}
