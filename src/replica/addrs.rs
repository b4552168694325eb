use super::Pid;
use crate::error::Result;
use crate::errinput;

use serde_derive::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::path::Path;

/// A replica network address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicaAddr {
    pub host: String,
    pub port: u16,
}

impl ReplicaAddr {
    /// Parses a host:port line from the address file.
    fn parse(line: &str) -> Result<Self> {
        let Some((host, port)) = line.rsplit_once(':') else {
            return errinput!("invalid replica address '{line}'");
        };
        if host.is_empty() {
            return errinput!("invalid replica address '{line}'");
        }
        Ok(ReplicaAddr { host: host.to_owned(), port: port.parse()? })
    }

    /// Resolves the address for dialing.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        match (self.host.as_str(), self.port).to_socket_addrs()?.next() {
            Some(addr) => Ok(addr),
            None => errinput!("address {self} did not resolve"),
        }
    }
}

impl std::fmt::Display for ReplicaAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The static replica address list. A replica's PID is its position in the
/// list, so the cluster membership and every identity in it are fixed at
/// startup.
#[derive(Clone, Debug)]
pub struct AddressBook {
    addrs: Vec<ReplicaAddr>,
}

impl AddressBook {
    /// Loads the address book from a newline-separated host:port file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parses the address book from newline-separated host:port records.
    pub fn parse(text: &str) -> Result<Self> {
        let addrs = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ReplicaAddr::parse)
            .collect::<Result<Vec<_>>>()?;
        if addrs.is_empty() {
            return errinput!("address file contains no replica addresses");
        }
        Ok(AddressBook { addrs })
    }

    /// Returns the address of the given replica.
    pub fn get(&self, pid: Pid) -> Result<&ReplicaAddr> {
        match usize::try_from(pid).ok().and_then(|i| self.addrs.get(i)) {
            Some(addr) => Ok(addr),
            None => errinput!("no replica with PID {pid}"),
        }
    }

    /// Returns the number of replicas.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Returns true if the address book is empty. Never the case after
    /// parsing, but keeps clippy and callers honest.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Returns the highest PID in the cluster.
    pub fn max_pid(&self) -> Pid {
        self.addrs.len() as Pid - 1
    }

    /// Iterates over (pid, address) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Pid, &ReplicaAddr)> {
        self.addrs.iter().enumerate().map(|(i, addr)| (i as Pid, addr))
    }

    /// Iterates over all peers except the given replica.
    pub fn peers(&self, pid: Pid) -> impl Iterator<Item = (Pid, &ReplicaAddr)> {
        self.iter().filter(move |(i, _)| *i != pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_file() -> Result<()> {
        let book = AddressBook::parse("127.0.0.1:16000\nlocalhost:16001\n\n")?;
        assert_eq!(book.len(), 2);
        assert_eq!(book.max_pid(), 1);
        assert_eq!(book.get(0)?.port, 16000);
        assert_eq!(book.get(1)?.host, "localhost");
        assert!(book.get(2).is_err());
        assert!(book.get(-1).is_err());
        Ok(())
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(AddressBook::parse("127.0.0.1").is_err());
        assert!(AddressBook::parse("127.0.0.1:notaport").is_err());
        assert!(AddressBook::parse(":16000").is_err());
        assert!(AddressBook::parse("").is_err());
    }

    #[test]
    fn peers_excludes_self() -> Result<()> {
        let book = AddressBook::parse("a:1\nb:2\nc:3")?;
        let peers: Vec<Pid> = book.peers(1).map(|(pid, _)| pid).collect();
        assert_eq!(peers, vec![0, 2]);
        Ok(())
    }
}
