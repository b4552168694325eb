//! Data encodings.
//!
//! The network protocol between replicas and gateways uses bincode, a
//! Rust-specific binary encoding. That is fine here since both ends of every
//! connection run the same binary version. The on-disk log entry files use
//! JSON instead (via serde_json, see the replica log module) so they stay
//! inspectable during repair.

use crate::error::Result;

use bincode::Options as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Returns the bincode options for the wire format. DefaultOptions uses
/// variable-length integer encoding, unlike the top-level bincode functions,
/// and is a zero-sized value that is cheaper to build than to cache.
fn options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
}

/// Returns true if the error just means the peer hung up before sending
/// another value, which ends a session rather than failing it.
fn disconnected(err: &bincode::Error) -> bool {
    use std::io::ErrorKind;
    match &**err {
        bincode::ErrorKind::Io(err) => {
            matches!(err.kind(), ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset)
        }
        _ => false,
    }
}

/// A serializable value that can travel over the wire. The RPC request and
/// response types implement this to pick up the bincode helpers.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value into a byte vector.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(options().serialize(self)?)
    }

    /// Encodes the value into a writer.
    fn encode_into<W: std::io::Write>(&self, writer: W) -> Result<()> {
        Ok(options().serialize_into(writer, self)?)
    }

    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(options().deserialize(bytes)?)
    }

    /// Decodes a value from a reader.
    fn decode_from<R: std::io::Read>(reader: R) -> Result<Self> {
        Ok(options().deserialize_from(reader)?)
    }

    /// Decodes a value from a reader, or returns None if the connection was
    /// closed cleanly.
    fn maybe_decode_from<R: std::io::Read>(reader: R) -> Result<Option<Self>> {
        match options().deserialize_from(reader) {
            Ok(value) => Ok(Some(value)),
            Err(err) if disconnected(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

// RPC handler outcomes are sent across the wire as Result<Response>.
impl<V: Value> Value for Result<V> {}
