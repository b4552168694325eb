#![warn(clippy::all)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod replica;
pub mod store;

pub use client::Gateway;
pub use error::{Error, Result};
pub use replica::{Replica, Server};
