//! Purpose: Define the pipe address scheme and the on-disk message envelope.
//! Exports: `Address`, `Envelope`, `DEFAULT_CHANNEL`.
//! Role: Shared wire contract for every writer and reader on one address.
//! Invariants: The canonical key is `"channel-name"`; channel and name are never empty.
//! Invariants: An envelope with an empty key is invalid and is dropped by readers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_CHANNEL: &str = "pipe";

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Address {
    channel: String,
    name: String,
}

impl Address {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let channel = channel.into();
        if name.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("pipe name must not be empty"));
        }
        if channel.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("channel must not be empty"));
        }
        Ok(Self { channel, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Canonical address key shared by every process on this host.
    pub fn key(&self) -> String {
        format!("{}-{}", self.channel, self.name)
    }
}

/// One message as written to disk. All writers and readers on an address must
/// agree on the payload type `T`; a decode failure on a foreign payload is
/// treated as "no message" by the reader.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Envelope<T> {
    pub key: String,
    pub data_type: String,
    pub data: T,
    pub request: bool,
}

impl<T> Envelope<T> {
    pub fn new(address: &Address, data: T, request: bool) -> Self {
        Self {
            key: address.key(),
            data_type: std::any::type_name::<T>().to_string(),
            data,
            request,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode envelope")
                .with_address(self.key.clone())
                .with_source(err)
        })
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decode an envelope, treating malformed or foreign-typed content as
    /// absent rather than an error.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let envelope: Self = serde_json::from_slice(bytes).ok()?;
        if !envelope.is_valid() {
            return None;
        }
        Some(envelope)
    }
}
