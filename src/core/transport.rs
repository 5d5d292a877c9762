//! Purpose: Map pipe addresses to shared directories and move envelope files.
//! Exports: `Transport`, `default_root`, `MESSAGE_EXTENSION`.
//! Role: The only module that touches message files on disk.
//! Invariants: Address resolution is deterministic and idempotent; invalid
//! path characters in a key are substituted with `_`.
//! Invariants: Message files are written once under a random unique name and
//! deleted only by the retention sweeper, never by a reader.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use getrandom::fill as fill_random;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::core::envelope::{Address, Envelope};
use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::sweep;

pub(crate) const MESSAGE_EXTENSION: &str = "fp";

/// Shared, host-local root for all channel directories. `FILEPIPE_DIR`
/// overrides the default for tests and sandboxed deployments.
pub fn default_root() -> PathBuf {
    if let Some(dir) = std::env::var_os("FILEPIPE_DIR") {
        return PathBuf::from(dir);
    }
    std::env::temp_dir().join("filepipe")
}

#[derive(Clone, Debug)]
pub(crate) struct Transport {
    root: PathBuf,
    retention: Duration,
}

impl Transport {
    pub(crate) fn new(root: PathBuf, retention: Duration) -> Self {
        Self { root, retention }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn retention(&self) -> Duration {
        self.retention
    }

    /// Resolve an address to its channel directory, creating it on first use
    /// with broad local-user access so unrelated processes can write into it.
    pub(crate) fn resolve(&self, address: &Address) -> Result<PathBuf, Error> {
        let dir = self.root.join(sanitize_key(&address.key()));
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir).map_err(|err| {
                Error::new(io_error_kind(&err))
                    .with_message("failed to create channel directory")
                    .with_address(address.key())
                    .with_path(&dir)
                    .with_source(err)
            })?;
            // Other users on this host must be able to write and sweep here;
            // a refusal mirrors pre-existing directories we don't own.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777));
            }
        }
        Ok(dir)
    }

    /// Pick a unique destination for one message. The caller learns the path
    /// before any bytes land on disk, so it can suppress its own watcher
    /// ahead of the write.
    pub(crate) fn new_message_path(&self, address: &Address) -> Result<PathBuf, Error> {
        let dir = self.resolve(address)?;
        let token = message_token()?;
        Ok(dir.join(format!("{token}.{MESSAGE_EXTENSION}")))
    }

    /// Serialize and write one envelope, then schedule a retention sweep for
    /// its directory.
    pub(crate) fn write<T: Serialize>(
        &self,
        path: &Path,
        envelope: &Envelope<T>,
    ) -> Result<(), Error> {
        let bytes = envelope.to_bytes()?;
        std::fs::write(path, &bytes).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to write message")
                .with_address(envelope.key.clone())
                .with_path(path)
                .with_source(err)
        })?;
        trace!(path = %path.display(), request = envelope.request, "delivered message");
        if let Some(dir) = path.parent() {
            sweep::schedule(dir, self.retention);
        }
        Ok(())
    }

    /// Read one envelope back. A vanished file lost a race with the sweeper
    /// and undecodable content is a partial write or a foreign payload; both
    /// mean "no message". Permission and unexpected I/O failures propagate.
    pub(crate) fn read<T: DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<Envelope<T>>, Error> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::new(io_error_kind(&err))
                    .with_message("failed to read message")
                    .with_path(path)
                    .with_source(err));
            }
        };
        Ok(Envelope::from_bytes(&bytes))
    }
}

fn message_token() -> Result<String, Error> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate message token: {err}"))
    })?;
    Ok(hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(nibble_hex(byte >> 4));
        out.push(nibble_hex(byte & 0x0f));
    }
    out
}

fn nibble_hex(nibble: u8) -> char {
    match nibble {
        0..=9 => char::from(b'0' + nibble),
        _ => char::from(b'a' + (nibble - 10)),
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect()
}
