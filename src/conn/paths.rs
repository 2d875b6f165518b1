//! Channel naming.
//!
//! Every connection's OS resources are derived from its id under a
//! well-known runtime directory, so the two sides can find each other with
//! nothing but the id from the handshake. Direction prefixes are from the
//! client's point of view relative to the host: `c2h` is client→host, `h2c`
//! is host→client.

use std::path::{Path, PathBuf};

use crate::protocol::ClientId;

/// Resolves the filesystem paths and queue names for a connection id.
#[derive(Debug, Clone)]
pub struct ChannelDirs {
    dir: PathBuf,
    mq_prefix: String,
}

impl ChannelDirs {
    /// The well-known runtime directory: `$XDG_RUNTIME_DIR`, then `$TMPDIR`,
    /// then `/tmp`.
    #[must_use]
    pub fn from_env() -> Self {
        let dir = std::env::var_os("XDG_RUNTIME_DIR")
            .or_else(|| std::env::var_os("TMPDIR"))
            .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
        Self::at(dir, "hearth")
    }

    /// Roots channels under an explicit directory with an explicit queue
    /// namespace. Tests use this to keep runs isolated.
    #[must_use]
    pub fn at(dir: impl Into<PathBuf>, mq_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            mq_prefix: mq_prefix.into(),
        }
    }

    /// The directory fifos and sockets live in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the client→host fifo for `id`.
    #[must_use]
    pub fn fifo_c2h(&self, id: ClientId) -> PathBuf {
        self.dir.join(format!("hearth_fifo_c2h_{id}"))
    }

    /// Path of the host→client fifo for `id`.
    #[must_use]
    pub fn fifo_h2c(&self, id: ClientId) -> PathBuf {
        self.dir.join(format!("hearth_fifo_h2c_{id}"))
    }

    /// Name of the client→host message queue for `id`. Queue names live in
    /// the kernel's own namespace and must start with `/`.
    #[must_use]
    pub fn mq_c2h(&self, id: ClientId) -> String {
        format!("/{}_mq_c2h_{id}", self.mq_prefix)
    }

    /// Name of the host→client message queue for `id`.
    #[must_use]
    pub fn mq_h2c(&self, id: ClientId) -> String {
        format!("/{}_mq_h2c_{id}", self.mq_prefix)
    }

    /// Path of the stream socket for `id`.
    #[must_use]
    pub fn socket(&self, id: ClientId) -> PathBuf {
        self.dir.join(format!("hearth_sock_{id}"))
    }
}

impl Default for ChannelDirs {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_keyed_by_id_and_direction() {
        let dirs = ChannelDirs::at("/run/x", "t");
        assert_eq!(dirs.fifo_c2h(7), PathBuf::from("/run/x/hearth_fifo_c2h_7"));
        assert_eq!(dirs.fifo_h2c(7), PathBuf::from("/run/x/hearth_fifo_h2c_7"));
        assert_eq!(dirs.mq_c2h(7), "/t_mq_c2h_7");
        assert_eq!(dirs.mq_h2c(7), "/t_mq_h2c_7");
        assert_eq!(dirs.socket(7), PathBuf::from("/run/x/hearth_sock_7"));
    }
}
