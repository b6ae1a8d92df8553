use std::fmt;
use std::sync::Weak;

use crate::error::{Error, Result};
use crate::{follower, leader, supervisor};

/// Immutable view of the replicated state at one point in time.
///
/// A handle remembers which node produced it, so [`Version::update`] can
/// attempt an optimistic write on top of exactly the state the holder saw.
/// The reference is weak: a handle that outlives its node fails `update`
/// with [`Error::NodeClosed`] instead of writing through a dead role.
#[derive(Clone)]
pub struct Version {
    version: u64,
    data: Vec<u8>,
    writer: Writer,
}

#[derive(Clone)]
pub(crate) enum Writer {
    Leader(Weak<leader::Core>),
    Follower(Weak<follower::Core>),
    Supervisor(Weak<supervisor::Inner>),
}

impl Version {
    pub(crate) fn new(version: u64, data: Vec<u8>, writer: Writer) -> Self {
        Self {
            version,
            data,
            writer,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Replace the state with `data`, expecting the state to still be at this
    /// handle's version. Fails with [`Error::VersionMismatch`] if another
    /// writer got there first.
    pub async fn update(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        match &self.writer {
            Writer::Leader(core) => {
                let core = core.upgrade().ok_or(Error::NodeClosed)?;
                core.apply(self.version, data).await
            }
            Writer::Follower(core) => {
                let core = core.upgrade().ok_or(Error::NodeClosed)?;
                core.write(self.version, data).await
            }
            Writer::Supervisor(inner) => {
                let inner = inner.upgrade().ok_or(Error::NodeClosed)?;
                inner.write(self.version, data).await
            }
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Version")
            .field("version", &self.version)
            .field("len", &self.data.len())
            .finish()
    }
}
