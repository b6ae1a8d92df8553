use std::sync::Mutex;

use crate::error::Result;

/// Storage capability a node replicates through.
///
/// A store holds exactly one value: the state bytes and their version. The
/// leader and each follower own an independent instance; they do not need to
/// be the same variant. Implementations must tolerate concurrent `get`/`put`
/// from multiple tasks.
pub trait Datastore: Send + Sync + 'static {
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn get(&self) -> Result<(u64, Vec<u8>)>;
    fn put(&self, version: u64, data: &[u8]) -> Result<()>;
}

/// Volatile in-memory store. The usual choice for follower mirrors, which can
/// always re-bootstrap from the leader.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<(u64, Vec<u8>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Datastore for MemoryStore {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn get(&self) -> Result<(u64, Vec<u8>)> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state.clone())
    }

    fn put(&self, version: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        *state = (version, data.to_vec());
        Ok(())
    }
}
