//! Role acquisition and failover.
//!
//! Each process runs one supervisor over the same directory. Acquisition is
//! opportunistic: try to bind the rendezvous socket, and on "already exists"
//! attach to whoever holds it. There is no election and no quorum; the
//! socket's bind atomicity is the whole arbitration. When a follower loses
//! its connection, the supervisor re-runs acquisition, deleting the socket
//! first if dialing it says nobody is listening, so the first process
//! through the retry loop inherits the leader role.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::follower::FollowerNode;
use crate::leader::LeaderNode;
use crate::store::Datastore;
use crate::version::{Version, Writer};

const SOCKET_FILE: &str = "interstate.sock";

const INIT_ATTEMPTS: usize = 10;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Composes a node out of two datastores and keeps one alive across
/// failovers.
///
/// `leader_ds` backs the canonical state if this process wins the leader
/// role; `follower_ds` backs the local mirror if it attaches as a follower.
/// They may be the same instance.
pub struct Supervisor {
    inner: Arc<Inner>,
    reset_rx: StdMutex<Option<mpsc::UnboundedReceiver<()>>>,
    error_rx: StdMutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

pub(crate) struct Inner {
    socket: PathBuf,
    leader_ds: Arc<dyn Datastore>,
    follower_ds: Arc<dyn Datastore>,
    node: StdMutex<Option<Arc<RoleNode>>>,
    watchers: StdMutex<Vec<mpsc::UnboundedSender<Version>>>,
    reset_tx: mpsc::UnboundedSender<()>,
    error_tx: mpsc::UnboundedSender<Error>,
    closed: AtomicBool,
}

/// The role this process currently holds.
pub(crate) enum RoleNode {
    Leader(LeaderNode),
    Follower(FollowerNode),
}

impl RoleNode {
    pub(crate) async fn write(&self, version: u64, data: Vec<u8>) -> Result<()> {
        match self {
            Self::Leader(node) => node.write(version, data).await,
            Self::Follower(node) => node.write(version, data).await,
        }
    }

    fn version(&self) -> Result<u64> {
        match self {
            Self::Leader(node) => node.version(),
            Self::Follower(node) => node.version(),
        }
    }

    fn data(&self) -> Result<Vec<u8>> {
        match self {
            Self::Leader(node) => node.data(),
            Self::Follower(node) => node.data(),
        }
    }

    fn watch(&self, watcher: mpsc::UnboundedSender<Version>) {
        match self {
            Self::Leader(node) => node.watch(watcher),
            Self::Follower(node) => node.watch(watcher),
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::Leader(node) => node.close().await,
            Self::Follower(node) => node.close().await,
        }
    }
}

impl Supervisor {
    pub fn new(
        dir: impl AsRef<Path>,
        leader_ds: Arc<dyn Datastore>,
        follower_ds: Arc<dyn Datastore>,
    ) -> Self {
        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                socket: dir.as_ref().join(SOCKET_FILE),
                leader_ds,
                follower_ds,
                node: StdMutex::new(None),
                watchers: StdMutex::new(Vec::new()),
                reset_tx,
                error_tx,
                closed: AtomicBool::new(false),
            }),
            reset_rx: StdMutex::new(Some(reset_rx)),
            error_rx: StdMutex::new(Some(error_rx)),
        }
    }

    /// Acquire a role and start the failover loop. Calling `open` on an
    /// already-open supervisor is a no-op, and an open that failed may be
    /// retried.
    pub async fn open(&self) -> Result<()> {
        let Some(mut reset_rx) = self
            .reset_rx
            .lock()
            .expect("reset channel lock poisoned")
            .take()
        else {
            return Ok(());
        };

        if let Err(err) = self.inner.init_node_with_retry().await {
            // Hand the channel back; only a successful acquisition marks the
            // supervisor as open.
            *self
                .reset_rx
                .lock()
                .expect("reset channel lock poisoned") = Some(reset_rx);
            return Err(err);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while reset_rx.recv().await.is_some() {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                info!("connection to leader lost, reacquiring role");
                if let Err(err) = inner.init_node_with_retry().await {
                    let _ = inner.error_tx.send(err);
                }
            }
        });

        Ok(())
    }

    /// Close the active node and stop participating in failover. A follower
    /// disconnect observed after this point does not trigger a reset.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let node = self
            .inner
            .node
            .lock()
            .expect("node lock poisoned")
            .take();
        match node {
            Some(node) => node.close().await,
            None => Ok(()),
        }
    }

    /// The current state as an updatable handle.
    pub fn current(&self) -> Result<Version> {
        let node = self.inner.current_node()?;
        let version = node.version()?;
        let data = node.data()?;
        Ok(Version::new(
            version,
            data,
            Writer::Supervisor(Arc::downgrade(&self.inner)),
        ))
    }

    /// Write `data` expecting the state to be at `version`.
    pub async fn write(&self, version: u64, data: impl Into<Vec<u8>>) -> Result<()> {
        self.inner.write(version, data.into()).await
    }

    /// Subscribe to state updates. The subscription survives role
    /// transitions: after a failover the new node keeps feeding the same
    /// receiver.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<Version> {
        let (tx, rx) = mpsc::unbounded_channel();

        let node = self.inner.node.lock().expect("node lock poisoned").clone();
        if let Some(node) = node {
            node.watch(tx.clone());
        }
        self.inner
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .push(tx);

        rx
    }

    /// Failures from the background failover loop, such as an exhausted
    /// retry budget. There is one live receiver; later calls get a channel
    /// that yields nothing.
    pub fn errors(&self) -> mpsc::UnboundedReceiver<Error> {
        self.error_rx
            .lock()
            .expect("error channel lock poisoned")
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1)
    }

    /// Whether this process currently holds the leader role.
    pub fn is_leader(&self) -> bool {
        match &*self.inner.node.lock().expect("node lock poisoned") {
            Some(node) => matches!(node.as_ref(), RoleNode::Leader(_)),
            None => false,
        }
    }
}

impl Inner {
    fn current_node(&self) -> Result<Arc<RoleNode>> {
        self.node
            .lock()
            .expect("node lock poisoned")
            .clone()
            .ok_or(Error::NodeClosed)
    }

    pub(crate) async fn write(&self, version: u64, data: Vec<u8>) -> Result<()> {
        self.current_node()?.write(version, data).await
    }

    /// One acquisition attempt: leader first, follower on "already exists".
    async fn init_node(self: &Arc<Self>) -> Result<()> {
        match LeaderNode::new(&self.socket, self.leader_ds.clone()) {
            Ok(leader) => {
                self.install_node(RoleNode::Leader(leader));
                info!(socket = %self.socket.display(), "acquired leader role");
                return Ok(());
            }
            Err(Error::LeaderAlreadyExists) => {}
            Err(err) => return Err(err),
        }

        let (follower, close_rx) = FollowerNode::new(&self.socket, self.follower_ds.clone()).await?;
        self.install_node(RoleNode::Follower(follower));
        info!(socket = %self.socket.display(), "attached as follower");

        let inner = self.clone();
        tokio::spawn(async move {
            let _ = close_rx.await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let _ = inner.reset_tx.send(());
        });

        Ok(())
    }

    async fn init_node_with_retry(self: &Arc<Self>) -> Result<()> {
        for attempt in 0..INIT_ATTEMPTS {
            match self.init_node().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if matches!(err, Error::LeaderClosed) {
                        info!("leader socket is stale, removing it before the next attempt");
                        if let Err(err) = fs_err::remove_file(&self.socket) {
                            if err.kind() != io::ErrorKind::NotFound {
                                warn!(error = %err, "failed to remove stale socket");
                            }
                        }
                    }
                    debug!(attempt, error = %err, "failed to initialize node");
                    sleep(RETRY_DELAY).await;
                }
            }
        }

        Err(Error::RetriesExhausted)
    }

    /// Swap in a freshly acquired node and re-register every live watcher
    /// with it.
    fn install_node(&self, node: RoleNode) {
        let node = Arc::new(node);
        {
            let watchers = self.watchers.lock().expect("watchers lock poisoned");
            for watcher in watchers.iter() {
                node.watch(watcher.clone());
            }
        }
        *self.node.lock().expect("node lock poisoned") = Some(node);
    }
}
