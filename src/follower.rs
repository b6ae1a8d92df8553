//! The follower side of the replication protocol.
//!
//! A follower dials the leader's socket, blocks until the bootstrap snapshot
//! has been applied to its local mirror, and then serves reads locally while
//! forwarding writes to the leader as request/response pairs correlated by
//! id. Broadcast updates from the leader overwrite the mirror as they
//! arrive; re-applying a version the follower already stored after its own
//! write is harmless by construction.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{self, MessageType, ResponseCode, UpdateRequest, UpdateResponse, VersionUpdate};
use crate::store::Datastore;
use crate::version::{Version, Writer};

/// How long the constructor waits for the leader's initial state before
/// giving up, so a wedged endpoint cannot hang the caller.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FollowerNode {
    core: Arc<Core>,
    reader_task: JoinHandle<()>,
}

impl fmt::Debug for FollowerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowerNode").finish_non_exhaustive()
    }
}

pub(crate) struct Core {
    ds: Arc<dyn Datastore>,
    writer: Mutex<OwnedWriteHalf>,
    /// Response slots for in-flight writes, keyed by request id. `None` once
    /// the connection is gone, so a late write fails instead of registering
    /// a slot nobody will ever answer.
    requests: StdMutex<Option<HashMap<u64, oneshot::Sender<UpdateResponse>>>>,
    next_request_id: AtomicU64,
    watchers: StdMutex<Vec<mpsc::UnboundedSender<Version>>>,
}

impl FollowerNode {
    /// Connect to the leader at `socket` and mirror its state into `ds`.
    ///
    /// Returns only after the bootstrap snapshot has been applied, so the
    /// mirror is never observably empty. The second return value fires once
    /// the connection is gone, which is the supervisor's cue to reacquire a
    /// role.
    pub async fn new(
        socket: impl AsRef<Path>,
        ds: Arc<dyn Datastore>,
    ) -> Result<(Self, oneshot::Receiver<()>)> {
        let socket = socket.as_ref();

        // Dialing a path that exists but is not a socket surfaces a raw
        // errno; check the file type up front instead.
        if let Ok(meta) = fs_err::metadata(socket) {
            if !meta.file_type().is_socket() {
                return Err(Error::InvalidSocket);
            }
        }

        let stream = match UnixStream::connect(socket).await {
            Ok(stream) => stream,
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(Error::LeaderClosed)
            }
            Err(err) => return Err(err.into()),
        };

        let (read_half, write_half) = stream.into_split();

        let core = Arc::new(Core {
            ds,
            writer: Mutex::new(write_half),
            requests: StdMutex::new(Some(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            watchers: StdMutex::new(Vec::new()),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let (close_tx, close_rx) = oneshot::channel();

        let reader_core = core.clone();
        let reader_task = tokio::spawn(async move {
            reader_core.read_loop(read_half, ready_tx).await;
            let _ = close_tx.send(());
        });

        match timeout(BOOTSTRAP_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {}
            // The reader exited before the first frame: the leader went away
            // between accepting us and sending the snapshot.
            Ok(Err(_)) => return Err(Error::LeaderClosed),
            Err(_) => {
                reader_task.abort();
                return Err(Error::BootstrapTimeout);
            }
        }

        Ok((Self { core, reader_task }, close_rx))
    }

    /// Forward an optimistic write to the leader and wait for its verdict.
    pub async fn write(&self, version: u64, data: impl Into<Vec<u8>>) -> Result<()> {
        self.core.write(version, data.into()).await
    }

    pub fn version(&self) -> Result<u64> {
        Ok(self.core.ds.get()?.0)
    }

    pub fn data(&self) -> Result<Vec<u8>> {
        Ok(self.core.ds.get()?.1)
    }

    /// Register a channel that receives a [`Version`] for every broadcast
    /// applied after bootstrap. Sends never block; a watcher whose receiver
    /// is gone is dropped at the next notification.
    pub fn watch(&self, watcher: mpsc::UnboundedSender<Version>) {
        self.core
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .push(watcher);
    }

    /// Drop the connection to the leader. Outstanding writes fail with
    /// [`Error::LeaderClosed`]; the local datastore is left to its owner.
    pub async fn close(&self) -> Result<()> {
        {
            let mut writer = self.core.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                debug!(error = %err, "failed to shut down connection");
            }
        }
        self.reader_task.abort();
        self.core.fail_pending_requests();
        Ok(())
    }
}

impl Core {
    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut reader = BufReader::new(read_half);

        loop {
            match message::read_frame(&mut reader).await {
                Ok(Some(body)) => self.handle_message(&body, &mut ready),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "failed to read frame from leader");
                    break;
                }
            }
        }

        // Fail every in-flight write rather than leaving its caller parked.
        self.fail_pending_requests();
    }

    fn handle_message(self: &Arc<Self>, body: &[u8], ready: &mut Option<oneshot::Sender<()>>) {
        match message::message_type(body) {
            Some(MessageType::UpdateResponse) => {
                let res = match UpdateResponse::decode(body) {
                    Ok(res) => res,
                    Err(err) => {
                        warn!(error = %err, "failed to decode update response");
                        return;
                    }
                };
                let slot = self
                    .requests
                    .lock()
                    .expect("requests lock poisoned")
                    .as_mut()
                    .and_then(|requests| requests.remove(&res.request_id));
                match slot {
                    Some(tx) => {
                        let _ = tx.send(res);
                    }
                    None => {
                        debug!(request_id = res.request_id, "dropping response with no waiting request");
                    }
                }
            }
            Some(MessageType::VersionUpdate) => {
                let msg = match VersionUpdate::decode(body) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(error = %err, "failed to decode version update");
                        return;
                    }
                };
                if let Err(err) = self.ds.put(msg.version, &msg.data) {
                    warn!(error = %err, "failed to store version update");
                    return;
                }
                // The first update is the bootstrap; it releases the
                // constructor instead of notifying watchers.
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                    return;
                }
                self.notify_watchers(msg.version, msg.data);
            }
            other => {
                warn!(message_type = ?other, "dropping frame with unexpected message type");
            }
        }
    }

    pub(crate) async fn write(&self, version: u64, data: Vec<u8>) -> Result<()> {
        // Local pre-check saves the round trip when this follower is already
        // known to be stale.
        let (current, _) = self.ds.get()?;
        if version != current {
            return Err(Error::VersionMismatch);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        // Register before sending so a fast response cannot beat the slot.
        match self
            .requests
            .lock()
            .expect("requests lock poisoned")
            .as_mut()
        {
            Some(requests) => {
                requests.insert(request_id, tx);
            }
            None => return Err(Error::LeaderClosed),
        }

        let frame = UpdateRequest {
            request_id,
            version,
            data: data.clone(),
        }
        .encode();

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = message::write_frame(&mut *writer, &frame).await {
                if let Some(requests) = self
                    .requests
                    .lock()
                    .expect("requests lock poisoned")
                    .as_mut()
                {
                    requests.remove(&request_id);
                }
                return Err(err.into());
            }
        }

        let res = match rx.await {
            Ok(res) => res,
            // The reader dropped the slot: the connection to the leader is
            // gone and this write will never be answered.
            Err(_) => return Err(Error::LeaderClosed),
        };

        match ResponseCode::from_u16(res.code) {
            // Persist with the leader-assigned version right away instead of
            // waiting on the broadcast; the broadcast re-putting the same
            // pair later is idempotent.
            Some(ResponseCode::Ok) => self.ds.put(res.version, &data),
            Some(ResponseCode::MismatchedVersion) => Err(Error::VersionMismatch),
            Some(ResponseCode::WriteFailed) => Err(Error::LeaderFailedToWrite),
            None => Err(Error::UnknownResponseCode(res.code)),
        }
    }

    fn fail_pending_requests(&self) {
        // Dropping the slots wakes every waiter with a closed-channel error.
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .take();
    }

    fn notify_watchers(self: &Arc<Self>, version: u64, data: Vec<u8>) {
        let mut watchers = self.watchers.lock().expect("watchers lock poisoned");
        watchers.retain(|watcher| {
            let v = Version::new(version, data.clone(), Writer::Follower(Arc::downgrade(self)));
            watcher.send(v).is_ok()
        });
    }
}
