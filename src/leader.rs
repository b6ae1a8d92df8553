//! The leader side of the replication protocol.
//!
//! The leader owns the rendezvous socket and the canonical datastore. Client
//! connections are greeted with a snapshot of the current state, then read by
//! per-connection tasks that feed every inbound frame into a single request
//! channel. One serializer task drains that channel, which gives all
//! client-originated writes a total order without any locking between
//! clients. Local writes take the same internal write lock, so they slot
//! into the same order.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::BufReader;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{
    self, MessageType, ResponseCode, UpdateRequest, UpdateResponse, VersionUpdate,
};
use crate::store::Datastore;
use crate::version::{Version, Writer};

type ClientId = u64;

/// One complete frame from a client, tagged with who sent it so the response
/// and the broadcast exclusion find their way back.
struct ClientRequest {
    client_id: ClientId,
    body: Vec<u8>,
}

pub struct LeaderNode {
    core: Arc<Core>,
    socket: PathBuf,
    accept_task: JoinHandle<()>,
    serialize_task: JoinHandle<()>,
}

pub(crate) struct Core {
    ds: Arc<dyn Datastore>,
    clients: Mutex<HashMap<ClientId, OwnedWriteHalf>>,
    next_client_id: AtomicU64,
    watchers: StdMutex<Vec<mpsc::UnboundedSender<Version>>>,
    /// Held across the whole check-put-broadcast sequence. Local writes and
    /// the request serializer both take it, so no two writes interleave.
    write_lock: Mutex<()>,
}

enum WriteError {
    /// The expected version was stale; carries the version the leader is at.
    Mismatch { current: u64 },
    /// The datastore rejected the put; carries the pre-write version.
    Store { version: u64, source: Error },
}

impl LeaderNode {
    /// Take the leader role at `socket`.
    ///
    /// The socket's filesystem entry doubles as the presence marker for the
    /// role: if it already exists this fails with
    /// [`Error::LeaderAlreadyExists`] and the caller should attach as a
    /// follower instead. Losing the bind race is reported the same way.
    pub fn new(socket: impl AsRef<Path>, ds: Arc<dyn Datastore>) -> Result<Self> {
        let socket = socket.as_ref();

        match fs_err::metadata(socket) {
            Ok(meta) => {
                if meta.is_dir() {
                    return Err(Error::InvalidSocket);
                }
                return Err(Error::LeaderAlreadyExists);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        ds.open()?;

        let listener = match UnixListener::bind(socket) {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                return Err(Error::LeaderAlreadyExists)
            }
            Err(err) => return Err(err.into()),
        };

        let core = Arc::new(Core {
            ds,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            watchers: StdMutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        });

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, core.clone(), requests_tx));
        let serialize_task = tokio::spawn(serialize_requests(core.clone(), requests_rx));

        Ok(Self {
            core,
            socket: socket.to_path_buf(),
            accept_task,
            serialize_task,
        })
    }

    /// Apply an optimistic write and broadcast the result to every connected
    /// follower.
    pub async fn write(&self, version: u64, data: impl Into<Vec<u8>>) -> Result<()> {
        self.core.apply(version, data.into()).await
    }

    pub fn version(&self) -> Result<u64> {
        Ok(self.core.ds.get()?.0)
    }

    pub fn data(&self) -> Result<Vec<u8>> {
        Ok(self.core.ds.get()?.1)
    }

    /// Register a channel that receives a [`Version`] for every follower
    /// write the leader handles, accepted or not; a rejected write carries
    /// the unchanged version and empty data. Sends never block; a watcher
    /// whose receiver is gone is dropped at the next notification.
    pub fn watch(&self, watcher: mpsc::UnboundedSender<Version>) {
        self.core
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .push(watcher);
    }

    /// Close the datastore, stop accepting, disconnect every follower, and
    /// release the rendezvous socket.
    pub async fn close(&self) -> Result<()> {
        self.core.ds.close()?;
        self.accept_task.abort();
        self.serialize_task.abort();

        // Dropping the write halves shuts the connections down; follower
        // readers see EOF and trigger their supervisors' failover.
        self.core.clients.lock().await.clear();

        match fs_err::remove_file(&self.socket) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    core: Arc<Core>,
    requests: mpsc::UnboundedSender<ClientRequest>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                if let Err(err) = core.register_client(stream, requests.clone()).await {
                    warn!(error = %err, "failed to register client connection");
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
                return;
            }
        }
    }
}

async fn serialize_requests(core: Arc<Core>, mut requests: mpsc::UnboundedReceiver<ClientRequest>) {
    while let Some(req) = requests.recv().await {
        core.handle_client_request(req.client_id, &req.body).await;
    }
}

impl Core {
    /// Greet a new connection with the current state, then hand its inbound
    /// frames to the serializer until it disconnects.
    async fn register_client(
        self: &Arc<Self>,
        stream: UnixStream,
        requests: mpsc::UnboundedSender<ClientRequest>,
    ) -> Result<()> {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        let (version, data) = self.ds.get()?;
        let bootstrap = VersionUpdate { version, data }.encode();

        let (read_half, mut write_half) = stream.into_split();
        message::write_frame(&mut write_half, &bootstrap).await?;

        self.clients.lock().await.insert(client_id, write_half);
        debug!(client = client_id, "client connected");

        let core = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match message::read_frame(&mut reader).await {
                    Ok(Some(body)) => {
                        if requests.send(ClientRequest { client_id, body }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(client = client_id, error = %err, "failed to read client frame");
                        break;
                    }
                }
            }
            core.clients.lock().await.remove(&client_id);
            debug!(client = client_id, "client disconnected");
        });

        Ok(())
    }

    async fn handle_client_request(self: &Arc<Self>, client_id: ClientId, body: &[u8]) {
        match message::message_type(body) {
            Some(MessageType::UpdateRequest) => {
                let req = match UpdateRequest::decode(body) {
                    Ok(req) => req,
                    Err(err) => {
                        warn!(client = client_id, error = %err, "failed to decode update request");
                        return;
                    }
                };
                let request_id = req.request_id;

                let outcome = self.write(req.version, req.data, &[client_id]).await;

                let (code, version, data) = match outcome {
                    Ok((version, data)) => (ResponseCode::Ok as u16, version, data),
                    Err(WriteError::Mismatch { current }) => {
                        (ResponseCode::MismatchedVersion as u16, current, Vec::new())
                    }
                    Err(WriteError::Store { version, source }) => {
                        warn!(client = client_id, error = %source, "write failed");
                        (ResponseCode::WriteFailed as u16, version, Vec::new())
                    }
                };

                let response = UpdateResponse {
                    request_id,
                    code,
                    version,
                    data: data.clone(),
                };
                self.send_to_client(client_id, &response.encode()).await;

                // Watchers hear about every handled request. A rejected
                // write publishes the unchanged version with no data, the
                // same values the originator got in its response.
                self.notify_watchers(version, data);
            }
            other => {
                warn!(client = client_id, message_type = ?other, "dropping frame with unexpected message type");
            }
        }
    }

    /// Map the internal write outcome onto caller-facing errors.
    pub(crate) async fn apply(&self, version: u64, data: Vec<u8>) -> Result<()> {
        match self.write(version, data, &[]).await {
            Ok(_) => Ok(()),
            Err(WriteError::Mismatch { .. }) => Err(Error::VersionMismatch),
            Err(WriteError::Store { source, .. }) => Err(source),
        }
    }

    /// The single write path. Checks the expected version, persists the new
    /// state, and fans it out to every client except the ones in `exclude`
    /// (the originator of a forwarded write already gets the result in its
    /// response).
    async fn write(
        &self,
        expected: u64,
        data: Vec<u8>,
        exclude: &[ClientId],
    ) -> std::result::Result<(u64, Vec<u8>), WriteError> {
        let _guard = self.write_lock.lock().await;

        let current = match self.ds.get() {
            Ok((version, _)) => version,
            Err(source) => return Err(WriteError::Store { version: 0, source }),
        };

        if expected != current {
            return Err(WriteError::Mismatch { current });
        }

        let version = current + 1;
        if let Err(source) = self.ds.put(version, &data) {
            return Err(WriteError::Store {
                version: current,
                source,
            });
        }

        self.broadcast(version, &data, exclude).await;
        Ok((version, data))
    }

    async fn broadcast(&self, version: u64, data: &[u8], exclude: &[ClientId]) {
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            return;
        }

        let frame = VersionUpdate {
            version,
            data: data.to_vec(),
        }
        .encode();

        for (client_id, conn) in clients.iter_mut() {
            if exclude.contains(client_id) {
                continue;
            }
            // The write is already committed; a failed send only affects
            // this client, whose reader task cleans up on disconnect.
            if let Err(err) = message::write_frame(conn, &frame).await {
                warn!(client = *client_id, error = %err, "failed to send version update");
            }
        }
    }

    async fn send_to_client(&self, client_id: ClientId, frame: &[u8]) {
        let mut clients = self.clients.lock().await;
        let Some(conn) = clients.get_mut(&client_id) else {
            debug!(client = client_id, "client disconnected before response");
            return;
        };
        if let Err(err) = message::write_frame(conn, frame).await {
            warn!(client = client_id, error = %err, "failed to send update response");
        }
    }

    fn notify_watchers(self: &Arc<Self>, version: u64, data: Vec<u8>) {
        let mut watchers = self.watchers.lock().expect("watchers lock poisoned");
        watchers.retain(|watcher| {
            let v = Version::new(version, data.clone(), Writer::Leader(Arc::downgrade(self)));
            watcher.send(v).is_ok()
        });
    }
}
