//! Asynchronous 9P2000 server.
//!
//! Every connection runs a reader and a writer task. The reader decodes
//! requests and queues them as transactions on one shared work queue; a
//! single dispatcher task owns the namespace and executes the transactions in
//! arrival order, replying through the writer of the requesting connection.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::Error,
        fcall::*,
        fid::FId,
        io_err,
        path::IdAllocator,
        res, serialize,
        tree::Namespace,
        users,
        utils::{self, Result},
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{Level, debug, error, info, log, warn},
    std::{
        collections::{HashMap, VecDeque},
        path::{Path, PathBuf},
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Notify, mpsc, oneshot},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::{self, LengthDelimitedCodec},
};

/// Framing of 9P messages: a little-endian `size[4]` that counts itself.
pub(crate) fn framing() -> length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(MSIZE as usize);
    builder
}

fn traffic(chatty: &AtomicBool) -> Level {
    if chatty.load(Ordering::Relaxed) {
        Level::Info
    } else {
        Level::Debug
    }
}

/// The replying side of a connection.
#[derive(Debug)]
pub(crate) struct Session {
    id: u32,
    outbound: mpsc::UnboundedSender<Msg>,
}

/// A unit of work for the dispatcher.
pub(crate) enum Transaction {
    /// A decoded request and, for attach and walk, the fid template minted
    /// for its new fid.
    Request {
        session: Arc<Session>,
        msg: Msg,
        newfid: Option<FId>,
    },
    /// The connection went away; its fids are to be clunked.
    Teardown { conn: u32 },
    /// A job of the local facade.
    Local(Box<dyn FnOnce(&mut Namespace) + Send>),
}

impl Transaction {
    /// Connection ids are reused, so a request belongs to `from` only if it
    /// was queued through that very session.
    fn matches(&self, from: &Arc<Session>, tag: u16) -> bool {
        match self {
            Transaction::Request { session, msg, .. } => {
                Arc::ptr_eq(session, from) && msg.tag == tag
            }
            _ => false,
        }
    }
}

/// FIFO of transactions not yet taken by the dispatcher.
#[derive(Default)]
pub(crate) struct WorkQueue {
    pending: Mutex<VecDeque<Transaction>>,
    ready: Notify,
}

impl WorkQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Transaction>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn submit(&self, t: Transaction) {
        self.lock().push_back(t);
        self.ready.notify_one();
    }

    /// Drop the request tagged `tag` that `session` still has queued.
    pub(crate) fn cancel(&self, session: &Arc<Session>, tag: u16) -> bool {
        let mut pending = self.lock();
        match pending.iter().position(|t| t.matches(session, tag)) {
            Some(i) => pending.remove(i).is_some(),
            None => false,
        }
    }

    pub(crate) async fn next(&self) -> Transaction {
        loop {
            let next = self.lock().pop_front();
            if let Some(t) = next {
                return t;
            }
            self.ready.notified().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn tags(&self) -> Vec<u16> {
        self.lock()
            .iter()
            .filter_map(|t| match t {
                Transaction::Request { msg, .. } => Some(msg.tag),
                _ => None,
            })
            .collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Unattached,
    Attached,
}

/// Per connection state, owned by the dispatcher.
#[derive(Debug)]
struct SessionState {
    conn: ConnState,
    msize: u32,
    uid: String,
    fids: HashMap<u32, FId>,
}

impl SessionState {
    fn new() -> SessionState {
        SessionState {
            conn: ConnState::Unattached,
            msize: MSIZE,
            uid: users::NONE.to_owned(),
            fids: HashMap::new(),
        }
    }
}

type MintRequest = oneshot::Sender<FId>;

/// Serve fid templates one request at a time.
fn spawn_minter() -> mpsc::Sender<MintRequest> {
    let (tx, mut rx) = mpsc::channel::<MintRequest>(1);
    tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let _ = reply.send(FId::template());
        }
    });
    tx
}

/// The connection facing half of the server.
pub struct Server {
    queue: Arc<WorkQueue>,
    minter: mpsc::Sender<MintRequest>,
    conns: IdAllocator<u32>,
    chatty: Arc<AtomicBool>,
}

/// Executes transactions against the namespace, one at a time.
pub struct Dispatcher {
    ns: Namespace,
    queue: Arc<WorkQueue>,
    sessions: HashMap<u32, SessionState>,
}

impl Server {
    /// Create a server for `ns` along with its dispatcher, which must be run
    /// for any request to be answered. Must be called within a tokio runtime.
    pub fn new(ns: Namespace) -> (Arc<Server>, Dispatcher) {
        let queue = Arc::new(WorkQueue::default());
        let server = Arc::new(Server {
            queue: queue.clone(),
            minter: spawn_minter(),
            conns: IdAllocator::new(),
            chatty: ns.admin.chatty.clone(),
        });
        let dispatcher = Dispatcher {
            ns,
            queue,
            sessions: HashMap::new(),
        };
        (server, dispatcher)
    }

    /// Create a server and spawn its dispatcher.
    pub fn spawn(ns: Namespace) -> Arc<Server> {
        let (server, dispatcher) = Server::new(ns);
        tokio::spawn(dispatcher.run());
        server
    }

    pub fn set_chatty(&self, on: bool) {
        self.chatty.store(on, Ordering::Relaxed);
    }

    pub(crate) fn submit(&self, t: Transaction) {
        self.queue.submit(t);
    }

    /// Get a fresh fid template from the minting task.
    pub(crate) async fn mint(&self) -> Result<FId> {
        let (tx, rx) = oneshot::channel();
        self.minter
            .send(tx)
            .await
            .map_err(|_| io_err!(BrokenPipe, "fid minter stopped"))?;
        Ok(rx
            .await
            .map_err(|_| io_err!(BrokenPipe, "fid minter stopped"))?)
    }

    /// Serve one connection until its reader reaches end of stream.
    pub async fn dispatch<Reader, Writer>(
        self: Arc<Self>,
        reader: Reader,
        writer: Writer,
    ) -> Result<()>
    where
        Reader: 'static + AsyncRead + Send + std::marker::Unpin,
        Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
    {
        let id = self.conns.alloc()?;
        info!("conn {}: open", id);

        let res = self.converse(id, reader, writer).await;

        self.queue.submit(Transaction::Teardown { conn: id });
        self.conns.release(id);
        info!("conn {}: closed", id);
        res
    }

    async fn converse<Reader, Writer>(&self, id: u32, reader: Reader, writer: Writer) -> Result<()>
    where
        Reader: 'static + AsyncRead + Send + std::marker::Unpin,
        Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
    {
        let (outbound, mut replies) = mpsc::unbounded_channel::<Msg>();
        let session = Arc::new(Session { id, outbound });

        let mut framedread = framing().new_read(reader);
        let mut framedwrite = framing().new_write(writer);

        let chatty = self.chatty.clone();
        tokio::spawn(async move {
            while let Some(response) = replies.recv().await {
                let mut writer = bytes::BytesMut::with_capacity(4096).writer();
                if let Err(e) = serialize::write_msg(&mut writer, &response) {
                    error!("Failed to serialize response for tag {}: {:?}", response.tag, e);
                    writer = bytes::BytesMut::new().writer();
                    let fallback = Msg {
                        tag: response.tag,
                        body: FCall::RError {
                            ename: Error::from(e).ename(),
                        },
                    };
                    if serialize::write_msg(&mut writer, &fallback).is_err() {
                        continue;
                    }
                }

                let frozen = writer.into_inner().freeze();
                if let Err(e) = framedwrite.send(frozen).await {
                    error!("Failed to send response for tag {}: {:?}", response.tag, e);
                    break;
                }
                log!(traffic(&chatty), "\t→ {:?}", response);
            }
        });

        while let Some(bytes) = framedread.next().await {
            let bytes = bytes?;

            let msg = serialize::read_msg(&mut bytes.reader())?;
            log!(traffic(&self.chatty), "\t← {:?}", msg);

            if let FCall::TFlush { oldtag } = msg.body {
                if self.queue.cancel(&session, oldtag) {
                    debug!("conn {}: flushed tag {}", id, oldtag);
                }
            }

            let newfid = match msg.body.newfid() {
                Some(_) => Some(self.mint().await?),
                None => None,
            };
            self.queue.submit(Transaction::Request {
                session: session.clone(),
                msg,
                newfid,
            });
        }

        Ok(())
    }

    /// Accept connections on `listener` forever.
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("accepted: {:?}", peer);

                    let server = self.clone();
                    tokio::spawn(async move {
                        let (readhalf, writehalf) = stream.into_split();
                        if let Err(e) = server.dispatch(readhalf, writehalf).await {
                            error!("Error: {}: {:?}", e, e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub async fn serve_unix(self: Arc<Self>, path: impl AsRef<Path>) -> Result<()> {
        let listener = DeleteOnDrop::bind(path)?;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("accepted: {:?}", peer);

                    let server = self.clone();
                    tokio::spawn(async move {
                        let (readhalf, writehalf) = tokio::io::split(stream);
                        if let Err(e) = server.dispatch(readhalf, writehalf).await {
                            error!("Error: {:?}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Listen on a dial string, `tcp!host!port` or `unix!path!0`.
    pub async fn listen(self: Arc<Self>, addr: &str) -> Result<()> {
        let (proto, host, port) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => {
                let listener = TcpListener::bind(format!("{}:{}", host, port)).await?;
                info!("listening on {}", listener.local_addr()?);
                self.serve_tcp(listener).await
            }
            "unix" => {
                info!("listening on {}", host);
                self.serve_unix(host).await
            }
            _ => res!(io_err!(InvalidInput, "Protocol not supported")),
        }
    }
}

fn template(newfid: Option<FId>, num: u32) -> Result<FId> {
    newfid
        .map(|fid| fid.numbered(num))
        .ok_or_else(|| Error::invalid("no fid template"))
}

impl Dispatcher {
    pub async fn run(mut self) {
        loop {
            let t = self.queue.next().await;
            self.execute(t);
        }
    }

    fn execute(&mut self, t: Transaction) {
        match t {
            Transaction::Request {
                session,
                msg,
                newfid,
            } => {
                let body = self
                    .dispatch_once(session.id, &msg, newfid)
                    .unwrap_or_else(|e| {
                        debug!("{:?}: Error: \"{}\": {:?}", MsgType::from(&msg.body), e, e);
                        FCall::RError { ename: e.ename() }
                    });
                // The connection may be gone already.
                let _ = session.outbound.send(Msg { tag: msg.tag, body });
            }
            Transaction::Teardown { conn } => {
                if let Some(state) = self.sessions.remove(&conn) {
                    debug!("conn {}: clunking {} fids of {}", conn, state.fids.len(), state.uid);
                    for (_, fid) in state.fids {
                        fid.clunk(&mut self.ns);
                    }
                }
            }
            Transaction::Local(job) => job(&mut self.ns),
        }
    }

    fn dispatch_once(&mut self, conn: u32, msg: &Msg, newfid: Option<FId>) -> Result<FCall> {
        let Dispatcher { ns, sessions, .. } = self;
        let state = sessions.entry(conn).or_insert_with(SessionState::new);

        use crate::FCall::*;
        match msg.body {
            TVersion { msize, ref version } => {
                for (_, fid) in state.fids.drain() {
                    fid.clunk(ns);
                }
                *state = SessionState::new();
                state.msize = msize.min(MSIZE);

                let version = if version.starts_with(P92000) {
                    P92000
                } else {
                    VERSION_UNKNOWN
                };
                Ok(RVersion {
                    msize: state.msize,
                    version: version.to_owned(),
                })
            }
            TAuth { .. } => Err(Error::AuthNotSupported),
            TFlush { .. } => Ok(RFlush),
            TAttach {
                fid,
                afid,
                ref uname,
                ref aname,
            } => {
                if afid != NOFID {
                    return Err(Error::AuthNotSupported);
                }
                if state.fids.contains_key(&fid) {
                    return Err(Error::FidInUse);
                }

                let mut fresh = template(newfid, fid)?;
                let qid = fresh.attach(ns, uname, aname)?;
                state.uid = fresh.uid().to_owned();
                state.conn = ConnState::Attached;
                state.fids.insert(fid, fresh);
                Ok(RAttach { qid })
            }
            _ if state.conn != ConnState::Attached => Err(Error::NotAttached),
            TWalk {
                fid,
                newfid: num,
                ref wnames,
            } => {
                if num != fid && state.fids.contains_key(&num) {
                    return Err(Error::FidInUse);
                }

                let fresh = template(newfid, num)?;
                let from = state.fids.get(&fid).ok_or(Error::UnknownFid)?;
                let (wqids, walked) = from.walk(ns, wnames, fresh)?;
                if let Some(walked) = walked {
                    if let Some(old) = state.fids.insert(num, walked) {
                        old.clunk(ns);
                    }
                }
                Ok(RWalk { wqids })
            }
            TOpen { fid, mode } => {
                let fid = state.fids.get_mut(&fid).ok_or(Error::UnknownFid)?;
                let (qid, iounit) = fid.open(ns, mode)?;
                Ok(ROpen {
                    qid,
                    iounit: iounit.min(state.msize.saturating_sub(IOHDRSZ)),
                })
            }
            TCreate {
                fid,
                ref name,
                perm,
                mode,
            } => {
                let fid = state.fids.get_mut(&fid).ok_or(Error::UnknownFid)?;
                let (qid, iounit) = fid.create(ns, name, perm, mode)?;
                Ok(RCreate {
                    qid,
                    iounit: iounit.min(state.msize.saturating_sub(IOHDRSZ)),
                })
            }
            TRead { fid, offset, count } => {
                let count = count.min(state.msize.saturating_sub(IOHDRSZ));
                let fid = state.fids.get_mut(&fid).ok_or(Error::UnknownFid)?;
                Ok(RRead {
                    data: Data(fid.read(ns, offset, count)?),
                })
            }
            TWrite {
                fid,
                offset,
                ref data,
            } => {
                let fid = state.fids.get_mut(&fid).ok_or(Error::UnknownFid)?;
                Ok(RWrite {
                    count: fid.write(ns, offset, &data.0)?,
                })
            }
            TClunk { fid } => {
                let fid = state.fids.remove(&fid).ok_or(Error::UnknownFid)?;
                fid.clunk(ns);
                Ok(RClunk)
            }
            TRemove { fid } => {
                let fid = state.fids.remove(&fid).ok_or(Error::UnknownFid)?;
                fid.remove(ns)?;
                Ok(RRemove)
            }
            TStat { fid } => {
                let fid = state.fids.get(&fid).ok_or(Error::UnknownFid)?;
                Ok(RStat {
                    stat: fid.stat(ns)?,
                })
            }
            TWStat { fid, ref stat } => {
                let fid = state.fids.get_mut(&fid).ok_or(Error::UnknownFid)?;
                fid.wstat(ns, stat)?;
                Ok(RWStat)
            }
            _ => Err(Error::invalid(format!(
                "unexpected message: {:?}",
                MsgType::from(&msg.body)
            ))),
        }
    }
}

pub struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    pub fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}
