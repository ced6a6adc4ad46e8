//! Asynchronous 9P2000 client.
//!
//! One request is outstanding at a time when going through the typed
//! methods; `send` and `recv` give raw access for pipelining.

use {
    crate::{
        error::Error,
        fcall::*,
        io_err, serialize,
        srv::framing,
        utils::Result,
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, ToSocketAddrs},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{Framed, LengthDelimitedCodec},
};

pub struct Client<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    tag: u16,
    msize: u32,
}

impl Client<TcpStream> {
    pub async fn dial(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Client::new(stream))
    }
}

#[cfg(unix)]
impl Client<tokio::net::UnixStream> {
    pub async fn dial_unix(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Client::new(stream))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Client {
            framed: framing().new_framed(stream),
            tag: 0,
            msize: MSIZE,
        }
    }

    /// The message size negotiated by the last `version`.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub async fn send(&mut self, msg: &Msg) -> Result<()> {
        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, msg)?;
        self.framed.send(writer.into_inner().freeze()).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Msg> {
        match self.framed.next().await {
            Some(bytes) => Ok(serialize::read_msg(&mut bytes?.reader())?),
            None => Err(From::from(io_err!(UnexpectedEof, "connection closed"))),
        }
    }

    fn next_tag(&mut self) -> u16 {
        self.tag = self.tag.wrapping_add(1);
        if self.tag == NOTAG {
            self.tag = 0;
        }
        self.tag
    }

    /// Send `body` and wait for its reply. `RError` becomes `Error::Remote`.
    pub async fn rpc(&mut self, body: FCall) -> Result<FCall> {
        let tag = match body {
            FCall::TVersion { .. } => NOTAG,
            _ => self.next_tag(),
        };
        self.send(&Msg { tag, body }).await?;

        let reply = self.recv().await?;
        if !MsgType::from(&reply.body).is_r() {
            return Err(Error::invalid(format!(
                "reply is not an R-message: {:?}",
                MsgType::from(&reply.body)
            )));
        }
        if reply.tag != tag {
            return Err(Error::invalid(format!(
                "reply tag {} for request tag {}",
                reply.tag, tag
            )));
        }
        match reply.body {
            FCall::RError { ename } => Err(Error::Remote(ename)),
            body => Ok(body),
        }
    }

    pub async fn version_str(&mut self, msize: u32, version: &str) -> Result<(u32, String)> {
        let body = FCall::TVersion {
            msize,
            version: version.to_owned(),
        };
        match self.rpc(body).await? {
            FCall::RVersion { msize, version } => {
                self.msize = msize;
                Ok((msize, version))
            }
            _ => Err(unexpected()),
        }
    }

    /// Negotiate 9P2000 with at most `msize` bytes per message.
    pub async fn version(&mut self, msize: u32) -> Result<u32> {
        let (msize, version) = self.version_str(msize, P92000).await?;
        if version == P92000 {
            Ok(msize)
        } else {
            Err(Error::invalid(format!("unsupported version: {}", version)))
        }
    }

    pub async fn auth(&mut self, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        let body = FCall::TAuth {
            afid,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.rpc(body).await? {
            FCall::RAuth { aqid } => Ok(aqid),
            _ => Err(unexpected()),
        }
    }

    pub async fn attach(&mut self, fid: u32, uname: &str, aname: &str) -> Result<QId> {
        let body = FCall::TAttach {
            fid,
            afid: NOFID,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.rpc(body).await? {
            FCall::RAttach { qid } => Ok(qid),
            _ => Err(unexpected()),
        }
    }

    pub async fn walk(&mut self, fid: u32, newfid: u32, wnames: &[&str]) -> Result<Vec<QId>> {
        let body = FCall::TWalk {
            fid,
            newfid,
            wnames: wnames.iter().map(|s| s.to_string()).collect(),
        };
        match self.rpc(body).await? {
            FCall::RWalk { wqids } => Ok(wqids),
            _ => Err(unexpected()),
        }
    }

    /// Walk a slash separated path, failing unless every element resolves.
    pub async fn walk_path(&mut self, fid: u32, newfid: u32, path: &str) -> Result<QId> {
        let elems = crate::utils::split_path(path);
        let mut chunks = elems.chunks(MAXWELEM);

        let first = chunks.next().unwrap_or(&[]);
        let wqids = self.walk(fid, newfid, first).await?;
        if wqids.len() != first.len() {
            return Err(Error::NotFound);
        }
        let mut qid = match wqids.last() {
            Some(&qid) => qid,
            None => self.stat(newfid).await?.qid,
        };

        for chunk in chunks {
            match self.walk(newfid, newfid, chunk).await {
                Ok(wqids) if wqids.len() == chunk.len() => {
                    if let Some(&last) = wqids.last() {
                        qid = last;
                    }
                }
                res => {
                    self.clunk(newfid).await?;
                    return Err(res.err().unwrap_or(Error::NotFound));
                }
            }
        }
        Ok(qid)
    }

    pub async fn open(&mut self, fid: u32, mode: u8) -> Result<(QId, u32)> {
        match self.rpc(FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            _ => Err(unexpected()),
        }
    }

    pub async fn create(
        &mut self,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(QId, u32)> {
        let body = FCall::TCreate {
            fid,
            name: name.to_owned(),
            perm,
            mode,
        };
        match self.rpc(body).await? {
            FCall::RCreate { qid, iounit } => Ok((qid, iounit)),
            _ => Err(unexpected()),
        }
    }

    pub async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self.rpc(FCall::TRead { fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data.0),
            _ => Err(unexpected()),
        }
    }

    pub async fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let body = FCall::TWrite {
            fid,
            offset,
            data: Data(data.to_vec()),
        };
        match self.rpc(body).await? {
            FCall::RWrite { count } => Ok(count),
            _ => Err(unexpected()),
        }
    }

    fn iounit(&self) -> u32 {
        self.msize.saturating_sub(IOHDRSZ).clamp(1, IOUNIT)
    }

    /// Read an open fid from offset 0 until a read returns nothing.
    pub async fn read_all(&mut self, fid: u32) -> Result<Vec<u8>> {
        let count = self.iounit();
        let mut out = Vec::new();
        loop {
            let data = self.read(fid, out.len() as u64, count).await?;
            if data.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&data);
        }
    }

    /// Write all of `data` starting at offset 0.
    pub async fn write_all(&mut self, fid: u32, data: &[u8]) -> Result<()> {
        let count = self.iounit() as usize;
        let mut offset = 0;
        for chunk in data.chunks(count) {
            let n = self.write(fid, offset, chunk).await?;
            if n as usize != chunk.len() {
                return Err(From::from(io_err!(WriteZero, "short write")));
            }
            offset += n as u64;
        }
        Ok(())
    }

    /// Read every entry of an open directory.
    pub async fn read_dir(&mut self, fid: u32) -> Result<Vec<Stat>> {
        let data = self.read_all(fid).await?;
        Ok(serialize::read_stats(&data)?)
    }

    pub async fn clunk(&mut self, fid: u32) -> Result<()> {
        match self.rpc(FCall::TClunk { fid }).await? {
            FCall::RClunk => Ok(()),
            _ => Err(unexpected()),
        }
    }

    pub async fn remove(&mut self, fid: u32) -> Result<()> {
        match self.rpc(FCall::TRemove { fid }).await? {
            FCall::RRemove => Ok(()),
            _ => Err(unexpected()),
        }
    }

    pub async fn stat(&mut self, fid: u32) -> Result<Stat> {
        match self.rpc(FCall::TStat { fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(unexpected()),
        }
    }

    pub async fn wstat(&mut self, fid: u32, stat: &Stat) -> Result<()> {
        let body = FCall::TWStat {
            fid,
            stat: stat.clone(),
        };
        match self.rpc(body).await? {
            FCall::RWStat => Ok(()),
            _ => Err(unexpected()),
        }
    }
}

fn unexpected() -> Error {
    Error::invalid("unexpected reply")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mismatched_replies_are_refused() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = Client::new(near);
        let mut peer = Client::new(far);

        let server = tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            let body = FCall::TClunk { fid: 0 };
            peer.send(&Msg { tag: req.tag, body }).await.unwrap();

            let req = peer.recv().await.unwrap();
            let body = FCall::RClunk;
            peer.send(&Msg { tag: req.tag.wrapping_add(1), body }).await.unwrap();

            let req = peer.recv().await.unwrap();
            let body = FCall::RClunk;
            peer.send(&Msg { tag: req.tag, body }).await.unwrap();
        });

        assert!(matches!(client.clunk(0).await, Err(Error::Invalid(_))));
        assert!(matches!(client.clunk(0).await, Err(Error::Invalid(_))));
        client.clunk(0).await.unwrap();
        server.await.unwrap();
    }
}
