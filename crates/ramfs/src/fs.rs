//! Embeddable facade.
//!
//! `Fs` runs a server in the current tokio runtime and offers the namespace
//! to local code without going over the wire. Local operations are queued on
//! the dispatcher like any request, so they are ordered with the traffic of
//! network clients.

use std::sync::Arc;

use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    error::Error,
    fcall::{IOUNIT, QId, Stat},
    fid::FId,
    io_err,
    srv::{Server, Transaction},
    tree::Namespace,
    users,
    utils::{self, Result},
};

#[derive(Clone)]
pub struct Fs {
    server: Arc<Server>,
    hostowner: String,
}

impl Fs {
    /// Start a server for a fresh namespace owned by `hostowner` (`adm` if
    /// empty). Must be called within a tokio runtime.
    pub fn new(hostowner: &str) -> Fs {
        let ns = Namespace::new(hostowner);
        let hostowner = ns.hostowner().to_owned();
        Fs {
            server: Server::spawn(ns),
            hostowner,
        }
    }

    pub fn hostowner(&self) -> &str {
        &self.hostowner
    }

    pub fn set_chatty(&self, on: bool) {
        self.server.set_chatty(on);
    }

    /// Run `job` on the dispatcher and wait for its result.
    ///
    /// If the caller stops waiting, the result is handed to `lost` on the
    /// dispatcher instead, so fids inside it can still be clunked.
    async fn run<T, F, L>(&self, job: F, lost: L) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Namespace) -> T + Send + 'static,
        L: FnOnce(&mut Namespace, T) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.server.submit(Transaction::Local(Box::new(move |ns: &mut Namespace| {
            if let Err(unsent) = tx.send(job(ns)) {
                lost(ns, unsent);
            }
        })));
        Ok(rx
            .await
            .map_err(|_| io_err!(BrokenPipe, "dispatcher stopped"))?)
    }

    async fn attached(&self, uname: String, aname: String) -> Result<File> {
        let mut fid = self.server.mint().await?;
        let fid = self
            .run(
                move |ns| {
                    fid.attach(ns, &uname, &aname)?;
                    Ok::<_, Error>(fid)
                },
                clunk_ok,
            )
            .await??;
        Ok(File::new(self.clone(), fid))
    }

    /// Attach as `uname` to the tree rooted at `aname`.
    pub async fn attach(&self, uname: &str, aname: &str) -> Result<File> {
        self.attached(uname.to_owned(), aname.to_owned()).await
    }

    /// Create `name` as the host owner and open it in `mode`.
    pub async fn create(&self, name: &str, mode: u8, perm: u32) -> Result<File> {
        let (dirs, base) = utils::split_base(name).ok_or(Error::AlreadyExists)?;
        let base = base.to_owned();
        let mut file = self
            .attached(self.hostowner.clone(), dirs.join("/"))
            .await?;
        file.create(&base, perm, mode).await?;
        Ok(file)
    }

    /// Open `name` as the host owner.
    pub async fn open(&self, name: &str, mode: u8) -> Result<File> {
        let mut file = self.attached(self.hostowner.clone(), name.to_owned()).await?;
        file.open(mode).await?;
        Ok(file)
    }

    /// Remove `name` as the host owner.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let file = self.attached(self.hostowner.clone(), name.to_owned()).await?;
        file.remove().await
    }

    /// Serve the namespace on a dial string until an error occurs.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        self.server.clone().listen(addr).await
    }

    /// Serve the namespace on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.server.clone().serve_tcp(listener).await
    }
}

fn clunk_ok(ns: &mut Namespace, fid: Result<FId>) {
    if let Ok(fid) = fid {
        fid.clunk(ns);
    }
}

/// A local handle into the namespace. Clunked when dropped.
pub struct File {
    fs: Fs,
    fid: Option<FId>,
}

impl File {
    fn new(fs: Fs, fid: FId) -> File {
        File { fs, fid: Some(fid) }
    }

    /// Run `job` on this file's fid.
    async fn with_fid<T, F>(&mut self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Namespace, &mut FId) -> Result<T> + Send + 'static,
    {
        let mut fid = self.fid.take().ok_or(Error::UnknownFid)?;
        let (fid, res) = self
            .fs
            .run(
                move |ns| {
                    let res = job(ns, &mut fid);
                    (fid, res)
                },
                |ns, (fid, _)| fid.clunk(ns),
            )
            .await?;
        self.fid = Some(fid);
        res
    }

    /// Consume the fid with `job`.
    async fn finish<F>(mut self, job: F) -> Result<()>
    where
        F: FnOnce(&mut Namespace, FId) -> Result<()> + Send + 'static,
    {
        let fid = self.fid.take().ok_or(Error::UnknownFid)?;
        self.fs.run(move |ns| job(ns, fid), |_, _| {}).await?
    }

    pub fn uid(&self) -> &str {
        self.fid.as_ref().map_or(users::NONE, FId::uid)
    }

    /// Walk `names`, all of which must resolve, to a new file.
    pub async fn walk(&mut self, names: &[&str]) -> Result<File> {
        let fresh = self.fs.server.mint().await?;
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let fid = self.fid.take().ok_or(Error::UnknownFid)?;
        let (fid, walked) = self
            .fs
            .run(
                move |ns| {
                    let walked = fid
                        .walk(ns, &names, fresh)
                        .and_then(|(_, walked)| walked.ok_or(Error::NotFound));
                    (fid, walked)
                },
                |ns, (fid, walked)| {
                    fid.clunk(ns);
                    clunk_ok(ns, walked);
                },
            )
            .await?;
        self.fid = Some(fid);
        Ok(File::new(self.fs.clone(), walked?))
    }

    pub async fn open(&mut self, mode: u8) -> Result<QId> {
        self.with_fid(move |ns, fid| Ok(fid.open(ns, mode)?.0))
            .await
    }

    /// Create `name` in this directory; the handle moves to the new file.
    pub async fn create(&mut self, name: &str, perm: u32, mode: u8) -> Result<QId> {
        let name = name.to_owned();
        self.with_fid(move |ns, fid| Ok(fid.create(ns, &name, perm, mode)?.0))
            .await
    }

    pub async fn read(&mut self, offset: u64, count: u32) -> Result<Vec<u8>> {
        self.with_fid(move |ns, fid| fid.read(ns, offset, count))
            .await
    }

    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<u32> {
        let mut offset = offset;
        let mut total = 0;
        for chunk in data.chunks(IOUNIT as usize) {
            let chunk = chunk.to_vec();
            let n = self
                .with_fid(move |ns, fid| fid.write(ns, offset, &chunk))
                .await?;
            offset += n as u64;
            total += n;
        }
        Ok(total)
    }

    pub async fn stat(&mut self) -> Result<Stat> {
        self.with_fid(|ns, fid| fid.stat(ns)).await
    }

    pub async fn wstat(&mut self, stat: &Stat) -> Result<()> {
        let stat = stat.clone();
        self.with_fid(move |ns, fid| fid.wstat(ns, &stat)).await
    }

    pub async fn remove(self) -> Result<()> {
        self.finish(|ns, fid| fid.remove(ns)).await
    }

    pub async fn clunk(self) -> Result<()> {
        self.finish(|ns, fid| {
            fid.clunk(ns);
            Ok(())
        })
        .await
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Some(fid) = self.fid.take() {
            self.fs
                .server
                .submit(Transaction::Local(Box::new(move |ns: &mut Namespace| {
                    fid.clunk(ns)
                })));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{dm, om};
    use futures::FutureExt;

    #[tokio::test]
    async fn local_create_write_read() {
        let fs = Fs::new("glenda");
        let mut f = fs.create("/notes", om::RDWR, 0o644).await.unwrap();
        assert_eq!(f.write(0, b"remember").await.unwrap(), 8);
        assert_eq!(f.read(0, 100).await.unwrap(), b"remember");
        f.clunk().await.unwrap();

        let mut f = fs.open("/notes", om::READ).await.unwrap();
        assert_eq!(f.uid(), "glenda");
        assert_eq!(f.read(4, 4).await.unwrap(), b"mber");
        let st = f.stat().await.unwrap();
        assert_eq!((st.uid.as_str(), st.gid.as_str()), ("glenda", "adm"));
        drop(f);

        fs.remove("/notes").await.unwrap();
        assert!(matches!(
            fs.open("/notes", om::READ).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn empty_hostowner_becomes_adm() {
        let fs = Fs::new("");
        assert_eq!(fs.hostowner(), "adm");
        let mut root = fs.attach("adm", "").await.unwrap();
        assert_eq!(root.stat().await.unwrap().uid, "adm");
    }

    #[tokio::test]
    async fn attach_falls_back_to_none() {
        let fs = Fs::new("glenda");
        let mut root = fs.attach("stranger", "").await.unwrap();
        assert_eq!(root.uid(), "none");
        assert!(matches!(
            root.create("x", 0o644, om::WRITE).await,
            Err(Error::PermissionDenied)
        ));
        assert!(matches!(
            fs.attach("glenda", "/missing").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn walk_and_directories() {
        let fs = Fs::new("glenda");
        fs.create("/a", om::READ, dm::DIR | 0o755).await.unwrap();
        fs.create("/a/b", om::READ, 0o644).await.unwrap();

        let mut root = fs.attach("glenda", "").await.unwrap();
        let mut b = root.walk(&["a", "b"]).await.unwrap();
        assert_eq!(b.stat().await.unwrap().name, "b");
        assert!(matches!(
            root.walk(&["a", "nope"]).await,
            Err(Error::NotFound)
        ));

        assert!(matches!(
            fs.remove("/a").await,
            Err(Error::DirectoryNotEmpty)
        ));
        b.remove().await.unwrap();
        fs.remove("/a").await.unwrap();
        assert!(matches!(fs.remove("/").await, Err(Error::PermissionDenied)));
    }

    #[tokio::test]
    async fn dropped_files_are_clunked() {
        let fs = Fs::new("glenda");
        fs.create("/lock", om::READ, dm::EXCL | 0o644).await.unwrap();

        let held = fs.open("/lock", om::READ).await.unwrap();
        assert!(matches!(
            fs.open("/lock", om::READ).await,
            Err(Error::Busy)
        ));
        drop(held);
        fs.open("/lock", om::READ).await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_calls_release_their_fid() {
        let fs = Fs::new("glenda");
        fs.create("/lock", om::READ, dm::EXCL | 0o644).await.unwrap();

        let mut held = fs.open("/lock", om::READ).await.unwrap();
        assert!(held.read(0, 10).now_or_never().is_none());
        drop(held);
        fs.open("/lock", om::READ).await.unwrap().clunk().await.unwrap();

        let mut lock = fs.attach("glenda", "/lock").await.unwrap();
        assert!(lock.open(om::READ).now_or_never().is_none());
        assert!(matches!(lock.read(0, 1).await, Err(Error::UnknownFid)));
        drop(lock);
        fs.open("/lock", om::READ).await.unwrap();
    }
}
