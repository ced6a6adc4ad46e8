use ramfs::{Client, Data, Error, FCall, Fs, MSIZE, Msg, Stat, dm, om};
use tokio::net::{TcpListener, TcpStream};

async fn start() -> (Fs, Client<TcpStream>) {
    let fs = Fs::new("glenda");

    let mut group = fs.open("/adm/group", om::WRITE).await.unwrap();
    group.write(0, b"alice::\nbob::\n").await.unwrap();
    group.clunk().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = fs.clone();
    tokio::spawn(async move { server.serve(listener).await });

    let mut client = Client::dial(addr).await.unwrap();
    assert_eq!(client.version(MSIZE).await.unwrap(), MSIZE);
    (fs, client)
}

/// A world writable /tmp, made by the host owner.
async fn mktmp(fs: &Fs) {
    let mut tmp = fs.create("/tmp", om::READ, dm::DIR | 0o777).await.unwrap();
    let stat = Stat {
        mode: dm::DIR | 0o777,
        ..Stat::unchanged()
    };
    tmp.wstat(&stat).await.unwrap();
    tmp.clunk().await.unwrap();
}

fn remote<T: std::fmt::Debug>(res: ramfs::Result<T>, ename: &str) {
    match res {
        Err(Error::Remote(ref e)) if e == ename => {}
        other => panic!("expected {:?}, got {:?}", ename, other),
    }
}

#[tokio::test]
async fn alice_writes_and_reads_back() {
    let (fs, mut c) = start().await;
    mktmp(&fs).await;

    c.attach(0, "alice", "").await.unwrap();
    c.walk_path(0, 1, "/tmp").await.unwrap();
    c.create(1, "x", 0o644, om::WRITE).await.unwrap();
    assert_eq!(c.write(1, 0, b"hello").await.unwrap(), 5);
    c.clunk(1).await.unwrap();
    c.clunk(0).await.unwrap();

    c.attach(2, "alice", "").await.unwrap();
    c.walk_path(2, 3, "/tmp/x").await.unwrap();
    c.open(3, om::READ).await.unwrap();
    assert_eq!(c.read(3, 0, 100).await.unwrap(), b"hello");

    let st = c.stat(3).await.unwrap();
    assert_eq!((st.uid.as_str(), st.gid.as_str()), ("alice", "adm"));
    assert_eq!(st.length, 5);
}

#[tokio::test]
async fn partial_walk_leaves_newfid_unbound() {
    let (fs, mut c) = start().await;
    fs.create("/a", om::READ, dm::DIR | 0o755).await.unwrap();
    fs.create("/a/b", om::READ, dm::DIR | 0o755).await.unwrap();

    c.attach(0, "glenda", "").await.unwrap();
    let wqids = c.walk(0, 1, &["a", "b", "c"]).await.unwrap();
    assert_eq!(wqids.len(), 2);
    assert!(wqids.iter().all(|q| q.typ.contains(ramfs::QIdType::DIR)));
    remote(c.stat(1).await, "unknown fid");

    remote(c.walk(0, 1, &["c"]).await, "file does not exist");
    assert!(matches!(
        c.walk_path(0, 1, "/a/b/c").await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
async fn non_empty_directory_survives_remove() {
    let (fs, mut c) = start().await;
    fs.create("/a", om::READ, dm::DIR | 0o755).await.unwrap();
    fs.create("/a/b", om::READ, 0o644).await.unwrap();

    c.attach(0, "glenda", "").await.unwrap();
    c.walk_path(0, 1, "/a").await.unwrap();
    remote(c.remove(1).await, "directory not empty");
    // remove clunks even on failure
    remote(c.stat(1).await, "unknown fid");

    c.walk_path(0, 2, "/a/b").await.unwrap();
    assert_eq!(c.stat(2).await.unwrap().name, "b");
}

#[tokio::test]
async fn pipelined_writes_apply_in_order() {
    let (fs, mut c) = start().await;
    mktmp(&fs).await;

    c.attach(0, "alice", "").await.unwrap();
    c.walk_path(0, 1, "/tmp").await.unwrap();
    c.create(1, "f", 0o644, om::RDWR).await.unwrap();

    for (tag, data) in [(10, b"A"), (11, b"B")] {
        let body = FCall::TWrite {
            fid: 1,
            offset: 0,
            data: Data(data.to_vec()),
        };
        c.send(&Msg { tag, body }).await.unwrap();
    }
    for tag in [10, 11] {
        let reply = c.recv().await.unwrap();
        assert_eq!(reply.tag, tag);
        assert_eq!(reply.body, FCall::RWrite { count: 1 });
    }

    assert_eq!(c.read(1, 0, 10).await.unwrap(), b"B");
}

#[tokio::test]
async fn removed_path_waits_for_last_fid() {
    let (_fs, mut c) = start().await;
    c.attach(0, "glenda", "").await.unwrap();

    c.walk(0, 1, &[]).await.unwrap();
    let f = c.create(1, "f", 0o644, om::READ).await.unwrap().0;

    c.walk_path(0, 2, "/f").await.unwrap();
    c.remove(2).await.unwrap();

    c.walk(0, 3, &[]).await.unwrap();
    let g = c.create(3, "g", 0o644, om::READ).await.unwrap().0;
    assert_ne!(g.path, f.path);
    assert_eq!(c.stat(1).await.unwrap().qid.path, f.path);

    c.clunk(1).await.unwrap();
    c.walk(0, 4, &[]).await.unwrap();
    let h = c.create(4, "h", 0o644, om::READ).await.unwrap().0;
    assert_eq!(h.path, f.path);
}

#[tokio::test]
async fn identities_through_admin_files() {
    let (fs, mut c) = start().await;

    let mut ctl = fs.open("/adm/ctl", om::WRITE).await.unwrap();
    ctl.write(0, b"uname carol\nuname adm +carol\n").await.unwrap();
    ctl.clunk().await.unwrap();

    c.attach(0, "glenda", "/adm").await.unwrap();
    c.walk(0, 1, &["group"]).await.unwrap();
    c.open(1, om::READ).await.unwrap();
    let table = String::from_utf8(c.read_all(1).await.unwrap()).unwrap();
    assert!(table.lines().any(|l| l == "carol::"));
    assert!(table.lines().any(|l| l.starts_with("adm::") && l.contains("carol")));

    c.attach(2, "bob", "").await.unwrap();
    // bob may look at /adm but not search it
    let wqids = c.walk(2, 3, &["adm", "group"]).await.unwrap();
    assert_eq!(wqids.len(), 1);
    remote(c.stat(3).await, "unknown fid");
}

#[tokio::test]
async fn directory_listing_over_the_wire() {
    let (fs, mut c) = start().await;
    mktmp(&fs).await;
    for name in ["/tmp/one", "/tmp/two"] {
        fs.create(name, om::READ, 0o644).await.unwrap();
    }

    c.attach(0, "bob", "/tmp").await.unwrap();
    c.open(0, om::READ).await.unwrap();
    let mut names: Vec<String> = c
        .read_dir(0)
        .await
        .unwrap()
        .into_iter()
        .map(|st| st.name)
        .collect();
    names.sort();
    assert_eq!(names, ["one", "two"]);
}

#[tokio::test]
async fn long_names_get_a_whole_ename() {
    let (_fs, mut c) = start().await;
    c.attach(0, "glenda", "").await.unwrap();
    c.walk(0, 1, &[]).await.unwrap();

    let name = format!("a/{}", "b".repeat(65530));
    match c.create(1, &name, 0o644, om::READ).await {
        Err(Error::Remote(e)) => {
            assert!(e.starts_with("bad file name: a/bbb"));
            assert_eq!(e.len(), ramfs::error::ERRMAX);
        }
        other => panic!("unexpected {:?}", other),
    }

    let name = "c".repeat(ramfs::users::MAXNAME + 1);
    assert!(c.create(1, &name, 0o644, om::READ).await.is_err());
    // the connection is still usable
    c.create(1, "short", 0o644, om::READ).await.unwrap();
}
