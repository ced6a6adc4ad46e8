use {
    clap::{Parser, Subcommand, ValueEnum},
    log::debug,
    ramfs::{
        Client, Error, Perm, Stat, dm, om,
        utils::{self, Result},
    },
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

const ROOT_FID: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Net {
    Tcp,
    Unix,
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// Network to dial
    #[arg(long, value_enum, default_value_t = Net::Tcp)]
    net: Net,

    /// Server address, host:port or a socket path
    #[arg(long, default_value = "localhost:5640")]
    addr: String,

    /// Tree to attach to
    #[arg(long, default_value = "")]
    aname: String,

    /// User to attach as
    #[arg(long, env = "USER", default_value = "none")]
    uname: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Change the group of files
    Chgrp {
        group: String,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Change the permission bits of files (octal)
    Chmod {
        #[arg(value_parser = parse_octal)]
        mode: u32,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Create files, or directories with -d
    Create {
        #[arg(short = 'd')]
        dir: bool,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// List a directory or describe a file
    Ls {
        #[arg(short = 'l')]
        long: bool,
        #[arg(default_value = "/")]
        file: String,
    },
    /// Attach and detach
    Noop,
    /// Copy files to standard output
    Read {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Print the stat of files
    Stat {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Replace the contents of a file with standard input
    Write { file: String },
}

fn parse_octal(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s, 8)
        .ok()
        .filter(|mode| mode & !Perm::RWX == 0)
        .ok_or_else(|| format!("bad mode: {}", s))
}

fn entry(st: &Stat, long: bool) -> String {
    if long {
        format!(
            "{} {} {} {} {}",
            Perm(st.mode),
            st.uid,
            st.gid,
            st.length,
            st.name
        )
    } else if st.mode & dm::DIR != 0 {
        format!("{}/", st.name)
    } else {
        st.name.clone()
    }
}

/// The long listing of a file followed by its qid and times.
fn status(st: &Stat) -> String {
    format!(
        "{} q ({:016x} {} {:02x}) at {} mt {} muid {}",
        entry(st, true),
        st.qid.path,
        st.qid.version,
        st.qid.typ.bits(),
        st.atime,
        st.mtime,
        st.muid
    )
}

struct Session<S> {
    client: Client<S>,
    next: u32,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn start(mut client: Client<S>, uname: &str, aname: &str) -> Result<Self> {
        let msize = client.version(ramfs::MSIZE).await?;
        debug!("msize {}", msize);
        client.attach(ROOT_FID, uname, aname).await?;
        Ok(Session {
            client,
            next: ROOT_FID + 1,
        })
    }

    async fn walk(&mut self, path: &str) -> Result<u32> {
        let fid = self.next;
        self.next += 1;
        self.client.walk_path(ROOT_FID, fid, path).await?;
        Ok(fid)
    }

    async fn chgrp(&mut self, group: &str, file: &str) -> Result<()> {
        let fid = self.walk(file).await?;
        let stat = Stat {
            gid: group.to_owned(),
            ..Stat::unchanged()
        };
        let res = self.client.wstat(fid, &stat).await;
        self.client.clunk(fid).await?;
        res
    }

    async fn chmod(&mut self, mode: u32, file: &str) -> Result<()> {
        let fid = self.walk(file).await?;
        let res = match self.client.stat(fid).await {
            Ok(old) => {
                let stat = Stat {
                    mode: (old.mode & !Perm::RWX) | mode,
                    ..Stat::unchanged()
                };
                self.client.wstat(fid, &stat).await
            }
            Err(e) => Err(e),
        };
        self.client.clunk(fid).await?;
        res
    }

    async fn create(&mut self, dir: bool, file: &str) -> Result<()> {
        let (parent, name) = utils::split_base(file).ok_or(Error::AlreadyExists)?;
        let fid = self.walk(&parent.join("/")).await?;
        let perm = if dir { dm::DIR | 0o777 } else { 0o666 };
        let res = self.client.create(fid, name, perm, om::READ).await;
        self.client.clunk(fid).await?;
        res.map(|_| ())
    }

    async fn ls(&mut self, file: &str, long: bool) -> Result<Vec<String>> {
        let fid = self.walk(file).await?;
        let res = self.listing(fid, long).await;
        self.client.clunk(fid).await?;
        res
    }

    async fn listing(&mut self, fid: u32, long: bool) -> Result<Vec<String>> {
        let st = self.client.stat(fid).await?;
        if st.mode & dm::DIR == 0 {
            return Ok(vec![entry(&st, long)]);
        }
        self.client.open(fid, om::READ).await?;
        let stats = self.client.read_dir(fid).await?;
        Ok(stats.iter().map(|st| entry(st, long)).collect())
    }

    async fn read(&mut self, file: &str) -> Result<Vec<u8>> {
        let fid = self.walk(file).await?;
        let res = match self.client.open(fid, om::READ).await {
            Ok(_) => self.client.read_all(fid).await,
            Err(e) => Err(e),
        };
        self.client.clunk(fid).await?;
        res
    }

    async fn stat(&mut self, file: &str) -> Result<Stat> {
        let fid = self.walk(file).await?;
        let res = self.client.stat(fid).await;
        self.client.clunk(fid).await?;
        res
    }

    async fn write(&mut self, file: &str, data: &[u8]) -> Result<()> {
        let fid = self.walk(file).await?;
        let res = match self.client.open(fid, om::WRITE | om::TRUNC).await {
            Ok(_) => self.client.write_all(fid, data).await,
            Err(e) => Err(e),
        };
        self.client.clunk(fid).await?;
        res
    }

    async fn run(&mut self, cmd: Cmd) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        match cmd {
            Cmd::Chgrp { group, files } => {
                for file in &files {
                    self.chgrp(&group, file).await?;
                }
            }
            Cmd::Chmod { mode, files } => {
                for file in &files {
                    self.chmod(mode, file).await?;
                }
            }
            Cmd::Create { dir, files } => {
                for file in &files {
                    self.create(dir, file).await?;
                }
            }
            Cmd::Ls { long, file } => {
                for line in self.ls(&file, long).await? {
                    stdout.write_all(format!("{}\n", line).as_bytes()).await?;
                }
            }
            Cmd::Noop => {}
            Cmd::Read { files } => {
                for file in &files {
                    let data = self.read(file).await?;
                    stdout.write_all(&data).await?;
                }
            }
            Cmd::Stat { files } => {
                for file in &files {
                    let st = self.stat(file).await?;
                    stdout.write_all(format!("{}\n", status(&st)).as_bytes()).await?;
                }
            }
            Cmd::Write { file } => {
                let mut data = Vec::new();
                tokio::io::stdin().read_to_end(&mut data).await?;
                self.write(&file, &data).await?;
            }
        }
        stdout.flush().await?;
        self.client.clunk(ROOT_FID).await
    }
}

async fn racon_main(cli: Cli) -> Result<i32> {
    match cli.net {
        Net::Tcp => {
            let client = Client::dial(cli.addr.as_str()).await?;
            let mut session = Session::start(client, &cli.uname, &cli.aname).await?;
            session.run(cli.cmd).await?;
        }
        Net::Unix => {
            let client = Client::dial_unix(&cli.addr).await?;
            let mut session = Session::start(client, &cli.uname, &cli.aname).await?;
            session.run(cli.cmd).await?;
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = racon_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("racon: {}", e);
        1
    });

    std::process::exit(exit_code);
}
