use {
    clap::Parser,
    log::info,
    nix::unistd::{User, getuid},
    ramfs::Fs,
};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!0.0.0.0!5640")]
    address: String,

    /// Owner of the root directory, defaults to the invoking user
    #[arg(long)]
    hostowner: Option<String>,

    /// Log every 9P message at info level
    #[arg(short = 'D', long)]
    chatty: bool,
}

fn invoking_user() -> String {
    match User::from_uid(getuid()) {
        Ok(Some(user)) => user.name,
        _ => String::new(),
    }
}

async fn ramfsd_main(
    Cli {
        address,
        hostowner,
        chatty,
    }: Cli,
) -> ramfs::Result<i32> {
    let hostowner = hostowner.unwrap_or_else(invoking_user);
    let fs = Fs::new(&hostowner);
    fs.set_chatty(chatty);

    info!("hostowner: {}", fs.hostowner());
    info!("ready to accept clients: {}", address);
    tokio::select! {
        res = fs.listen(&address) => res.and(Ok(0)),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ramfsd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
