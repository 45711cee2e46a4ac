use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use leech::{DownloadSupervisor, EngineConfig, LeechError, TorrentMeta};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "leech", about = "Download a torrent from its tracker's swarm", version)]
struct Cli {
    #[arg(long, short = 't', value_name = "FILE", help = "Path to the .torrent metainfo file")]
    torrent: PathBuf,

    #[arg(long, short = 'o', value_name = "DIR", env = "LEECH_OUT", default_value = "downloads", help = "Directory to write the downloaded files into")]
    out: PathBuf,

    #[arg(long, short = 'p', value_name = "PORT", env = "LEECH_PORT", default_value_t = 6881, help = "Port reported to the tracker")]
    port: u16,

    #[arg(long, value_name = "COUNT", env = "LEECH_MAX_PEERS", default_value_t = 30, help = "Maximum number of concurrent peer connections")]
    max_peers: usize,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(&self.out);
        config.listen_port = self.port;
        config.max_peers = self.max_peers.max(1);
        config
    }
}

fn print_summary(meta: &TorrentMeta) {
    println!("announce:     {}", meta.announce);
    println!("name:         {}", meta.name);
    println!("piece length: {}", meta.piece_length);
    println!("pieces:       {}", meta.num_pieces());
    println!("size:         {} bytes", meta.total_length);
    println!("info hash:    {}", meta.info_hash_hex());
    for file in &meta.files {
        println!("  {} ({} bytes)", file.path.join("/"), file.length);
    }
}

async fn run(cli: Cli) -> Result<(), LeechError> {
    let raw = tokio::fs::read(&cli.torrent).await?;
    let meta = TorrentMeta::from_bytes(&raw)?;
    print_summary(&meta);

    let supervisor = DownloadSupervisor::new(meta, cli.engine_config())?;
    let cancel = supervisor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping download");
            cancel.cancel();
        }
    });

    let summary = supervisor.run().await?;
    info!(elapsed = ?summary.elapsed, peers = summary.peers_tried, "done");
    for path in &summary.files {
        println!("wrote {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
