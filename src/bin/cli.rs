use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use rs_swarm::{Config, DownloadEvent, Metadata, Session};
use tracing_subscriber::EnvFilter;

/// Download a torrent from its swarm
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The .torrent file to download.
    #[arg(short, long)]
    file: PathBuf,

    /// Directory the content is written to.
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Port reported to trackers.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Extra peer to connect to; may be repeated.
    #[arg(long = "peer", value_name = "IP:PORT")]
    peers: Vec<SocketAddr>,

    /// Maximum number of peers connected at once.
    #[arg(long, default_value_t = 30)]
    connections: usize,

    /// Maximum number of peers unchoked at once.
    #[arg(long, default_value_t = 10)]
    unchoke: usize,
}

/// Report whole-percent steps and the final 100% exactly once.
fn worth_reporting(percent: f64, last_reported: f64) -> bool {
    let finished = percent >= 100.0 && last_reported < 100.0;
    percent - last_reported >= 1.0 || finished
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let metadata = Metadata::from_file(&args.file)?;
    println!(
        "Downloading {} ({} bytes in {} chunks)",
        metadata.name,
        metadata.total_size,
        metadata.chunk_count()
    );

    let config = Config {
        download_dir: args.out,
        listen_port: args.port,
        connection_limit: args.connections,
        unchoke_limit: args.unchoke,
        ..Config::default()
    };
    let session = Session::new(metadata, config)?;
    for peer in &args.peers {
        session.add_peer(peer.ip(), peer.port());
    }

    let mut events = session.subscribe();
    session.start_download().await?;

    let mut last_reported = -1.0;
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DownloadEvent::Progress(percent)) if worth_reporting(percent, last_reported) => {
                    last_reported = percent;
                    println!("Progress: {percent:.1}%");
                }
                Some(DownloadEvent::Completed) => break Ok(()),
                Some(DownloadEvent::Failed(reason)) => break Err(reason),
                Some(_) => {}
                None => break Err("event stream closed".to_string()),
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted at {:.1}%", session.progress());
                break Ok(());
            }
        }
    };

    session.stop().await;
    match outcome {
        Ok(()) => {
            println!("Done");
            Ok(())
        }
        Err(reason) => Err(reason.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worth_reporting() {
        assert!(worth_reporting(0.0, -1.0));
        assert!(!worth_reporting(0.5, 0.0));
        assert!(worth_reporting(1.2, 0.0));
        assert!(worth_reporting(100.0, 99.5));
        assert!(!worth_reporting(100.0, 100.0));
    }
}
