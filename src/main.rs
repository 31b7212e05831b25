use anyhow::Context;
use clap::Parser;
use std::io;
use std::path::Path;
use tokio::task;
use tracing::info;

use udp_tftp::cli::{Command, PeerArgs};
use udp_tftp::client::resolve;
use udp_tftp::console::{self, Operation};
use udp_tftp::logging::init_logging;
use udp_tftp::{Cli, Client, Server, TransferSummary};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose)?;

    match args.command {
        Command::Server(server) => {
            let config = server.config();
            let server = Server::bind(config.clone())
                .await
                .with_context(|| format!("failed to bind {}", config.addr))?;
            server.run().await?;
        }
        Command::Get(transfer) => get(&transfer.peer, &transfer.filename).await?,
        Command::Put(transfer) => put(&transfer.peer, &transfer.filename).await?,
        Command::Client(peer) => {
            let request =
                task::spawn_blocking(|| console::prompt(&mut io::stdin().lock(), &mut io::stdout()))
                    .await??;
            match request.operation {
                Operation::Retrieve => get(&peer, &request.filename).await?,
                Operation::Send => put(&peer, &request.filename).await?,
            }
        }
    }
    Ok(())
}

async fn connect(peer: &PeerArgs) -> anyhow::Result<Client> {
    let server = resolve(&peer.server, peer.port)
        .await
        .with_context(|| format!("failed to resolve {}", peer.server))?;
    Ok(Client::new(server, peer.config()))
}

async fn get(peer: &PeerArgs, filename: &str) -> anyhow::Result<()> {
    let client = connect(peer).await?;
    let summary = client
        .download(filename, Path::new(filename))
        .await
        .with_context(|| format!("download of {filename} from {} failed", client.server()))?;
    report("File downloaded successfully", &summary);
    Ok(())
}

async fn put(peer: &PeerArgs, filename: &str) -> anyhow::Result<()> {
    let client = connect(peer).await?;
    let summary = client
        .upload(Path::new(filename), filename)
        .await
        .with_context(|| format!("upload of {filename} to {} failed", client.server()))?;
    report("File sent to server", &summary);
    Ok(())
}

fn report(what: &str, summary: &TransferSummary) {
    info!(
        blocks = summary.blocks,
        bytes = summary.bytes,
        "{what}, cost: {:.3}s, speed: {:.2} MB/s",
        summary.elapsed.as_secs_f64(),
        summary.speed()
    );
}
