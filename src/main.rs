use std::path::PathBuf;

use anyhow::{bail, Context};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use blesd::ble::BleUart;
use blesd::{
    run_deletes, run_downloads, BatchReport, Command, DownloadTarget, Event, NodeKind, SdRemote,
};

#[derive(Parser)]
#[command(name = "blesd", version, about = "Browse and transfer files on a BLE UART SD-card bridge")]
struct Cli {
    /// Advertised name of the bridge to connect to.
    #[arg(short, long)]
    device: String,

    /// Print machine-readable JSON instead of plain text.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List a directory on the card (the root when omitted).
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Show metadata for one file.
    Info { path: String },
    /// Delete one or more files.
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Download one or more files.
    Get {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Local directory the files are written into.
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
    /// Upload a local file.
    Put {
        file: PathBuf,
        /// Remote directory to place the file in (the root when omitted).
        #[arg(long, default_value = "")]
        dest: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    let adapter = adapters
        .first()
        .context("no Bluetooth adapter available")?
        .clone();

    info!(device = %cli.device, "scanning");
    let peripheral = find_peripheral(&adapter, &cli.device).await?;
    let (link, chunks, connected) = BleUart::connect(&adapter, peripheral).await?;
    let (remote, mut events) = SdRemote::spawn(link.clone(), chunks, connected);

    let outcome = run(&cli, &remote, &mut events).await;

    if let Err(e) = link.disconnect().await {
        warn!(error = %e, "disconnect failed");
    }
    outcome
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Scans until a peripheral advertising `name` shows up.
async fn find_peripheral(adapter: &Adapter, name: &str) -> anyhow::Result<Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    let mut events = adapter.events().await?;

    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };
        let Ok(peripheral) = adapter.peripheral(&id).await else {
            continue;
        };
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        if properties.local_name.as_deref() != Some(name) {
            continue;
        }

        adapter.stop_scan().await?;
        return Ok(peripheral);
    }

    bail!("scan ended before {name:?} was discovered")
}

async fn run(cli: &Cli, remote: &SdRemote, events: &mut mpsc::Receiver<Event>) -> anyhow::Result<()> {
    match &cli.command {
        Cmd::Ls { path } => {
            remote.list(path).await?;
            print_listing(events, cli.json).await
        }
        Cmd::Info { path } => {
            remote.info(path).await?;
            loop {
                match events.recv().await.context("engine stopped")? {
                    Event::InfoReady(info) => {
                        if cli.json {
                            println!("{}", serde_json::to_string_pretty(&info)?);
                        } else {
                            println!("name:     {}", info.name);
                            println!("size:     {} bytes", info.size);
                            println!("created:  {}", info.created);
                            println!("modified: {}", info.modified);
                        }
                        return Ok(());
                    }
                    Event::CommandFailed { message, .. } => bail!("info failed: {message}"),
                    Event::Disconnected => bail!("connection lost"),
                    _ => {}
                }
            }
        }
        Cmd::Rm { paths } => {
            let report = run_deletes(remote, events, paths.clone()).await;
            print_report("deleted", &report);

            // Mirror the interactive flow: show the directory as it looks
            // after the deletes.
            if !report.aborted {
                let dir = parent_dir(paths.first().map(String::as_str).unwrap_or(""));
                remote.list(dir).await?;
                print_listing(events, cli.json).await?;
            }
            finish_report(report)
        }
        Cmd::Get { paths, out } => {
            let targets = paths
                .iter()
                .map(|p| {
                    let name = p.rsplit('/').next().unwrap_or(p);
                    DownloadTarget {
                        remote: p.clone(),
                        dest: out.join(name),
                    }
                })
                .collect();
            let report = run_downloads(remote, events, targets).await;
            print_report("downloaded", &report);
            finish_report(report)
        }
        Cmd::Put { file, dest } => {
            remote.upload(file, dest).await?;
            let mut last_decile = 0;
            loop {
                match events.recv().await.context("engine stopped")? {
                    Event::UploadStarted { total } => info!(total, "upload started"),
                    Event::UploadProgress { sent, total } if total > 0 => {
                        let decile = sent * 10 / total;
                        if decile > last_decile {
                            last_decile = decile;
                            info!("upload {}%", decile * 10);
                        }
                    }
                    Event::UploadDone { source } => {
                        println!("uploaded {}", source.display());
                        return Ok(());
                    }
                    Event::CommandFailed {
                        command: Command::Put,
                        message,
                    } => bail!("upload failed: {message}"),
                    Event::Disconnected => bail!("connection lost"),
                    _ => {}
                }
            }
        }
    }
}

async fn print_listing(events: &mut mpsc::Receiver<Event>, json: bool) -> anyhow::Result<()> {
    loop {
        match events.recv().await.context("engine stopped")? {
            Event::ListingReady(nodes) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&nodes)?);
                } else {
                    for node in &nodes {
                        match node.kind {
                            NodeKind::Up => println!("../"),
                            NodeKind::Directory => println!("{}/", node.name),
                            NodeKind::File => println!("{}", node.name),
                        }
                    }
                }
                return Ok(());
            }
            Event::CommandFailed { message, .. } => bail!("listing failed: {message}"),
            Event::Disconnected => bail!("connection lost"),
            _ => {}
        }
    }
}

fn print_report(verb: &str, report: &BatchReport) {
    for item in &report.items {
        match &item.error {
            None => println!("{verb} {}", item.target),
            Some(e) => println!("failed  {}: {e}", item.target),
        }
    }
}

fn finish_report(report: BatchReport) -> anyhow::Result<()> {
    if report.aborted {
        bail!("batch aborted: connection lost");
    }
    if !report.all_ok() {
        bail!("some items failed");
    }
    Ok(())
}

/// The remote directory containing `path` (empty = root).
fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}
