//! Copies a directory tree through a full sender/receiver pair.
//!
//! Usage: `arbor-copy <source-dir> <dest-dir> [config.toml]`
//!
//! Both parties run in this process and talk over a [`LocalChannel`], which
//! serializes every envelope exactly as a network transport would.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbor_receiver::{DirectoryHandler, LocalChannel, ReceiverService};
use arbor_sender::{EnvelopeRemote, TransferListener, TransferService};
use arbor_transfer::{TransferConfig, TransferError, TransferProgress, scan_dir};

/// Logs sender progress.
struct ConsoleListener;

impl TransferListener for ConsoleListener {
    fn on_progress(&self, p: &TransferProgress) {
        info!(
            transfer = %p.transfer_id,
            percent = format_args!("{:.1}", p.percentage()),
            bytes = p.bytes_transferred,
            total = p.total_bytes,
            rate = format_args!("{:.0} B/s", p.bytes_per_second),
            eta_ms = p.eta_ms,
            "progress"
        );
    }

    fn on_failed(&self, p: &TransferProgress, cause: &TransferError) {
        tracing::error!(transfer = %p.transfer_id, error = %cause, "copy failed");
    }
}

struct Args {
    source: PathBuf,
    dest: PathBuf,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args_os().skip(1);
    let (Some(source), Some(dest)) = (args.next(), args.next()) else {
        bail!("usage: arbor-copy <source-dir> <dest-dir> [config.toml]");
    };
    let config = args.next().map(PathBuf::from);
    if args.next().is_some() {
        bail!("unexpected extra arguments");
    }
    Ok(Args {
        source: source.into(),
        dest: dest.into(),
        config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,arbor=debug")),
        )
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => TransferConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TransferConfig::default(),
    };

    let roots = scan_dir(&args.source)
        .with_context(|| format!("scanning {}", args.source.display()))?;
    if roots.is_empty() {
        bail!("{} is empty", args.source.display());
    }

    let receiver = Arc::new(ReceiverService::new(
        config.clone(),
        Arc::new(DirectoryHandler::new(&args.dest)),
    )?);
    let remote = Arc::new(EnvelopeRemote::new(LocalChannel::new(receiver)));
    let sender = TransferService::new(config, remote)?;

    let handle = sender.start(roots, None, Arc::new(ConsoleListener));
    info!(
        transfer = %handle.transfer_id(),
        from = %args.source.display(),
        to = %args.dest.display(),
        "copy started"
    );

    let done = handle.wait().await?;
    info!(
        bytes = done.total_bytes,
        frames = done.frames,
        retries = done.retry_count,
        elapsed_ms = done.elapsed().num_milliseconds(),
        "copy committed"
    );
    Ok(())
}
