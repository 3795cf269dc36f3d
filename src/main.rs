//! pairsync - synchronize one directory with a single peer

use anyhow::{Context, Result};
use clap::Parser;

use pairsync::cli::Args;
use pairsync::{net, Session, Settings, SyncConfig};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = Args::parse();
    let settings = Settings::load(&args.settings)?;

    if !args.dir.is_dir() {
        anyhow::bail!("Not a directory: {}", args.dir.display());
    }
    let root = std::fs::canonicalize(&args.dir)
        .with_context(|| format!("Failed to canonicalize {}", args.dir.display()))?;
    let config = SyncConfig::from_settings(root, &settings, args.debug);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let report = rt.block_on(async {
        let conn = net::connect(&settings).await?;
        let mut session = Session::new(config)?;
        session.run(conn).await
    })?;

    println!(
        "Synchronized: {} pulled ({} bytes), {} served, {} deleted",
        report.transfer.files_pulled,
        report.transfer.bytes_pulled,
        report.transfer.files_served,
        report.deleted.len()
    );
    Ok(())
}
