use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use arw::backup::LocalBackup;
use arw::id::uuid_from_rel_path;
use arw::rpc::RpcServer;
use arw::store::BlockStore;

#[derive(Parser)]
#[command(name = "arw", version = "1.0.0", about = "Deduplicating, versioned file backup")]
struct Cli {
    /// Repository root (store, version records, link tree)
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a source tree into the repository
    Backup {
        source: PathBuf,
    },
    /// Restore the current version of a source-relative path
    Restore {
        /// Source-relative path, or a version id as <xx>/<b64hi>.<b64lo>
        path: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Recompute every chunk's checksums across all buckets
    Verify,
    /// Show repository state and space usage
    Info,
    /// Serve the backup RPC on stdin/stdout (the remote peer)
    Serve,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {

        // ── Backup ───────────────────────────────────────────────────────────
        Commands::Backup { source } => {
            let mut backup = LocalBackup::open(&cli.repo, &source)?;
            backup.run()?;
            println!("Backed up {} file(s) from {}", backup.stats.files, source.display());
        }

        // ── Restore ──────────────────────────────────────────────────────────
        Commands::Restore { path, output } => {
            let mut backup = LocalBackup::open(&cli.repo, ".")?;
            let mut sink: Box<dyn Write> = match &output {
                Some(p) => Box::new(std::fs::File::create(p)?),
                None => Box::new(std::io::stdout().lock()),
            };
            let written = match uuid_from_rel_path(&path) {
                Some(uuid) => backup.restore(&uuid, &mut sink)?,
                None => backup.restore_path(std::path::Path::new(&path), &mut sink)?,
            };
            sink.flush()?;
            if let Some(p) = output {
                println!("Restored {written} B to {}", p.display());
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify => {
            let mut store = BlockStore::open(&cli.repo)?;
            let failures = store.verify_all()?;
            if failures == 0 {
                println!("All {} bucket(s) verified clean", store.bucket_count());
            } else {
                println!("{failures} corrupt chunk(s) found");
                std::process::exit(1);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info => {
            let mut store = BlockStore::open(&cli.repo)?;
            store.dump(&mut std::io::stdout().lock())?;
            let (used, total) = store.size()?;
            println!("Used: {used} B of {total} B on disk");
        }

        // ── Serve ────────────────────────────────────────────────────────────
        Commands::Serve => {
            let stdin = std::io::stdin().lock();
            let stdout = std::io::stdout().lock();
            let mut server = RpcServer::new(&cli.repo, stdin, stdout)?;
            server.serve()?;
        }
    }
    Ok(())
}
