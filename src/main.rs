//! CLI binary for storing and discovering cartridges.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cartridge_ledger::address::LedgerAddress;
use cartridge_ledger::progress::{Phase, ProgressEvent, ProgressReporter};
use cartridge_ledger::record::{Semver, SCHEMA_VERSION};
use cartridge_ledger::{
    drivers, CartridgeCache, CatalogIndexer, Config, Downloader, FetchRequest, ListOptions,
    ProgressStore, UploadRequest, Uploader,
};

#[derive(Parser)]
#[command(name = "cartridge-ledger")]
#[command(about = "Store and discover cartridges on public ledgers")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List applications in the catalog
    Catalog {
        /// Include retired applications
        #[arg(long)]
        show_retired: bool,

        /// Only show this application
        #[arg(long)]
        app_id: Option<u32>,
    },

    /// Download and verify a cartridge
    Download {
        /// Cartridge address to read from
        #[arg(long, conflicts_with = "app_id")]
        address: Option<String>,

        /// Resolve the cartridge through the catalog
        #[arg(long)]
        app_id: Option<u32>,

        /// Catalog version (latest when omitted)
        #[arg(long, requires = "app_id")]
        version: Option<Semver>,

        /// Output file
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Upload a file as a cartridge and publish it in the catalog
    /// (tx-ledger backend only; other backends need a transaction signer)
    Upload {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        app_id: u32,

        #[arg(long, default_value = "0")]
        platform: u8,

        #[arg(long)]
        version: Semver,

        /// Catalog title (at most 15 bytes)
        #[arg(long)]
        title: String,

        /// Resume or reuse a specific cartridge id
        #[arg(long)]
        cartridge_id: Option<u32>,
    },

    /// Mark an application as retired in the catalog
    /// (tx-ledger backend only; other backends need a transaction signer)
    Retire {
        #[arg(long)]
        app_id: u32,
    },

    /// Show upload progress files
    Progress {
        #[arg(long)]
        app_id: Option<u32>,

        #[arg(long, requires = "app_id")]
        cartridge_id: Option<u32>,
    },

    /// Convert between hex and user-friendly ledger addresses
    Address {
        #[arg(long, conflicts_with = "friendly")]
        hex: Option<String>,

        #[arg(long)]
        friendly: Option<String>,
    },
}

/// Download progress rendered as a terminal bar.
struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} chunks {msg}")?
                .progress_chars("█▓░"),
        );
        bar.set_prefix("[download]");
        Ok(Self { bar })
    }
}

impl ProgressReporter for BarReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        if event.chunks_expected > 0 {
            self.bar.set_length(event.chunks_expected);
            self.bar.set_position(event.chunks_found);
        }
        match event.phase {
            Phase::Done => self
                .bar
                .finish_with_message(format!("done, {} bytes", event.bytes)),
            phase => self.bar.set_message(phase.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cartridge_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    cli.config.validate()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Catalog {
            show_retired,
            app_id,
        } => list_catalog(&cli.config, cancel, show_retired, app_id).await?,
        Commands::Download {
            address,
            app_id,
            version,
            out,
        } => download(&cli.config, cancel, address, app_id, version, out).await?,
        Commands::Upload {
            file,
            app_id,
            platform,
            version,
            title,
            cartridge_id,
        } => {
            cli.config.ensure_signerless_writes()?;
            let request = UploadRequest {
                data: tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?,
                app_id,
                platform,
                schema: SCHEMA_VERSION,
                version,
                title,
                chunk_size: cli.config.chunk_size,
                cartridge_id,
            };
            upload(&cli.config, cancel, request).await?
        }
        Commands::Retire { app_id } => {
            cli.config.ensure_signerless_writes()?;
            retire(&cli.config, cancel, app_id).await?
        }
        Commands::Progress {
            app_id,
            cartridge_id,
        } => show_progress(&cli.config, app_id, cartridge_id).await?,
        Commands::Address { hex, friendly } => convert_address(hex, friendly)?,
    }

    Ok(())
}

fn catalog_indexer(config: &Config, cancel: CancellationToken) -> Result<CatalogIndexer> {
    let address = config
        .catalog_address
        .clone()
        .context("--catalog-address is required")?;
    let driver = drivers::connect(config, None)?;
    Ok(CatalogIndexer::new(driver, address)
        .with_scan_options(config.scan_options())
        .with_cancel(cancel))
}

async fn list_catalog(
    config: &Config,
    cancel: CancellationToken,
    show_retired: bool,
    app_id: Option<u32>,
) -> Result<()> {
    let indexer = catalog_indexer(config, cancel)?;
    let options = ListOptions {
        include_retired: show_retired,
        publisher: config.publisher.clone(),
    };

    let games = indexer.list(&options).await?;
    for game in games.iter().filter(|g| app_id.map_or(true, |id| g.app_id == id)) {
        let retired = if game.retired { " (retired)" } else { "" };
        println!("{:>10}  {}{}", game.app_id, game.title, retired);
        for version in &game.versions {
            println!(
                "            v{}  platform {}  height {}  ref {}",
                version.version,
                version.platform,
                version.height,
                version.cartridge_ref.to_hex()
            );
        }
    }
    Ok(())
}

async fn download(
    config: &Config,
    cancel: CancellationToken,
    address: Option<String>,
    app_id: Option<u32>,
    version: Option<Semver>,
    out: Option<PathBuf>,
) -> Result<()> {
    let driver = drivers::connect(config, None)?;

    let cache = match config.resolved_cache_dir() {
        Some(dir) => Some(Arc::new(
            CartridgeCache::open(&dir, config.cache_budget_bytes)
                .await
                .with_context(|| format!("opening cache at {}", dir.display()))?,
        )),
        None => None,
    };

    let mut downloader = Downloader::new(Arc::clone(&driver))
        .with_options(config.download_options(cancel.clone()))
        .with_reporter(Arc::new(BarReporter::new()?));
    if let Some(cache) = &cache {
        downloader = downloader.with_cache(Arc::clone(cache));
    }

    let result = match (address, app_id) {
        (Some(address), _) => {
            let request = FetchRequest::new(address).with_publisher(config.publisher.clone());
            downloader.fetch(&request).await?
        }
        (None, Some(app_id)) => {
            let indexer = catalog_indexer(config, cancel)?;
            let options = ListOptions {
                include_retired: true,
                publisher: config.publisher.clone(),
            };
            let game = indexer
                .find(app_id, &options)
                .await?
                .with_context(|| format!("app {} is not in the catalog", app_id))?;
            let entry = match version {
                Some(version) => game
                    .version(version)
                    .with_context(|| format!("app {} has no version {}", app_id, version))?,
                None => game
                    .latest()
                    .with_context(|| format!("app {} has no versions", app_id))?,
            };
            downloader
                .fetch_from_catalog(entry, config.publisher.clone())
                .await?
        }
        (None, None) => bail!("pass --address or --app-id"),
    };

    let out = out.unwrap_or_else(|| {
        PathBuf::from(format!("cartridge-{}.bin", result.header.cartridge_id))
    });
    tokio::fs::write(&out, &result.bytes)
        .await
        .with_context(|| format!("writing {}", out.display()))?;

    if let Some(cache) = cache {
        cache.close().await?;
    }

    println!(
        "cartridge {}: {} bytes, checksum {} verified{} -> {}",
        result.header.cartridge_id,
        result.bytes.len(),
        result.header.checksum,
        if result.from_cache { " (cached)" } else { "" },
        out.display()
    );
    Ok(())
}

async fn upload(config: &Config, cancel: CancellationToken, request: UploadRequest) -> Result<()> {
    let catalog_address = config
        .catalog_address
        .clone()
        .context("--catalog-address is required")?;
    let driver = drivers::connect(config, None)?;
    let store = ProgressStore::new(&config.progress_dir);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner} {msg} ({elapsed})")?);
    spinner.set_message(format!(
        "uploading {} bytes for app {}",
        request.data.len(),
        request.app_id
    ));
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let outcome = Uploader::new(driver, store, catalog_address)
        .with_options(config.upload_options(cancel))
        .run(request)
        .await;
    spinner.finish_and_clear();

    let report = match outcome {
        Ok(report) => report,
        Err(e) if e.is_retryable_by_caller() => {
            bail!("{}; progress was saved, run the same command again to resume", e)
        }
        Err(e) => return Err(e.into()),
    };

    println!("cartridge {} at {}", report.cartridge_id, report.address);
    println!(
        "  chunks: {} total, {} written now, {} already on the ledger",
        report.total_chunks, report.written_now, report.skipped
    );
    println!("  checksum: {}", report.checksum);
    if let Some(header) = &report.header_ref {
        println!("  header: {}", header);
    }
    if let Some(catalog) = &report.catalog_ref {
        println!("  catalog entry: {}", catalog);
    }
    Ok(())
}

async fn retire(config: &Config, cancel: CancellationToken, app_id: u32) -> Result<()> {
    let indexer = catalog_indexer(config, cancel)?;
    let reference = indexer.retire_app(app_id).await?;
    println!("app {} retired in {}", app_id, reference);
    Ok(())
}

async fn show_progress(
    config: &Config,
    app_id: Option<u32>,
    cartridge_id: Option<u32>,
) -> Result<()> {
    let store = ProgressStore::new(&config.progress_dir);
    let uploads: Vec<_> = match (app_id, cartridge_id) {
        (Some(app_id), Some(cartridge_id)) => store
            .load(app_id, cartridge_id)
            .await?
            .into_iter()
            .collect(),
        (app_id, _) => store
            .list()
            .await?
            .into_iter()
            .filter(|p| app_id.map_or(true, |id| p.app_id == id))
            .collect(),
    };

    if uploads.is_empty() {
        println!("no uploads in {}", store.dir().display());
    }
    for p in uploads {
        println!(
            "app {} cartridge {}: {}/{} chunks, {} failed, {:?}, updated {}",
            p.app_id,
            p.cartridge_id,
            p.sent_chunks,
            p.total_chunks,
            p.failed_chunks.len(),
            p.status,
            p.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

fn convert_address(hex: Option<String>, friendly: Option<String>) -> Result<()> {
    match (hex, friendly) {
        (Some(hex), _) => {
            let address = LedgerAddress::from_hex(&hex)?;
            println!("{}", address.to_user_friendly());
        }
        (None, Some(friendly)) => {
            let address = LedgerAddress::from_user_friendly_checked(&friendly)?;
            println!("{}", address.to_hex());
        }
        (None, None) => bail!("pass --hex or --friendly"),
    }
    Ok(())
}
