mod config;
mod info;
mod ingest;
mod send;
mod store;

use std::{io::stderr, net::SocketAddr, path::PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use nbs::transport::ProductType;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest an NBS frame stream and store the products it carries.
    ///
    /// Frames are read on their own thread into a frame queue and decoded on the main
    /// thread. Products are written to the output directory, one file per product named by
    /// its MD5 signature, and indexed in products.jsonl.
    Ingest {
        /// JSON ingest configuration. Flags override values in the file.
        #[arg(short, long, value_name = "path")]
        config: Option<PathBuf>,

        /// Frame queue capacity in bytes.
        #[arg(long, value_name = "bytes")]
        capacity: Option<usize>,

        /// Product output directory.
        #[arg(short, long, value_name = "path")]
        output: Option<PathBuf>,

        /// Origin host name recorded with each product.
        #[arg(long)]
        origin: Option<String>,

        /// Discard products larger than this many bytes.
        #[arg(long, value_name = "bytes")]
        max_product_size: Option<usize>,

        /// Receive frames as UDP datagrams on this address instead of reading a stream.
        #[arg(long, value_name = "addr", conflicts_with = "input")]
        udp: Option<SocketAddr>,

        /// Count products in memory rather than writing them.
        #[arg(long, action)]
        dry_run: bool,

        /// Frame stream file; - or nothing reads standard input.
        input: Option<PathBuf>,
    },
    /// Show information about an NBS frame stream file.
    Info {
        /// Input frame stream file
        input: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: info::Format,
    },
    /// Write the NBS frames of a GINI image file.
    Send {
        /// Run number of the frames.
        #[arg(short, long, default_value_t = 0)]
        run: u16,

        /// Product type of the image: 1 (GOES east), 2 (GOES west) or 3 (NOAAPORT option).
        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=3))]
        prod_type: u8,

        /// Delete output file if it already exists
        #[arg(long, action)]
        clobber: bool,

        /// Output file path.
        #[arg(short, long, default_value = "frames.dat", value_name = "path")]
        output: PathBuf,

        /// Input GINI image file.
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("NBS_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Ingest {
            config,
            capacity,
            output,
            origin,
            max_product_size,
            udp,
            dry_run,
            input,
        } => {
            let mut config = match config {
                Some(path) => config::IngestConfig::load(path)?,
                None => config::IngestConfig::default(),
            };
            if let Some(capacity) = capacity {
                config.capacity = *capacity;
            }
            if let Some(output) = output {
                config.output.clone_from(output);
            }
            if let Some(origin) = origin {
                config.origin.clone_from(origin);
            }
            if max_product_size.is_some() {
                config.max_product_size = *max_product_size;
            }
            if udp.is_some() {
                config.udp = *udp;
            }
            ingest::ingest(&config, input.as_deref(), *dry_run)
        }
        Commands::Info { input, format } => info::info(input, format),
        Commands::Send {
            run,
            prod_type,
            clobber,
            output,
            input,
        } => {
            if !clobber && output.exists() {
                bail!("{output:?} exists; use --clobber");
            }
            send::send(input, output, ProductType::from(*prod_type), *run)
        }
    }
}
