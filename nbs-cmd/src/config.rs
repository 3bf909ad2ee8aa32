use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default frame queue capacity; room for several thousand maximum size frames.
pub const DEFAULT_CAPACITY: usize = 1 << 24;

/// Settings for `nbs ingest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Frame queue capacity in bytes
    pub capacity: usize,
    /// Product output directory
    pub output: PathBuf,
    /// Origin host name recorded with each product
    pub origin: String,
    /// Products larger than this are discarded
    pub max_product_size: Option<usize>,
    /// Receive UDP datagrams on this address rather than reading a stream
    pub udp: Option<SocketAddr>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            capacity: DEFAULT_CAPACITY,
            output: PathBuf::from("products"),
            origin: std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost")),
            max_product_size: None,
            udp: None,
        }
    }
}

impl IngestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening config {path:?}"))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config {path:?}"))
    }
}
