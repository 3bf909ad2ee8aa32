use std::{
    fs::File,
    io::{stdin, BufReader},
    net::UdpSocket,
    path::Path,
    thread,
};

use anyhow::{anyhow, Context, Result};
use nbs::{
    application::{MemoryQueue, ProductQueue},
    link::{FrameSource, Link, LinkStats, StreamFrames},
    queue::FrameQueue,
    Stack, StackOptions,
};
use tracing::{debug, info};

use crate::{config::IngestConfig, store::DirStore};

fn open_source(
    config: &IngestConfig,
    input: Option<&Path>,
) -> Result<Box<dyn FrameSource + Send>> {
    if let Some(addr) = config.udp {
        let socket = UdpSocket::bind(addr).with_context(|| format!("binding {addr}"))?;
        info!("receiving frames on udp://{addr}");
        return Ok(Box::new(socket));
    }
    match input {
        Some(path) if path != Path::new("-") => {
            let file = File::open(path).with_context(|| format!("opening input {path:?}"))?;
            info!("reading frames from {path:?}");
            Ok(Box::new(StreamFrames::new(BufReader::new(file))))
        }
        _ => {
            info!("reading frames from stdin");
            Ok(Box::new(StreamFrames::new(stdin())))
        }
    }
}

pub fn ingest(config: &IngestConfig, input: Option<&Path>, dry_run: bool) -> Result<()> {
    debug!("{config:?}");
    let mut source = open_source(config, input)?;
    let (mut writer, mut reader) = FrameQueue::new(config.capacity)
        .context("creating frame queue")?
        .split();

    let memory = MemoryQueue::new();
    let queue: Box<dyn ProductQueue + Send> = if dry_run {
        Box::new(match config.max_product_size {
            Some(max) => memory.clone().with_max_size(max),
            None => memory.clone(),
        })
    } else {
        Box::new(DirStore::open(&config.output, config.max_product_size)?)
    };
    let mut stack = Stack::new(
        queue,
        StackOptions::builder().origin(config.origin.clone()).build(),
    );

    let io = thread::Builder::new()
        .name("nbs-io".into())
        .spawn(move || -> nbs::Result<LinkStats> {
            let mut link = Link::new();
            link.fill_queue(&mut *source, &mut writer)?;
            Ok(link.stats().clone())
        })
        .context("spawning I/O thread")?;

    stack
        .receive_queue(&mut reader)
        .context("receiving frames")?;
    drop(reader);

    let io_stats = io
        .join()
        .map_err(|_| anyhow!("I/O thread panicked"))?
        .context("reading frames")?;

    let transport = stack.transport_stats();
    let counts = stack.insert_counts();
    info!(
        frames = io_stats.total_frames,
        bytes = io_stats.total_bytes,
        missing = transport.missing,
        invalid = transport.invalid,
        products = transport.products,
        "end of input"
    );
    info!(
        inserted = counts.inserted,
        duplicates = counts.duplicates,
        too_big = counts.too_big,
        "products"
    );
    if dry_run {
        for product in memory.products() {
            println!("{product}");
        }
    }
    Ok(())
}
