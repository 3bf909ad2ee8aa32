use std::{fs::File, io::BufWriter, path::Path};

use anyhow::{Context, Result};
use nbs::{
    link::WriteFrames,
    presentation::{
        gini::{FillerCache, Gini},
        send_gini,
    },
    transport::{ProductType, Sender},
};
use tracing::info;

pub fn send(input: &Path, output: &Path, prod_type: ProductType, run: u16) -> Result<()> {
    let dat = std::fs::read(input).with_context(|| format!("reading {input:?}"))?;
    let mut gini = Gini::new(FillerCache::new());
    gini.deserialize(&dat, prod_type)
        .with_context(|| format!("decoding GINI image {input:?}"))?;

    let dest =
        File::create(output).with_context(|| format!("failed to create output {output:?}"))?;
    let mut sender = Sender::new(WriteFrames::new(BufWriter::new(dest))).with_run(run);
    send_gini(&gini, &mut sender).context("sending frames")?;
    let frames = sender.sequence();
    sender
        .into_inner()
        .into_inner()
        .with_context(|| format!("writing {output:?}"))?;

    info!(
        wmo = %gini.wmo(),
        blocks = gini.num_blocks(),
        frames,
        "wrote {output:?}"
    );
    Ok(())
}
