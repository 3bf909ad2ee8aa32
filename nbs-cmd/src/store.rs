use std::{
    fs::{self, create_dir_all, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use nbs::application::{InsertStatus, Product, ProductQueue};

/// Name of the product index within a store directory.
pub const INDEX_NAME: &str = "products.jsonl";

/// Product store backed by a directory.
///
/// Each product is written to `<signature>.gini` and described by one JSON line in
/// [INDEX_NAME]. A product whose file already exists is a duplicate.
///
/// Product data is first written to `.<signature>.part` and renamed into place once
/// complete, so a failed write never leaves a truncated product behind.
pub struct DirStore {
    dir: PathBuf,
    index: File,
    max_size: Option<usize>,
}

impl DirStore {
    pub fn open(dir: &Path, max_size: Option<usize>) -> Result<Self> {
        create_dir_all(dir).with_context(|| format!("creating store directory {dir:?}"))?;
        let path = dir.join(INDEX_NAME);
        let index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening product index {path:?}"))?;
        Ok(DirStore {
            dir: dir.to_path_buf(),
            index,
            max_size,
        })
    }

    fn product_path(&self, product: &Product) -> PathBuf {
        self.dir.join(format!("{}.gini", product.signature_hex()))
    }

    fn partial_path(&self, product: &Product) -> PathBuf {
        self.dir.join(format!(".{}.part", product.signature_hex()))
    }
}

fn write_file(path: &Path, dat: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(dat)?;
    file.sync_all()
}

impl ProductQueue for DirStore {
    fn insert(&mut self, product: &Product) -> nbs::Result<InsertStatus> {
        if self.max_size.is_some_and(|max| product.data.len() > max) {
            return Ok(InsertStatus::TooBig);
        }
        let path = self.product_path(product);
        if path.try_exists()? {
            return Ok(InsertStatus::Duplicate);
        }

        let partial = self.partial_path(product);
        if let Err(err) = write_file(&partial, &product.data) {
            let _ = fs::remove_file(&partial);
            return Err(err.into());
        }
        fs::rename(&partial, &path)?;

        let mut line = serde_json::to_vec(&product.info())
            .map_err(|err| nbs::Error::System(format!("serializing product info: {err}")))?;
        line.push(b'\n');
        self.index.write_all(&line)?;
        Ok(InsertStatus::Inserted)
    }
}
