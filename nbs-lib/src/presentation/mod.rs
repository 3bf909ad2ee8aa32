//! Presentation layer: reassembly of products from their data blocks.
//!
//! Only GINI images are supported.
pub mod gini;

use tracing::debug;

use crate::{
    application::Application,
    link::FrameSink,
    transport::{ProductType, Sender},
    Error, Result,
};
use gini::{FillerCache, Gini};

/// Kind of product being reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InProgress {
    Gini,
}

/// Routes product blocks to the reassembler for their product type and hands finished
/// products to the [Application].
pub struct Presentation {
    application: Application,
    gini: Gini,
    current: Option<InProgress>,
}

impl Presentation {
    /// `filler` may be shared with other presentation layers in the same process.
    #[must_use]
    pub fn new(application: Application, filler: FillerCache) -> Self {
        Presentation {
            application,
            gini: Gini::new(filler),
            current: None,
        }
    }

    /// Start a GINI image from its headers block.
    ///
    /// # Errors
    /// [Error::Logic] if a product is in progress, otherwise see [Gini::start].
    pub fn recv_gini_start(
        &mut self,
        buf: &[u8],
        rec_len: usize,
        recs_per_block: usize,
        compressed: bool,
        prod_type: ProductType,
    ) -> Result<()> {
        if let Some(kind) = self.current {
            return Err(Error::Logic(format!("{kind:?} product already in progress")));
        }
        self.gini
            .start(buf, rec_len, recs_per_block, compressed, prod_type)?;
        self.current = Some(InProgress::Gini);
        Ok(())
    }

    /// Add a data block to the GINI image in progress.
    ///
    /// # Errors
    /// [Error::Logic] if no GINI image is in progress, otherwise see [Gini::add_block].
    pub fn recv_gini_block(
        &mut self,
        block_index: usize,
        data: &[u8],
        compressed: bool,
    ) -> Result<()> {
        if self.current != Some(InProgress::Gini) {
            return Err(Error::logic("GINI block without GINI image in progress"));
        }
        self.gini.add_block(block_index, data, compressed)
    }

    /// Finish the product in progress, if any, and pass it to the application layer.
    ///
    /// # Errors
    /// If the product cannot be finished or inserted.
    pub fn recv_end(&mut self) -> Result<()> {
        match self.current.take() {
            None => Ok(()),
            Some(InProgress::Gini) => {
                self.gini.finish()?;
                debug!(
                    wmo = %self.gini.wmo(),
                    blocks = self.gini.num_blocks(),
                    records = self.gini.actual_records(),
                    "finished GINI image"
                );
                self.application.recv_gini(&self.gini)?;
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.current.is_some()
    }

    #[must_use]
    pub fn application(&self) -> &Application {
        &self.application
    }
}

/// Send a finished GINI image, one block per frame.
///
/// # Errors
/// [Error::Logic] if the image is still being accumulated, [Error::Invalid] if its
/// geometry or blocks cannot be framed, or any error from the sender.
pub fn send_gini<S: FrameSink>(gini: &Gini, sender: &mut Sender<S>) -> Result<()> {
    if gini.is_started() {
        return Err(Error::logic("cannot send an unfinished GINI image"));
    }
    let recs_per_block = u8::try_from(gini.recs_per_block()).map_err(|_| {
        Error::Invalid(format!(
            "{} records per block doesn't fit in a product-definition header",
            gini.recs_per_block()
        ))
    })?;
    let bytes_per_rec = u16::try_from(gini.rec_len()).map_err(|_| {
        Error::Invalid(format!(
            "record length {} doesn't fit in a product-specific header",
            gini.rec_len()
        ))
    })?;

    sender.send_start(
        recs_per_block,
        bytes_per_rec,
        gini.prod_type(),
        gini.num_blocks(),
        gini.is_compressed(),
    )?;
    for block in gini.blocks() {
        sender.send_block(block)?;
    }
    debug!(wmo = %gini.wmo(), blocks = gini.num_blocks(), "sent GINI image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::MemoryQueue,
        presentation::gini::{Pdb, WmoHeader},
    };

    fn presentation() -> (Presentation, MemoryQueue) {
        let queue = MemoryQueue::new();
        let app = Application::new(Box::new(queue.clone()), "test");
        (Presentation::new(app, FillerCache::new()), queue)
    }

    fn headers_block() -> Vec<u8> {
        let pdb = Pdb {
            num_logical_recs: 3,
            logical_rec_size: 4,
            length: 512,
            ..Default::default()
        };
        let mut buf = WmoHeader::new("TIGE01 KNES 221915").encode();
        buf.extend(pdb.encode());
        buf
    }

    #[test]
    fn test_start_while_in_progress() {
        let (mut pres, _) = presentation();
        pres.recv_gini_start(&headers_block(), 4, 3, false, ProductType::GoesEast)
            .unwrap();
        assert!(pres.is_in_progress());
        assert!(matches!(
            pres.recv_gini_start(&headers_block(), 4, 3, false, ProductType::GoesEast),
            Err(Error::Logic(_))
        ));
    }

    #[test]
    fn test_block_without_start() {
        let (mut pres, _) = presentation();
        assert!(matches!(
            pres.recv_gini_block(1, &[0u8; 12], false),
            Err(Error::Logic(_))
        ));
    }

    #[test]
    fn test_end_inserts_product() {
        let (mut pres, queue) = presentation();
        pres.recv_end().unwrap();
        assert!(queue.is_empty());

        pres.recv_gini_start(&headers_block(), 4, 3, false, ProductType::GoesEast)
            .unwrap();
        pres.recv_gini_block(1, &[9u8; 12], false).unwrap();
        pres.recv_end().unwrap();

        assert!(!pres.is_in_progress());
        assert_eq!(queue.len(), 1);
        assert_eq!(pres.application().counts().inserted, 1);
        let data = &queue.products()[0].data;
        assert_eq!(data.len(), 21 + 512 + 12 + 4);
    }

    #[test]
    fn test_failed_start_leaves_idle() {
        let (mut pres, _) = presentation();
        assert!(matches!(
            pres.recv_gini_start(b"garbage", 4, 3, false, ProductType::GoesEast),
            Err(Error::Invalid(_))
        ));
        assert!(!pres.is_in_progress());
    }

    #[test]
    fn test_send_unfinished() {
        let (mut pres, _) = presentation();
        pres.recv_gini_start(&headers_block(), 4, 3, false, ProductType::GoesEast)
            .unwrap();
        let mut sender = Sender::new(Vec::<Vec<u8>>::new());
        assert!(matches!(
            send_gini(&pres.gini, &mut sender),
            Err(Error::Logic(_))
        ));
    }

    #[test]
    fn test_send_gini() {
        let mut gini = Gini::new(FillerCache::new());
        gini.start(&headers_block(), 4, 3, false, ProductType::GoesWest)
            .unwrap();
        gini.finish().unwrap();

        let mut sender = Sender::new(Vec::<Vec<u8>>::new());
        send_gini(&gini, &mut sender).unwrap();
        let frames = sender.into_inner();
        assert_eq!(frames.len(), gini.num_blocks());
    }
}
