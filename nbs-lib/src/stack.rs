use typed_builder::TypedBuilder;

use crate::{
    application::{Application, InsertCounts, ProductQueue},
    link::{FrameSource, Link, LinkStats},
    presentation::{gini::FillerCache, Presentation},
    queue::FrameReader,
    transport::{Transport, TransportStats},
    Error, Result,
};

/// Options for a [Stack].
#[derive(Clone, TypedBuilder)]
pub struct StackOptions {
    /// Host name recorded as the origin of every product.
    #[builder(default = String::from("localhost"), setter(into))]
    pub origin: String,
    /// Filler block cache, shared with any other stacks in the process.
    #[builder(default)]
    pub filler: FillerCache,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The complete receive path: link, transport, presentation and application layers
/// delivering products to a [ProductQueue].
///
/// # Example
/// ```
/// use nbs::{application::MemoryQueue, queue::FrameQueue, Stack, StackOptions};
///
/// let products = MemoryQueue::new();
/// let mut stack = Stack::new(Box::new(products.clone()), StackOptions::default());
///
/// let (writer, mut reader) = FrameQueue::new(1 << 16).unwrap().split();
/// drop(writer); // no frames
/// stack.receive_queue(&mut reader).unwrap();
/// assert!(products.is_empty());
/// ```
pub struct Stack {
    link: Link,
    transport: Transport,
}

impl Stack {
    pub fn new(queue: Box<dyn ProductQueue + Send>, options: StackOptions) -> Self {
        let application = Application::new(queue, options.origin);
        let presentation = Presentation::new(application, options.filler);
        Stack {
            link: Link::new(),
            transport: Transport::new(presentation),
        }
    }

    /// Process frames from a queue until it is shut down and drained.
    ///
    /// # Errors
    /// Any fatal error from the protocol layers.
    pub fn receive_queue(&mut self, reader: &mut FrameReader) -> Result<()> {
        self.link
            .recv_queue(reader, &mut self.transport)
            .map_err(fatal)
    }

    /// Process frames from a source until it ends.
    ///
    /// # Errors
    /// An I/O error from the source, or any fatal error from the protocol layers.
    pub fn receive_source<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        self.link
            .recv_source(source, &mut self.transport)
            .map_err(fatal)
    }

    #[must_use]
    pub fn link_stats(&self) -> &LinkStats {
        self.link.stats()
    }

    #[must_use]
    pub fn transport_stats(&self) -> &TransportStats {
        self.transport.stats()
    }

    #[must_use]
    pub fn insert_counts(&self) -> &InsertCounts {
        self.transport.presentation().application().counts()
    }
}

/// The link layer absorbs invalid frames, so one escaping it is a logic error.
fn fatal(err: Error) -> Error {
    match err {
        Error::Invalid(msg) => Error::Logic(msg),
        err => err,
    }
}
