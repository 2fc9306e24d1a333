//! Event-loop boundary
//!
//! The surrounding socket multiplexer owns readiness polling; this layer only
//! tells it what to watch next. A mask request can change read interest,
//! write interest, or schedule an immediate retry ("trial" read/write) that
//! re-invokes the relay without waiting for a new readiness event.

/// Read interest requested for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadInterest {
    /// Leave the current read interest untouched.
    Unchanged,
    /// Stop watching for read readiness.
    Off,
    /// Watch for read readiness until told otherwise.
    Poll,
}

/// Write interest requested for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteInterest {
    /// Leave the current write interest untouched.
    Unchanged,
    /// Stop watching for write readiness.
    Off,
    /// Watch for a single write-readiness event, then disarm.
    Single,
}

/// A requested change to the readiness mask of one descriptor.
///
/// Built with chained constructors:
///
/// ```
/// use tlshook::event::EventMask;
///
/// let mask = EventMask::new().poll_read().no_write();
/// assert_ne!(mask, EventMask::new());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub read: ReadInterest,
    pub write: WriteInterest,
    /// Re-invoke the read path immediately, without a new readiness event.
    pub trial_read: bool,
    /// Re-invoke the write path immediately, without a new readiness event.
    pub trial_write: bool,
}

impl EventMask {
    pub const fn new() -> Self {
        EventMask {
            read: ReadInterest::Unchanged,
            write: WriteInterest::Unchanged,
            trial_read: false,
            trial_write: false,
        }
    }

    pub fn poll_read(mut self) -> Self {
        self.read = ReadInterest::Poll;
        self
    }

    pub fn no_read(mut self) -> Self {
        self.read = ReadInterest::Off;
        self
    }

    pub fn single_write(mut self) -> Self {
        self.write = WriteInterest::Single;
        self
    }

    pub fn no_write(mut self) -> Self {
        self.write = WriteInterest::Off;
        self
    }

    pub fn trial_read(mut self) -> Self {
        self.trial_read = true;
        self
    }

    pub fn trial_write(mut self) -> Self {
        self.trial_write = true;
        self
    }

    /// True if the request would not change anything.
    pub fn is_empty(&self) -> bool {
        *self == EventMask::new()
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::new()
    }
}

/// Receiver for mask-change requests.
///
/// Implemented by the event loop in production and by a recording fake in
/// tests. The relay never calls the transport for readiness itself.
pub trait EventSink {
    fn change_mask(&mut self, fd: usize, mask: EventMask);
}
