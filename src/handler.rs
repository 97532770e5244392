//! The user-facing reader contract and the per-slot handler variants.

/// What the reactor should do with a registration after a datagram is
/// delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Leave the registration in place.
    Continue,
    /// Deregister the socket before the next event is processed. Datagrams
    /// already pulled into the current receive batch after this one are
    /// discarded.
    Remove,
}

/// Trait that users implement to consume datagrams from a registered socket.
pub trait DatagramReader: Send + 'static {
    /// Called once per received datagram. The slice borrows one of the
    /// reactor's pooled receive buffers and is valid only for the duration
    /// of the call; copy out anything that must outlive it.
    fn on_read(&mut self, datagram: &[u8]) -> Control;

    /// Called exactly once per successful registration, after the socket
    /// has been deregistered (whether by [`Control::Remove`], an explicit
    /// cancel, or reactor shutdown).
    fn on_remove(&mut self) {}
}

/// Adapt a closure into a [`DatagramReader`] with an empty `on_remove`.
pub fn from_fn<F>(f: F) -> impl DatagramReader
where
    F: FnMut(&[u8]) -> Control + Send + 'static,
{
    struct FnReader<F>(F);

    impl<F> DatagramReader for FnReader<F>
    where
        F: FnMut(&[u8]) -> Control + Send + 'static,
    {
        fn on_read(&mut self, datagram: &[u8]) -> Control {
            (self.0)(datagram)
        }
    }

    FnReader(f)
}

/// Per-slot handler variant. Dispatch indexes the slot table and matches on
/// this instead of branching on "is this the control descriptor".
pub(crate) enum Handler {
    /// The slot is on the free list.
    Vacant,
    /// The slot owns the cross-thread wake-up descriptor; firing it drains
    /// the submission queue.
    Wakeup,
    /// The slot owns a registered datagram socket.
    Datagram(Box<dyn DatagramReader>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fn_forwards_datagrams() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reader = from_fn(move |d: &[u8]| {
            sink.lock().extend_from_slice(d);
            Control::Continue
        });
        assert_eq!(reader.on_read(b"xy"), Control::Continue);
        assert_eq!(*seen.lock(), b"xy");
    }
}
