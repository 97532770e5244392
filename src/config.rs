use crate::error::Error;

/// Configuration for a [`Reactor`](crate::Reactor).
///
/// All sizes are fixed at construction; the event array and the receive
/// pool are allocated once and never resized.
#[derive(Clone)]
pub struct Config {
    /// Debug label for the loop thread.
    pub thread_name: String,
    /// Capacity of the epoll event-output array.
    pub max_selected_events: usize,
    /// Number of datagrams pulled per recvmmsg call; also the number of
    /// preallocated receive buffers.
    pub max_datagrams_per_read: usize,
    /// Size of each pooled receive buffer. Datagrams larger than this are
    /// truncated by the kernel, so size it to the largest expected datagram.
    pub read_buffer_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_name: "gramio-loop".to_string(),
            max_selected_events: 256,
            max_datagrams_per_read: 16,
            read_buffer_bytes: 2048,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.thread_name.is_empty() {
            return Err(Error::InvalidConfig("thread_name must be non-empty".to_string()));
        }
        if self.max_selected_events == 0 {
            return Err(Error::InvalidConfig("max_selected_events must be >= 1".to_string()));
        }
        if self.max_datagrams_per_read == 0 {
            return Err(Error::InvalidConfig("max_datagrams_per_read must be >= 1".to_string()));
        }
        if self.read_buffer_bytes == 0 {
            return Err(Error::InvalidConfig("read_buffer_bytes must be >= 1".to_string()));
        }
        Ok(())
    }
}
