//! Native reactor state: the epoll instance, the cross-thread wake-up
//! descriptor, the event-output array, and the preallocated recvmmsg pool.
//!
//! All buffers are allocated once at construction and reused for the life
//! of the reactor; buffer base addresses never move, so readers may borrow
//! datagram payloads directly out of the pool.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use crate::config::Config;

/// Slot index reserved for the wake-up descriptor. The eventfd is added to
/// the epoll set with this user-data value during construction, before the
/// slot table claims the matching slot.
pub(crate) const WAKEUP_SLOT: u32 = 0;

pub(crate) struct Poller {
    epoll_fd: RawFd,
    wakeup_fd: RawFd,
    events: Box<[libc::epoll_event]>,
    /// Vectored-receive headers, one per pooled buffer. Each points at the
    /// matching iovec below; the kernel writes the per-datagram length into
    /// `msg_len`.
    msgs: Box<[libc::mmsghdr]>,
    iovecs: Box<[libc::iovec]>,
    /// One contiguous allocation sliced into `max_datagrams_per_read`
    /// chunks of `read_buffer_bytes` each.
    storage: Box<[u8]>,
    buffer_bytes: usize,
}

// The raw pointers in `msgs` and `iovecs` all point into `iovecs` and
// `storage`, which this struct owns; moving it across threads moves the
// whole pool.
unsafe impl Send for Poller {}

impl Poller {
    pub(crate) fn new(config: &Config) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut wakeup_event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: u64::from(WAKEUP_SLOT),
        };
        let rc = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wakeup_fd, &mut wakeup_event)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wakeup_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        let events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            config.max_selected_events
        ]
        .into_boxed_slice();

        let pool = config.max_datagrams_per_read;
        let buffer_bytes = config.read_buffer_bytes;
        let mut storage = vec![0u8; pool * buffer_bytes].into_boxed_slice();

        let mut iovecs = vec![
            libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            };
            pool
        ]
        .into_boxed_slice();
        for (i, chunk) in storage.chunks_exact_mut(buffer_bytes).enumerate() {
            iovecs[i].iov_base = chunk.as_mut_ptr() as *mut libc::c_void;
            iovecs[i].iov_len = buffer_bytes;
        }

        // SAFETY: mmsghdr is a C struct for which all-zeros is a valid
        // initial state.
        let mut msgs = vec![unsafe { mem::zeroed::<libc::mmsghdr>() }; pool].into_boxed_slice();
        for i in 0..pool {
            msgs[i].msg_hdr.msg_iov = &mut iovecs[i] as *mut libc::iovec;
            msgs[i].msg_hdr.msg_iovlen = 1;
        }

        Ok(Poller {
            epoll_fd,
            wakeup_fd,
            events,
            msgs,
            iovecs,
            storage,
            buffer_bytes,
        })
    }

    pub(crate) fn wakeup_fd(&self) -> RawFd {
        self.wakeup_fd
    }

    /// Block until at least one registered descriptor is ready, or the
    /// timeout elapses (-1 blocks indefinitely). EINTR is reported as a
    /// zero-event batch.
    pub(crate) fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    /// Slot index carried in event `i`'s user-data field.
    pub(crate) fn event_index(&self, i: usize) -> u32 {
        self.events[i].u64 as u32
    }

    /// Add `fd` to the epoll set with read interest, storing `idx` as the
    /// event user-data. Returns the event structure for the slot to retain.
    pub(crate) fn add(&mut self, fd: RawFd, idx: u32) -> io::Result<Box<libc::epoll_event>> {
        let mut event = Box::new(libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: u64::from(idx),
        });
        let rc =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut *event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(event)
    }

    pub(crate) fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let rc =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// One vectored receive against `fd`, filling up to the pool's worth of
    /// datagrams. Returns the number of datagrams received.
    pub(crate) fn recv_batch(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = unsafe {
            libc::recvmmsg(
                fd,
                self.msgs.as_mut_ptr(),
                self.msgs.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Payload of datagram `i` from the most recent [`recv_batch`]. Valid
    /// until the next receive overwrites the pool.
    ///
    /// [`recv_batch`]: Poller::recv_batch
    pub(crate) fn datagram(&self, i: usize) -> &[u8] {
        // The kernel caps msg_len at iov_len, which never changes after
        // construction.
        debug_assert_eq!(self.iovecs[i].iov_len, self.buffer_bytes);
        let len = (self.msgs[i].msg_len as usize).min(self.buffer_bytes);
        let start = i * self.buffer_bytes;
        &self.storage[start..start + len]
    }

    /// Consume the pending wake-up notification, resetting the eventfd
    /// counter. Must be called under the submission-queue mutex so the
    /// empty-to-non-empty trigger in `submit` stays accurate.
    pub(crate) fn clear_wakeup(&mut self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.wakeup_fd,
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};

    #[test]
    fn wakeup_descriptor_reports_ready_under_its_reserved_index() {
        let mut poller = Poller::new(&Config::default()).unwrap();
        let val: u64 = 1;
        unsafe {
            libc::write(
                poller.wakeup_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
        let n = poller.wait(1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(poller.event_index(0), WAKEUP_SLOT);

        poller.clear_wakeup();
        let n = poller.wait(0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn batched_receive_reads_payloads_into_the_pool() {
        let config = Config {
            max_datagrams_per_read: 4,
            read_buffer_bytes: 64,
            ..Config::default()
        };
        let mut poller = Poller::new(&config).unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        let _event = poller.add(sock.as_raw_fd(), 3).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"a", addr).unwrap();
        sender.send_to(b"bb", addr).unwrap();

        let mut payloads: Vec<Vec<u8>> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while payloads.len() < 2 && Instant::now() < deadline {
            let n = poller.wait(1000).unwrap();
            for i in 0..n {
                assert_eq!(poller.event_index(i), 3);
            }
            if n == 0 {
                continue;
            }
            let k = poller.recv_batch(sock.as_raw_fd()).unwrap();
            for i in 0..k {
                payloads.push(poller.datagram(i).to_vec());
            }
        }

        assert_eq!(payloads, vec![b"a".to_vec(), b"bb".to_vec()]);
        poller.delete(sock.as_raw_fd()).unwrap();
    }

    #[test]
    fn truncated_datagrams_are_capped_at_the_buffer_size() {
        let config = Config {
            max_datagrams_per_read: 2,
            read_buffer_bytes: 4,
            ..Config::default()
        };
        let mut poller = Poller::new(&config).unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        let _event = poller.add(sock.as_raw_fd(), 1).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"oversized", addr).unwrap();

        let n = poller.wait(5000).unwrap();
        assert!(n >= 1);
        let k = poller.recv_batch(sock.as_raw_fd()).unwrap();
        assert_eq!(k, 1);
        assert_eq!(poller.datagram(0), b"over");
    }
}
