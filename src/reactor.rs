//! The public reactor handle, the cross-thread submission queue, and the
//! registration cancel handle.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Error;
use crate::event_loop::Core;
use crate::handler::DatagramReader;
use crate::poller::Poller;

/// A task queued for execution on the loop thread. Internal tasks (such as
/// registration) get the loop-thread core; user tasks ignore it.
pub(crate) type Task = Box<dyn FnOnce(&mut Core) + Send>;

pub(crate) struct Submissions {
    pub(crate) running: bool,
    pub(crate) pending: Vec<Task>,
}

/// State shared between the loop thread and foreign threads: the
/// mutex-protected submission queue (which also guards the running flag)
/// and the wake-up descriptor, which is safe to write from anywhere.
pub(crate) struct Shared {
    pub(crate) queue: Mutex<Submissions>,
    wakeup_fd: RawFd,
}

impl Shared {
    pub(crate) fn new(wakeup_fd: RawFd) -> Self {
        Shared {
            queue: Mutex::new(Submissions {
                running: true,
                pending: Vec::new(),
            }),
            wakeup_fd,
        }
    }

    /// Append a task, waking the loop only on the empty-to-non-empty
    /// transition so any number of submissions between two drains costs at
    /// most one notification. After shutdown the task is dropped silently.
    /// The eventfd write happens under the mutex, so no write can race the
    /// descriptor being closed during cleanup.
    pub(crate) fn submit(&self, task: Task) {
        let mut queue = self.queue.lock();
        if !queue.running {
            return;
        }
        queue.pending.push(task);
        if queue.pending.len() == 1 {
            let val: u64 = 1;
            unsafe {
                libc::write(self.wakeup_fd, &val as *const u64 as *const libc::c_void, 8);
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.queue.lock().running
    }
}

/// A single-threaded epoll reactor that multiplexes batched UDP receive
/// across many sockets and doubles as an executor for its loop thread.
///
/// Created inert; [`start`](Reactor::start) spawns the loop thread exactly
/// once; [`close`](Reactor::close) shuts it down and is idempotent. Dropping
/// the reactor closes it.
pub struct Reactor {
    shared: Arc<Shared>,
    /// Loop-thread state; present until `start` moves it into the spawned
    /// thread (or close-before-start tears it down inline).
    core: Mutex<Option<Core>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    started: AtomicBool,
    thread_name: String,
}

impl Reactor {
    /// Allocate the native state and build an inert reactor. Fails if the
    /// config is invalid or the kernel refuses the epoll/eventfd setup; no
    /// reactor is left behind on failure.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let poller = Poller::new(&config)?;
        let shared = Arc::new(Shared::new(poller.wakeup_fd()));
        let core = Core::new(poller, Arc::clone(&shared));
        Ok(Reactor {
            shared,
            core: Mutex::new(Some(core)),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
            thread_name: config.thread_name,
        })
    }

    /// Spawn the loop thread. Only the first call has any effect.
    pub fn start(&self) -> Result<(), Error> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let Some(core) = self.core.lock().take() else {
            return Ok(());
        };
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || core.run())
            .map_err(Error::Io)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Shut the reactor down. If `start` was never called the native state
    /// is torn down inline; otherwise a stop task is submitted and the loop
    /// thread is joined. Every live registration receives its single
    /// `on_remove` during cleanup. Repeat calls are no-ops.
    pub fn close(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Never started: clean up synchronously on this thread.
            if let Some(mut core) = self.core.lock().take() {
                core.shutdown();
            }
            return;
        }
        self.shared.submit(Box::new(|core: &mut Core| core.stop()));
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Register a datagram socket with a reader, from any thread. The
    /// socket handle is extracted eagerly; the registration itself runs as
    /// a task on the loop thread. The returned handle cancels the
    /// registration when asked; dropping it leaves the registration live.
    pub fn register<S, R>(&self, socket: &S, reader: R) -> Registration
    where
        S: AsRawFd,
        R: DatagramReader,
    {
        let fd = socket.as_raw_fd();
        let boxed: Box<dyn DatagramReader> = Box::new(reader);
        self.shared
            .submit(Box::new(move |core: &mut Core| core.add_socket(fd, boxed)));
        Registration {
            shared: Arc::clone(&self.shared),
            fd,
        }
    }

    /// Submit a task to run on the loop thread, from any thread. Tasks from
    /// one submitting thread run in submission order. After shutdown the
    /// task is dropped silently; there is no completion callback.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(Box::new(move |_core: &mut Core| task()));
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cancellation capability returned by [`Reactor::register`].
pub struct Registration {
    shared: Arc<Shared>,
    fd: RawFd,
}

impl Registration {
    /// Deregister the socket. Safe to call from any thread and any number
    /// of times; the reader's `on_remove` fires at most once.
    pub fn cancel(&self) {
        let fd = self.fd;
        self.shared
            .submit(Box::new(move |core: &mut Core| core.remove_socket(fd)));
    }

    /// The socket handle this registration was created for.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task() -> Task {
        Box::new(|_core: &mut Core| {})
    }

    #[test]
    fn submissions_coalesce_to_one_wakeup_write() {
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(efd >= 0);
        let shared = Shared::new(efd);

        for _ in 0..100 {
            shared.submit(noop_task());
        }

        // Each notification adds 1 to the eventfd counter; 100 submissions
        // into an initially-empty queue must have written exactly once.
        let mut val: u64 = 0;
        let n = unsafe { libc::read(efd, &mut val as *mut u64 as *mut libc::c_void, 8) };
        assert_eq!(n, 8);
        assert_eq!(val, 1);
        assert_eq!(shared.queue.lock().pending.len(), 100);

        unsafe { libc::close(efd) };
    }

    #[test]
    fn submissions_after_shutdown_are_dropped() {
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(efd >= 0);
        let shared = Shared::new(efd);
        shared.queue.lock().running = false;

        shared.submit(noop_task());
        assert!(shared.queue.lock().pending.is_empty());

        // No notification either.
        let mut val: u64 = 0;
        let n = unsafe { libc::read(efd, &mut val as *mut u64 as *mut libc::c_void, 8) };
        assert!(n < 0);

        unsafe { libc::close(efd) };
    }

    #[test]
    fn drain_runs_tasks_in_submission_order_outside_the_lock() {
        let reactor = Reactor::new(Config::default()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            reactor.execute(move || log.lock().push(i));
        }

        // A task that re-enters the queue while the drain is running; it
        // must not deadlock, and it lands in the next drain.
        let shared = Arc::clone(&reactor.shared);
        reactor.execute(move || shared.submit(Box::new(|_core: &mut Core| {})));

        let mut guard = reactor.core.lock();
        let core = guard.as_mut().unwrap();
        core.run_pending();

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(reactor.shared.queue.lock().pending.len(), 1);
        drop(guard);
    }
}
