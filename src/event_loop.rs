//! The loop-thread core: readiness wait, per-event dispatch, submission
//! drain, registration lifecycle, and shutdown.
//!
//! After `start`, `Core` is owned by the loop thread; every mutation of the
//! slot table, the registry, and the epoll set happens here. Foreign
//! threads reach it only by submitting tasks through the shared queue.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::handler::{Control, DatagramReader, Handler};
use crate::poller::{Poller, WAKEUP_SLOT};
use crate::reactor::{Shared, Task};
use crate::slots::SlotTable;

pub(crate) struct Core {
    poller: Poller,
    slots: SlotTable,
    /// Socket handle to live slot index; consulted only on unregistration.
    registry: HashMap<RawFd, u32>,
    /// Drained tasks land here so each drain reuses the same storage.
    scratch: Vec<Task>,
    shared: Arc<Shared>,
}

impl Core {
    pub(crate) fn new(poller: Poller, shared: Arc<Shared>) -> Self {
        let mut slots = SlotTable::new();
        // The eventfd was added to the epoll set under WAKEUP_SLOT during
        // poller construction; claim the matching slot before any
        // registration can take it.
        let idx = slots.claim();
        debug_assert_eq!(idx, WAKEUP_SLOT);
        if let Some(slot) = slots.get_mut(idx) {
            slot.fd = poller.wakeup_fd();
            slot.handler = Handler::Wakeup;
        }
        Core {
            poller,
            slots,
            registry: HashMap::new(),
            scratch: Vec::new(),
            shared,
        }
    }

    /// Drive the loop until the running flag is cleared, then clean up.
    /// Consumes the core; dropping it releases the native state.
    pub(crate) fn run(mut self) {
        while self.shared.is_running() {
            let count = match self.poller.wait(-1) {
                Ok(count) => count,
                Err(err) => {
                    error!(error = %err, "epoll_wait failed, shutting down loop");
                    break;
                }
            };
            for i in 0..count {
                let idx = self.poller.event_index(i);
                self.dispatch(idx);
            }
        }
        self.shutdown();
    }

    fn dispatch(&mut self, idx: u32) {
        let is_wakeup = match self.slots.get(idx) {
            Some(slot) => matches!(slot.handler, Handler::Wakeup),
            None => return,
        };
        if is_wakeup {
            self.run_pending();
        } else {
            self.read_datagrams(idx);
        }
    }

    /// One vectored receive for the slot's socket, dispatching each
    /// datagram to the reader in kernel order. The first `Remove` stops
    /// dispatch and deregisters the socket; the rest of the batch is
    /// discarded.
    fn read_datagrams(&mut self, idx: u32) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        // Vacant: the slot was freed earlier in this event batch.
        let Handler::Datagram(reader) = &mut slot.handler else {
            return;
        };
        let fd = slot.fd;

        let count = match self.poller.recv_batch(fd) {
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!(fd, error = %err, "recvmmsg failed, treating as empty batch");
                return;
            }
        };

        let mut remove = false;
        for i in 0..count {
            match reader.on_read(self.poller.datagram(i)) {
                Control::Continue => {}
                Control::Remove => {
                    remove = true;
                    break;
                }
            }
        }
        if remove {
            self.remove_socket(fd);
        }
    }

    /// Drain the submission queue: swap the pending buffer with the scratch
    /// buffer and consume the wake-up notification under the mutex, then
    /// run the tasks with the mutex released so they may call `execute`
    /// re-entrantly.
    pub(crate) fn run_pending(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            mem::swap(&mut queue.pending, &mut self.scratch);
            self.poller.clear_wakeup();
        }
        let mut tasks = mem::take(&mut self.scratch);
        for task in tasks.drain(..) {
            task(self);
        }
        self.scratch = tasks;
    }

    /// Claim a slot, register `fd` with the kernel under the slot's index,
    /// and record the registration. On kernel failure the slot goes back to
    /// the free list unused and the reader is dropped without `on_remove`.
    pub(crate) fn add_socket(&mut self, fd: RawFd, reader: Box<dyn DatagramReader>) {
        let idx = self.slots.claim();
        match self.poller.add(fd, idx) {
            Ok(event) => {
                if let Some(slot) = self.slots.get_mut(idx) {
                    slot.fd = fd;
                    slot.handler = Handler::Datagram(reader);
                    slot.event = Some(event);
                }
                self.registry.insert(fd, idx);
                debug!(fd, idx, "registered datagram socket");
            }
            Err(err) => {
                error!(fd, error = %err, "epoll add failed, dropping registration");
                self.slots.release(idx);
            }
        }
    }

    /// Deregister `fd` if it is live: remove it from the kernel set, park
    /// the slot, free its event structure, and deliver the reader's single
    /// `on_remove`. A second removal of the same handle is a no-op because
    /// the registry entry is already gone.
    pub(crate) fn remove_socket(&mut self, fd: RawFd) {
        let Some(idx) = self.registry.remove(&fd) else {
            return;
        };
        if let Err(err) = self.poller.delete(fd) {
            error!(fd, error = %err, "epoll delete failed");
        }
        if let Some(mut reader) = self.slots.release(idx) {
            reader.on_remove();
        }
        debug!(fd, idx, "removed datagram socket");
    }

    /// Mark the queue stopped, drop any tasks that will never run, and
    /// deregister every live socket. The native state is released when the
    /// core is dropped.
    pub(crate) fn shutdown(&mut self) {
        // Take the stale tasks out under the lock but drop them outside it;
        // a captured value's Drop may run user code.
        let stale = {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
            mem::take(&mut queue.pending)
        };
        drop(stale);
        let fds: Vec<RawFd> = self.registry.keys().copied().collect();
        for fd in fds {
            self.remove_socket(fd);
        }
    }

    pub(crate) fn stop(&mut self) {
        self.shared.queue.lock().running = false;
    }
}
