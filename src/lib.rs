//! gramio - single-threaded epoll reactor for batched UDP receive.
//!
//! A [`Reactor`] owns one loop thread that blocks in `epoll_wait`, pulls
//! datagrams from ready sockets in batches with `recvmmsg` into a
//! preallocated buffer pool, and hands each datagram to the registered
//! [`DatagramReader`]. The same thread doubles as an executor: tasks
//! submitted from any thread via [`Reactor::execute`] are queued behind a
//! mutex and flushed to the loop through an eventfd, so the loop never
//! needs to poll with a timeout.
//!
//! Registration and unregistration are themselves tasks, which confines
//! every mutation of the reactor's internal state to the loop thread.
//!
//! # Quick start
//!
//! ```ignore
//! use gramio::{Config, Control, Reactor, handler};
//!
//! let reactor = Reactor::new(Config::default())?;
//! reactor.start()?;
//!
//! let socket = std::net::UdpSocket::bind("0.0.0.0:9000")?;
//! let registration = reactor.register(
//!     &socket,
//!     handler::from_fn(|datagram| {
//!         println!("got {} bytes", datagram.len());
//!         Control::Continue
//!     }),
//! );
//!
//! // ... later, from any thread:
//! registration.cancel();
//! reactor.close();
//! ```
//!
//! Linux only: the implementation is built directly on `epoll`, `eventfd`,
//! and `recvmmsg`.

pub mod config;
pub mod error;
pub mod handler;

mod event_loop;
mod poller;
mod reactor;
mod slots;

pub use config::Config;
pub use error::Error;
pub use handler::{Control, DatagramReader};
pub use reactor::{Reactor, Registration};
