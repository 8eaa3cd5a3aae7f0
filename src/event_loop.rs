//! Timed event loop
//!
//! Single-threaded loop multiplexing the Wayland socket with one software
//! countdown timer. Each iteration fires the timer if it is due, drains events
//! already queued, flushes requests, then blocks in one `poll()` bounded by the
//! time left on the timer. The remaining time is re-derived from the monotonic
//! clock after every wait.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::trace;
use wayland_client::backend::WaylandError;
use wayland_client::{Connection, EventQueue};

use crate::error::FatalError;

/// Longest single wait in `poll()`; longer timers span several waits
pub const MAX_WAIT_MS: u16 = 60_000;

/// One-shot countdown driven by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timer {
    /// `None` while disabled
    remaining: Option<Duration>,
}

impl Timer {
    pub fn disabled() -> Self {
        Self { remaining: None }
    }

    /// Schedule the callback `delay` from now (replaces any pending schedule)
    pub fn arm(&mut self, delay: Duration) {
        self.remaining = Some(delay);
    }

    pub fn disarm(&mut self) {
        self.remaining = None;
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    /// Armed and out of time
    pub fn is_due(&self) -> bool {
        self.remaining == Some(Duration::ZERO)
    }

    /// Account for `elapsed` wall-clock time; clamps at zero
    pub fn elapse(&mut self, elapsed: Duration) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(elapsed);
        }
    }

    /// The wait timed out: an armed timer fires on the next iteration
    pub fn expire(&mut self) {
        if self.remaining.is_some() {
            self.remaining = Some(Duration::ZERO);
        }
    }

    /// Milliseconds to wait, rounded up so the wait never ends early
    pub fn timeout_ms(&self) -> Option<u64> {
        self.remaining
            .map(|remaining| remaining.as_micros().div_ceil(1000) as u64)
    }

    /// Length of the next wait, capped at [`MAX_WAIT_MS`]
    ///
    /// The flag is set when the cap applied: that wait ending is not the
    /// timer running out, the remaining time just gets shorter.
    pub fn next_wait_ms(&self) -> Option<(u16, bool)> {
        self.timeout_ms().map(|ms| match u16::try_from(ms) {
            Ok(ms) if ms <= MAX_WAIT_MS => (ms, false),
            _ => (MAX_WAIT_MS, true),
        })
    }

    fn poll_timeout(&self) -> (PollTimeout, bool) {
        match self.next_wait_ms() {
            None => (PollTimeout::NONE, false),
            Some((ms, capped)) => (PollTimeout::from(ms), capped),
        }
    }
}

/// State driven by [`run`]
pub trait LoopHandler {
    fn timer(&mut self) -> &mut Timer;

    /// Timer reached zero
    fn on_timer(&mut self);

    /// Whether a fatal error has been flagged
    fn has_failed(&self) -> bool;

    /// Take the flagged fatal error, if any
    fn take_error(&mut self) -> Option<FatalError>;
}

/// Run until a fatal error is flagged or the connection fails
pub fn run<S: LoopHandler + 'static>(
    conn: &Connection,
    queue: &mut EventQueue<S>,
    state: &mut S,
) -> FatalError {
    let mut prev_poll = Instant::now();

    loop {
        if let Some(err) = state.take_error() {
            return err;
        }

        if let Err(err) = iterate(conn, queue, state, &mut prev_poll) {
            // An error flagged by a callback is the root cause; prefer it
            return state.take_error().unwrap_or(err);
        }
    }
}

fn iterate<S: LoopHandler + 'static>(
    conn: &Connection,
    queue: &mut EventQueue<S>,
    state: &mut S,
    prev_poll: &mut Instant,
) -> Result<(), FatalError> {
    if state.timer().is_due() {
        state.timer().disarm();
        state.on_timer();
        if state.has_failed() {
            return Ok(());
        }
    }

    // Events may already sit in the queue; they must be dispatched before
    // we are allowed to read from the socket
    let guard = loop {
        match queue.prepare_read() {
            Some(guard) => break guard,
            None => {
                queue
                    .dispatch_pending(state)
                    .map_err(|e| connection_error("dispatch", e))?;
            }
        }
    };

    let mut want_write = false;
    match conn.flush() {
        Ok(()) => {}
        Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => want_write = true,
        Err(e) => return Err(connection_error("flush", e)),
    }

    let mut interest = PollFlags::POLLIN;
    if want_write {
        interest |= PollFlags::POLLOUT;
    }

    let (timeout, capped) = state.timer().poll_timeout();
    let (ready, revents) = {
        let mut fds = [PollFd::new(guard.connection_fd(), interest)];
        match poll(&mut fds, timeout) {
            Ok(ready) => (Some(ready), fds[0].revents().unwrap_or(PollFlags::empty())),
            // Interrupted by a signal: nothing ready, keep the timer running
            Err(Errno::EINTR) => (None, PollFlags::empty()),
            Err(e) => return Err(connection_error("poll", e)),
        }
    };
    trace!("poll returned {:?} revents={:?}", ready, revents);

    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
        return Err(FatalError::Connection("Error on display connection fd".into()));
    }

    if revents.contains(PollFlags::POLLIN) {
        guard.read().map_err(|e| connection_error("read events", e))?;
        queue
            .dispatch_pending(state)
            .map_err(|e| connection_error("dispatch", e))?;
    } else {
        // Dropping the guard cancels the read intent
        drop(guard);
        if revents.contains(PollFlags::POLLHUP) {
            return Err(FatalError::Connection("Display connection hung up".into()));
        }
    }

    if revents.contains(PollFlags::POLLOUT) {
        if let Err(e) = conn.flush() {
            if !matches!(&e, WaylandError::Io(io) if io.kind() == ErrorKind::WouldBlock) {
                return Err(connection_error("flush", e));
            }
        }
    }

    let now = Instant::now();
    if ready == Some(0) && !capped {
        state.timer().expire();
    } else {
        state.timer().elapse(now.duration_since(*prev_poll));
    }
    *prev_poll = now;

    trace!("Timer: {:?} remaining", state.timer().remaining());
    Ok(())
}

fn connection_error(op: &str, err: impl std::fmt::Display) -> FatalError {
    FatalError::Connection(format!("{}: {}", op, err))
}
