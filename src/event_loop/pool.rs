//! A pool of sibling event loops, each running on its own thread, that
//! distributes registrations across whichever member is least loaded.
//!
//! Grounded on `M_event_pool_create`/`M_event_get_pool` in
//! `examples/original_source/include/mstdlib/io/m_event.h`: "an internal
//! search is performed, and the least-loaded thread will" receive the new
//! object. Handles and their layers are never moved between threads here --
//! each [`EventPool::add`] job is a `Send` closure that builds and registers
//! its `Io` *on* the chosen member's own thread, which sidesteps needing
//! every [`crate::layer::Layer`] to be `Send` for the whole stack to be one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::IoResult;

use super::{EventLoop, EventLoopFlags};

/// How often a member thread checks for newly queued `add` jobs between
/// spins of its own `EventLoop::run`. Bounds cross-thread dispatch latency
/// without needing a dedicated cross-thread waker plumbed through
/// `EventLoop`.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

type Job = Box<dyn FnOnce(&mut EventLoop) + Send>;

struct Member {
    sender: mpsc::Sender<Job>,
    load: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

/// A pool of `n` event loops, each on its own OS thread, sharing load by a
/// simple least-assignments counter (§9 design note: this is the only
/// process-wide-looking mutable state in the crate, and it lives entirely
/// inside the `EventPool` rather than as a true global).
pub struct EventPool {
    members: Vec<Member>,
}

impl EventPool {
    /// Spawn `max_threads` member loops, each built with `flags`. Matches
    /// `M_event_pool_create(size_t max_threads)`.
    pub fn new(max_threads: usize, flags: EventLoopFlags) -> IoResult<Self> {
        let max_threads = max_threads.max(1);
        let mut members = Vec::with_capacity(max_threads);
        for i in 0..max_threads {
            let (tx, rx) = mpsc::channel::<Job>();
            let load = Arc::new(AtomicUsize::new(0));
            let running = Arc::new(AtomicBool::new(true));
            let running_thread = running.clone();
            let handle = std::thread::Builder::new()
                .name(format!("relayio-pool-{i}"))
                .spawn(move || member_loop(flags, rx, running_thread))
                .map_err(|e| crate::error::IoError::invalid(format!("failed to spawn pool thread: {e}")))?;
            members.push(Member {
                sender: tx,
                load,
                handle: Some(handle),
                running,
            });
        }
        Ok(EventPool { members })
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Run `build` on whichever member currently has the fewest
    /// assignments, handing it a `&mut EventLoop` to register against.
    /// Mirrors routing a new object to the pool's least-loaded thread
    /// instead of to a specific member handle.
    pub fn add(&self, build: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let (index, member) = self
            .members
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| m.load.load(Ordering::Relaxed))
            .expect("pool always has at least one member");
        let _ = index;
        member.load.fetch_add(1, Ordering::Relaxed);
        let _ = member.sender.send(Box::new(build));
    }

    /// Stop every member loop and join its thread.
    pub fn shutdown(mut self) {
        for member in &self.members {
            member.running.store(false, Ordering::Relaxed);
        }
        for member in &mut self.members {
            if let Some(handle) = member.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        for member in &self.members {
            member.running.store(false, Ordering::Relaxed);
        }
        for member in &mut self.members {
            if let Some(handle) = member.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn member_loop(flags: EventLoopFlags, rx: mpsc::Receiver<Job>, running: Arc<AtomicBool>) {
    let mut loop_ = match EventLoop::new(flags) {
        Ok(l) => l,
        Err(e) => {
            log::error!("pool member failed to start: {e}");
            return;
        }
    };

    while running.load(Ordering::Relaxed) {
        while let Ok(job) = rx.try_recv() {
            job(&mut loop_);
        }
        let _ = loop_.run(Some(POLL_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn jobs_are_distributed_and_run_on_member_threads() {
        let pool = EventPool::new(2, EventLoopFlags::default()).unwrap();
        let (tx, rx) = std_mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.add(move |_loop| {
                let _ = tx.send(());
            });
        }
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(2)).expect("job should run on a pool thread");
        }
        pool.shutdown();
    }
}
