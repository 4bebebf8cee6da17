//! Background run loop for housekeeping work
//!
//! One task executes every submitted closure, so closures must be short and
//! must not block. Immediate work runs in submission order; timed work runs
//! when due. After [`Scheduler::close`] nothing new is accepted and pending
//! timers are dropped.

use crate::error::{Error, Result};
use crate::utils::panic_message;
use log::{debug, error};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

enum Job {
    Once(Box<dyn FnOnce() + Send>),
    Every(Box<dyn FnMut() + Send>, Duration),
}

enum Command {
    Run(Box<dyn FnOnce() + Send>),
    Schedule(TimerId, Instant, Job),
    Cancel(TimerId),
    Stop,
}

pub struct Scheduler {
    tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    next_timer: AtomicU64,
}

impl Scheduler {
    /// Spawns the run loop on the current tokio runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_loop(rx, Arc::clone(&closed)));
        Self {
            tx,
            closed,
            next_timer: AtomicU64::new(1),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SchedulerClosed);
        }
        self.tx.send(command).map_err(|_| Error::SchedulerClosed)
    }

    /// Queues `f` to run as soon as the loop reaches it.
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Run(Box::new(f)))
    }

    /// Runs `f` once after `delay`.
    pub fn after<F>(&self, delay: Duration, f: F) -> Result<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id();
        self.send(Command::Schedule(id, Instant::now() + delay, Job::Once(Box::new(f))))?;
        Ok(id)
    }

    /// Runs `f` every `interval`, first after one interval has passed.
    pub fn every<F>(&self, interval: Duration, f: F) -> Result<TimerId>
    where
        F: FnMut() + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let id = self.next_id();
        self.send(Command::Schedule(
            id,
            Instant::now() + interval,
            Job::Every(Box::new(f), interval),
        ))?;
        Ok(id)
    }

    /// Cancels a timer. Unknown or already fired timers are ignored.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.send(Command::Cancel(id));
    }

    /// Stops the loop. Closures submitted afterwards are rejected.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Command::Stop);
        }
    }

    fn next_id(&self) -> TimerId {
        TimerId(self.next_timer.fetch_add(1, Ordering::SeqCst))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_guarded<F: FnOnce()>(f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!("Scheduled task panicked: {}", panic_message(payload.as_ref()));
    }
}

async fn run_loop(mut rx: mpsc::UnboundedReceiver<Command>, closed: Arc<AtomicBool>) {
    let mut queue: BTreeMap<(Instant, TimerId), Job> = BTreeMap::new();
    let mut due_at: HashMap<TimerId, Instant> = HashMap::new();

    loop {
        let next_due = queue.keys().next().map(|(due, _)| *due);
        let command = tokio::select! {
            command = rx.recv() => command,
            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                while let Some(((due, id), _)) = queue.first_key_value() {
                    if *due > now || closed.load(Ordering::SeqCst) {
                        break;
                    }
                    let key = (*due, *id);
                    let Some(job) = queue.remove(&key) else { break };
                    due_at.remove(&key.1);
                    match job {
                        Job::Once(f) => run_guarded(f),
                        Job::Every(mut f, interval) => {
                            run_guarded(&mut f);
                            let mut next = key.0 + interval;
                            if next <= now {
                                next = now + interval;
                            }
                            due_at.insert(key.1, next);
                            queue.insert((next, key.1), Job::Every(f, interval));
                        }
                    }
                }
                continue;
            }
        };

        match command {
            Some(Command::Run(f)) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                run_guarded(f);
            }
            Some(Command::Schedule(id, due, job)) => {
                due_at.insert(id, due);
                queue.insert((due, id), job);
            }
            Some(Command::Cancel(id)) => {
                if let Some(due) = due_at.remove(&id) {
                    queue.remove(&(due, id));
                }
            }
            Some(Command::Stop) | None => break,
        }
    }

    debug!("Scheduler stopped with {} pending timers", queue.len());
}
