// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Thread groups, thread pools, and worker limits.
//!
//! Every thread the server starts belongs to a [`ThreadGroup`], which
//! lets the daemon shut all of them down together. Listener threads
//! are *respawnable*: if one exits or panics while the group is live,
//! it is started again. Request handling runs on [`ThreadPool`]s, and
//! long-running streaming replies are bounded by a [`WorkerLimit`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, info};
use slab::Slab;

////////////////////////////////////////////////////////////////////////
// THREAD GROUPS                                                      //
////////////////////////////////////////////////////////////////////////

/// A set of threads that are shut down together.
///
/// Once [`ThreadGroup::shut_down`] is called, no new threads may be
/// started and respawnable threads are no longer restarted. Threads are
/// not interrupted, so long-running tasks should poll
/// [`ThreadGroup::is_shutting_down`] and return when it becomes true.
/// [`ThreadGroup::await_shutdown`] blocks until every thread has
/// exited.
pub struct ThreadGroup {
    records: Mutex<GroupRecords>,

    /// Signalled when shutdown begins and when the last thread exits.
    /// Used with `records`.
    shutdown_wakeup: Condvar,
}

#[derive(Default)]
struct GroupRecords {
    live_threads: usize,
    pools: Slab<Arc<ThreadPool>>,
    shutting_down: bool,
}

/// What a group thread runs.
enum Body {
    Oneshot(Box<dyn FnOnce() + Send + 'static>),
    Respawnable(Arc<dyn Fn() + Send + Sync + 'static>),
}

impl ThreadGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(GroupRecords::default()),
            shutdown_wakeup: Condvar::new(),
        })
    }

    /// Starts a thread that runs `task` once.
    pub fn start_oneshot<F>(self: &Arc<Self>, name: Option<String>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.live_records()?;
        spawn(self, &mut records, name, Body::Oneshot(Box::new(task)))?;
        Ok(())
    }

    /// Starts a thread that runs `task`, starting a replacement each
    /// time it returns or panics until the group shuts down. Restarts
    /// are throttled to one per [`RESPAWN_INTERVAL`].
    pub fn start_respawnable<F>(
        self: &Arc<Self>,
        name: Option<String>,
        task: F,
    ) -> Result<(), Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut records = self.live_records()?;
        spawn(self, &mut records, name, Body::Respawnable(Arc::new(task)))?;
        Ok(())
    }

    /// Begins shutting down the group and all of its pools.
    pub fn shut_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        for pool in records.pools.drain() {
            pool.close();
        }
        self.shutdown_wakeup.notify_all();
    }

    /// Blocks until shutdown has begun and every thread of the group
    /// has exited. Calling this from a group thread deadlocks.
    pub fn await_shutdown(&self) {
        let records = self.records.lock().unwrap();
        let _records = self
            .shutdown_wakeup
            .wait_while(records, |r| !r.shutting_down || r.live_threads > 0)
            .unwrap();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }

    fn live_records(&self) -> Result<MutexGuard<GroupRecords>, Error> {
        let records = self.records.lock().unwrap();
        if records.shutting_down {
            Err(Error::ShuttingDown)
        } else {
            Ok(records)
        }
    }
}

/// The minimum time between successive starts of a respawnable thread.
pub const RESPAWN_INTERVAL: Duration = Duration::from_secs(1);

/// Owned by each group thread. Dropping it (on return or unwinding)
/// accounts for the thread's exit and, for respawnable threads, starts
/// the replacement.
struct ThreadGuard {
    group: Arc<ThreadGroup>,
    spawner: ThreadId,
    respawn: Option<(Arc<dyn Fn() + Send + Sync + 'static>, Instant)>,
}

fn spawn(
    group: &Arc<ThreadGroup>,
    records: &mut MutexGuard<GroupRecords>,
    name: Option<String>,
    body: Body,
) -> io::Result<()> {
    let mut guard = ThreadGuard {
        group: group.clone(),
        spawner: thread::current().id(),
        respawn: None,
    };
    let run: Box<dyn FnOnce() + Send> = match body {
        Body::Oneshot(task) => task,
        Body::Respawnable(task) => {
            guard.respawn = Some((task.clone(), Instant::now()));
            Box::new(move || task())
        }
    };

    records.live_threads += 1;
    let result = thread::Builder::new()
        .name(name.unwrap_or_else(|| "anonymous".to_owned()))
        .spawn(move || {
            let _guard = guard;
            run();
        });
    if result.is_err() {
        records.live_threads -= 1;
    }
    result.map(drop)
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let current = thread::current();

        // Dropped by the spawning thread: the OS thread never started,
        // and spawn() (which holds the records lock) has cleaned up.
        if current.id() == self.spawner {
            return;
        }

        let name = current.name().unwrap_or("anonymous");
        if thread::panicking() {
            error!("Thread {} panicked", name);
        }

        let mut records = self.group.records.lock().unwrap();
        if let Some((task, started)) = self.respawn.take() {
            if !records.shutting_down {
                if !thread::panicking() {
                    error!("Thread {} exited prematurely", name);
                }
                let elapsed = started.elapsed();
                if elapsed < RESPAWN_INTERVAL {
                    let delay = RESPAWN_INTERVAL - elapsed;
                    info!("Delaying respawn of thread {} by {} ms", name, delay.as_millis());
                    // Shutdown notifications cut the delay short.
                    records = self
                        .group
                        .shutdown_wakeup
                        .wait_timeout(records, delay)
                        .unwrap()
                        .0;
                }
                if !records.shutting_down {
                    let body = Body::Respawnable(task);
                    if let Err(e) = spawn(&self.group, &mut records, Some(name.to_owned()), body) {
                        error!("Failed to respawn thread {}: {}", name, e);
                    }
                }
            }
        }

        records.live_threads -= 1;
        if records.shutting_down && records.live_threads == 0 {
            self.group.shutdown_wakeup.notify_all();
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THREAD POOLS                                                       //
////////////////////////////////////////////////////////////////////////

/// A fixed set of permanent worker threads within a [`ThreadGroup`].
///
/// Tasks are handed directly to idle workers; there is no unbounded
/// queue. [`ThreadPool::submit`] waits for an idle worker, while
/// [`ThreadPool::submit_or_spawn`] starts a one-shot auxiliary thread
/// when none is idle.
pub struct ThreadPool {
    group: Arc<ThreadGroup>,
    key: usize,
    name: String,
    records: Mutex<PoolRecords>,

    /// Signalled when a task is queued. Used with `records`.
    task_wakeup: Condvar,

    /// Signalled when a worker becomes idle. Used with `records`.
    idle_wakeup: Condvar,
}

struct PoolRecords {
    pending: VecDeque<Box<dyn FnOnce() + Send + 'static>>,
    idle_workers: usize,
    auxiliaries_started: u64,
    closed: bool,
}

impl PoolRecords {
    fn has_idle_worker(&self) -> bool {
        self.idle_workers > self.pending.len()
    }
}

impl ThreadGroup {
    /// Starts a [`ThreadPool`] with `permanent_workers` workers.
    pub fn start_pool(
        self: &Arc<Self>,
        name: Option<String>,
        permanent_workers: usize,
    ) -> Result<Arc<ThreadPool>, Error> {
        let mut records = self.live_records()?;
        let entry = records.pools.vacant_entry();
        let pool = Arc::new(ThreadPool {
            group: self.clone(),
            key: entry.key(),
            name: name.unwrap_or_else(|| "pool".to_owned()),
            records: Mutex::new(PoolRecords {
                pending: VecDeque::with_capacity(permanent_workers),
                idle_workers: 0,
                auxiliaries_started: 0,
                closed: false,
            }),
            task_wakeup: Condvar::new(),
            idle_wakeup: Condvar::new(),
        });
        entry.insert(pool.clone());

        for i in 0..permanent_workers {
            let worker_pool = pool.clone();
            let body = Body::Oneshot(Box::new(move || worker_pool.work()));
            let name = format!("{} worker {}", pool.name, i);
            if let Err(e) = spawn(self, &mut records, Some(name), body) {
                // Workers that did start exit once the pool closes.
                pool.close();
                records.pools.remove(pool.key);
                return Err(e.into());
            }
        }
        Ok(pool)
    }
}

impl ThreadPool {
    /// Runs `task` on a permanent worker, waiting for one to become
    /// idle if necessary.
    pub fn submit<F>(self: &Arc<Self>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let records = self.records.lock().unwrap();
        let mut records = self
            .idle_wakeup
            .wait_while(records, |r| !r.closed && !r.has_idle_worker())
            .unwrap();
        if records.closed {
            return Err(Error::ShuttingDown);
        }
        records.pending.push_back(Box::new(task));
        self.task_wakeup.notify_one();
        Ok(())
    }

    /// Runs `task` on a permanent worker if one is idle, and otherwise
    /// on a new auxiliary thread that exits when the task is done.
    pub fn submit_or_spawn<F>(self: &Arc<Self>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.closed {
            return Err(Error::ShuttingDown);
        }
        if records.has_idle_worker() {
            records.pending.push_back(Box::new(task));
            self.task_wakeup.notify_one();
            return Ok(());
        }
        let id = records.auxiliaries_started;
        records.auxiliaries_started += 1;
        drop(records);
        let name = format!("{} auxiliary {}", self.name, id);
        self.group.start_oneshot(Some(name), task)
    }

    /// Shuts the pool down without shutting down its group.
    pub fn shut_down(&self) {
        self.group.records.lock().unwrap().pools.remove(self.key);
        self.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().closed
    }

    /// Marks the pool closed and wakes everyone waiting on it. The
    /// caller is responsible for removing it from the group.
    fn close(&self) {
        self.records.lock().unwrap().closed = true;
        self.task_wakeup.notify_all();
        self.idle_wakeup.notify_all();
    }

    /// The body of a permanent worker. A panicking task is logged and
    /// does not take the worker down with it.
    fn work(&self) {
        loop {
            let mut records = self.records.lock().unwrap();
            records.idle_workers += 1;
            self.idle_wakeup.notify_one();
            records = self
                .task_wakeup
                .wait_while(records, |r| r.pending.is_empty() && !r.closed)
                .unwrap();
            let task = match records.pending.pop_front() {
                Some(task) => task,
                None => return,
            };
            records.idle_workers -= 1;
            drop(records);
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("A task in {} panicked", self.name);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// WORKER LIMITS                                                      //
////////////////////////////////////////////////////////////////////////

/// A counter bounding how many workers of some kind run at once.
///
/// Streaming replies take a [`Permit`] with [`WorkerLimit::try_acquire`]
/// and run on their own thread while they hold it; when none is left
/// they are served synchronously instead. The push coordinator blocks
/// in [`WorkerLimit::acquire`] and waits for its workers with
/// [`WorkerLimit::wait_idle`].
#[derive(Debug)]
pub struct WorkerLimit {
    max: usize,
    active: Mutex<usize>,
    released: Condvar,
}

/// A slot in a [`WorkerLimit`], returned on drop.
#[derive(Debug)]
pub struct Permit {
    limit: Arc<WorkerLimit>,
}

impl WorkerLimit {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            active: Mutex::new(0),
            released: Condvar::new(),
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Returns the number of permits currently held.
    pub fn active(&self) -> usize {
        *self.active.lock().unwrap()
    }

    /// Takes a permit if one is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut active = self.active.lock().unwrap();
        if *active < self.max {
            *active += 1;
            Some(Permit { limit: self.clone() })
        } else {
            None
        }
    }

    /// Takes a permit, waiting for one to be returned if necessary. A
    /// limit of zero is treated as one here.
    pub fn acquire(self: &Arc<Self>) -> Permit {
        let max = self.max.max(1);
        let active = self.active.lock().unwrap();
        let mut active = self.released.wait_while(active, |n| *n >= max).unwrap();
        *active += 1;
        Permit { limit: self.clone() }
    }

    /// Blocks until every permit has been returned.
    pub fn wait_idle(&self) {
        let active = self.active.lock().unwrap();
        let _active = self.released.wait_while(active, |n| *n > 0).unwrap();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        *self.limit.active.lock().unwrap() -= 1;
        self.limit.released.notify_all();
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error starting a thread or submitting a task.
#[derive(Debug)]
pub enum Error {
    /// The OS failed to create a thread.
    Io(io::Error),

    /// The [`ThreadGroup`] or [`ThreadPool`] is shutting down.
    ShuttingDown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::ShuttingDown => f.write_str("thread group or pool is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn await_shutdown_waits_for_threads() {
        let exited = Arc::new(AtomicUsize::new(0));
        let group = ThreadGroup::new();
        const TICK: Duration = Duration::from_millis(50);
        let start = Instant::now();
        for _ in 0..2 {
            let exited = exited.clone();
            let group_cloned = group.clone();
            group
                .start_oneshot(None, move || {
                    while !group_cloned.is_shutting_down() {
                        thread::sleep(TICK);
                    }
                    exited.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        thread::sleep(TICK);
        group.shut_down();
        group.await_shutdown();
        assert!(start.elapsed() >= TICK);
        assert_eq!(exited.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn respawnable_threads_come_back() {
        let runs = Arc::new((Mutex::new(0), Condvar::new()));
        let runs_cloned = runs.clone();
        let group = ThreadGroup::new();
        group
            .start_respawnable(Some("flaky".to_owned()), move || {
                *runs_cloned.0.lock().unwrap() += 1;
                runs_cloned.1.notify_all();
            })
            .unwrap();
        let count = runs.0.lock().unwrap();
        let count = runs.1.wait_while(count, |n| *n < 2).unwrap();
        assert!(*count >= 2);
        drop(count);
        group.shut_down();
        group.await_shutdown();
    }

    #[test]
    fn shut_down_group_refuses_threads() {
        let group = ThreadGroup::new();
        group.shut_down();
        assert!(matches!(group.start_oneshot(None, || ()), Err(Error::ShuttingDown)));
        assert!(matches!(group.start_respawnable(None, || ()), Err(Error::ShuttingDown)));
        assert!(matches!(group.start_pool(None, 1), Err(Error::ShuttingDown)));
    }

    #[test]
    fn pool_runs_every_task() {
        let done = Arc::new(AtomicUsize::new(0));
        let group = ThreadGroup::new();
        let pool = group.start_pool(Some("test".to_owned()), 2).unwrap();
        for i in 0..8 {
            let done = done.clone();
            let task = move || {
                thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            };
            if i % 2 == 0 {
                pool.submit(task).unwrap();
            } else {
                pool.submit_or_spawn(task).unwrap();
            }
        }
        group.shut_down();
        group.await_shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn pools_are_tracked_by_group() {
        let group = ThreadGroup::new();
        let first = group.start_pool(None, 0).unwrap();
        let second = group.start_pool(None, 0).unwrap();
        assert_eq!(group.records.lock().unwrap().pools.len(), 2);
        first.shut_down();
        assert!(matches!(first.submit(|| ()), Err(Error::ShuttingDown)));
        assert_eq!(group.records.lock().unwrap().pools.len(), 1);
        group.shut_down();
        assert!(second.is_shutting_down());
        assert_eq!(group.records.lock().unwrap().pools.len(), 0);
    }

    #[test]
    fn worker_limit_caps_permits() {
        let limit = WorkerLimit::new(2);
        let first = limit.try_acquire().unwrap();
        let _second = limit.try_acquire().unwrap();
        assert!(limit.try_acquire().is_none());
        assert_eq!(limit.active(), 2);
        drop(first);
        assert!(limit.try_acquire().is_some());
        assert!(WorkerLimit::new(0).try_acquire().is_none());
    }

    #[test]
    fn worker_limit_waits_for_release() {
        let limit = WorkerLimit::new(1);
        let permit = limit.acquire();
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = {
            let limit = limit.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                let _permit = limit.acquire();
                finished.fetch_add(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        drop(permit);
        handle.join().unwrap();
        limit.wait_idle();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(limit.active(), 0);
    }
}
