//! Fixed-size worker pool
//!
//! The queue is filled single-threaded, optionally sorted ascending by
//! file size, and then drained by a fixed set of OS threads. Forward
//! workers take items from the head; an optional subset of reverse
//! workers takes from the tail, so on a sorted queue the largest files
//! start immediately instead of waiting behind thousands of small
//! ones. The head and tail indexes share one mutex and never cross.

use crate::fs::StatSnapshot;
use crate::signals;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// One unit of work: a candidate file and its metadata snapshot.
///
/// Owned by the queue until a worker takes it; the worker updates the
/// snapshot in place after the rewrite.
#[derive(Debug)]
pub struct WorkItem {
    /// Path of the file to rewrite
    pub path: PathBuf,
    /// Metadata snapshot taken at enqueue time
    pub snapshot: StatSnapshot,
}

/// Aggregate counters shared by all workers.
#[derive(Debug, Default)]
pub struct JobStats {
    /// Files examined (rewritten or not)
    pub num_files: AtomicU64,
    /// Files actually rewritten
    pub rewritten: AtomicU64,
    /// Files whose rewrite failed
    pub failures: AtomicU64,
    /// Hard-linked duplicates skipped during scanning
    pub hard_link_files: AtomicU64,
    /// Sum of apparent sizes
    pub uncompressed_bytes: AtomicU64,
    /// Sum of on-disk (allocated) sizes
    pub compressed_bytes: AtomicU64,
    first_errno: AtomicI32,
}

impl JobStats {
    /// Count a file that was examined but not rewritten.
    pub fn record_file(&self, snapshot: &StatSnapshot) {
        self.num_files.fetch_add(1, Ordering::Relaxed);
        self.uncompressed_bytes
            .fetch_add(snapshot.size, Ordering::Relaxed);
        self.compressed_bytes
            .fetch_add(snapshot.on_disk_size(), Ordering::Relaxed);
    }

    /// Count a successful rewrite; `snapshot` is the refreshed,
    /// post-rewrite view of the file.
    pub fn record_rewritten(&self, snapshot: &StatSnapshot) {
        self.record_file(snapshot);
        self.rewritten.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed rewrite and remember the first errno for the
    /// process exit code.
    pub fn record_failure(&self, errno: Option<i32>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = errno {
            let _ = self
                .first_errno
                .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    /// The errno of the first failure, or zero.
    pub fn first_errno(&self) -> i32 {
        self.first_errno.load(Ordering::Acquire)
    }

    /// Exit code for the process: the first failure's errno, else 0.
    pub fn exit_code(&self) -> i32 {
        self.first_errno()
    }
}

struct Queue {
    slots: Vec<Option<WorkItem>>,
    head: usize,
    tail: usize,
}

impl Queue {
    fn pop_head(&mut self) -> Option<WorkItem> {
        if self.head == self.tail {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head += 1;
        item
    }

    fn pop_tail(&mut self) -> Option<WorkItem> {
        if self.head == self.tail {
            return None;
        }
        self.tail -= 1;
        self.slots[self.tail].take()
    }
}

/// Fixed-size pool draining a pre-filled queue of [`WorkItem`]s.
pub struct WorkerPool {
    items: Vec<WorkItem>,
    workers: usize,
    reverse: usize,
}

impl WorkerPool {
    /// Create a pool with `workers` threads, `reverse` of which will
    /// consume from the tail of the queue.
    pub fn new(workers: usize, reverse: usize) -> Self {
        let workers = workers.max(1);
        WorkerPool {
            items: Vec::new(),
            workers,
            reverse: reverse.min(workers),
        }
    }

    /// Add an item. Only called from the single-threaded enqueue phase.
    pub fn enqueue(&mut self, item: WorkItem) {
        self.items.push(item);
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Sort the queue ascending by file size.
    pub fn sort_by_size(&mut self) {
        self.items.sort_by_key(|item| item.snapshot.size);
    }

    /// Shrink the worker count to the queue length, keeping the
    /// requested reverse share when possible.
    pub fn clamp_workers(&mut self) {
        if self.workers > self.items.len() && !self.items.is_empty() {
            self.workers = self.items.len();
            self.reverse = self.reverse.min(self.workers);
        }
    }

    /// Drain the queue with `process`, blocking until every worker has
    /// finished. Returns the number of items processed.
    ///
    /// Workers observe the process quit flag between items; items
    /// already handed out run to completion.
    pub fn run<F>(self, process: F) -> usize
    where
        F: Fn(usize, &mut WorkItem) + Send + Sync,
    {
        let total = self.items.len();
        let queue = Mutex::new(Queue {
            slots: self.items.into_iter().map(Some).collect(),
            head: 0,
            tail: total,
        });
        let processed = AtomicUsize::new(0);
        let forward_workers = self.workers - self.reverse;

        std::thread::scope(|scope| {
            for worker_id in 0..self.workers {
                let from_tail = worker_id >= forward_workers;
                let queue = &queue;
                let process = &process;
                let processed = &processed;
                scope.spawn(move || loop {
                    if signals::quit_requested() {
                        break;
                    }
                    let next = {
                        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                        if from_tail {
                            queue.pop_tail()
                        } else {
                            queue.pop_head()
                        }
                    };
                    match next {
                        Some(mut item) => {
                            process(worker_id, &mut item);
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        None => break,
                    }
                });
            }
        });

        processed.into_inner()
    }
}
