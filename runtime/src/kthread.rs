// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Per-worker state: the bundle, the runqueue the host scheduler consumes,
//! and the thread-locals that identify the current worker and uthread.
//!
//! Every worker registers itself once at startup and stays registered for
//! the life of the process. The bundle is worker-private; the runqueue ring
//! is published with release stores so the work-stealing loops on other
//! workers observe fully-initialized uthreads.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::arch;
use crate::bundle::Bundle;
use crate::thread::Uthread;

/// Capacity of the per-worker runqueue ring.
pub const RUNTIME_RQ_SIZE: usize = 256;

/// The ring slots and the overflow list. Both live behind the worker's
/// spinlock; only the head/tail cursors are read lock-free by stealers.
pub struct RunQueue {
    slots: Vec<Option<Arc<Uthread>>>,
    overflow: VecDeque<Arc<Uthread>>,
}

impl RunQueue {
    fn new() -> RunQueue {
        RunQueue {
            slots: vec![None; RUNTIME_RQ_SIZE],
            overflow: VecDeque::new(),
        }
    }
}

/// One worker: a kernel thread pinned to a hardware thread, owning one
/// bundle and one runqueue.
pub struct Kthread {
    id: u32,
    rq_head: AtomicU32,
    rq_tail: AtomicU32,
    /// `ready_tsc` of the oldest entry while the ring is non-empty; the
    /// control plane uses it to detect queue build-up.
    oldest_tsc: AtomicU64,
    /// Set by the control plane when this worker must cede to it.
    cede_needed: AtomicBool,
    /// LAMEs dropped because one was already being handled.
    suppressed_lames: AtomicU64,
    /// Deliveries that detoured through the preemption slow path.
    preempt_slowpaths: AtomicU64,
    rq: spin::Mutex<RunQueue>,
    bundle: UnsafeCell<Bundle>,
}

// The bundle is only touched from the owning worker; everything else is
// atomic or behind the spinlock.
unsafe impl Send for Kthread {}
unsafe impl Sync for Kthread {}

impl Kthread {
    fn new(id: u32, bundle_capacity: u32) -> Kthread {
        Kthread {
            id,
            rq_head: AtomicU32::new(0),
            rq_tail: AtomicU32::new(0),
            oldest_tsc: AtomicU64::new(0),
            cede_needed: AtomicBool::new(false),
            suppressed_lames: AtomicU64::new(0),
            preempt_slowpaths: AtomicU64::new(0),
            rq: spin::Mutex::new(RunQueue::new()),
            bundle: UnsafeCell::new(Bundle::new(bundle_capacity)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Runs `f` against this worker's bundle.
    ///
    /// The bundle is unsynchronized: it must only be reached from the
    /// owning worker, and bundle scheduling must be dynamically disabled
    /// around any section that leaves the bundle inconsistent, since a
    /// LAME may land between any two instructions otherwise.
    pub fn with_bundle<R>(&self, f: impl FnOnce(&mut Bundle) -> R) -> R {
        f(unsafe { &mut *self.bundle.get() })
    }

    /// Adds a uthread to the bundle and hides every member from the
    /// work-stealer (not ready, running), preserving the illusion that
    /// bundled uthreads are on CPU.
    pub fn add_to_bundle(
        &self,
        th: &Arc<Uthread>,
        set_active: bool,
    ) -> Result<(), crate::Error> {
        self.with_bundle(|b| {
            b.add(th, set_active)?;
            b.set_all_unready();
            Ok(())
        })
    }

    pub fn set_cede_needed(&self, needed: bool) {
        self.cede_needed.store(needed, Ordering::Release);
    }

    pub fn cede_needed(&self) -> bool {
        self.cede_needed.load(Ordering::Acquire)
    }

    pub(crate) fn note_suppressed_lame(&self) {
        self.suppressed_lames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn suppressed_lames(&self) -> u64 {
        self.suppressed_lames.load(Ordering::Relaxed)
    }

    pub(crate) fn note_preempt_slowpath(&self) {
        self.preempt_slowpaths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn preempt_slowpaths(&self) -> u64 {
        self.preempt_slowpaths.load(Ordering::Relaxed)
    }

    pub fn rq_len(&self) -> usize {
        let head = self.rq_head.load(Ordering::Acquire);
        let tail = self.rq_tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn rq_overflow_len(&self) -> usize {
        self.rq.lock().overflow.len()
    }

    pub fn oldest_tsc(&self) -> u64 {
        self.oldest_tsc.load(Ordering::Relaxed)
    }

    /// Ring + overflow contents in pop order, for the host scheduler's
    /// bookkeeping (and the tests).
    pub fn rq_snapshot(&self) -> Vec<Arc<Uthread>> {
        let rq = self.rq.lock();
        let head = self.rq_head.load(Ordering::Acquire);
        let tail = self.rq_tail.load(Ordering::Acquire);
        let mut out = Vec::new();
        let mut cursor = tail;
        while cursor != head {
            if let Some(ref th) = rq.slots[cursor as usize % RUNTIME_RQ_SIZE] {
                out.push(Arc::clone(th));
            }
            cursor = cursor.wrapping_add(1);
        }
        out.extend(rq.overflow.iter().cloned());
        out
    }

    /// Pops the oldest runnable uthread. This is the consumer side the
    /// host scheduler loop (and stealers, via the same lock) use.
    pub fn rq_pop(&self) -> Option<Arc<Uthread>> {
        let mut rq = self.rq.lock();
        let head = self.rq_head.load(Ordering::Acquire);
        let tail = self.rq_tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let th = rq.slots[tail as usize % RUNTIME_RQ_SIZE].take();
        self.rq_tail.store(tail.wrapping_add(1), Ordering::Release);
        self.drain_overflow_locked(&mut rq);
        th
    }

    fn rq_push_locked(&self, rq: &mut RunQueue, th: Arc<Uthread>) {
        let head = self.rq_head.load(Ordering::Relaxed);
        let tail = self.rq_tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) as usize >= RUNTIME_RQ_SIZE || !rq.overflow.is_empty() {
            // Ring is full (or older entries already spilled): preserve
            // FIFO order through the overflow list and try to drain.
            rq.overflow.push_back(th);
            self.drain_overflow_locked(rq);
            return;
        }
        let ready_tsc = th.ready_tsc.load(Ordering::Relaxed);
        rq.slots[head as usize % RUNTIME_RQ_SIZE] = Some(th);
        self.rq_head.store(head.wrapping_add(1), Ordering::Release);
        if head == tail {
            // Ring transitioned from empty.
            self.oldest_tsc.store(ready_tsc, Ordering::Relaxed);
        }
    }

    fn drain_overflow_locked(&self, rq: &mut RunQueue) {
        loop {
            let head = self.rq_head.load(Ordering::Relaxed);
            let tail = self.rq_tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) as usize >= RUNTIME_RQ_SIZE {
                return;
            }
            let th = match rq.overflow.pop_front() {
                Some(th) => th,
                None => return,
            };
            let ready_tsc = th.ready_tsc.load(Ordering::Relaxed);
            rq.slots[head as usize % RUNTIME_RQ_SIZE] = Some(th);
            self.rq_head.store(head.wrapping_add(1), Ordering::Release);
            if head == tail {
                self.oldest_tsc.store(ready_tsc, Ordering::Relaxed);
            }
        }
    }

    /// Dismantles the bundle: every member goes back onto this worker's
    /// runqueue as ready, and the bundle ends up empty. Called whenever the
    /// host scheduler reclaims the worker (park, yield, preemption) or
    /// bundling is being disabled.
    pub fn dismantle_bundle(&self) {
        if self.with_bundle(|b| b.used()) >= 1 {
            let mut rq = self.rq.lock();
            self.dismantle_bundle_locked(&mut rq);
        }
        self.with_bundle(|b| b.reset_cursor());
    }

    /// Same as [`dismantle_bundle`], for callers already holding the
    /// worker's runqueue lock.
    ///
    /// [`dismantle_bundle`]: Kthread::dismantle_bundle
    pub fn dismantle_bundle_locked(&self, rq: &mut RunQueue) {
        let now = arch::rdtsc();
        let members: Vec<Arc<Uthread>> = self.with_bundle(|b| b.take_all().collect());
        for th in members {
            // The ready store must be visible before the ring-head bump:
            // rq_push_locked publishes with a release store that a stealer
            // pairs with an acquire load.
            th.ready_tsc.store(now, Ordering::Relaxed);
            th.mark_queued();
            self.rq_push_locked(rq, th);
        }
    }

    pub fn print_bundle(&self) {
        self.with_bundle(|b| b.print(self.id));
    }
}

lazy_static! {
    /// All workers, indexed by id. Workers register once and are never
    /// removed, so references handed out by [`myk`] stay valid.
    static ref KTHREADS: spin::RwLock<Vec<Arc<Kthread>>> = spin::RwLock::new(Vec::new());
}

thread_local! {
    static MY_KTHREAD: Cell<*const Kthread> = Cell::new(ptr::null());
    static SELF_UTHREAD: Cell<*mut Uthread> = Cell::new(ptr::null_mut());
}

/// Registers the calling thread as a worker and binds it to a fresh
/// kthread record. Called once per worker at startup, before LAME delivery
/// is enabled for that thread.
pub fn init_thread(bundle_capacity: u32) -> Arc<Kthread> {
    let mut table = KTHREADS.write();
    let id = table.len() as u32;
    let k = Arc::new(Kthread::new(id, bundle_capacity));
    table.push(Arc::clone(&k));
    MY_KTHREAD.with(|slot| slot.set(Arc::as_ptr(&k)));
    k
}

/// The calling worker's kthread, or `None` off the worker threads.
pub fn myk() -> Option<&'static Kthread> {
    let ptr = MY_KTHREAD.with(|slot| slot.get());
    if ptr.is_null() {
        None
    } else {
        // Entries in KTHREADS are never dropped; see the table above.
        Some(unsafe { &*ptr })
    }
}

/// Index of the calling worker, for log records. `u32::MAX` when the
/// calling thread is not a worker.
pub fn my_index() -> u32 {
    myk().map(|k| k.id()).unwrap_or(u32::MAX)
}

/// Current-uthread pointer for this worker. The switch policy stores the
/// next uthread here before the register-restore epilogue runs, so the
/// store is always visible by the time the target uthread resumes.
pub fn set_self(th: *mut Uthread) {
    SELF_UTHREAD.with(|slot| slot.set(th));
}

pub fn thread_self() -> *mut Uthread {
    SELF_UTHREAD.with(|slot| slot.get())
}

/// Visits every registered worker (counter dumps, shutdown reporting).
pub fn for_each(mut f: impl FnMut(&Kthread)) {
    for k in KTHREADS.read().iter() {
        f(k);
    }
}

/// Hands the CPU back to the host scheduler. The bundle is dismantled
/// first so every member is visible on the runqueue before this worker
/// stops running uthreads.
pub fn thread_yield() {
    if let Some(k) = myk() {
        k.dismantle_bundle();
    }
    std::thread::yield_now();
}

/// Cedes this worker to the control plane. Like a yield, the bundle goes
/// back to the runqueue so the members can be stolen while the worker is
/// away.
pub fn thread_cede() {
    if let Some(k) = myk() {
        k.dismantle_bundle();
        log::debug!("[LAME][func:thread_cede][kthread:{}] ceding to control plane", k.id());
    }
    std::thread::yield_now();
}

/// Worker shutdown: any remaining bundle members go back to the runqueue
/// (where another worker can steal them), the bundle is cleared, and the
/// calling thread stops being a worker.
pub fn exit_thread() {
    if let Some(k) = myk() {
        k.dismantle_bundle();
        k.with_bundle(|b| b.clear());
    }
    MY_KTHREAD.with(|slot| slot.set(ptr::null()));
    SELF_UTHREAD.with(|slot| slot.set(ptr::null_mut()));
}
