// The id pool hands out monotonically increasing ids from one (partition,
// namespace) pair, hiding the authority round-trip behind a prefetched
// block. The moving parts:
//
//  - At most one current block and one pending slot. The pending slot walks
//    Idle -> Fetching -> {Ready, Exhausted, Failed} and back to Idle when
//    the block is swapped in or the failure is reported.
//
//  - A single renewer thread owns all authority traffic for the pool. It is
//    fed RenewJobs over a channel; the pending slot guarantees at most one
//    job is wanted at a time, so the channel stays near-empty.
//
//  - next_id consumes the current block and, once consumption crosses the
//    renew threshold, schedules the next fetch so the swap at drain time
//    usually finds a Ready block waiting.
//
//  - A drain-time swap waits at most renew_timeout. On expiry the job is
//    told to stand down; if the authority cannot be interrupted the job is
//    parked in close_blockers and its eventual result discarded. close()
//    refuses to return before every in-flight job has landed, which is what
//    drains that queue.
//
//  - Exhaustion (from the authority or from the configured upper bound) is
//    permanent: the pool latches and every later next_id fails fast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::authority::{IdAuthority, IdBlock, Namespace, Partition};
use trellis_base::{err, err_kind, ErrorKind, Result};

// A fetch is always scheduled at least this many ids before the block
// drains, however small the configured buffer percentage.
pub(crate) const RENEW_ID_COUNT: u64 = 100;

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub renew_timeout: Duration,
    pub renew_buffer_percentage: f64,
    pub upper_bound: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            renew_timeout: Duration::from_secs(10),
            renew_buffer_percentage: 0.3,
            upper_bound: u64::MAX,
        }
    }
}

struct RenewJob {
    // Ask the getter to stand down before it issues the remote call.
    stop: AtomicBool,
    // The result is no longer wanted; discard it on arrival.
    abandoned: AtomicBool,
}

impl RenewJob {
    fn new() -> Arc<RenewJob> {
        Arc::new(RenewJob {
            stop: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        })
    }
}

enum Pending {
    Idle,
    Fetching(Arc<RenewJob>),
    Ready(IdBlock),
    Exhausted,
    Failed(String),
}

struct PoolState {
    current: Option<IdBlock>,
    index: u64,
    renew_at: u64,
    pending: Pending,
    // Jobs submitted but not yet landed, including abandoned ones. close()
    // waits for this to reach zero.
    in_flight: usize,
    // Timed-out fetches against a non-interruptible authority, parked here
    // until their result lands.
    close_blockers: Vec<Arc<RenewJob>>,
    interrupt_epoch: u64,
    closed: bool,
    exhausted: bool,
}

struct PoolShared {
    partition: Partition,
    namespace: Namespace,
    authority: Arc<dyn IdAuthority>,
    opts: PoolOptions,
    state: Mutex<PoolState>,
    renewed: Condvar,
}

pub struct IdPool {
    shared: Arc<PoolShared>,
    jobs: Mutex<Option<Sender<Arc<RenewJob>>>>,
    renewer: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) fn renew_threshold(num_ids: u64, buffer_percentage: f64) -> u64 {
    let buffer = (num_ids as f64 * buffer_percentage).ceil() as u64;
    num_ids.saturating_sub(RENEW_ID_COUNT.max(buffer))
}

fn renewer_main(shared: Arc<PoolShared>, jobs: Receiver<Arc<RenewJob>>) {
    // The sender half is dropped by close(); the iterator then drains
    // whatever is queued and the thread exits.
    for job in jobs.iter() {
        if job.stop.load(Ordering::Acquire) {
            // Stood down before the remote call was issued: no block. The
            // next next_id resubmits if it still wants one.
            trace!(target: "trellis", "id renewer stood down before fetch");
            shared.land(&job, None);
            continue;
        }
        let got = shared.authority.get_id_block(
            shared.partition,
            shared.namespace,
            shared.opts.renew_timeout,
        );
        shared.land(&job, Some(got));
    }
}

impl PoolShared {
    // Publish a fetch result into the pending slot and wake everyone
    // waiting on the swap (or on close's drain).
    fn land(&self, job: &Arc<RenewJob>, got: Option<Result<IdBlock>>) {
        let mut st = self.state.lock();
        st.in_flight -= 1;
        st.close_blockers.retain(|b| !Arc::ptr_eq(b, job));
        if job.abandoned.load(Ordering::Acquire) {
            if let Some(Ok(block)) = got {
                debug!(
                    target: "trellis",
                    num_ids = block.num_ids(),
                    "discarding id block fetched after timeout"
                );
            }
        } else {
            st.pending = match got {
                None => Pending::Idle,
                Some(Ok(block)) => Pending::Ready(block),
                Some(Err(e)) if e.kind() == ErrorKind::PoolExhausted => Pending::Exhausted,
                Some(Err(e)) => Pending::Failed(format!("{:?}", e.kind())),
            };
        }
        self.renewed.notify_all();
    }
}

impl IdPool {
    pub fn new(
        authority: Arc<dyn IdAuthority>,
        partition: Partition,
        namespace: Namespace,
        opts: PoolOptions,
    ) -> Result<IdPool> {
        let shared = Arc::new(PoolShared {
            partition,
            namespace,
            authority,
            opts,
            state: Mutex::new(PoolState {
                current: None,
                index: 0,
                renew_at: 0,
                pending: Pending::Idle,
                in_flight: 0,
                close_blockers: Vec::new(),
                interrupt_epoch: 0,
                closed: false,
                exhausted: false,
            }),
            renewed: Condvar::new(),
        });
        let (tx, rx) = unbounded();
        let renewer_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("trellis-id-{}-{}", partition.0, namespace.0))
            .spawn(move || renewer_main(renewer_shared, rx))?;
        Ok(IdPool {
            shared,
            jobs: Mutex::new(Some(tx)),
            renewer: Mutex::new(Some(handle)),
        })
    }

    // Schedule a fetch if none is wanted yet. Call with the state lock held.
    fn ensure_fetch(&self, st: &mut PoolState) -> Result<()> {
        if st.closed || st.exhausted || !matches!(st.pending, Pending::Idle) {
            return Ok(());
        }
        let jobs = self.jobs.lock();
        let tx = match jobs.as_ref() {
            Some(tx) => tx,
            None => return Err(err_kind(ErrorKind::PoolClosed, "id pool renewer is gone")),
        };
        let job = RenewJob::new();
        st.pending = Pending::Fetching(job.clone());
        st.in_flight += 1;
        trace!(
            target: "trellis",
            partition = self.shared.partition.0,
            namespace = self.shared.namespace.0,
            "scheduling id block fetch"
        );
        if tx.send(job).is_err() {
            st.pending = Pending::Idle;
            st.in_flight -= 1;
            return Err(err_kind(ErrorKind::PoolClosed, "id pool renewer is gone"));
        }
        Ok(())
    }

    pub fn next_id(&self) -> Result<u64> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.closed {
            return Err(err_kind(ErrorKind::PoolClosed, "id pool is closed"));
        }
        if st.exhausted {
            return Err(err_kind(ErrorKind::PoolExhausted, "id pool is exhausted"));
        }

        // Swap in the next block if the current one is drained.
        if st.current.map_or(true, |b| st.index == b.num_ids()) {
            let deadline = Instant::now() + shared.opts.renew_timeout;
            let epoch = st.interrupt_epoch;
            loop {
                match std::mem::replace(&mut st.pending, Pending::Idle) {
                    Pending::Ready(block) => {
                        st.current = Some(block);
                        st.index = 0;
                        st.renew_at =
                            renew_threshold(block.num_ids(), shared.opts.renew_buffer_percentage);
                        trace!(
                            target: "trellis",
                            num_ids = block.num_ids(),
                            "swapped in renewed id block"
                        );
                        break;
                    }
                    Pending::Exhausted => {
                        st.exhausted = true;
                        return Err(err_kind(
                            ErrorKind::PoolExhausted,
                            "id authority is drained",
                        ));
                    }
                    Pending::Failed(msg) => {
                        // Transient: the pool stays usable and the next call
                        // retries the fetch.
                        return Err(err_kind(
                            ErrorKind::PoolBackend,
                            format!("id block fetch failed: {}", msg),
                        ));
                    }
                    Pending::Idle => self.ensure_fetch(&mut st)?,
                    Pending::Fetching(job) => st.pending = Pending::Fetching(job),
                }
                let timed_out = shared.renewed.wait_until(&mut st, deadline).timed_out();
                if st.closed || st.interrupt_epoch != epoch {
                    return Err(err_kind(
                        ErrorKind::Interrupted,
                        "unblocked while awaiting id block renewal",
                    ));
                }
                if timed_out && matches!(st.pending, Pending::Fetching(_)) {
                    if let Pending::Fetching(job) = std::mem::replace(&mut st.pending, Pending::Idle)
                    {
                        job.stop.store(true, Ordering::Release);
                        job.abandoned.store(true, Ordering::Release);
                        if !shared.authority.supports_interruption() {
                            // Park the fetch; close() waits it out.
                            st.close_blockers.push(job);
                        }
                    }
                    return Err(err_kind(
                        ErrorKind::PoolTimeout,
                        "timed out waiting for id block renewal",
                    ));
                }
            }
        }

        let block = match st.current {
            Some(b) => b,
            None => return Err(err("no current id block after renewal")),
        };
        let id = block.get_id(st.index);
        if id >= shared.opts.upper_bound {
            st.exhausted = true;
            return Err(err_kind(ErrorKind::PoolExhausted, "id upper bound reached"));
        }
        st.index += 1;

        // Crossing the renew threshold schedules exactly one fetch; the
        // pending slot stops duplicates, and an abandoned fetch still in
        // flight means the authority is struggling, so don't pile on.
        if st.index >= st.renew_at && st.in_flight == 0 {
            self.ensure_fetch(&mut st)?;
        }
        Ok(id)
    }

    // Wake every thread blocked in next_id; each fails with Interrupted and
    // the pool stays usable.
    pub fn interrupt_waiters(&self) {
        let mut st = self.shared.state.lock();
        st.interrupt_epoch += 1;
        self.shared.renewed.notify_all();
    }

    // Idempotent. Blocks until every in-flight fetch has landed (draining
    // the close_blockers queue) and the renewer thread has exited. After
    // return, next_id fails with PoolClosed.
    pub fn close(&self) {
        let shared = &self.shared;
        {
            let mut st = shared.state.lock();
            if !st.closed {
                st.closed = true;
                debug!(
                    target: "trellis",
                    partition = shared.partition.0,
                    namespace = shared.namespace.0,
                    "closing id pool"
                );
            }
            if let Pending::Fetching(job) = &st.pending {
                job.stop.store(true, Ordering::Release);
                job.abandoned.store(true, Ordering::Release);
            }
            // Waiters observe closed and fail with Interrupted.
            shared.renewed.notify_all();
            while st.in_flight > 0 {
                shared.renewed.wait(&mut st);
            }
            st.close_blockers.clear();
        }
        // Dropping the sender ends the renewer loop.
        drop(self.jobs.lock().take());
        let handle = self.renewer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for IdPool {
    fn drop(&mut self) {
        self.close();
    }
}
