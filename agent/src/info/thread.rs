use super::MappedInfo;
use crate::channel::{EventChannel, SummaryReader};
use rtprof_shared::{InternalId, OsThreadId, ThreadId, Ticks};
use std::cell::UnsafeCell;
use std::sync::atomic::{compiler_fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// State touched only by the thread itself (or a signal handler running on
/// it while the thread is interruptible)
pub struct ThreadState {
    pub channel: EventChannel,
    /// Generation tick of the last successful sample
    pub fix_ticks: Ticks,
    /// Number of frames below the top whose ip still has to be restored
    pub max_restore_ip_idx: usize,
}

/// A runtime thread as seen by the agent
pub struct ThreadInfo {
    pub id: ThreadId,
    pub iid: InternalId,
    os_thread_id: AtomicU32,
    native_handle: AtomicUsize,
    /// Thread CPU time at the previous CPU trace record, in microseconds
    pub last_user_time: AtomicU64,
    gen_ticks: AtomicU32,
    interruptible: AtomicBool,
    state: UnsafeCell<ThreadState>,
    reader: SummaryReader,
}

// SAFETY: `state` is only reached through `state_mut`, whose contract
// restricts it to the owning thread; everything else is atomic or Sync.
unsafe impl Sync for ThreadInfo {}
unsafe impl Send for ThreadInfo {}

impl ThreadInfo {
    pub fn with_capacity(id: ThreadId, iid: InternalId, capacity: usize) -> Self {
        let (channel, reader) = EventChannel::with_capacity(capacity);
        Self {
            id,
            iid,
            os_thread_id: AtomicU32::new(0),
            native_handle: AtomicUsize::new(0),
            last_user_time: AtomicU64::new(0),
            gen_ticks: AtomicU32::new(0),
            interruptible: AtomicBool::new(false),
            state: UnsafeCell::new(ThreadState {
                channel,
                fix_ticks: 0,
                max_restore_ip_idx: 0,
            }),
            reader,
        }
    }

    /// Owner-only state of the thread
    ///
    /// # Safety
    /// Only the thread this record describes may call this, and no other
    /// reference obtained from it may be alive. A signal handler may call it
    /// only when it interrupted the thread while [`is_interruptible`] was
    /// set.
    ///
    /// [`is_interruptible`]: Self::is_interruptible
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn state_mut(&self) -> &mut ThreadState {
        &mut *self.state.get()
    }

    /// Consumer side of the thread's summaries, used by the log thread
    pub fn reader(&self) -> &SummaryReader {
        &self.reader
    }

    pub fn os_thread_id(&self) -> OsThreadId {
        self.os_thread_id.load(Ordering::Acquire)
    }

    pub fn set_os_thread_id(&self, tid: OsThreadId) {
        self.os_thread_id.store(tid, Ordering::Release);
    }

    /// `pthread_t` of the OS thread currently running this thread, or zero
    pub fn native_handle(&self) -> libc::pthread_t {
        self.native_handle.load(Ordering::Acquire) as libc::pthread_t
    }

    pub fn set_native_handle(&self, handle: libc::pthread_t) {
        self.native_handle.store(handle as usize, Ordering::Release);
    }

    pub fn gen_ticks(&self) -> Ticks {
        self.gen_ticks.load(Ordering::Acquire)
    }

    /// Advance the generation tick; called by the sampling thread
    pub fn bump_gen_ticks(&self) -> Ticks {
        self.gen_ticks.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn is_interruptible(&self) -> bool {
        let value = self.interruptible.load(Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        value
    }

    /// Allow or forbid the sample handler to touch the owner state
    pub fn set_interruptible(&self, value: bool) {
        compiler_fence(Ordering::SeqCst);
        self.interruptible.store(value, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// Whether the sampler should consider this thread
    pub fn is_live(&self) -> bool {
        self.id != 0 && self.native_handle() != 0
    }
}

impl MappedInfo for ThreadInfo {
    type Id = ThreadId;

    fn create(id: ThreadId, iid: InternalId) -> Self {
        Self::with_capacity(id, iid, crate::channel::START_CAPACITY)
    }

    fn id(&self) -> ThreadId {
        self.id
    }

    fn iid(&self) -> InternalId {
        self.iid
    }
}

impl std::fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("id", &self.id)
            .field("iid", &self.iid)
            .field("os_thread_id", &self.os_thread_id())
            .finish()
    }
}
