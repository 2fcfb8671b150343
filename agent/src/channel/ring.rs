//! Single-producer single-consumer summary queue
//!
//! The producer is the profiled thread, possibly inside a signal handler.
//! Pushing never allocates and never locks; growing the queue takes the
//! queue mutex and must happen outside signal context. The consumer holds
//! the same mutex while it looks at the front element, so a growth can't
//! move the element out from under it.

use super::EventSummary;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Slot = MaybeUninit<EventSummary>;

#[derive(Clone, Copy)]
struct Buffer {
    ptr: *mut Slot,
    capacity: usize,
}

impl Buffer {
    fn allocate(capacity: usize) -> Self {
        let mut slots: Vec<Slot> = Vec::with_capacity(capacity);
        slots.resize_with(capacity, MaybeUninit::uninit);
        let ptr = Box::into_raw(slots.into_boxed_slice()) as *mut Slot;
        Self { ptr, capacity }
    }

    /// Free the storage without touching the elements
    ///
    /// # Safety
    /// The buffer must come from `allocate` and must not be used afterwards.
    unsafe fn free(self) {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            self.ptr,
            self.capacity,
        )));
    }

    fn slot(&self, counter: usize) -> *mut Slot {
        // SAFETY: the mask keeps the offset inside the allocation
        unsafe { self.ptr.add(counter & (self.capacity - 1)) }
    }
}

struct Shared {
    buffer: std::cell::UnsafeCell<Buffer>,
    /// Next element to read, advanced by the consumer
    head: AtomicUsize,
    /// Next slot to write, advanced by the producer
    tail: AtomicUsize,
    lock: Mutex<()>,
}

// SAFETY: `buffer` is replaced only by the producer while holding `lock`,
// and the consumer reads it only while holding `lock`. Elements are handed
// from producer to consumer through the release/acquire pair on `tail`.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn buffer(&self) -> Buffer {
        // SAFETY: see the Sync impl
        unsafe { *self.buffer.get() }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let buffer = self.buffer();
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for counter in head..tail {
            // SAFETY: slots in head..tail hold initialised elements
            unsafe { ptr::drop_in_place((*buffer.slot(counter)).as_mut_ptr()) };
        }
        // SAFETY: last owner; nothing refers to the buffer anymore
        unsafe { buffer.free() };
    }
}

/// Create a queue with room for `capacity` summaries, rounded up to a power
/// of two
pub fn summary_queue(capacity: usize) -> (SummaryWriter, SummaryReader) {
    let capacity = capacity.max(1).next_power_of_two();
    let shared = Arc::new(Shared {
        buffer: std::cell::UnsafeCell::new(Buffer::allocate(capacity)),
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        lock: Mutex::new(()),
    });
    (
        SummaryWriter {
            shared: shared.clone(),
        },
        SummaryReader { shared },
    )
}

/// Producer half, owned by the profiled thread
pub struct SummaryWriter {
    shared: Arc<Shared>,
}

impl SummaryWriter {
    pub fn len(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.buffer().capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Append a summary; hands it back when the queue is full
    ///
    /// Safe to call from a signal handler running on the producer thread,
    /// as long as it did not interrupt [`grow`](Self::grow).
    pub fn push(&mut self, summary: EventSummary) -> Result<(), EventSummary> {
        if self.is_full() {
            return Err(summary);
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        // SAFETY: the slot at `tail` is free and only the producer writes it
        unsafe { (*self.shared.buffer().slot(tail)).write(summary) };
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Double the capacity
    pub fn grow(&mut self) {
        let _guard = self.shared.lock();
        let old = self.shared.buffer();
        let new = Buffer::allocate(old.capacity * 2);
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        for counter in head..tail {
            // SAFETY: moves each live element into the same logical position
            unsafe { ptr::copy_nonoverlapping(old.slot(counter), new.slot(counter), 1) };
        }
        // SAFETY: the consumer can't look at the buffer while we hold the lock
        unsafe {
            *self.shared.buffer.get() = new;
            old.free();
        }
    }
}

/// Consumer half, drained by the log thread
pub struct SummaryReader {
    shared: Arc<Shared>,
}

impl SummaryReader {
    /// Number of summaries waiting to be consumed
    pub fn pending(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Acquire);
        let head = self.shared.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// Lock the queue and look at its oldest summary
    pub fn front(&self) -> Option<SummaryGuard<'_>> {
        let guard = self.shared.lock();
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = self.shared.buffer().slot(head);
        Some(SummaryGuard {
            shared: &self.shared,
            slot,
            head,
            _guard: guard,
        })
    }
}

/// The front summary of a queue; the queue stays locked while this lives
pub struct SummaryGuard<'a> {
    shared: &'a Shared,
    slot: *mut Slot,
    head: usize,
    _guard: MutexGuard<'a, ()>,
}

impl SummaryGuard<'_> {
    /// Remove the summary from the queue and unlock it
    pub fn advance(self) {
        // SAFETY: the slot holds an initialised element published by `tail`
        let summary = unsafe { (*self.slot).assume_init_read() };
        self.shared
            .head
            .store(self.head.wrapping_add(1), Ordering::Release);
        drop(self);
        drop(summary);
    }
}

impl std::ops::Deref for SummaryGuard<'_> {
    type Target = EventSummary;

    fn deref(&self) -> &EventSummary {
        // SAFETY: initialised, and the producer won't touch it until `head` moves
        unsafe { (*self.slot).assume_init_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(ticks: u32) -> EventSummary {
        let mut summary = EventSummary::new(0);
        summary.ticks = ticks;
        summary
    }

    #[test]
    fn test_push_until_full() {
        let (mut writer, reader) = summary_queue(3);
        assert_eq!(writer.capacity(), 4);
        for ticks in 0..4 {
            assert!(writer.push(summary(ticks)).is_ok());
        }
        assert!(writer.is_full());
        let rejected = writer.push(summary(99)).unwrap_err();
        assert_eq!(rejected.ticks, 99);
        assert_eq!(reader.pending(), 4);
    }

    #[test]
    fn test_fifo_across_growth() {
        let (mut writer, reader) = summary_queue(2);
        writer.push(summary(1)).unwrap();
        writer.push(summary(2)).unwrap();
        reader.front().unwrap().advance();
        writer.push(summary(3)).unwrap();

        // Wrapped around; growing must keep the order
        writer.grow();
        assert_eq!(writer.capacity(), 4);
        writer.push(summary(4)).unwrap();
        writer.push(summary(5)).unwrap();

        let mut seen = Vec::new();
        while let Some(front) = reader.front() {
            seen.push(front.ticks);
            front.advance();
        }
        assert_eq!(seen, vec![2, 3, 4, 5]);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_guard_without_advance_keeps_element() {
        let (mut writer, reader) = summary_queue(4);
        writer.push(summary(7)).unwrap();
        {
            let front = reader.front().unwrap();
            assert_eq!(front.ticks, 7);
        }
        assert_eq!(reader.pending(), 1);
        assert!(reader.front().is_some());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let (mut writer, reader) = summary_queue(8);
        let consumer = std::thread::spawn(move || {
            let mut expected = 0;
            while expected < 10_000 {
                if let Some(front) = reader.front() {
                    assert_eq!(front.ticks, expected);
                    front.advance();
                    expected += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut next = 0;
        while next < 10_000 {
            match writer.push(summary(next)) {
                Ok(()) => next += 1,
                Err(_) if writer.capacity() < 64 => writer.grow(),
                Err(_) => std::thread::yield_now(),
            }
        }
        consumer.join().unwrap();
    }

    #[test]
    fn test_drop_releases_pending() {
        let (mut writer, reader) = summary_queue(4);
        let mut big = summary(1);
        big.new_frames.reserve(100);
        writer.push(big).unwrap();
        drop(writer);
        drop(reader);
    }
}
