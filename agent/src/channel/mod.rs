//! Per-thread event channel
//!
//! The channel mirrors the logical call stack of one thread and accumulates
//! what changed since the previous sample: how much of the old stack is
//! still in place, whether the instruction pointer of the topmost kept frame
//! moved, which frames are new, and which allocations happened. A sample
//! moves that accumulated [`EventSummary`] into a queue drained by the log
//! thread.
//!
//! Writer methods must only be called from the owning thread. Sampling with
//! [`Reallocation::Disallow`] performs no heap operations and may be invoked
//! from a signal handler that interrupted the owning thread outside of any
//! other channel call.

mod ring;

pub use ring::{summary_queue, SummaryGuard, SummaryReader, SummaryWriter};

use rtprof_shared::{
    AllocEntry, AllocSample, FunctionId, InternalId, Ip, SampleFrame, StackSample, Ticks,
};
use std::collections::BTreeMap;
use std::mem;

/// Initial queue capacity of a new channel
pub const START_CAPACITY: usize = 128;

/// One frame of the logical call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub function: FunctionId,
    pub iid: InternalId,
    /// Zero when unknown
    pub ip: Ip,
}

impl Frame {
    pub fn new(function: FunctionId, iid: InternalId) -> Self {
        Self {
            function,
            iid,
            ip: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocInfo {
    pub count: u64,
    pub bytes: u64,
}

/// Allocations by class internal id, then by allocation ip
pub type AllocTable = BTreeMap<InternalId, BTreeMap<Ip, AllocInfo>>;

/// What changed on a thread between two samples
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSummary {
    pub ticks: Ticks,
    pub count: u32,

    /// Frames of the previous stack still in place
    pub match_prefix: usize,
    /// Size of the previous stack
    pub stack_size: usize,
    pub ip_changed: bool,
    /// New ip of the topmost kept frame, when `ip_changed`
    pub ip: Ip,
    pub new_frames: Vec<Frame>,

    pub alloc_table: AllocTable,
}

impl EventSummary {
    /// Empty summary on top of a stack of `stack_size` frames
    pub fn new(stack_size: usize) -> Self {
        Self {
            ticks: 0,
            count: 0,
            match_prefix: stack_size,
            stack_size,
            ip_changed: false,
            ip: 0,
            new_frames: Vec::new(),
            alloc_table: AllocTable::new(),
        }
    }

    pub fn has_stack_sample(&self) -> bool {
        self.count > 0
            || self.match_prefix != self.stack_size
            || self.ip_changed
            || !self.new_frames.is_empty()
    }

    pub fn has_alloc_sample(&self) -> bool {
        !self.alloc_table.is_empty()
    }

    /// Trace-log samples of this summary for thread `thread`
    pub fn to_records(&self, thread: InternalId) -> (Option<StackSample>, Option<AllocSample>) {
        let stack = self.has_stack_sample().then(|| StackSample {
            thread,
            ticks: self.ticks,
            count: self.count,
            match_prefix: self.match_prefix as u32,
            stack_size: self.stack_size as u32,
            changed_ip: self.ip_changed.then_some(self.ip),
            new_frames: self
                .new_frames
                .iter()
                .map(|f| SampleFrame::new(f.iid, f.ip))
                .collect(),
        });

        let alloc = self.has_alloc_sample().then(|| AllocSample {
            thread,
            ticks: self.ticks,
            entries: self
                .alloc_table
                .iter()
                .flat_map(|(class, by_ip)| {
                    by_ip.iter().map(|(ip, info)| AllocEntry {
                        class: *class,
                        count: info.count,
                        bytes: info.bytes,
                        ip: *ip,
                    })
                })
                .collect(),
        });

        (stack, alloc)
    }
}

/// Whether a channel call may allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reallocation {
    Allow,
    /// Signal context: fail instead of allocating
    Disallow,
}

/// Producer side of a thread's events
pub struct EventChannel {
    stack: Vec<Frame>,
    current: EventSummary,
    writer: SummaryWriter,
    growth_planned: bool,
}

impl EventChannel {
    pub fn new() -> (Self, SummaryReader) {
        Self::with_capacity(START_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, SummaryReader) {
        let (writer, reader) = summary_queue(capacity);
        let channel = Self {
            stack: Vec::new(),
            current: EventSummary::new(0),
            writer,
            growth_planned: false,
        };
        (channel, reader)
    }

    /// Make room for the next sample; `false` if that would need allocating
    fn ensure_capacity(&mut self, realloc: Reallocation) -> bool {
        let queue_full = self.writer.is_full();
        let needed = self.stack.len() - self.current.match_prefix;
        let frames_short = self.current.new_frames.capacity() < needed;

        match realloc {
            Reallocation::Disallow => {
                if queue_full {
                    self.plan_growth();
                }
                !queue_full && !frames_short
            }
            Reallocation::Allow => {
                if queue_full || self.growth_planned {
                    self.writer.grow();
                    self.growth_planned = false;
                }
                if frames_short {
                    self.current.new_frames.reserve(needed);
                }
                true
            }
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.stack.push(frame);
        self.ensure_capacity(Reallocation::Allow);
    }

    pub fn pop(&mut self) {
        if self.stack.pop().is_none() {
            tracing::warn!("Pop from an empty stack mirror ignored");
            return;
        }
        if self.stack.len() < self.current.match_prefix {
            self.current.match_prefix = self.stack.len();
            self.current.ip_changed = false;
        }
        self.ensure_capacity(Reallocation::Allow);
    }

    /// Set the ip of the frame `from_top` positions below the top
    pub fn set_instruction_pointer(&mut self, ip: Ip, from_top: usize) {
        self.set_instruction_pointer_in(ip, from_top, Reallocation::Allow);
    }

    /// As [`set_instruction_pointer`](Self::set_instruction_pointer); with
    /// `Disallow` it is usable from signal context
    pub fn set_instruction_pointer_in(&mut self, ip: Ip, from_top: usize, realloc: Reallocation) {
        let len = self.stack.len();
        if from_top >= len {
            return;
        }
        let index = len - from_top - 1;
        let frame = &mut self.stack[index];
        if frame.ip != ip {
            frame.ip = ip;
            if index + 1 == self.current.match_prefix {
                self.current.ip_changed = true;
            } else if index + 1 < self.current.match_prefix {
                // Only the topmost kept frame has an ip slot in the summary;
                // deeper changes resend the frame and everything above it
                self.current.match_prefix = index;
                self.current.ip_changed = false;
            }
        }
        self.ensure_capacity(realloc);
    }

    /// Account one allocation of `size` bytes of `class` at `ip`
    pub fn record_allocation(&mut self, class: InternalId, size: u64, ip: Ip) {
        let info = self
            .current
            .alloc_table
            .entry(class)
            .or_default()
            .entry(ip)
            .or_default();
        info.count += 1;
        info.bytes += size;
    }

    /// Close the accumulated summary and queue it
    ///
    /// Returns `false` when the queue has no room and `realloc` forbids
    /// growing it; the summary keeps accumulating in that case.
    pub fn try_sample(&mut self, ticks: Ticks, count: u32, realloc: Reallocation) -> bool {
        if !self.ensure_capacity(realloc) {
            return false;
        }

        self.current.ticks = ticks;
        self.current.count = count;
        if self.current.ip_changed {
            self.current.ip = self.stack[self.current.match_prefix - 1].ip;
        }
        let prefix = self.current.match_prefix;
        self.current.new_frames.clear();
        self.current
            .new_frames
            .extend_from_slice(&self.stack[prefix..]);

        // `replace` leaves an empty summary behind without dropping anything
        let summary = mem::replace(&mut self.current, EventSummary::new(self.stack.len()));
        if let Err(summary) = self.writer.push(summary) {
            // Unreachable after a successful capacity check
            self.current = summary;
            return false;
        }
        true
    }

    /// Grow the queue on the next call that may allocate
    pub fn plan_growth(&mut self) {
        self.growth_planned = true;
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Frame `from_top` positions below the top of the stack
    pub fn frame_from_top(&self, from_top: usize) -> Option<&Frame> {
        self.stack.iter().rev().nth(from_top)
    }

    pub fn has_stack_sample(&self) -> bool {
        self.current.has_stack_sample() || self.stack.len() > self.current.match_prefix
    }

    pub fn has_alloc_sample(&self) -> bool {
        self.current.has_alloc_sample()
    }

    /// Summaries queued and not yet consumed
    pub fn queued(&self) -> usize {
        self.writer.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.writer.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> Frame {
        Frame::new(0x1000 + n, InternalId(n as u32))
    }

    fn drain(reader: &SummaryReader) -> Vec<EventSummary> {
        let mut out = Vec::new();
        while let Some(front) = reader.front() {
            out.push((*front).clone());
            front.advance();
        }
        out
    }

    #[test]
    fn test_first_sample_carries_whole_stack() {
        let (mut channel, reader) = EventChannel::new();
        channel.push(frame(2));
        channel.push(frame(3));
        assert!(channel.has_stack_sample());
        assert!(channel.try_sample(5, 1, Reallocation::Allow));

        let summaries = drain(&reader);
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!((s.match_prefix, s.stack_size), (0, 0));
        assert_eq!(s.new_frames, vec![frame(2), frame(3)]);
        assert_eq!(s.ticks, 5);
        assert!(!channel.has_stack_sample());
    }

    #[test]
    fn test_pop_below_prefix_clamps() {
        let (mut channel, reader) = EventChannel::new();
        channel.push(frame(1));
        channel.push(frame(2));
        channel.try_sample(0, 1, Reallocation::Allow);

        channel.set_instruction_pointer(0xabc, 0);
        channel.pop();
        channel.push(frame(4));
        channel.try_sample(1, 1, Reallocation::Allow);

        let summaries = drain(&reader);
        let s = &summaries[1];
        assert_eq!((s.match_prefix, s.stack_size), (1, 2));
        assert!(!s.ip_changed);
        assert_eq!(s.new_frames, vec![frame(4)]);
    }

    #[test]
    fn test_ip_change_at_prefix_boundary() {
        let (mut channel, reader) = EventChannel::new();
        channel.push(frame(1));
        channel.push(frame(2));
        channel.try_sample(0, 1, Reallocation::Allow);

        channel.set_instruction_pointer(0x20, 0);
        channel.try_sample(1, 1, Reallocation::Allow);

        let s = &drain(&reader)[1];
        assert!(s.ip_changed);
        assert_eq!(s.ip, 0x20);
        assert_eq!(s.match_prefix, 2);
        assert!(s.new_frames.is_empty());
    }

    #[test]
    fn test_ip_change_below_prefix_resends_frames() {
        let (mut channel, reader) = EventChannel::new();
        channel.push(frame(1));
        channel.push(frame(2));
        channel.try_sample(0, 1, Reallocation::Allow);

        channel.set_instruction_pointer(0x20, 0);
        channel.set_instruction_pointer(0x10, 1);
        assert!(!channel.current.ip_changed);
        assert!(channel.try_sample(1, 1, Reallocation::Allow));

        let s = &drain(&reader)[1];
        assert_eq!((s.match_prefix, s.stack_size), (0, 2));
        assert!(!s.ip_changed);
        let ips: Vec<Ip> = s.new_frames.iter().map(|f| f.ip).collect();
        assert_eq!(ips, vec![0x10, 0x20]);
    }

    /// Small deterministic generator so the walk is reproducible
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn test_random_walk_replays_to_mirror() {
        use rtprof_shared::StackReplay;

        let mut rng = Lcg(0x5eed);
        let (mut channel, reader) = EventChannel::new();
        let mut replay = StackReplay::new();
        let mut samples = 0;

        for step in 0..5000 {
            match rng.next() % 5 {
                0 | 1 => channel.push(frame((rng.next() % 16) as usize)),
                2 => channel.pop(),
                3 => {
                    let depth = channel.stack_size().max(1);
                    let ip = if rng.next() % 4 == 0 { 0 } else { 0x4000 + rng.next() % 8 };
                    channel.set_instruction_pointer(ip, (rng.next() as usize) % depth);
                }
                _ => {
                    let realloc = if rng.next() % 2 == 0 {
                        Reallocation::Allow
                    } else {
                        Reallocation::Disallow
                    };
                    if !channel.try_sample(step, 1, realloc) {
                        continue;
                    }
                    samples += 1;
                    for summary in drain(&reader) {
                        let (stack, _) = summary.to_records(InternalId(0));
                        if let Some(stack) = stack {
                            replay.apply(&stack).unwrap();
                        }
                    }
                    let expected: Vec<SampleFrame> = (0..channel.stack_size())
                        .rev()
                        .map(|n| {
                            let f = channel.frame_from_top(n).unwrap();
                            SampleFrame::new(f.iid, f.ip)
                        })
                        .collect();
                    assert_eq!(replay.frames(), expected.as_slice(), "step {}", step);
                }
            }
        }
        assert!(samples > 500);
    }

    #[test]
    fn test_repeat_ip_is_not_a_change() {
        let (mut channel, _reader) = EventChannel::new();
        channel.push(frame(1));
        channel.try_sample(0, 1, Reallocation::Allow);
        channel.set_instruction_pointer(0, 0);
        assert!(!channel.current.ip_changed);
    }

    #[test]
    fn test_allocations_accumulate() {
        let (mut channel, reader) = EventChannel::new();
        channel.record_allocation(InternalId(3), 24, 0);
        channel.record_allocation(InternalId(3), 8, 0);
        channel.record_allocation(InternalId(1), 16, 0x40);
        assert!(channel.has_alloc_sample());
        assert!(!channel.has_stack_sample());
        channel.try_sample(9, 0, Reallocation::Allow);

        let s = &drain(&reader)[0];
        let (stack, alloc) = s.to_records(InternalId(7));
        assert!(stack.is_none());
        let alloc = alloc.unwrap();
        assert_eq!(alloc.to_string(), "sam mem 0x00000007 9 0x1:1:16:0x0000000000000040 0x3:2:32");
    }

    #[test]
    fn test_disallow_on_full_queue_plans_growth() {
        let (mut channel, reader) = EventChannel::with_capacity(2);
        channel.push(frame(1));
        assert!(channel.try_sample(0, 1, Reallocation::Disallow));
        assert!(channel.try_sample(1, 1, Reallocation::Disallow));
        assert!(!channel.try_sample(2, 1, Reallocation::Disallow));
        assert!(channel.growth_planned);
        assert_eq!(channel.queue_capacity(), 2);

        // The next call allowed to allocate performs the growth
        channel.push(frame(2));
        assert_eq!(channel.queue_capacity(), 4);
        assert!(channel.try_sample(3, 1, Reallocation::Disallow));
        assert_eq!(drain(&reader).len(), 3);
    }

    #[test]
    fn test_disallow_without_reserved_frames_fails() {
        let (mut channel, _reader) = EventChannel::new();
        channel.stack.push(frame(1));
        assert!(!channel.try_sample(0, 1, Reallocation::Disallow));
        assert!(channel.try_sample(0, 1, Reallocation::Allow));
    }

    #[test]
    fn test_out_of_range_requests_are_ignored() {
        let (mut channel, _reader) = EventChannel::new();
        channel.pop();
        channel.set_instruction_pointer(0x1, 3);
        assert_eq!(channel.stack_size(), 0);
        assert!(channel.frame_from_top(0).is_none());
    }

    #[test]
    fn test_stack_sample_format() {
        let mut summary = EventSummary::new(3);
        summary.match_prefix = 2;
        summary.ip_changed = true;
        summary.ip = 0;
        summary.count = 4;
        summary.new_frames = vec![Frame {
            function: 1,
            iid: InternalId(0x1f),
            ip: 0x400,
        }];
        let (stack, alloc) = summary.to_records(InternalId(1));
        assert!(alloc.is_none());
        assert_eq!(
            stack.unwrap().to_string(),
            "sam str 0x00000001 0 4 2:3:? 0x1f:0x0000000000000400"
        );
    }
}
