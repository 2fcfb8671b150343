//! Profile data structures
//!
//! These types aggregate a stream of trace-log records into per-thread and
//! per-stack totals, suitable for summaries and flamegraphs.

use super::ids::{InternalId, OsThreadId, ThreadId};
use super::records::{AllocSample, Record, StackSample};
use crate::replay::StackReplay;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Per-thread totals
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadProfile {
    /// Runtime thread id, if the creation record was seen
    pub id: Option<ThreadId>,

    /// OS thread the runtime thread ran on
    pub os_thread_id: Option<OsThreadId>,

    /// Sampling periods attributed to this thread
    pub samples: u64,

    /// User CPU time reported for this thread, in microseconds
    pub cpu_us: u64,

    /// Whether the thread destruction record was seen
    pub destroyed: bool,

    #[serde(skip)]
    replay: StackReplay,
}

/// Allocation totals for one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocTotals {
    pub count: u64,
    pub bytes: u64,
}

/// Aggregated profile built from a trace log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Text of the `prf stm` record
    pub start_time: Option<String>,

    /// Configuration values dumped by the agent
    pub config: BTreeMap<String, String>,

    /// Function names by internal id
    pub function_names: HashMap<InternalId, String>,

    /// Class names by internal id
    pub class_names: HashMap<InternalId, String>,

    /// Per-thread totals by thread internal id
    pub threads: BTreeMap<InternalId, ThreadProfile>,

    /// Allocation totals by class internal id
    pub allocations: BTreeMap<InternalId, AllocTotals>,

    /// Sampling periods per full stack (function internal ids, bottom first)
    #[serde(skip)]
    pub stacks: HashMap<Vec<InternalId>, u64>,

    /// Total sampling periods across all threads
    pub total_samples: u64,

    /// Process user CPU time, in microseconds
    pub process_cpu_us: u64,

    /// Number of records consumed
    pub records: u64,

    /// Stack samples that did not fit the replayed stack
    pub replay_errors: u64,
}

impl Profile {
    /// Create a new empty profile
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a profile from a sequence of records
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut profile = Self::new();
        for record in records {
            profile.add_record(record);
        }
        profile
    }

    /// Fold one record into the profile
    pub fn add_record(&mut self, record: &Record) {
        self.records += 1;
        match record {
            Record::StartTime { time } => self.start_time = Some(time.clone()),
            Record::Config { name, value } => {
                self.config.insert(name.clone(), value.clone());
            }
            Record::ProcessCpu { user_us, .. } => self.process_cpu_us += user_us,
            Record::ClassName { iid, name } => {
                self.class_names.insert(*iid, name.clone());
            }
            Record::FunctionName { iid, full_name, .. } => {
                self.function_names.insert(*iid, full_name.clone());
            }
            Record::ThreadCreated { id, iid } => {
                let thread = self.threads.entry(*iid).or_default();
                thread.id = Some(*id);
                thread.destroyed = false;
                thread.replay.reset();
            }
            Record::ThreadDestroyed { iid } => {
                self.threads.entry(*iid).or_default().destroyed = true;
            }
            Record::ThreadAssigned { iid, os_thread_id } => {
                self.threads.entry(*iid).or_default().os_thread_id = Some(*os_thread_id);
            }
            Record::ThreadCpu { iid, user_us, .. } => {
                self.threads.entry(*iid).or_default().cpu_us += user_us;
            }
            Record::StackSample(sample) => self.add_stack_sample(sample),
            Record::AllocSample(sample) => self.add_alloc_sample(sample),
            _ => {}
        }
    }

    fn add_stack_sample(&mut self, sample: &StackSample) {
        let thread = self.threads.entry(sample.thread).or_default();
        let stack = match thread.replay.apply(sample) {
            Ok(frames) => frames.iter().map(|f| f.function).collect::<Vec<_>>(),
            Err(_) => {
                self.replay_errors += 1;
                thread.replay.reset();
                return;
            }
        };

        let weight = u64::from(sample.count);
        if weight == 0 {
            return;
        }
        thread.samples += weight;
        self.total_samples += weight;
        *self.stacks.entry(stack).or_insert(0) += weight;
    }

    fn add_alloc_sample(&mut self, sample: &AllocSample) {
        for entry in &sample.entries {
            let totals = self.allocations.entry(entry.class).or_default();
            totals.count += entry.count;
            totals.bytes += entry.bytes;
        }
    }

    /// Name of a function, falling back to its internal id
    pub fn function_name(&self, iid: InternalId) -> String {
        self.function_names
            .get(&iid)
            .cloned()
            .unwrap_or_else(|| format!("func_{}", iid))
    }

    /// Name of a class, falling back to its internal id
    pub fn class_name(&self, iid: InternalId) -> String {
        self.class_names
            .get(&iid)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", iid))
    }

    /// Folded stacks with their weights, heaviest first
    pub fn folded(&self) -> Vec<(String, u64)> {
        let mut folded: Vec<(String, u64)> = self
            .stacks
            .iter()
            .map(|(stack, weight)| {
                let names = stack.iter().map(|iid| self.function_name(*iid));
                (crate::utils::fold_names(names), *weight)
            })
            .collect();
        folded.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        folded
    }

    /// Functions ranked by the number of periods they were on top of the stack
    pub fn top_functions(&self, limit: usize) -> Vec<(String, u64)> {
        let mut by_leaf: HashMap<InternalId, u64> = HashMap::new();
        for (stack, weight) in &self.stacks {
            if let Some(leaf) = stack.last() {
                *by_leaf.entry(*leaf).or_insert(0) += weight;
            }
        }
        let mut ranked: Vec<(String, u64)> = by_leaf
            .into_iter()
            .map(|(iid, weight)| (self.function_name(iid), weight))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::records::{AllocEntry, SampleFrame};

    fn stack_sample(thread: u32, count: u32, prefix: u32, size: u32, new: &[u32]) -> Record {
        Record::StackSample(StackSample {
            thread: InternalId(thread),
            ticks: 0,
            count,
            match_prefix: prefix,
            stack_size: size,
            changed_ip: None,
            new_frames: new
                .iter()
                .map(|f| SampleFrame::new(InternalId(*f), 0))
                .collect(),
        })
    }

    #[test]
    fn test_profile_aggregates_stacks() {
        let records = vec![
            Record::FunctionName {
                iid: InternalId(2),
                full_name: "Main".into(),
                return_type: "void".into(),
                signature: "()".into(),
            },
            Record::FunctionName {
                iid: InternalId(3),
                full_name: "Work".into(),
                return_type: "void".into(),
                signature: "()".into(),
            },
            stack_sample(1, 2, 0, 0, &[2, 3]),
            stack_sample(1, 1, 2, 2, &[]),
            stack_sample(1, 4, 1, 2, &[]),
        ];
        let profile = Profile::from_records(&records);

        assert_eq!(profile.total_samples, 7);
        assert_eq!(profile.threads[&InternalId(1)].samples, 7);
        assert_eq!(
            profile.folded(),
            vec![("Main".to_string(), 4), ("Main;Work".to_string(), 3)]
        );
        assert_eq!(profile.top_functions(1), vec![("Main".to_string(), 4)]);
    }

    #[test]
    fn test_zero_count_samples_only_move_the_stack() {
        let records = vec![
            stack_sample(1, 0, 0, 0, &[5]),
            stack_sample(1, 1, 1, 1, &[6]),
        ];
        let profile = Profile::from_records(&records);
        assert_eq!(profile.total_samples, 1);
        assert_eq!(profile.folded(), vec![("func_0x00000005;func_0x00000006".to_string(), 1)]);
    }

    #[test]
    fn test_replay_errors_are_counted() {
        let records = vec![stack_sample(1, 1, 0, 3, &[1])];
        let profile = Profile::from_records(&records);
        assert_eq!(profile.replay_errors, 1);
        assert_eq!(profile.total_samples, 0);
    }

    #[test]
    fn test_allocations_and_cpu() {
        let records = vec![
            Record::AllocSample(AllocSample {
                thread: InternalId(1),
                ticks: 0,
                entries: vec![
                    AllocEntry {
                        class: InternalId(9),
                        count: 2,
                        bytes: 64,
                        ip: 0,
                    },
                    AllocEntry {
                        class: InternalId(9),
                        count: 1,
                        bytes: 32,
                        ip: 0x10,
                    },
                ],
            }),
            Record::ThreadCpu {
                iid: InternalId(1),
                ticks: 10,
                user_us: 150,
            },
            Record::ProcessCpu {
                ticks: 10,
                user_us: 400,
            },
        ];
        let profile = Profile::from_records(&records);
        assert_eq!(
            profile.allocations[&InternalId(9)],
            AllocTotals { count: 3, bytes: 96 }
        );
        assert_eq!(profile.threads[&InternalId(1)].cpu_us, 150);
        assert_eq!(profile.process_cpu_us, 400);
        assert_eq!(profile.class_name(InternalId(9)), "class_0x00000009");
    }
}
