use super::{MappedInfo, UNKNOWN_NAME};
use crate::host::{ClassDetails, HostResult, RuntimeInfo};
use rtprof_shared::{ClassId, InternalId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// A runtime class as seen by the agent
#[derive(Debug)]
pub struct ClassInfo {
    pub id: ClassId,
    pub iid: InternalId,
    details: OnceLock<ClassDetails>,
    name_printed: AtomicBool,
}

impl ClassInfo {
    /// Fetch the class metadata once
    ///
    /// A failed query is remembered as an unnamed class so the error is only
    /// reported the first time.
    pub fn initialize(&self, host: &dyn RuntimeInfo) -> HostResult<&ClassDetails> {
        if let Some(details) = self.details.get() {
            return Ok(details);
        }
        match host.class_info(self.id) {
            Ok(details) => Ok(self.details.get_or_init(|| details)),
            Err(e) => {
                self.details.get_or_init(|| ClassDetails {
                    name: UNKNOWN_NAME.to_string(),
                    ..ClassDetails::default()
                });
                Err(e)
            }
        }
    }

    pub fn details(&self) -> Option<&ClassDetails> {
        self.details.get()
    }

    pub fn name(&self) -> &str {
        self.details
            .get()
            .map(|d| d.name.as_str())
            .unwrap_or(UNKNOWN_NAME)
    }

    /// `true` exactly once: when the caller should write the name record
    pub fn claim_name_print(&self) -> bool {
        !self.name_printed.swap(true, Ordering::AcqRel)
    }
}

impl MappedInfo for ClassInfo {
    type Id = ClassId;

    fn create(id: ClassId, iid: InternalId) -> Self {
        Self {
            id,
            iid,
            details: OnceLock::new(),
            name_printed: AtomicBool::new(false),
        }
    }

    fn id(&self) -> ClassId {
        self.id
    }

    fn iid(&self) -> InternalId {
        self.iid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostError, Status};
    use rtprof_shared::ThreadId;
    use std::sync::atomic::AtomicUsize;

    struct Host {
        calls: AtomicUsize,
        fail: bool,
    }

    impl RuntimeInfo for Host {
        fn current_thread_id(&self) -> HostResult<ThreadId> {
            Ok(1)
        }

        fn class_info(&self, id: ClassId) -> HostResult<ClassDetails> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HostError::Failed(Status::E_FAIL));
            }
            Ok(ClassDetails {
                module: 0x10,
                token: 0x0200_0001,
                name: format!("Class{}", id),
            })
        }
    }

    #[test]
    fn test_initialize_once() {
        let host = Host {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let class = ClassInfo::create(5, InternalId(0));
        assert_eq!(class.name(), UNKNOWN_NAME);
        assert_eq!(class.initialize(&host).unwrap().name, "Class5");
        assert_eq!(class.initialize(&host).unwrap().token, 0x0200_0001);
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        assert_eq!(class.name(), "Class5");
    }

    #[test]
    fn test_failed_initialize_is_remembered() {
        let host = Host {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let class = ClassInfo::create(5, InternalId(0));
        assert!(class.initialize(&host).is_err());
        assert!(class.initialize(&host).is_ok());
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        assert_eq!(class.name(), UNKNOWN_NAME);
    }

    #[test]
    fn test_name_printed_once() {
        let class = ClassInfo::create(1, InternalId(0));
        assert!(class.claim_name_print());
        assert!(!class.claim_name_print());
    }
}
