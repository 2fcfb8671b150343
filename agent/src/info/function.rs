use super::{MappedInfo, UNKNOWN_NAME};
use crate::host::{FunctionDetails, HostResult, RuntimeInfo};
use rtprof_shared::{FunctionCode, FunctionId, InternalId, Record};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// A runtime function as seen by the agent
#[derive(Debug)]
pub struct FunctionInfo {
    pub id: FunctionId,
    pub iid: InternalId,
    details: OnceLock<FunctionDetails>,
    name_printed: AtomicBool,
}

impl FunctionInfo {
    /// Fetch metadata and code layout once; failures leave an unnamed entry
    pub fn initialize(&self, host: &dyn RuntimeInfo) -> HostResult<&FunctionDetails> {
        if let Some(details) = self.details.get() {
            return Ok(details);
        }
        match host.function_info(self.id) {
            Ok(details) => Ok(self.details.get_or_init(|| details)),
            Err(e) => {
                self.details.get_or_init(|| FunctionDetails {
                    full_name: UNKNOWN_NAME.to_string(),
                    ..FunctionDetails::default()
                });
                Err(e)
            }
        }
    }

    /// Name an entry that has no runtime counterpart
    pub fn set_pseudo_name(&self, name: &str) {
        self.details.get_or_init(|| FunctionDetails {
            full_name: name.to_string(),
            ..FunctionDetails::default()
        });
    }

    pub fn details(&self) -> Option<&FunctionDetails> {
        self.details.get()
    }

    pub fn full_name(&self) -> &str {
        self.details
            .get()
            .map(|d| d.full_name.as_str())
            .unwrap_or(UNKNOWN_NAME)
    }

    /// Identity and code layout for the compilation records
    pub fn code(&self) -> FunctionCode {
        let details = self.details.get();
        FunctionCode {
            id: self.id,
            iid: self.iid,
            class: details.map_or(0, |d| d.class),
            module: details.map_or(0, |d| d.module),
            token: details.map_or(0, |d| d.token),
            code_ranges: details.map(|d| d.code_ranges.clone()).unwrap_or_default(),
            il_map: details.map(|d| d.il_map.clone()).unwrap_or_default(),
        }
    }

    /// The `fun nam` record of this function
    pub fn name_record(&self) -> Record {
        let details = self.details.get();
        Record::FunctionName {
            iid: self.iid,
            full_name: self.full_name().to_string(),
            return_type: details.map(|d| d.return_type.clone()).unwrap_or_default(),
            signature: details.map(|d| d.signature.clone()).unwrap_or_default(),
        }
    }

    /// `true` exactly once: when the caller should write the name record
    pub fn claim_name_print(&self) -> bool {
        !self.name_printed.swap(true, Ordering::AcqRel)
    }
}

impl MappedInfo for FunctionInfo {
    type Id = FunctionId;

    fn create(id: FunctionId, iid: InternalId) -> Self {
        Self {
            id,
            iid,
            details: OnceLock::new(),
            name_printed: AtomicBool::new(false),
        }
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn iid(&self) -> InternalId {
        self.iid
    }
}
