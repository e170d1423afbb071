//! Process and machine identity types.
//!
//! A [`MachineId`] uniquely identifies a machine instance across processes.
//! It consists of three components:
//!
//! - **process**: the GUID of the process that owns the instance
//! - **index**: the 1-based slot of the instance in its process table
//! - **name**: the name of the machine declaration it was created from
//!
//! The process GUID makes ids globally unambiguous: index 3 of one process
//! and index 3 of another are different machines. The name is carried for
//! display and diagnostics only; identity is `(process, index)`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A process GUID.
///
/// Four fixed-width fields, compared bitwise. The host chooses the values;
/// the runtime only ever compares and displays them.
///
/// # Examples
///
/// ```
/// use machina_core::ProcessGuid;
///
/// let a = ProcessGuid::new(1, 0, 0, 0);
/// let b = ProcessGuid::new(2, 0, 0, 0);
/// assert_ne!(a, b);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessGuid {
    /// First field.
    pub data1: u32,
    /// Second field.
    pub data2: u16,
    /// Third field.
    pub data3: u16,
    /// Fourth field.
    pub data4: u64,
}

impl ProcessGuid {
    /// Creates a GUID from its four fields.
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: u64) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }
}

impl fmt::Debug for ProcessGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:016x}",
            self.data1, self.data2, self.data3, self.data4
        )
    }
}

impl fmt::Display for ProcessGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The identity of a machine instance.
///
/// Machine-id values embed one of these. Equality and hashing consider only
/// `(process, index)`; the declaration name travels along for logs and
/// display.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineId {
    /// GUID of the owning process.
    pub process: ProcessGuid,
    /// 1-based index of the instance in the owning process's table.
    pub index: u32,
    /// Name of the machine declaration this instance was created from.
    pub name: String,
}

impl MachineId {
    /// Creates a machine id from its parts.
    pub fn new(process: ProcessGuid, index: u32, name: impl Into<String>) -> Self {
        Self {
            process,
            index,
            name: name.into(),
        }
    }
}

impl PartialEq for MachineId {
    fn eq(&self, other: &Self) -> bool {
        self.process == other.process && self.index == other.index
    }
}

impl Eq for MachineId {}

impl Hash for MachineId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.process.hash(state);
        self.index.hash(state);
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_equality() {
        let a = ProcessGuid::new(1, 2, 3, 4);
        let b = ProcessGuid::new(1, 2, 3, 4);
        let c = ProcessGuid::new(1, 2, 3, 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_machine_id_identity_ignores_name() {
        let guid = ProcessGuid::new(7, 0, 0, 0);
        let a = MachineId::new(guid, 1, "Client");
        let b = MachineId::new(guid, 1, "client-renamed");
        assert_eq!(a, b);
    }

    #[test]
    fn test_machine_id_distinct_process() {
        let a = MachineId::new(ProcessGuid::new(1, 0, 0, 0), 1, "M");
        let b = MachineId::new(ProcessGuid::new(2, 0, 0, 0), 1, "M");
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        let id = MachineId::new(ProcessGuid::new(1, 0, 0, 0), 3, "Server");
        assert_eq!(format!("{}", id), "Server(3)");
    }
}
