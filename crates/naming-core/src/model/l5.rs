//! Legacy L5 (cl5) routing tables.
//!
//! L5 records carry no string ID and no modify time. Each table is pulled
//! incrementally by a monotonically increasing flow number instead.

use serde::{Deserialize, Serialize};

/// Maps a caller IP and command to a set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L5Route {
    /// Caller IP, as a packed IPv4 address.
    pub ip: u32,
    /// Module ID.
    pub mod_id: u32,
    /// Command ID.
    pub cmd_id: u32,
    /// Set the route resolves to.
    pub set_id: String,
    /// `false` marks a deleted route.
    pub valid: bool,
    /// Write sequence number.
    pub flow: u32,
}

/// Division policy of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L5Policy {
    /// Module ID.
    pub mod_id: u32,
    /// Division divisor.
    pub div: u32,
    /// `false` marks a deleted policy.
    pub valid: bool,
    /// Write sequence number.
    pub flow: u32,
}

/// One section of a module's division space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L5Section {
    /// Module ID.
    pub mod_id: u32,
    /// Inclusive lower bound.
    pub from: u32,
    /// Inclusive upper bound.
    pub to: u32,
    /// Target xid.
    pub xid: u32,
    /// `false` marks a deleted section.
    pub valid: bool,
    /// Write sequence number.
    pub flow: u32,
}

/// Per-IP configuration flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L5IpConfig {
    /// Caller IP, as a packed IPv4 address.
    pub ip: u32,
    /// Configuration flag.
    pub flag: u32,
    /// `false` marks a deleted entry.
    pub valid: bool,
    /// Write sequence number.
    pub flow: u32,
}

/// Records that carry an L5 flow number.
pub trait L5Record: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Write sequence number.
    fn flow(&self) -> u32;

    /// Set the write sequence number. Stores call this on write.
    fn set_flow(&mut self, flow: u32);
}

macro_rules! impl_l5_record {
    ($($ty:ty),*) => {
        $(
            impl L5Record for $ty {
                fn flow(&self) -> u32 {
                    self.flow
                }

                fn set_flow(&mut self, flow: u32) {
                    self.flow = flow;
                }
            }
        )*
    };
}

impl_l5_record!(L5Route, L5Policy, L5Section, L5IpConfig);
