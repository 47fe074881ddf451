use procmon_probe_abi::MAX_STACK_FRAMES;
use serde_derive::{Deserialize, Serialize};

/// The user-mode instruction pointers captured with an event.
///
/// Symbolization is deliberately not done here; the stack is carried as
/// raw addresses until a detail view asks a symbolizer to resolve them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    pub user_ips: Vec<u64>,
}

impl StackTrace {
    pub fn from_raw(ips: &[u64; MAX_STACK_FRAMES], count: u64) -> Self {
        let count = (count as usize).min(MAX_STACK_FRAMES);
        StackTrace {
            user_ips: ips[..count].to_vec(),
        }
    }

    /// Serialized form stored in the snapshot's `stacktrace` column.
    pub fn serialize(&self) -> String {
        serde_json::to_string(&self.user_ips).unwrap_or_else(|_| "[]".to_string())
    }

    /// Inverse of [`serialize`]. Unparseable input yields an empty stack;
    /// a damaged snapshot should not take the whole row with it.
    pub fn inflate(serialized: &str) -> Self {
        StackTrace {
            user_ips: serde_json::from_str(serialized).unwrap_or_default(),
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = String> + '_ {
        self.user_ips.iter().map(|ip| format!("0x{ip:016x}"))
    }

    pub fn is_empty(&self) -> bool {
        self.user_ips.is_empty()
    }
}
