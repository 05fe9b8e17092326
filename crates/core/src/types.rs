//! Shared vocabulary types.

use serde::{Deserialize, Serialize};

/// Strength of an element cache key.
///
/// Strong keys include the transitive content of build dependencies; weak keys
/// include only their names. Both strengths of the same element always map to
/// the same artifact and are pinned and evicted together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStrength {
    Strong,
    Weak,
}

impl KeyStrength {
    /// Both strengths, in the order they are locked and linked.
    pub const ALL: [KeyStrength; 2] = [KeyStrength::Strong, KeyStrength::Weak];
}
