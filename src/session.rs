use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque ownership token generated once per record open.
///
/// Two handles racing on the same key carry distinct session ids; the
/// transaction executor uses the id plus its start timestamp to decide
/// which handle may keep writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock timestamp in UTC milliseconds, used for session arbitration.
pub fn session_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
