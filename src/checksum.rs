use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use serde_json::Value;

/// Dirty-detection checksum over a payload.
///
/// Hashes the MessagePack encoding of the value, so structurally equal
/// payloads always produce equal checksums. This is change detection for
/// the auto-save pass, not an integrity mechanism.
pub fn checksum(value: &Value) -> u64 {
    let bytes = match rmp_serde::to_vec(value) {
        Ok(bytes) => bytes,
        // Serialization of a serde_json::Value cannot fail in practice;
        // fall back to the display form rather than panic.
        Err(_) => value.to_string().into_bytes(),
    };
    let mut hasher = DefaultHasher::new();
    hasher.write(&bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_values_equal_checksums() {
        let a = json!({"coins": 5, "items": ["sword", "shield"]});
        let b = json!({"coins": 5, "items": ["sword", "shield"]});
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn changed_value_changes_checksum() {
        let a = json!({"coins": 5});
        let b = json!({"coins": 6});
        assert_ne!(checksum(&a), checksum(&b));
    }
}
