//! Serialization protocol for snapshot payloads

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol for encoding and decoding snapshot data
///
/// Stores go through a serializer rather than calling serde directly so the
/// encoding can be swapped (JSON for inspectability, bincode for density)
/// without touching store implementations.
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// JSON-based serializer (default)
///
/// Self-describing and human-inspectable on disk; the right choice for
/// snapshots, whose step payloads are arbitrary JSON values.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Binary serializer using bincode
///
/// Compact, but not self-describing: suitable for payload types with fixed
/// shapes, not for free-form JSON values.
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{RunSnapshot, RunStatus};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Marker {
        run: String,
        step: u32,
    }

    #[test]
    fn test_json_serializer_round_trip() {
        let serializer = JsonSerializer::new();
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot.status = RunStatus::Running;

        let bytes = serializer.dumps(&snapshot).unwrap();
        let restored: RunSnapshot = serializer.loads(&bytes).unwrap();

        assert_eq!(restored.run_id, "run-1");
        assert_eq!(restored.status, RunStatus::Running);
    }

    #[test]
    fn test_bincode_serializer_round_trip() {
        let serializer = BincodeSerializer::new();
        let marker = Marker {
            run: "run-1".to_string(),
            step: 4,
        };

        let bytes = serializer.dumps(&marker).unwrap();
        let restored: Marker = serializer.loads(&bytes).unwrap();

        assert_eq!(marker, restored);
    }

    #[test]
    fn test_json_rejects_garbage() {
        let serializer = JsonSerializer::new();
        let result: Result<RunSnapshot> = serializer.loads(b"not json");
        assert!(result.is_err());
    }
}
