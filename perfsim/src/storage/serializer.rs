//! JSON encoding for stored entries and typed values.

use crate::storage::entry::StorageEntry;
use crate::storage::error::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// JSON serializer shared by the typed storage helpers and the file backend.
///
/// Values travel through the store as [`serde_json::Value`] so any backend
/// can hold them; this type converts between typed records, values and the
/// on-disk byte form.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Create a new JSON serializer.
    pub fn new() -> Self {
        Self
    }

    /// Convert a typed record into a storable value.
    pub fn to_value<T: Serialize + ?Sized>(&self, record: &T) -> Result<Value, StorageError> {
        Ok(serde_json::to_value(record)?)
    }

    /// Convert a stored value back into a typed record.
    pub fn from_value<T: DeserializeOwned>(
        &self,
        key: &str,
        value: Value,
    ) -> Result<T, StorageError> {
        serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Encode a full entry (value plus expiry) to bytes.
    pub fn encode_entry(&self, entry: &StorageEntry) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(entry)?)
    }

    /// Decode a full entry from bytes.
    pub fn decode_entry(&self, key: &str, data: &[u8]) -> Result<StorageEntry, StorageError> {
        serde_json::from_slice(data).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        hits: u32,
        name: String,
    }

    #[test]
    fn test_typed_value_conversion() {
        let serializer = JsonSerializer::new();
        let original = Counter {
            hits: 42,
            name: "probe".to_string(),
        };

        let value = serializer.to_value(&original).unwrap();
        assert_eq!(value["hits"], 42);

        let decoded: Counter = serializer.from_value("counter", value).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_invalid_entry_bytes_are_corrupt() {
        let serializer = JsonSerializer::new();
        let result = serializer.decode_entry("broken", b"not valid json");

        assert!(matches!(
            result.unwrap_err(),
            StorageError::Corrupt { key, .. } if key == "broken"
        ));
    }

    #[test]
    fn test_mismatched_shape_is_corrupt() {
        let serializer = JsonSerializer::new();
        let result: Result<Counter, _> =
            serializer.from_value("counter", serde_json::json!({"hits": "many"}));
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }
}
