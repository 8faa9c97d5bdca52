//! Serde helpers shared by the wire formats.

/// Serialize `Vec<u8>` as standard base64, the JSON stand-in for protocol `<data>` values.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Remove `null` members so absent optionals are omitted from wire objects.
pub fn strip_nulls(map: &mut serde_json::Map<String, serde_json::Value>) {
    map.retain(|_, v| !v.is_null());
}
