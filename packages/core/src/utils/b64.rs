// Base64 утилиты

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Deserializer};

pub fn encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    general_purpose::STANDARD.decode(text.trim())
}

/// serde: необязательное base64-поле; пустая строка и null дают None
pub fn deserialize_optional<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(text) if !text.trim().is_empty() => decode(&text).map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// data: URL для локального превью вложения, которое ещё не загружено
pub fn data_url(content_type: &str, data: &[u8]) -> String {
    let content_type = if content_type.is_empty() {
        "application/octet-stream"
    } else {
        content_type
    };
    format!("data:{};base64,{}", content_type, encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url() {
        assert_eq!(data_url("image/png", b"hi"), "data:image/png;base64,aGk=");
        assert!(data_url("", b"x").starts_with("data:application/octet-stream;base64,"));
    }

    #[test]
    fn test_decode_roundtrips_encode() {
        assert_eq!(decode(&encode(b"chat")).unwrap(), b"chat".to_vec());
        assert!(decode("not base64!").is_err());
    }
}
