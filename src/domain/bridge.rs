//! Metadata handed to external adapters so they can see the last answer.

use num_bigint::BigInt;
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("latest answer {0} does not fit in a JSON number")]
    OutOfRange(BigInt),
}

/// Last observed answer and when it was recorded (unix seconds)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeMetaData {
    pub latest_answer: Option<BigInt>,
    pub updated_at: Option<i64>,
}

impl BridgeMetaData {
    /// Render as a JSON object with `latestAnswer` and `updatedAt` keys
    pub fn to_json(&self) -> Result<Value, MetadataError> {
        let latest_answer = match &self.latest_answer {
            Some(answer) => big_int_to_json(answer)?,
            None => Value::Null,
        };
        let updated_at = self
            .updated_at
            .map(|ts| Value::Number(ts.into()))
            .unwrap_or(Value::Null);

        let mut map = Map::new();
        map.insert("latestAnswer".to_string(), latest_answer);
        map.insert("updatedAt".to_string(), updated_at);
        Ok(Value::Object(map))
    }
}

/// Marshal the cached answer into run metadata
pub fn marshal_bridge_metadata(
    latest_answer: Option<BigInt>,
    updated_at: Option<i64>,
) -> Result<Value, MetadataError> {
    BridgeMetaData {
        latest_answer,
        updated_at,
    }
    .to_json()
}

fn big_int_to_json(value: &BigInt) -> Result<Value, MetadataError> {
    if let Ok(n) = i64::try_from(value) {
        return Ok(Value::Number(Number::from(n)));
    }
    if let Ok(n) = u64::try_from(value) {
        return Ok(Value::Number(Number::from(n)));
    }
    Err(MetadataError::OutOfRange(value.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_marshal_empty() {
        let md = marshal_bridge_metadata(None, None).unwrap();
        assert_eq!(md, json!({"latestAnswer": null, "updatedAt": null}));
    }

    #[test]
    fn test_marshal_answer() {
        let md = marshal_bridge_metadata(Some(BigInt::from(123)), Some(1_700_000_000)).unwrap();
        assert_eq!(md, json!({"latestAnswer": 123, "updatedAt": 1_700_000_000i64}));
    }

    #[test]
    fn test_marshal_unsigned_range() {
        let md = marshal_bridge_metadata(Some(BigInt::from(u64::MAX)), Some(1)).unwrap();
        assert_eq!(md["latestAnswer"], json!(u64::MAX));
    }

    #[test]
    fn test_marshal_out_of_range() {
        let huge = BigInt::from(u64::MAX) * 10;
        let err = marshal_bridge_metadata(Some(huge), Some(1)).unwrap_err();
        assert!(matches!(err, MetadataError::OutOfRange(_)));
    }
}
