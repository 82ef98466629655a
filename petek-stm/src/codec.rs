//! Value codec.
//!
//! Ref and atom payloads cross the coordinator as self-describing JSON
//! bytes via serde. Any `Serialize + DeserializeOwned` type round-trips;
//! byte payloads are compared for equality during commit validation, so
//! the codec must be deterministic for a given value (serde_json is:
//! struct fields serialize in declaration order).

use crate::errors::StmError;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StmError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StmError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_identity() {
        let v = vec![(1u32, "a".to_string()), (2, "b".to_string())];
        let bytes = encode(&v).unwrap();
        let back: Vec<(u32, String)> = decode(&bytes).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn equal_values_encode_equal_bytes() {
        #[derive(serde::Serialize)]
        struct Pair {
            a: i64,
            b: String,
        }
        let x = Pair { a: 9, b: "z".into() };
        let y = Pair { a: 9, b: "z".into() };
        assert_eq!(encode(&x).unwrap(), encode(&y).unwrap());
    }
}
