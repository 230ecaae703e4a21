use anyhow::{anyhow, Result};
use ciborium::Value;

/// Encode a CBOR value into a fresh buffer.
///
/// `ciborium` emits shortest-form integer and length encodings and
/// preserves map entry order, so callers that assemble maps with keys in
/// ascending order get canonical CTAP2 output.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| anyhow!("Failed to encode CBOR: {}", e))?;
    Ok(out)
}

/// Decode a single CBOR item from a byte slice.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    ciborium::from_reader(bytes).map_err(|e| anyhow!("Failed to parse CBOR: {}", e))
}

pub fn int(value: i64) -> Value {
    Value::Integer(value.into())
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

pub fn bytes(value: &[u8]) -> Value {
    Value::Bytes(value.to_vec())
}

pub fn as_text(value: &Value) -> Option<&str> {
    match value {
        Value::Text(s) => Some(s.as_str()),
        _ => None,
    }
}

pub fn as_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Bytes(b) => Some(b.as_slice()),
        _ => None,
    }
}

pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => {
            let val: i128 = (*i).into();
            if (0..=u64::MAX as i128).contains(&val) {
                Some(val as u64)
            } else {
                None
            }
        }
        _ => None,
    }
}

pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => {
            let val: i128 = (*i).into();
            if (i64::MIN as i128..=i64::MAX as i128).contains(&val) {
                Some(val as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

pub fn as_array(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array(a) => Some(a.as_slice()),
        _ => None,
    }
}

pub fn as_map(value: &Value) -> Option<&[(Value, Value)]> {
    match value {
        Value::Map(m) => Some(m.as_slice()),
        _ => None,
    }
}

/// Look up an integer key in a decoded map. Requests carry forward-
/// compatible maps, so absent and unknown keys are simply not found.
pub fn map_get_int<'a>(map: &'a [(Value, Value)], key: i64) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| as_i64(k) == Some(key))
        .map(|(_, v)| v)
}

/// Look up a text key in a decoded map.
pub fn map_get_text<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| as_text(k) == Some(key))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_round_trip() {
        for v in [0i64, 1, 23, 24, 255, 256, 65535, 65536, 1200, -1, -7, -256, -257] {
            let encoded = encode(&int(v)).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(as_i64(&decoded), Some(v), "round trip failed for {}", v);
        }
    }

    #[test]
    fn test_shortest_form_integers() {
        assert_eq!(encode(&int(1)).unwrap(), vec![0x01]);
        assert_eq!(encode(&int(23)).unwrap(), vec![0x17]);
        assert_eq!(encode(&int(24)).unwrap(), vec![0x18, 0x18]);
        assert_eq!(encode(&int(1200)).unwrap(), vec![0x19, 0x04, 0xB0]);
        assert_eq!(encode(&int(-7)).unwrap(), vec![0x26]);
    }

    #[test]
    fn test_text_and_bytes_round_trip() {
        let encoded = encode(&text("FIDO_2_0")).unwrap();
        assert_eq!(encoded[0], 0x68); // text of length 8
        assert_eq!(as_text(&decode(&encoded).unwrap()), Some("FIDO_2_0"));

        let payload = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let encoded = encode(&bytes(&payload)).unwrap();
        assert_eq!(as_bytes(&decode(&encoded).unwrap()), Some(&payload[..]));
    }

    #[test]
    fn test_map_preserves_entry_order() {
        let map = Value::Map(vec![
            (int(1), text("a")),
            (int(2), text("b")),
            (int(3), text("c")),
        ]);
        let encoded = encode(&map).unwrap();
        assert_eq!(encoded[0], 0xA3); // map of 3 entries
        assert_eq!(encoded[1], 0x01);
        let decoded = decode(&encoded).unwrap();
        let entries = as_map(&decoded).unwrap();
        let keys: Vec<i64> = entries.iter().filter_map(|(k, _)| as_i64(k)).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_map_lookup() {
        let map = vec![
            (int(1), text("first")),
            (int(-2), bytes(&[0x01])),
            (text("up"), Value::Bool(true)),
        ];
        assert_eq!(map_get_int(&map, 1).and_then(as_text), Some("first"));
        assert_eq!(map_get_int(&map, -2).and_then(as_bytes), Some(&[0x01][..]));
        assert_eq!(map_get_text(&map, "up").and_then(as_bool), Some(true));
        assert!(map_get_int(&map, 9).is_none());
        assert!(map_get_text(&map, "rk").is_none());
    }

    #[test]
    fn test_nested_containers_round_trip() {
        let value = Value::Map(vec![
            (int(1), Value::Array(vec![text("FIDO_2_0"), text("U2F_V2")])),
            (int(2), Value::Map(vec![(text("up"), Value::Bool(true))])),
            (int(3), Value::Null),
        ]);
        let encoded = encode(&value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
        // re-encoding the decoded value reproduces the original bytes
        assert_eq!(encode(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_truncated_input_fails() {
        let encoded = encode(&bytes(&[0u8; 16])).unwrap();
        assert!(decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_typed_accessor_mismatch() {
        assert!(as_text(&int(1)).is_none());
        assert!(as_bytes(&text("x")).is_none());
        assert!(as_u64(&int(-1)).is_none());
        assert!(as_bool(&Value::Null).is_none());
    }
}
