//! Wire codec for marker events.
//!
//! Payloads are UTF-8 JSON objects:
//!
//! ```json
//! {"address":"Main St","latitude":1.0,"longitude":2.0,"type":1,"approveCount":0}
//! ```
//!
//! Unknown fields are ignored and a missing `approveCount` defaults to 0, so
//! publishers may add fields without breaking older clients.

use crate::marker::Marker;

/// Why an inbound payload could not be turned into a [`Marker`].
///
/// Always recoverable: the event is dropped and the sync path keeps going.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("malformed marker payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("coordinates out of range: latitude={latitude}, longitude={longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
}

/// Encode a marker into its canonical wire form.
pub fn encode(marker: &Marker) -> Vec<u8> {
    // Strings, finite or non-finite floats and integers all have a JSON form.
    serde_json::to_vec(marker).expect("marker always serializes to JSON")
}

/// Decode a wire payload. Rejects anything that is not a complete, in-range
/// marker record.
pub fn decode(payload: &[u8]) -> Result<Marker, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let marker: Marker = serde_json::from_str(text)?;
    if !marker.has_valid_coordinates() {
        return Err(DecodeError::InvalidCoordinate {
            latitude: marker.latitude,
            longitude: marker.longitude,
        });
    }
    Ok(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MarkerType;

    #[test]
    fn encode_uses_wire_field_names() {
        let m = Marker::new("Main St", 1.0, 2.0, MarkerType::Hazard).with_approve_count(3);
        let value: serde_json::Value = serde_json::from_slice(&encode(&m)).unwrap();

        assert_eq!(value["address"], "Main St");
        assert_eq!(value["latitude"], 1.0);
        assert_eq!(value["longitude"], 2.0);
        assert_eq!(value["type"], 1);
        assert_eq!(value["approveCount"], 3);
    }

    #[test]
    fn encode_never_yields_empty_payload() {
        let odd = Marker::new("", f64::NAN, f64::INFINITY, MarkerType::Unknown(i64::MIN))
            .with_approve_count(u64::MAX);
        let bytes = encode(&odd);
        assert!(!bytes.is_empty());
        // Non-finite coordinates serialize as null and are rejected on the way in.
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn decode_reverses_encode() {
        let markers = [
            Marker::new("Main St", 1.0, 2.0, MarkerType::Hazard),
            Marker::new("Gangnam-daero 1", 37.4979, 127.0276, MarkerType::Construction)
                .with_approve_count(41),
            Marker::new("", -89.999_999, -179.5, MarkerType::Unknown(17)).with_approve_count(1),
        ];
        for m in markers {
            assert_eq!(decode(&encode(&m)).unwrap(), m);
        }
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let payload = br#"{"address":"A","latitude":1.5,"longitude":2.5,"type":0,"approveCount":2,"reporter":"dev_a","v":2}"#;
        let m = decode(payload).unwrap();
        assert_eq!(m.address, "A");
        assert_eq!(m.kind, MarkerType::Safe);
        assert_eq!(m.approve_count, 2);
    }

    #[test]
    fn decode_defaults_missing_approve_count() {
        let payload = br#"{"address":"A","latitude":1.5,"longitude":2.5,"type":2}"#;
        assert_eq!(decode(payload).unwrap().approve_count, 0);
    }

    #[test]
    fn decode_keeps_unknown_type_code() {
        let payload = br#"{"address":"A","latitude":0,"longitude":0,"type":99,"approveCount":0}"#;
        assert_eq!(decode(payload).unwrap().kind, MarkerType::Unknown(99));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let full = encode(&Marker::new("Main St", 1.0, 2.0, MarkerType::Hazard));
        for cut in [0, 1, full.len() / 2, full.len() - 1] {
            assert!(
                matches!(decode(&full[..cut]), Err(DecodeError::Malformed(_))),
                "truncated at {cut} should be malformed"
            );
        }
    }

    #[test]
    fn decode_rejects_missing_required_fields() {
        let no_address = br#"{"latitude":1.0,"longitude":2.0,"type":1}"#;
        let no_type = br#"{"address":"A","latitude":1.0,"longitude":2.0}"#;
        let no_latitude = br#"{"address":"A","longitude":2.0,"type":1}"#;

        assert!(matches!(decode(no_address), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(no_type), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(no_latitude), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_wrong_shapes() {
        assert!(decode(b"not json {{{").is_err());
        assert!(decode(b"[1,2,3]").is_err());
        assert!(decode(br#"{"address":"A","latitude":"north","longitude":2.0,"type":1}"#).is_err());
        assert!(decode(br#"{"address":"A","latitude":1.0,"longitude":2.0,"type":1.5}"#).is_err());
        assert!(
            decode(br#"{"address":"A","latitude":1.0,"longitude":2.0,"type":1,"approveCount":-1}"#)
                .is_err()
        );
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        assert!(matches!(
            decode(&[0x7b, 0xff, 0xfe, 0x7d]),
            Err(DecodeError::NotUtf8(_))
        ));
    }

    #[test]
    fn decode_rejects_out_of_range_coordinates() {
        let payload = br#"{"address":"A","latitude":123.0,"longitude":2.0,"type":1}"#;
        assert!(matches!(
            decode(payload),
            Err(DecodeError::InvalidCoordinate { .. })
        ));
    }
}
