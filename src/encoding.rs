//! Serde helpers for byte fields
//!
//! JSON documents (frames, snapshots, the store index) carry raw bytes as
//! lowercase hex strings rather than arrays of numbers.

/// `Vec<u8>` as a hex string
pub mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// `Option<Vec<u8>>` as a hex string or `null`
pub mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| hex::decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Fixed-size byte arrays as a hex string of exactly `2 * N` characters
pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| {
            serde::de::Error::invalid_length(len, &format!("{} bytes", N).as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::hex_vec")]
        body: Vec<u8>,
        #[serde(with = "super::hex_opt")]
        maybe: Option<Vec<u8>>,
        #[serde(with = "super::hex_array")]
        fixed: [u8; 4],
    }

    #[test]
    fn test_hex_fields() {
        let sample = Sample {
            body: vec![0xde, 0xad],
            maybe: None,
            fixed: [1, 2, 3, 4],
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(json, r#"{"body":"dead","maybe":null,"fixed":"01020304"}"#);
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_wrong_array_length_rejected() {
        let json = r#"{"body":"","maybe":"ff","fixed":"010203"}"#;
        assert!(serde_json::from_str::<Sample>(json).is_err());
    }
}
