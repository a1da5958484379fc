//! Byte codecs for the credential record and persisted key entries.

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::creds::AuthCreds;
use crate::error::{Result, StoreError};

/// Serialises the credential bundle and opaque entry values to bytes.
pub trait Codec: Send + Sync {
    fn encode_creds(&self, creds: &AuthCreds) -> Result<Vec<u8>>;
    fn decode_creds(&self, bytes: &[u8]) -> Result<AuthCreds>;
    fn encode_entry(&self, value: &[u8]) -> Result<Vec<u8>>;
    fn decode_entry(&self, bytes: &[u8]) -> Result<Bytes>;
}

/// JSON codec. Binary fields are base64; entries are wrapped as
/// `{"type":"Buffer","data":"<base64>"}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

#[derive(Serialize, Deserialize)]
struct BufferJson {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

const BUFFER_TAG: &str = "Buffer";

impl Codec for JsonCodec {
    fn encode_creds(&self, creds: &AuthCreds) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(creds)?)
    }

    fn decode_creds(&self, bytes: &[u8]) -> Result<AuthCreds> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_entry(&self, value: &[u8]) -> Result<Vec<u8>> {
        let wrapped = BufferJson {
            kind: BUFFER_TAG.to_string(),
            data: general_purpose::STANDARD.encode(value),
        };
        Ok(serde_json::to_vec(&wrapped)?)
    }

    fn decode_entry(&self, bytes: &[u8]) -> Result<Bytes> {
        let wrapped: BufferJson = serde_json::from_slice(bytes)?;
        if wrapped.kind != BUFFER_TAG {
            return Err(StoreError::Codec(format!(
                "unexpected entry tag {:?}",
                wrapped.kind
            )));
        }
        Ok(Bytes::from(general_purpose::STANDARD.decode(wrapped.data)?))
    }
}

/// `#[serde(with = "b64")]` for byte vectors.
pub(crate) mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
