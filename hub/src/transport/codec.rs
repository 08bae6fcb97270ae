//! CBOR encode/decode helpers shared by both transports (spec §6).

use ciborium::{de::from_reader, ser::into_writer};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TransportError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    into_writer(value, &mut buf).map_err(|e| TransportError::Protocol(e.to_string()))?;
    Ok(buf)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    from_reader(bytes).map_err(|e| TransportError::Protocol(e.to_string()))
}
