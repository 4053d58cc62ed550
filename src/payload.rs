//! # Snapshot Payload
//!
//! Decodes the raw payload of a discovery snapshot into candidate device specs,
//! and encodes candidates back into a payload for submission.

use crate::model::DeviceSpec;
use thiserror::Error;

/// The payload could not be decoded into a list of device candidates.
#[derive(Debug, Error)]
#[error("failed to parse rawData: {source}")]
pub struct PayloadError {
    #[from]
    source: serde_json::Error,
}

/// Decode a raw payload into candidates, preserving input order.
///
/// Only the structure is checked here. A candidate without a usable primary key
/// still decodes; the merge pass rejects it on its own.
pub fn parse_payload(raw: &[u8]) -> Result<Vec<DeviceSpec>, PayloadError> {
    let candidates: Vec<DeviceSpec> = serde_json::from_slice(raw)?;
    Ok(candidates.into_iter().map(DeviceSpec::normalized).collect())
}

/// Encode candidates as a snapshot payload.
pub fn encode_payload(candidates: &[DeviceSpec]) -> Result<String, PayloadError> {
    Ok(serde_json::to_string(candidates)?)
}
