//! Utility functions for identifiers and content digests

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::EscrowError;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, EscrowError> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| EscrowError::Identifier(e.to_string()))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| EscrowError::Identifier(e.to_string()))?;
    Ok(encode)
}

/// sha256 over the CBOR encoding of `value`, hex encoded.
pub fn digest<T: minicbor::Encode<()>>(value: &T) -> Result<String, EscrowError> {
    let cbor = minicbor::to_vec(value)?;
    Ok(sha256::digest(&cbor))
}
