//! CBOR encoding of changesets.

use crate::changeset::Changeset;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding protocol values.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Value could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes were not a valid encoding.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Encodes a changeset to CBOR bytes.
pub fn encode_changeset(changeset: &Changeset) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(changeset, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a changeset from CBOR bytes.
pub fn decode_changeset(bytes: &[u8]) -> CodecResult<Changeset> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, ObjectChange, Version};

    #[test]
    fn changeset_survives_encoding() {
        let cs = Changeset::local(
            Version::new(9),
            vec![
                ObjectChange::put("AllTypes", "x", vec![0xA1, 0x00]),
                ObjectChange::delete("AllTypes", "y"),
            ],
        )
        .stamped_by(ClientId::generate())
        .integrated_at(Version::new(100));

        let bytes = encode_changeset(&cs).unwrap();
        assert_eq!(decode_changeset(&bytes).unwrap(), cs);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = decode_changeset(&[0xFF, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
