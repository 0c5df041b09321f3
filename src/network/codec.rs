//! Every byte that crosses the wire or lands in a snapshot slot goes through this module, so the
//! bincode configuration lives in exactly one place.
//!
//! Datagrams get one extra layer: [`encode_datagram`] appends an 8 byte little-endian FNV-1a
//! checksum of the body, and [`decode_datagram`] refuses anything whose checksum does not match.
//! A corrupted datagram is therefore indistinguishable from a lost one, and the reliable channel
//! recovers from it the same way.
//!
//! # Examples
//!
//! ```
//! use netplay_rollback::network::codec::{decode, encode, encode_into};
//!
//! let bytes = encode(&42u32).expect("encoding should succeed");
//! let (decoded, _bytes_read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(decoded, 42);
//!
//! let mut buffer = [0u8; 16];
//! let len = encode_into(&42u32, &mut buffer).expect("encoding should succeed");
//! assert_eq!(len, 4);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::hash::fnv1a_bytes;
use crate::network::messages::{ChannelMessage, Datagram};

/// Length of the checksum trailer appended to every datagram.
pub const CHECKSUM_LEN: usize = 8;

// Fixed-size integers keep encoded sizes independent of the values, which keeps snapshot slot
// usage and fragment counts predictable.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a datagram for the wire.
    EncodeDatagram,
    /// Decoding a datagram from the wire.
    DecodeDatagram,
    /// Encoding into a caller-supplied buffer.
    EncodeIntoBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeDatagram => write!(f, "encoding datagram"),
            Self::DecodeDatagram => write!(f, "decoding datagram"),
            Self::EncodeIntoBuffer => write!(f, "encoding into buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors only expose a `Display` rendering, so their text is kept as a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The provided buffer was too small for encoding.
    BufferTooSmall {
        /// The required buffer size (0 if unknown).
        required: usize,
        /// The actual buffer size provided.
        provided: usize,
    },
    /// A value decoded cleanly but did not use all of the input.
    TrailingBytes {
        /// Bytes the decoder consumed.
        consumed: usize,
        /// Bytes that were supplied.
        total: usize,
    },
    /// The datagram checksum did not match its body.
    ChecksumMismatch {
        /// Checksum carried by the datagram.
        expected: u64,
        /// Checksum computed over the received body.
        actual: u64,
    },
    /// The datagram is too short to even hold a checksum.
    Truncated {
        /// Length of the received datagram.
        len: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    #[must_use]
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    #[must_use]
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::BufferTooSmall { required, provided } => {
                if *required > 0 {
                    write!(
                        f,
                        "buffer too small: needed {required} bytes, but only {provided} provided"
                    )
                } else {
                    write!(f, "buffer too small: only {provided} bytes provided")
                }
            },
            Self::TrailingBytes { consumed, total } => {
                write!(f, "decoded {consumed} of {total} bytes, trailing data left")
            },
            Self::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "checksum mismatch: datagram says {expected:#018x}, body hashes to {actual:#018x}"
                )
            },
            Self::Truncated { len } => {
                write!(f, "datagram of {len} bytes is shorter than its checksum")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value into an existing byte slice and returns the number of bytes written.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if the buffer is not large enough.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| match e {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall {
            required: 0,
            provided: buffer.len(),
        },
        other => CodecError::encode(other.to_string(), CodecOperation::EncodeIntoBuffer),
    })
}

/// Decodes a value from a byte slice, returning it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value that must occupy the whole slice.
///
/// # Errors
///
/// Returns [`CodecError::TrailingBytes`] if the value ends before the slice does.
pub fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let (value, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            total: bytes.len(),
        });
    }
    Ok(value)
}

/// Encodes a datagram and appends its checksum trailer.
pub fn encode_datagram<M: ChannelMessage>(datagram: &Datagram<M>) -> CodecResult<Vec<u8>> {
    let mut bytes = bincode::serde::encode_to_vec(datagram, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeDatagram))?;
    let checksum = fnv1a_bytes(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    Ok(bytes)
}

/// Verifies the checksum trailer and decodes the datagram in front of it.
///
/// # Errors
///
/// [`CodecError::Truncated`] or [`CodecError::ChecksumMismatch`] for damaged input, and the usual
/// decode errors if the body is not a datagram.
pub fn decode_datagram<M: ChannelMessage>(bytes: &[u8]) -> CodecResult<Datagram<M>> {
    let Some(body_len) = bytes.len().checked_sub(CHECKSUM_LEN) else {
        return Err(CodecError::Truncated { len: bytes.len() });
    };
    let (body, trailer) = bytes.split_at(body_len);
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(trailer);
    let expected = u64::from_le_bytes(expected);
    let actual = fnv1a_bytes(body);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    let (datagram, consumed) = bincode::serde::decode_from_slice(body, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeDatagram))?;
    if consumed != body.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            total: body.len(),
        });
    }
    Ok(datagram)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{NetplayMessage, PlayerInputs};
    use crate::test_config::miri_case_count;
    use crate::IndexedFrame;
    use proptest::prelude::*;

    fn inputs_datagram() -> Datagram {
        let mut inputs = PlayerInputs::new(IndexedFrame::new(3, 40));
        inputs.inputs[0] = 0x0010;
        Datagram::Unsequenced(NetplayMessage::PlayerInputs(inputs))
    }

    #[test]
    fn fixed_int_encoding_is_stable() {
        assert_eq!(encode(&0x0102_0304u32).unwrap(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn encode_into_reports_small_buffer() {
        let mut buffer = [0u8; 2];
        let err = encode_into(&7u64, &mut buffer).unwrap_err();
        assert_eq!(
            err,
            CodecError::BufferTooSmall {
                required: 0,
                provided: 2
            }
        );
    }

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let mut bytes = encode(&5u32).unwrap();
        bytes.push(0);
        assert_eq!(
            decode_exact::<u32>(&bytes).unwrap_err(),
            CodecError::TrailingBytes {
                consumed: 4,
                total: 5
            }
        );
    }

    #[test]
    fn datagram_survives_framing() {
        let datagram = inputs_datagram();
        let bytes = encode_datagram(&datagram).unwrap();
        let decoded: Datagram = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded, datagram);
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        assert_eq!(
            decode_datagram::<NetplayMessage>(&[1, 2, 3]).unwrap_err(),
            CodecError::Truncated { len: 3 }
        );
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let mut bytes = encode_datagram(&Datagram::<NetplayMessage>::Ack { sequence: 9 }).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(
            decode_datagram::<NetplayMessage>(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(miri_case_count()))]

        #[test]
        fn any_single_byte_corruption_is_detected(pos in 0usize..512, flip in 1u8..=255) {
            let bytes = encode_datagram(&inputs_datagram()).unwrap();
            let pos = pos % bytes.len();
            let mut damaged = bytes.clone();
            damaged[pos] ^= flip;
            prop_assert!(decode_datagram::<NetplayMessage>(&damaged).is_err());
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..300)) {
            let _ = decode_datagram::<NetplayMessage>(&bytes);
        }
    }
}
