//! Opaque pagination cursors.
//!
//! A cursor is a single-letter direction prefix (`F` forward, `B`
//! backward) followed by the URL-safe, unpadded base-64 of a job id's
//! twelve raw bytes. The encoding is deliberately opaque to callers:
//! clients hand cursors back verbatim and never parse them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use mongodb::bson::oid::ObjectId;

use crate::error::Error;

/// Which side of the anchor a page continues on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Jobs strictly after the anchor in `(created_at, id)` order.
    Forward,
    /// Jobs strictly before the anchor.
    Backward,
}

/// A decoded pagination cursor: an anchor job id plus a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub id: ObjectId,
    pub direction: Direction,
}

impl Cursor {
    pub fn new(id: ObjectId, direction: Direction) -> Self {
        Self { id, direction }
    }

    /// Encode into the opaque wire form. Round-trip with [`Cursor::decode`]
    /// is lossless.
    pub fn encode(&self) -> String {
        let prefix = match self.direction {
            Direction::Forward => 'F',
            Direction::Backward => 'B',
        };
        format!("{prefix}{}", URL_SAFE_NO_PAD.encode(self.id.bytes()))
    }

    /// Decode the opaque wire form.
    ///
    /// Fails with [`Error::InvalidCursor`] on empty input, an unknown
    /// prefix, malformed base-64, or a payload that is not exactly twelve
    /// bytes.
    pub fn decode(input: &str) -> Result<Self, Error> {
        let mut chars = input.chars();
        let direction = match chars.next() {
            Some('F') => Direction::Forward,
            Some('B') => Direction::Backward,
            Some(other) => {
                return Err(Error::InvalidCursor {
                    reason: format!("unknown prefix {other:?}"),
                })
            }
            None => {
                return Err(Error::InvalidCursor {
                    reason: "empty cursor".to_string(),
                })
            }
        };

        let raw = URL_SAFE_NO_PAD
            .decode(chars.as_str())
            .map_err(|_| Error::InvalidCursor {
                reason: "malformed base64 payload".to_string(),
            })?;
        let bytes: [u8; 12] = raw.as_slice().try_into().map_err(|_| Error::InvalidCursor {
            reason: format!("expected 12 id bytes, got {}", raw.len()),
        })?;

        Ok(Self {
            id: ObjectId::from_bytes(bytes),
            direction,
        })
    }
}
