//! Inbound wire protocol of the live endpoint.
//!
//! Frames are big-endian, unlike the little-endian on-disk recording format;
//! the two encodings are independent and never mix.

use thiserror::Error;

pub const OP_PIXEL_UPDATE: u8 = 0xC1;

const PIXEL_UPDATE_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMessage {
    PixelUpdate(PixelUpdate),
}

/// One pixel changed: chunk coordinates plus a packed color/offset field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelUpdate {
    pub chunk_x: i16,
    pub chunk_y: i16,
    pub color_index: u8,
    pub offset_x: u8,
    pub offset_y: u8,
}

/// A frame the decoder does not understand. Never fatal: the read loop logs
/// it and moves on to the next frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("bad length {len} for opcode {opcode:#04x}")]
    BadLength { opcode: u8, len: usize },
}

pub fn decode(frame: &[u8]) -> Result<WireMessage, WireError> {
    let opcode = *frame.first().ok_or(WireError::Empty)?;
    match opcode {
        OP_PIXEL_UPDATE => {
            if frame.len() != PIXEL_UPDATE_LEN {
                return Err(WireError::BadLength {
                    opcode,
                    len: frame.len(),
                });
            }
            let chunk_x = i16::from_be_bytes([frame[1], frame[2]]);
            let chunk_y = i16::from_be_bytes([frame[3], frame[4]]);
            // low 4 bits color, then 6 bits x offset, then 6 bits y offset
            let mixed = u16::from_be_bytes([frame[5], frame[6]]);
            Ok(WireMessage::PixelUpdate(PixelUpdate {
                chunk_x,
                chunk_y,
                color_index: (mixed & 0x0F) as u8,
                offset_x: ((mixed >> 4) & 0x3F) as u8,
                offset_y: ((mixed >> 10) & 0x3F) as u8,
            }))
        }
        other => Err(WireError::UnknownOpcode(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_mixed_field_bits() {
        // mixed = 0x0005: color 5, offsets (0, 0)
        let update = match decode(&[0xC1, 0x00, 0x02, 0x00, 0x03, 0x00, 0x05]).unwrap() {
            WireMessage::PixelUpdate(update) => update,
        };
        assert_eq!(update.chunk_x, 2);
        assert_eq!(update.chunk_y, 3);
        assert_eq!(update.color_index, 5);
        assert_eq!(update.offset_x, 0);
        assert_eq!(update.offset_y, 0);

        // mixed = 0x0415: color 5, offsets (1, 1)
        let update = match decode(&[0xC1, 0x00, 0x02, 0x00, 0x03, 0x04, 0x15]).unwrap() {
            WireMessage::PixelUpdate(update) => update,
        };
        assert_eq!(update.color_index, 5);
        assert_eq!(update.offset_x, 1);
        assert_eq!(update.offset_y, 1);
    }

    #[test]
    fn chunk_coordinates_are_signed() {
        let update = match decode(&[0xC1, 0xFF, 0xFF, 0x80, 0x00, 0x00, 0x00]).unwrap() {
            WireMessage::PixelUpdate(update) => update,
        };
        assert_eq!(update.chunk_x, -1);
        assert_eq!(update.chunk_y, -32768);
    }

    #[test]
    fn extracts_maximum_field_values() {
        let update = match decode(&[0xC1, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF]).unwrap() {
            WireMessage::PixelUpdate(update) => update,
        };
        assert_eq!(update.color_index, 15);
        assert_eq!(update.offset_x, 63);
        assert_eq!(update.offset_y, 63);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(decode(&[]), Err(WireError::Empty));
        assert_eq!(decode(&[0xC0, 1, 2]), Err(WireError::UnknownOpcode(0xC0)));
        assert_eq!(
            decode(&[0xC1, 0, 0, 0, 0, 0]),
            Err(WireError::BadLength {
                opcode: 0xC1,
                len: 6
            })
        );
        assert_eq!(
            decode(&[0xC1, 0, 0, 0, 0, 0, 0, 0]),
            Err(WireError::BadLength {
                opcode: 0xC1,
                len: 8
            })
        );
    }
}
