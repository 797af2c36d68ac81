//! Binary tunnel frames.
//!
//! Layout: `[tunnel id, 36 bytes, NUL padded][flag][payload]`.

use bytes::Bytes;

use crate::error::RelayError;

pub const TUNNEL_ID_LEN: usize = 36;
pub const HEADER_LEN: usize = TUNNEL_ID_LEN + 1;

pub const FLAG_DATA: u8 = 0x00;
pub const FLAG_EOF: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tunnel_id: String,
    pub eof: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(tunnel_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            eof: false,
            payload: payload.into(),
        }
    }

    pub fn eof(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            eof: true,
            payload: Bytes::new(),
        }
    }

    /// Ids longer than the fixed width are truncated. Tunnel ids are
    /// hyphenated uuids so this never happens for frames we originate.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        let id = self.tunnel_id.as_bytes();
        let n = id.len().min(TUNNEL_ID_LEN);
        buf.extend_from_slice(&id[..n]);
        buf.resize(TUNNEL_ID_LEN, 0);
        buf.push(if self.eof { FLAG_EOF } else { FLAG_DATA });
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        if buf.len() < HEADER_LEN {
            return Err(RelayError::MalformedFrame(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }

        let raw_id = &buf[..TUNNEL_ID_LEN];
        let end = raw_id.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
        let tunnel_id = std::str::from_utf8(&raw_id[..end])
            .map_err(|_| RelayError::MalformedFrame("tunnel id is not utf-8".to_string()))?
            .to_string();
        if tunnel_id.is_empty() {
            return Err(RelayError::MalformedFrame("empty tunnel id".to_string()));
        }

        let eof = match buf[TUNNEL_ID_LEN] {
            FLAG_DATA => false,
            FLAG_EOF => true,
            other => {
                return Err(RelayError::MalformedFrame(format!("unknown flag {other:#04x}")))
            }
        };

        Ok(Self {
            tunnel_id,
            eof,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "6f1c2a7e-93b4-4e0f-a1d2-5b8c9e0f1a2b";

    #[test]
    fn data_frame_survives_encoding() {
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let wire = Frame::data(ID, payload.clone()).encode();
        assert_eq!(wire.len(), HEADER_LEN + payload.len());

        let frame = Frame::decode(&wire).unwrap();
        assert_eq!(frame.tunnel_id, ID);
        assert!(!frame.eof);
        assert_eq!(&frame.payload[..], &payload[..]);

        let empty = Frame::decode(&Frame::data(ID, Vec::new()).encode()).unwrap();
        assert!(empty.payload.is_empty());
        assert!(!empty.eof);
    }

    #[test]
    fn eof_frame_has_no_payload() {
        let wire = Frame::eof(ID).encode();
        assert_eq!(wire.len(), HEADER_LEN);
        assert_eq!(wire[TUNNEL_ID_LEN], FLAG_EOF);

        let frame = Frame::decode(&wire).unwrap();
        assert!(frame.eof);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn short_ids_are_padded_and_trimmed() {
        let wire = Frame::data("abc", &b"x"[..]).encode();
        assert_eq!(&wire[3..TUNNEL_ID_LEN], &[0u8; TUNNEL_ID_LEN - 3][..]);
        assert_eq!(Frame::decode(&wire).unwrap().tunnel_id, "abc");
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(Frame::decode(&[0u8; HEADER_LEN - 1]).is_err());
        assert!(Frame::decode(&[0u8; HEADER_LEN]).is_err());

        let mut wire = Frame::data(ID, &b"hi"[..]).encode();
        wire[TUNNEL_ID_LEN] = 0x07;
        assert!(Frame::decode(&wire).is_err());
    }
}
