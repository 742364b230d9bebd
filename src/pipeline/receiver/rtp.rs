//! RTP fixed header parsing and sequence-number arithmetic

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RtpError;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

/// `a` is newer than `b` in mod 2^16 sequence space
#[inline]
pub fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Signed distance from `b` to `a` in sequence space
#[inline]
pub fn seq_delta(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    /// Profile id of the header extension, when the X bit is set
    pub extension_profile: Option<u16>,
    /// Offset of the payload inside the datagram
    pub header_len: usize,
    /// Trailing padding bytes, including the count byte
    pub padding_len: usize,
}

impl RtpHeader {
    /// Parse the header of an RTP datagram.
    ///
    /// The header is 12 bytes plus 4 per CSRC. A header extension is skipped
    /// and padding is stripped; neither is interpreted further.
    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpError::TooShort(data.len()));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = data[0] & 0x0F;

        let mut header_len = RTP_HEADER_LEN + 4 * csrc_count as usize;
        if data.len() < header_len {
            return Err(RtpError::CsrcOverrun {
                csrc_count,
                len: data.len(),
            });
        }

        let csrc = data[RTP_HEADER_LEN..header_len]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut extension_profile = None;
        if has_extension {
            if data.len() < header_len + 4 {
                return Err(RtpError::ExtensionOverrun(data.len()));
            }
            let profile = u16::from_be_bytes([data[header_len], data[header_len + 1]]);
            let words = u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]) as usize;
            header_len += 4 + 4 * words;
            if data.len() < header_len {
                return Err(RtpError::ExtensionOverrun(data.len()));
            }
            extension_profile = Some(profile);
        }

        let mut padding_len = 0;
        if has_padding {
            let available = data.len() - header_len;
            let pad = data[data.len() - 1] as usize;
            if pad == 0 || pad > available {
                return Err(RtpError::BadPadding {
                    padding: pad,
                    payload: available,
                });
            }
            padding_len = pad;
        }

        Ok(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            csrc,
            extension_profile,
            header_len,
            padding_len,
        })
    }
}

/// One received RTP datagram
///
/// Immutable once built; the jitter buffer and the receive path share it
/// behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRtpPacket {
    pub header: RtpHeader,
    data: Bytes,
    /// Estimated media duration carried by this packet, used for depth accounting
    pub payload_duration_ms: u32,
}

impl RawRtpPacket {
    pub fn parse(data: Bytes) -> Result<Self, RtpError> {
        let header = RtpHeader::parse(&data)?;
        Ok(Self {
            header,
            data,
            payload_duration_ms: 0,
        })
    }

    pub fn with_duration_ms(mut self, ms: u32) -> Self {
        self.payload_duration_ms = ms;
        self
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn payload_type(&self) -> u8 {
        self.header.payload_type
    }

    pub fn marker(&self) -> bool {
        self.header.marker
    }

    /// Media payload, without header, extension or padding
    pub fn payload(&self) -> Bytes {
        self.data
            .slice(self.header.header_len..self.data.len() - self.header.padding_len)
    }

    /// The full datagram as received
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }
}

/// Serialize a minimal RTP packet (no CSRC, no extension, no padding)
pub fn build_packet(payload_type: u8, seq: u16, timestamp: u32, marker: bool, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
    buf.put_u8(RTP_VERSION << 6);
    buf.put_u8((payload_type & 0x7F) | if marker { 0x80 } else { 0 });
    buf.put_u16(seq);
    buf.put_u32(timestamp);
    buf.put_u32(0x1234_5678);
    buf.put_slice(payload);
    buf.freeze()
}
