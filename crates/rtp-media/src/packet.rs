//! RTP packet layout per RFC 3550 §5.1.

use bytes::{BufMut, Bytes, BytesMut};

/// Static payload type for G.711 μ-law.
pub const PT_PCMU: u8 = 0;
/// Static payload type for G.711 A-law.
pub const PT_PCMA: u8 = 8;

const MIN_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// Why an inbound datagram was rejected as RTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    TooShort { len: usize },
    BadVersion { version: u8 },
    TruncatedHeader { expected: usize, len: usize },
}

impl std::fmt::Display for RtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "RTP packet too short: {} bytes", len),
            Self::BadVersion { version } => write!(f, "unsupported RTP version {}", version),
            Self::TruncatedHeader { expected, len } => {
                write!(f, "RTP header truncated: need {} have {}", expected, len)
            }
        }
    }
}

impl std::error::Error for RtpError {}

/// Fixed RTP header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Header for an outbound packet: version 2, no padding/extension/CSRC.
    pub fn outbound(payload_type: u8, marker: bool, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serializes the 12-byte fixed header.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MIN_HEADER_LEN);
        buf.put_u8(
            (self.version << 6)
                | ((self.padding as u8) << 5)
                | ((self.extension as u8) << 4)
                | self.csrc_count,
        );
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf
    }

    /// Parses the header, returning it along with the total header length
    /// (fixed part + CSRC list + extension, when present).
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), RtpError> {
        if data.len() < MIN_HEADER_LEN {
            return Err(RtpError::TooShort { len: data.len() });
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion { version });
        }
        let padding = (data[0] >> 5) & 1 == 1;
        let extension = (data[0] >> 4) & 1 == 1;
        let csrc_count = data[0] & 0x0F;
        let marker = (data[1] >> 7) & 1 == 1;
        let payload_type = data[1] & 0x7F;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut header_len = MIN_HEADER_LEN + csrc_count as usize * 4;
        if extension {
            // Extension header: 16-bit profile, 16-bit length in 32-bit words.
            if data.len() < header_len + 4 {
                return Err(RtpError::TruncatedHeader {
                    expected: header_len + 4,
                    len: data.len(),
                });
            }
            let ext_words =
                u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]) as usize;
            header_len += 4 + ext_words * 4;
        }
        if data.len() < header_len {
            return Err(RtpError::TruncatedHeader {
                expected: header_len,
                len: data.len(),
            });
        }

        Ok((
            Self {
                version,
                padding,
                extension,
                csrc_count,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
            },
            header_len,
        ))
    }
}

/// An RTP packet: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Serializes header and payload to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = self.header.to_bytes();
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a packet from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, RtpError> {
        let (header, header_len) = RtpHeader::from_bytes(data)?;
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[header_len..]),
        })
    }
}
