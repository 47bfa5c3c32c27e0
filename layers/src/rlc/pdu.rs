//! RLC AM PDU Codec
//!
//! Encodes and decodes AMD (data) PDU headers and STATUS PDU bodies per
//! 3GPP TS 38.322 6.2.2.4 / 6.2.3. All functions are pure: the same octets
//! always yield the same structured result, and every malformed input is
//! rejected with a typed error before any out-of-bounds read.

use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};

use super::sn::SnSize;

/// SO value meaning "through the last byte of the SDU".
///
/// Used in NACK sub-ranges while the receiver does not yet know the SDU's
/// total length.
pub const SO_END_OF_SDU: u16 = 0xFFFF;

/// Segmentation Info field (SI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentInfo {
    /// Complete SDU (SI = 00)
    Full,
    /// First segment of an SDU (SI = 01)
    First,
    /// Last segment of an SDU (SI = 10)
    Last,
    /// Middle segment of an SDU (SI = 11)
    Middle,
}

impl SegmentInfo {
    fn bits(self) -> u8 {
        match self {
            SegmentInfo::Full => 0b00,
            SegmentInfo::First => 0b01,
            SegmentInfo::Last => 0b10,
            SegmentInfo::Middle => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => SegmentInfo::Full,
            0b01 => SegmentInfo::First,
            0b10 => SegmentInfo::Last,
            _ => SegmentInfo::Middle,
        }
    }

    /// The SO field is present for middle and last segments only
    pub fn has_so(self) -> bool {
        matches!(self, SegmentInfo::Middle | SegmentInfo::Last)
    }

    /// True when this segment starts at offset 0 of its SDU
    pub fn is_first(self) -> bool {
        matches!(self, SegmentInfo::Full | SegmentInfo::First)
    }

    /// True when this segment ends at the last byte of its SDU
    pub fn is_last(self) -> bool {
        matches!(self, SegmentInfo::Full | SegmentInfo::Last)
    }
}

/// AMD PDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdPduHeader {
    /// Polling bit
    pub poll: bool,
    /// Segmentation info
    pub si: SegmentInfo,
    /// Sequence number (shared by all segments of one SDU)
    pub sn: u32,
    /// Segment offset; 0 unless `si.has_so()`
    pub so: u16,
}

impl AmdPduHeader {
    /// Header length without the SO field
    pub fn base_len(sn_size: SnSize) -> usize {
        match sn_size {
            SnSize::Size12 => 2,
            SnSize::Size18 => 3,
        }
    }

    /// Encoded length of this header
    pub fn len(&self, sn_size: SnSize) -> usize {
        Self::base_len(sn_size) + if self.si.has_so() { 2 } else { 0 }
    }
}

/// True iff the leading D/C bit marks a control (STATUS) PDU
pub fn is_control_pdu(pdu: &[u8]) -> bool {
    !pdu.is_empty() && pdu[0] & 0x80 == 0
}

/// Encode an AMD PDU header into `buf`
pub fn encode_data_header(hdr: &AmdPduHeader, sn_size: SnSize, buf: &mut BytesMut) {
    let sn = sn_size.wrap(hdr.sn);
    let p = u8::from(hdr.poll);
    match sn_size {
        SnSize::Size12 => {
            buf.put_u8(0x80 | (p << 6) | (hdr.si.bits() << 4) | ((sn >> 8) as u8 & 0x0F));
            buf.put_u8(sn as u8);
        }
        SnSize::Size18 => {
            buf.put_u8(0x80 | (p << 6) | (hdr.si.bits() << 4) | ((sn >> 16) as u8 & 0x03));
            buf.put_u8((sn >> 8) as u8);
            buf.put_u8(sn as u8);
        }
    }
    if hdr.si.has_so() {
        buf.put_u16(hdr.so);
    }
}

/// Decode an AMD PDU header.
///
/// Returns the header and its encoded length; the PDU payload follows.
/// Rejects truncated headers, reserved-bit violations and empty payloads.
pub fn decode_data_header(pdu: &[u8], sn_size: SnSize) -> Result<(AmdPduHeader, usize), LayerError> {
    let base = AmdPduHeader::base_len(sn_size);
    if pdu.len() < base {
        return Err(LayerError::MalformedPdu(format!(
            "AMD PDU of {} bytes shorter than {}-byte header",
            pdu.len(),
            base
        )));
    }
    if pdu[0] & 0x80 == 0 {
        return Err(LayerError::MalformedPdu("D/C bit marks a control PDU".into()));
    }

    let poll = pdu[0] & 0x40 != 0;
    let si = SegmentInfo::from_bits(pdu[0] >> 4);
    let sn = match sn_size {
        SnSize::Size12 => ((pdu[0] as u32 & 0x0F) << 8) | pdu[1] as u32,
        SnSize::Size18 => {
            if pdu[0] & 0x0C != 0 {
                return Err(LayerError::MalformedPdu("reserved bits set in AMD header".into()));
            }
            ((pdu[0] as u32 & 0x03) << 16) | ((pdu[1] as u32) << 8) | pdu[2] as u32
        }
    };

    let mut consumed = base;
    let so = if si.has_so() {
        if pdu.len() < consumed + 2 {
            return Err(LayerError::MalformedPdu("AMD PDU truncated before SO field".into()));
        }
        let so = u16::from_be_bytes([pdu[consumed], pdu[consumed + 1]]);
        consumed += 2;
        so
    } else {
        0
    };

    if pdu.len() == consumed {
        return Err(LayerError::MalformedPdu("AMD PDU carries no payload".into()));
    }

    Ok((AmdPduHeader { poll, si, sn, so }, consumed))
}

/// One NACK descriptor of a STATUS PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackDescriptor {
    /// First missing sequence number
    pub sn: u32,
    /// Missing byte sub-range, inclusive offsets; `so.1 == SO_END_OF_SDU`
    /// means through the end of the SDU
    pub so: Option<(u16, u16)>,
    /// Number of additional consecutive fully-missing SNs after `sn`
    pub range: Option<u8>,
}

impl NackDescriptor {
    fn encoded_len(&self, sn_size: SnSize) -> usize {
        let base = match sn_size {
            SnSize::Size12 => 2,
            SnSize::Size18 => 3,
        };
        base + if self.so.is_some() { 4 } else { 0 } + if self.range.is_some() { 1 } else { 0 }
    }
}

/// Decoded STATUS PDU: cumulative ACK plus selective NACKs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusReport {
    /// Lowest sequence number not fully received
    pub ack_sn: u32,
    /// Gaps below `rx_next_highest`, in ascending modulo order
    pub nacks: Vec<NackDescriptor>,
}

impl StatusReport {
    /// Fixed part: D/C + CPT + ACK_SN + E1 (3 octets for both SN lengths)
    pub fn header_len(_sn_size: SnSize) -> usize {
        3
    }

    /// Exact encoded size of the full report
    pub fn encoded_len(&self, sn_size: SnSize) -> usize {
        Self::header_len(sn_size)
            + self
                .nacks
                .iter()
                .map(|n| n.encoded_len(sn_size))
                .sum::<usize>()
    }

    /// Encode the report into octets
    pub fn encode(&self, sn_size: SnSize) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len(sn_size));
        let ack = sn_size.wrap(self.ack_sn);
        let e1 = u8::from(!self.nacks.is_empty());
        match sn_size {
            SnSize::Size12 => {
                buf.put_u8((ack >> 8) as u8 & 0x0F);
                buf.put_u8(ack as u8);
                buf.put_u8(e1 << 7);
            }
            SnSize::Size18 => {
                buf.put_u8((ack >> 14) as u8 & 0x0F);
                buf.put_u8((ack >> 6) as u8);
                buf.put_u8(((ack as u8) << 2) | (e1 << 1));
            }
        }

        for (i, nack) in self.nacks.iter().enumerate() {
            let more = u8::from(i + 1 < self.nacks.len());
            let e2 = u8::from(nack.so.is_some());
            let e3 = u8::from(nack.range.is_some());
            let sn = sn_size.wrap(nack.sn);
            match sn_size {
                SnSize::Size12 => {
                    buf.put_u8((sn >> 4) as u8);
                    buf.put_u8(((sn as u8) << 4) | (more << 3) | (e2 << 2) | (e3 << 1));
                }
                SnSize::Size18 => {
                    buf.put_u8((sn >> 10) as u8);
                    buf.put_u8((sn >> 2) as u8);
                    buf.put_u8(((sn as u8) << 6) | (more << 5) | (e2 << 4) | (e3 << 3));
                }
            }
            if let Some((start, end)) = nack.so {
                buf.put_u16(start);
                buf.put_u16(end);
            }
            if let Some(range) = nack.range {
                buf.put_u8(range);
            }
        }
        buf.freeze()
    }

    /// Decode a STATUS PDU body.
    ///
    /// Any structural violation discards the whole PDU; a report is never
    /// partially applied.
    pub fn decode(pdu: &[u8], sn_size: SnSize) -> Result<StatusReport, LayerError> {
        if pdu.len() < Self::header_len(sn_size) {
            return Err(LayerError::MalformedPdu(format!(
                "STATUS PDU of {} bytes shorter than fixed part",
                pdu.len()
            )));
        }
        if pdu[0] & 0x80 != 0 {
            return Err(LayerError::MalformedPdu("D/C bit marks a data PDU".into()));
        }
        if pdu[0] & 0x70 != 0 {
            return Err(LayerError::MalformedPdu(format!(
                "unknown control PDU type {}",
                (pdu[0] >> 4) & 0x07
            )));
        }

        let (ack_sn, mut more) = match sn_size {
            SnSize::Size12 => (
                ((pdu[0] as u32 & 0x0F) << 8) | pdu[1] as u32,
                pdu[2] & 0x80 != 0,
            ),
            SnSize::Size18 => (
                ((pdu[0] as u32 & 0x0F) << 14) | ((pdu[1] as u32) << 6) | (pdu[2] as u32 >> 2),
                pdu[2] & 0x02 != 0,
            ),
        };

        let mut nacks = Vec::new();
        let mut off = Self::header_len(sn_size);
        while more {
            let nack_base = match sn_size {
                SnSize::Size12 => 2,
                SnSize::Size18 => 3,
            };
            if pdu.len() < off + nack_base {
                return Err(LayerError::MalformedPdu("STATUS PDU truncated inside NACK".into()));
            }
            let (sn, flags) = match sn_size {
                SnSize::Size12 => (
                    ((pdu[off] as u32) << 4) | (pdu[off + 1] as u32 >> 4),
                    pdu[off + 1] << 4,
                ),
                SnSize::Size18 => (
                    ((pdu[off] as u32) << 10) | ((pdu[off + 1] as u32) << 2)
                        | (pdu[off + 2] as u32 >> 6),
                    pdu[off + 2] << 2,
                ),
            };
            // Flag nibble normalized to E1|E2|E3 in bits 7..5
            more = flags & 0x80 != 0;
            let has_so = flags & 0x40 != 0;
            let has_range = flags & 0x20 != 0;
            off += nack_base;

            let so = if has_so {
                if pdu.len() < off + 4 {
                    return Err(LayerError::MalformedPdu(
                        "STATUS PDU truncated before SO pair".into(),
                    ));
                }
                let start = u16::from_be_bytes([pdu[off], pdu[off + 1]]);
                let end = u16::from_be_bytes([pdu[off + 2], pdu[off + 3]]);
                if end != SO_END_OF_SDU && start > end {
                    return Err(LayerError::MalformedPdu(format!(
                        "inconsistent NACK sub-range {}..{}",
                        start, end
                    )));
                }
                off += 4;
                Some((start, end))
            } else {
                None
            };

            let range = if has_range {
                if pdu.len() < off + 1 {
                    return Err(LayerError::MalformedPdu(
                        "STATUS PDU truncated before NACK range".into(),
                    ));
                }
                let r = pdu[off];
                if r == 0 {
                    return Err(LayerError::MalformedPdu("zero-length NACK range".into()));
                }
                off += 1;
                Some(r)
            } else {
                None
            };

            nacks.push(NackDescriptor { sn, so, range });
        }

        Ok(StatusReport { ack_sn, nacks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_header_roundtrip_12bit() {
        for (si, so) in [
            (SegmentInfo::Full, 0),
            (SegmentInfo::First, 0),
            (SegmentInfo::Middle, 512),
            (SegmentInfo::Last, 65_000),
        ] {
            let hdr = AmdPduHeader { poll: true, si, sn: 0xABC, so };
            let mut buf = BytesMut::new();
            encode_data_header(&hdr, SnSize::Size12, &mut buf);
            buf.put_u8(0xEE); // payload byte
            let (decoded, len) = decode_data_header(&buf, SnSize::Size12).unwrap();
            assert_eq!(decoded, hdr);
            assert_eq!(len, hdr.len(SnSize::Size12));
        }
    }

    #[test]
    fn test_data_header_roundtrip_18bit() {
        let hdr = AmdPduHeader {
            poll: false,
            si: SegmentInfo::Middle,
            sn: 0x3FFFF,
            so: 1234,
        };
        let mut buf = BytesMut::new();
        encode_data_header(&hdr, SnSize::Size18, &mut buf);
        buf.put_u8(0x00);
        let (decoded, len) = decode_data_header(&buf, SnSize::Size18).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(len, 5);
    }

    #[test]
    fn test_data_header_known_bytes() {
        // SN=5, no poll, full SDU, 12-bit: 1000_0000 0000_0101
        let hdr = AmdPduHeader { poll: false, si: SegmentInfo::Full, sn: 5, so: 0 };
        let mut buf = BytesMut::new();
        encode_data_header(&hdr, SnSize::Size12, &mut buf);
        assert_eq!(&buf[..], &[0x80, 0x05]);
    }

    #[test]
    fn test_data_header_rejects_malformed() {
        assert!(decode_data_header(&[0x80], SnSize::Size12).is_err()); // truncated
        assert!(decode_data_header(&[0x00, 0x05, 0x01], SnSize::Size12).is_err()); // control bit
        assert!(decode_data_header(&[0x80, 0x05], SnSize::Size12).is_err()); // no payload
        // middle segment announces SO but the field is cut off
        assert!(decode_data_header(&[0xB0, 0x05, 0x00], SnSize::Size12).is_err());
        // reserved bits set, 18-bit header
        assert!(decode_data_header(&[0x84, 0x00, 0x05, 0xEE], SnSize::Size18).is_err());
    }

    #[test]
    fn test_status_ack_only() {
        let report = StatusReport { ack_sn: 5, nacks: vec![] };
        let encoded = report.encode(SnSize::Size12);
        assert_eq!(&encoded[..], &[0x00, 0x05, 0x00]);
        assert_eq!(report.encoded_len(SnSize::Size12), 3);
        assert_eq!(StatusReport::decode(&encoded, SnSize::Size12).unwrap(), report);
    }

    #[test]
    fn test_status_nack_roundtrip() {
        for sn_size in [SnSize::Size12, SnSize::Size18] {
            let report = StatusReport {
                ack_sn: 77,
                nacks: vec![
                    NackDescriptor { sn: 70, so: None, range: None },
                    NackDescriptor { sn: 72, so: Some((100, 499)), range: None },
                    NackDescriptor { sn: 74, so: None, range: Some(3) },
                    NackDescriptor { sn: 76, so: Some((0, SO_END_OF_SDU)), range: None },
                ],
            };
            let encoded = report.encode(sn_size);
            assert_eq!(encoded.len(), report.encoded_len(sn_size));
            let decoded = StatusReport::decode(&encoded, sn_size).unwrap();
            assert_eq!(decoded, report);
        }
    }

    #[test]
    fn test_status_rejects_malformed() {
        // data D/C bit
        assert!(StatusReport::decode(&[0x80, 0x05, 0x00], SnSize::Size12).is_err());
        // unknown CPT
        assert!(StatusReport::decode(&[0x10, 0x05, 0x00], SnSize::Size12).is_err());
        // E1 set but no NACK follows
        assert!(StatusReport::decode(&[0x00, 0x05, 0x80], SnSize::Size12).is_err());
        // NACK announces SO pair, PDU ends early
        let truncated = [0x00, 0x05, 0x80, 0x00, 0x24, 0x00, 0x64];
        assert!(StatusReport::decode(&truncated, SnSize::Size12).is_err());
        // inconsistent sub-range (start > end)
        let report = StatusReport {
            ack_sn: 5,
            nacks: vec![NackDescriptor { sn: 2, so: Some((400, 100)), range: None }],
        };
        let bytes = report.encode(SnSize::Size12);
        assert!(StatusReport::decode(&bytes, SnSize::Size12).is_err());
    }

    #[test]
    fn test_discriminator() {
        assert!(is_control_pdu(&[0x00, 0x05, 0x00]));
        assert!(!is_control_pdu(&[0x80, 0x05, 0xEE]));
        assert!(!is_control_pdu(&[]));
    }
}
