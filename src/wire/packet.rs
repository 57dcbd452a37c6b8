//! Packet payload types and the encode/decode entry points used by
//! [`crate::engine::Engine`]. DATA's segment list has to be length-
//! prefixed by hand (it isn't a plain struct of `Wire` fields), so it gets
//! a manual `Wire`-like `write_to`/`read_from` pair instead of
//! [`crate::WireStruct!`].

use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::config::HOMA_NUM_PRIORITIES;
use crate::error::TransportError;
use crate::wire::{CommonHeader, PacketType, Wire};
use crate::WireStruct;

/// One contiguous range of message bytes carried in a DATA packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl DataSegment {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        self.offset.write_to(dest)?;
        (self.bytes.len() as u32).write_to(dest)?;
        dest.write_all(&self.bytes)
    }

    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        let offset = u32::read_from(src)?;
        let length = u32::read_from(src)? as usize;
        let mut bytes = vec![0u8; length];
        src.read_exact(&mut bytes)?;
        Ok(DataSegment { offset, bytes })
    }
}

/// DATA packet payload: one or more segments batched into a single
/// datagram for segmentation offload (§4.1, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub message_length: u32,
    /// Sender's declared upper-bound frontier (§3, §9 `incoming` rule).
    pub incoming: u32,
    pub cutoff_version: u16,
    pub retransmit: bool,
    pub segments: Vec<DataSegment>,
}

impl DataPayload {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        self.message_length.write_to(dest)?;
        self.incoming.write_to(dest)?;
        self.cutoff_version.write_to(dest)?;
        dest.write_u8(self.retransmit as u8)?;
        (self.segments.len() as u32).write_to(dest)?;
        for seg in &self.segments {
            seg.write_to(dest)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        let message_length = u32::read_from(src)?;
        let incoming = u32::read_from(src)?;
        let cutoff_version = u16::read_from(src)?;
        let retransmit = src.read_u8()? != 0;
        let count = u32::read_from(src)? as usize;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            segments.push(DataSegment::read_from(src)?);
        }
        Ok(DataPayload {
            message_length,
            incoming,
            cutoff_version,
            retransmit,
            segments,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantPayload {
    pub offset: u32,
    pub priority: u8,
}
WireStruct!(GrantPayload, offset, priority);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPayload {
    pub offset: u32,
    pub length: u32,
    pub priority: u8,
}
WireStruct!(ResendPayload, offset, length, priority);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusyPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoffsPayload {
    pub unsched_cutoffs: [u32; HOMA_NUM_PRIORITIES],
    pub cutoff_version: u16,
}
WireStruct!(CutoffsPayload, unsched_cutoffs, cutoff_version);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreezePayload;

/// A decoded packet: common header plus its type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPayload),
    Grant(GrantPayload),
    Resend(ResendPayload),
    Restart(RestartPayload),
    Busy(BusyPayload),
    Cutoffs(CutoffsPayload),
    Freeze(FreezePayload),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Data(_) => PacketType::Data,
            Packet::Grant(_) => PacketType::Grant,
            Packet::Resend(_) => PacketType::Resend,
            Packet::Restart(_) => PacketType::Restart,
            Packet::Busy(_) => PacketType::Busy,
            Packet::Cutoffs(_) => PacketType::Cutoffs,
            Packet::Freeze(_) => PacketType::Freeze,
        }
    }
}

/// Encodes `header` followed by `payload` into a fresh byte buffer ready
/// to hand to [`crate::substrate::PacketSubstrate::send_datagram`].
pub fn encode_packet(header: &CommonHeader, payload: &Packet) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CommonHeader::WIRE_SIZE + 32);
    header
        .write_to(&mut buf)
        .expect("writing to a Vec<u8> is infallible");
    match payload {
        Packet::Data(p) => p.write_to(&mut buf),
        Packet::Grant(p) => p.write_to(&mut buf),
        Packet::Resend(p) => p.write_to(&mut buf),
        Packet::Restart(_) | Packet::Busy(_) | Packet::Freeze(_) => Ok(()),
        Packet::Cutoffs(p) => p.write_to(&mut buf),
    }
    .expect("writing to a Vec<u8> is infallible");
    buf
}

/// Decodes a raw datagram received from `src` into its header and typed
/// payload. Returns [`TransportError::MalformedPacket`] if the buffer is
/// too short for its declared type or the type byte is unrecognized.
pub fn decode_packet(src: Ipv4Addr, bytes: &[u8]) -> Result<(CommonHeader, Packet), TransportError> {
    if bytes.len() < CommonHeader::WIRE_SIZE {
        return Err(TransportError::MalformedPacket {
            src,
            reason: "shorter than the common header",
        });
    }
    let mut cursor = Cursor::new(bytes);
    let header = CommonHeader::read_from(&mut cursor).map_err(|_| TransportError::MalformedPacket {
        src,
        reason: "failed to parse common header",
    })?;
    let malformed = |reason: &'static str| TransportError::MalformedPacket { src, reason };
    let payload = match header.packet_type {
        PacketType::Data => {
            Packet::Data(DataPayload::read_from(&mut cursor).map_err(|_| malformed("truncated DATA payload"))?)
        }
        PacketType::Grant => {
            Packet::Grant(GrantPayload::read_from(&mut cursor).map_err(|_| malformed("truncated GRANT payload"))?)
        }
        PacketType::Resend => {
            Packet::Resend(ResendPayload::read_from(&mut cursor).map_err(|_| malformed("truncated RESEND payload"))?)
        }
        PacketType::Restart => Packet::Restart(RestartPayload),
        PacketType::Busy => Packet::Busy(BusyPayload),
        PacketType::Cutoffs => Packet::Cutoffs(
            CutoffsPayload::read_from(&mut cursor).map_err(|_| malformed("truncated CUTOFFS payload"))?,
        ),
        PacketType::Freeze => Packet::Freeze(FreezePayload),
    };
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_packet_round_trips() {
        let header = CommonHeader::new(100, 200, PacketType::Data, 3, 0xdead_beef_0000_0001);
        let payload = Packet::Data(DataPayload {
            message_length: 5000,
            incoming: 10000,
            cutoff_version: 7,
            retransmit: false,
            segments: vec![
                DataSegment { offset: 0, bytes: vec![1, 2, 3] },
                DataSegment { offset: 1440, bytes: vec![4, 5] },
            ],
        });
        let encoded = encode_packet(&header, &payload);
        let (decoded_header, decoded_payload) = decode_packet(Ipv4Addr::LOCALHOST, &encoded).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn grant_packet_round_trips() {
        let header = CommonHeader::new(1, 2, PacketType::Grant, 0, 42);
        let payload = Packet::Grant(GrantPayload { offset: 20000, priority: 5 });
        let encoded = encode_packet(&header, &payload);
        let (decoded_header, decoded_payload) = decode_packet(Ipv4Addr::LOCALHOST, &encoded).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn restart_packet_round_trips_with_empty_payload() {
        let header = CommonHeader::new(1, 2, PacketType::Restart, 0, 99);
        let payload = Packet::Restart(RestartPayload);
        let encoded = encode_packet(&header, &payload);
        assert_eq!(encoded.len(), CommonHeader::WIRE_SIZE);
        let (decoded_header, decoded_payload) = decode_packet(Ipv4Addr::LOCALHOST, &encoded).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn short_buffer_is_malformed() {
        let err = decode_packet(Ipv4Addr::LOCALHOST, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, TransportError::MalformedPacket { .. }));
    }

    #[test]
    fn id_is_preserved_byte_exact() {
        let header = CommonHeader::new(1, 2, PacketType::Busy, 0, 0x0102_0304_0506_0708);
        let encoded = encode_packet(&header, &Packet::Busy(BusyPayload));
        let (decoded, _) = decode_packet(Ipv4Addr::LOCALHOST, &encoded).unwrap();
        assert_eq!(decoded.id, 0x0102_0304_0506_0708);
    }
}
