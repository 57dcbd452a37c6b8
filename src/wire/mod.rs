//! Wire codec (C1): encode/decode the eight packet types over a common
//! 64-byte-bounded header.
//!
//! Grounded on the teacher's `protocol/xdr/mod.rs` `XDR` trait and
//! `XDRStruct!` macro (a working, self-consistent system — as opposed to
//! the `Serialize`/`SerializeStruct!` naming seen in the teacher's
//! `protocol/xdr/rpc.rs`, which referenced macros never defined anywhere
//! in the retrieved tree and was deliberately not carried forward).
//! Field layout is grounded on `examples/original_source/homa_impl.h`'s
//! packet header structs and `homa_outgoing.c`'s packet construction.
//!
//! Unlike XDR, there is no 4-byte alignment padding here: Homa's headers
//! are packed C structs, not an RFC 1832 wire format.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use std::io::{self, Read, Write};

pub mod header;
pub mod packet;

pub use header::CommonHeader;
pub use packet::{
    decode_packet, encode_packet, BusyPayload, CutoffsPayload, DataPayload, DataSegment, FreezePayload, GrantPayload, Packet,
    RestartPayload, ResendPayload,
};

/// Big-endian on the wire for every multi-byte field except the opaque
/// `id`, per §4.1.
pub type WireEndian = BigEndian;

/// Types that can be read from and written to the wire in the transport's
/// packed binary format.
pub trait Wire: Sized {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()>;
    fn read_from<R: Read>(src: &mut R) -> io::Result<Self>;
}

/// Implements [`Wire`] for a struct by writing/reading each field in
/// declaration order. Mirrors the teacher's `XDRStruct!`.
#[macro_export]
macro_rules! WireStruct {
    ($t:ident, $($element:ident),* $(,)?) => {
        impl $crate::wire::Wire for $t {
            fn write_to<W: std::io::Write>(&self, dest: &mut W) -> std::io::Result<()> {
                $(self.$element.write_to(dest)?;)*
                Ok(())
            }

            fn read_from<R: std::io::Read>(src: &mut R) -> std::io::Result<Self> {
                Ok($t {
                    $($element: $crate::wire::Wire::read_from(src)?,)*
                })
            }
        }
    };
}

impl Wire for u8 {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        dest.write_u8(*self)
    }
    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        src.read_u8()
    }
}

impl Wire for u16 {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        dest.write_u16::<WireEndian>(*self)
    }
    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        src.read_u16::<WireEndian>()
    }
}

impl Wire for u32 {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        dest.write_u32::<WireEndian>(*self)
    }
    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        src.read_u32::<WireEndian>()
    }
}

impl Wire for u64 {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        dest.write_u64::<WireEndian>(*self)
    }
    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        src.read_u64::<WireEndian>()
    }
}

impl<const N: usize> Wire for [u32; N] {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        for v in self {
            v.write_to(dest)?;
        }
        Ok(())
    }
    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        let mut out = [0u32; N];
        for slot in out.iter_mut() {
            *slot = u32::read_from(src)?;
        }
        Ok(out)
    }
}

/// The type byte identifying which payload follows the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum PacketType {
    Data = 0,
    Grant = 1,
    Resend = 2,
    Restart = 3,
    Busy = 4,
    Cutoffs = 5,
    Freeze = 6,
}

impl Wire for PacketType {
    fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        dest.write_u8(self.to_u8().expect("PacketType always fits in u8"))
    }

    fn read_from<R: Read>(src: &mut R) -> io::Result<Self> {
        let raw = src.read_u8()?;
        PacketType::from_u8(raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown packet type {raw}")))
    }
}
