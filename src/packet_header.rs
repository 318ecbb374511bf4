use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::seq::SeqNr;

/// The two delivery services multiplexed over the socket.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Channel {
    Unreliable,
    Reliable,
}

impl Channel {
    fn to_wire(self) -> u8 {
        match self {
            Channel::Unreliable => 0,
            Channel::Reliable => 1,
        }
    }

    fn try_from_wire(value: u8) -> anyhow::Result<Channel> {
        match value {
            0 => Ok(Channel::Unreliable),
            1 => Ok(Channel::Reliable),
            v => bail!("unknown channel {}", v),
        }
    }
}

/// Packet flags bit field.
///
/// Bit 1 (NACK) is reserved: decoders accept it, encoders never set it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    pub const ACK: PacketFlags = PacketFlags(1);
    pub const RETX: PacketFlags = PacketFlags(1 << 2);

    pub fn contains(&self, flag: PacketFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn with(self, flag: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | flag.0)
    }
}

/// The fixed eight-byte packet header - all numbers in network byte order (BE).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub channel: Channel,
    pub flags: PacketFlags,
    pub seq: SeqNr,
    pub ts_ms: u32,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn new_data(channel: Channel, seq: SeqNr, ts_ms: u32) -> PacketHeader {
        PacketHeader {
            channel,
            flags: PacketFlags::NONE,
            seq,
            ts_ms,
        }
    }

    /// ACK packets have no payload and always travel on the reliable channel.
    pub fn new_ack(seq: SeqNr, ts_ms: u32) -> PacketHeader {
        PacketHeader {
            channel: Channel::Reliable,
            flags: PacketFlags::ACK,
            seq,
            ts_ms,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(PacketFlags::ACK)
    }

    pub fn is_retx(&self) -> bool {
        self.flags.contains(PacketFlags::RETX)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.channel.to_wire());
        buf.put_u8(self.flags.0);
        buf.put_u16(self.seq.to_raw());
        buf.put_u32(self.ts_ms);
    }

    /// Parses a header, consuming exactly eight bytes; the rest of the buffer
    ///  is the payload. Fails on truncated input and on unknown channel values.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let channel = Channel::try_from_wire(buf.try_get_u8()?)?;
        let flags = PacketFlags(buf.try_get_u8()?);
        let seq = SeqNr::from_raw(buf.try_get_u16()?);
        let ts_ms = buf.try_get_u32()?;

        Ok(PacketHeader {
            channel,
            flags,
            seq,
            ts_ms,
        })
    }
}
