use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

/// Number of distinct packet ids: ids wrap around modulo this value.
pub const PACKET_ID_LIMIT: u32 = 1 << 24;

/// Largest UDP payload the codec will emit (65535 minus the 8-byte UDP header).
pub const MAX_UDP_PAYLOAD: usize = 65527;

/// Bytes AES-GCM adds to an encrypted payload: 12-byte nonce prefix plus 16-byte tag.
pub const AES_GCM_OVERHEAD: usize = 28;

/// Largest application payload in a single encrypted DATA packet.
pub const MAX_PACKET_DATA_LEN: usize =
    MAX_UDP_PAYLOAD - PacketHeader::SERIALIZED_LEN - AES_GCM_OVERHEAD;

/// A packet sequence number in `[0, 2^24)`, wrapping on overflow.
///
/// Each channel direction numbers its DATA packets independently; ACKs refer to these
///  ids. All arithmetic is modulo `2^24`, and ordering between two ids is decided by
///  the signed modular distance (see [`PacketId::distance`]).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    pub fn from_raw(value: u32) -> PacketId {
        PacketId(value & (PACKET_ID_LIMIT - 1))
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn wrapping_next(self) -> PacketId {
        PacketId((self.0 + 1) & (PACKET_ID_LIMIT - 1))
    }

    /// Signed modular distance from `self` (the expected id) to `id`, in
    ///  `[-2^23, 2^23)`.
    ///
    /// A negative result means `id` lies in the past (already delivered), a positive
    ///  result means it lies in the future (some packets are still missing), zero
    ///  means `id` is the one to deliver next.
    pub fn distance(self, id: PacketId) -> i32 {
        let diff = (id.0 + PACKET_ID_LIMIT - self.0) % PACKET_ID_LIMIT;
        if diff < PACKET_ID_LIMIT / 2 {
            diff as i32
        } else {
            diff as i32 - PACKET_ID_LIMIT as i32
        }
    }
}

/// Thread-safe wrapping id counter backing a channel's send id and expected receive id.
pub(crate) struct IdCounter(AtomicU32);

impl IdCounter {
    pub fn new(start: PacketId) -> IdCounter {
        IdCounter(AtomicU32::new(start.to_raw()))
    }

    pub fn get(&self) -> PacketId {
        PacketId::from_raw(self.0.load(Ordering::SeqCst))
    }

    /// Returns the current id and advances the counter - send-side id allocation.
    pub fn take_next(&self) -> PacketId {
        let raw = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some((v + 1) & (PACKET_ID_LIMIT - 1))
            })
            .expect("fetch_update closure never returns None");
        PacketId::from_raw(raw)
    }

    /// Advances the counter and returns the new value - receive-side expected id.
    pub fn advance(&self) -> PacketId {
        self.take_next().wrapping_next()
    }
}

/// Kind of a packet, carried in the upper 8 bits of the header word.
///
/// Bit 7 is not part of the enumeration: it is the SPLIT flag, valid on DATA only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    ConnectServerAnswer = 1,
    ConnectClientAnswer = 2,
    ConnectDone = 3,
    Data = 4,
    Ack = 5,
    Ping = 6,
    Pong = 7,
    Disconnect = 8,
    Punch = 9,
}

impl PacketType {
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::Connect
                | PacketType::ConnectServerAnswer
                | PacketType::ConnectClientAnswer
                | PacketType::ConnectDone
        )
    }
}

/// Marker on a DATA packet whose payload is a non-final fragment of a larger message.
pub const SPLIT_FLAG: u8 = 0x80;

/// Packs a raw status byte and a 24-bit id into the header word.
pub fn pack_status_id(status: u8, id: u32) -> u32 {
    (id & (PACKET_ID_LIMIT - 1)) | (status as u32) << 24
}

/// Inverse of [`pack_status_id`].
pub fn unpack_status_id(word: u32) -> (u8, u32) {
    ((word >> 24) as u8, word & (PACKET_ID_LIMIT - 1))
}

/// The fixed 4-byte packet header: one little-endian u32 carrying status and id.
///
/// The status byte is kept raw: this layer only frames, it does not judge. A
///  status outside the defined kinds decodes fine and is dropped by the dispatch
///  layer, so a future protocol revision stays distinguishable from a truncated
///  datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: PacketId,
    status: u8,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn new(packet_type: PacketType, id: PacketId) -> PacketHeader {
        PacketHeader {
            id,
            status: packet_type.into(),
        }
    }

    pub fn with_split(mut self, split: bool) -> PacketHeader {
        if split {
            self.status |= SPLIT_FLAG;
        } else {
            self.status &= !SPLIT_FLAG;
        }
        self
    }

    /// The raw status byte, SPLIT flag included.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// The packet kind encoded in the low 7 status bits; `None` for statuses this
    ///  protocol revision does not define.
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.status & !SPLIT_FLAG).ok()
    }

    pub fn is_split(&self) -> bool {
        self.status & SPLIT_FLAG != 0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(pack_status_id(self.status, self.id.to_raw()));
    }

    /// Fails only on a buffer shorter than the header.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let (status, id) = unpack_status_id(buf.try_get_u32_le()?);
        Ok(PacketHeader {
            id: PacketId::from_raw(id),
            status,
        })
    }
}

/// A parsed packet: header plus payload.
///
/// On the send path the payload is already encrypted when the packet is marshaled; on
///  the receive path packets handed to the queues carry the decrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    data: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, data: Bytes) -> Packet {
        Packet { header, data }
    }

    /// A payload-less control packet (ACK, PING, PONG, DISCONNECT).
    pub fn control(packet_type: PacketType, id: PacketId) -> Packet {
        Packet {
            header: PacketHeader::new(packet_type, id),
            data: Bytes::new(),
        }
    }

    pub fn header(&self) -> PacketHeader {
        self.header
    }

    pub fn id(&self) -> PacketId {
        self.header.id
    }

    pub fn status(&self) -> u8 {
        self.header.status()
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.header.packet_type()
    }

    pub fn is_split(&self) -> bool {
        self.header.is_split()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + self.data.len());
        self.header.ser(&mut buf);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parses a datagram. Fails only on input shorter than the header; everything
    ///  after the header is payload.
    pub fn unmarshal(mut buf: &[u8]) -> anyhow::Result<Packet> {
        let header = PacketHeader::deser(&mut buf)?;
        Ok(Packet {
            header,
            data: Bytes::copy_from_slice(buf),
        })
    }
}
