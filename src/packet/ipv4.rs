//! IPv4 header view and encoder
//!
//! `Ipv4Header<T>` wraps any byte buffer and exposes typed accessors over the
//! fixed 20-byte header. Read accessors need `T: AsRef<[u8]>`, setters need
//! `T: AsMut<[u8]>` as well, so the same type serves both the decode path
//! (borrowed frame) and the encode path (pooled transmit buffer).

use std::net::Ipv4Addr;

use super::checksum::checksum;
use super::error::PacketError;

/// Minimum (option-less) IPv4 header length
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Maximum IPv4 header length (IHL = 15)
pub const IPV4_MAX_HEADER_LEN: usize = 60;

/// IP version number handled by this crate
pub const IPV4_VERSION: u8 = 4;

/// TTL used for every emitted packet
pub const DEFAULT_TTL: u8 = 64;

/// Don't-fragment bit in the flags/fragment-offset word
const FLAG_DONT_FRAGMENT: u16 = 0x4000;

mod field {
    use std::ops::Range;

    pub const VER_IHL: usize = 0;
    pub const TOS: usize = 1;
    pub const LENGTH: Range<usize> = 2..4;
    pub const IDENT: Range<usize> = 4..6;
    pub const FLG_OFF: Range<usize> = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Range<usize> = 10..12;
    pub const SRC_ADDR: Range<usize> = 12..16;
    pub const DST_ADDR: Range<usize> = 16..20;
}

/// Values written by [`Ipv4Header::encode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Fields {
    /// Header length in bytes (multiple of 4, 20..=60)
    pub ihl: u8,
    /// Header plus payload length
    pub total_length: u16,
    /// Identification
    pub id: u16,
    /// Time to live
    pub ttl: u8,
    /// Transport protocol number
    pub protocol: u8,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
}

impl Ipv4Fields {
    /// Fields for an option-less header with the default TTL
    #[must_use]
    pub const fn new(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload_len: u16) -> Self {
        Self {
            ihl: IPV4_MIN_HEADER_LEN as u8,
            total_length: IPV4_MIN_HEADER_LEN as u16 + payload_len,
            id: 0,
            ttl: DEFAULT_TTL,
            protocol,
            src,
            dst,
        }
    }
}

/// Typed view over an IPv4 header
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv4Header<T> {
    /// Wrap a buffer without validation.
    ///
    /// Accessors panic if the buffer is shorter than 20 bytes.
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wrap a buffer, checking version, length and IHL.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the buffer is not a complete IPv4 header.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let header = Self::new_unchecked(buffer);
        header.check()?;
        Ok(header)
    }

    fn check(&self) -> Result<(), PacketError> {
        let data = self.buffer.as_ref();
        if data.is_empty() {
            return Err(PacketError::truncated("IPv4", IPV4_MIN_HEADER_LEN, 0));
        }
        let version = data[field::VER_IHL] >> 4;
        if version != IPV4_VERSION {
            return Err(PacketError::UnsupportedProtocol { version });
        }
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::truncated("IPv4", IPV4_MIN_HEADER_LEN, data.len()));
        }
        let ihl = self.header_len();
        if ihl < IPV4_MIN_HEADER_LEN || ihl > data.len() {
            return Err(PacketError::bad_header_length("IPv4", ihl));
        }
        let total = usize::from(self.total_length());
        if total < ihl {
            return Err(PacketError::bad_header_length("IPv4", total));
        }
        Ok(())
    }

    /// IP version nibble
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VER_IHL] >> 4
    }

    /// Header length in bytes
    pub fn header_len(&self) -> usize {
        usize::from(self.buffer.as_ref()[field::VER_IHL] & 0x0F) * 4
    }

    /// Total length field
    pub fn total_length(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::LENGTH.start)
    }

    /// Identification field
    pub fn ident(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::IDENT.start)
    }

    /// Time to live
    pub fn ttl(&self) -> u8 {
        self.buffer.as_ref()[field::TTL]
    }

    /// Transport protocol number
    pub fn protocol(&self) -> u8 {
        self.buffer.as_ref()[field::PROTOCOL]
    }

    /// Header checksum field
    pub fn checksum(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::CHECKSUM.start)
    }

    /// Source address
    pub fn src_addr(&self) -> Ipv4Addr {
        read_addr(self.buffer.as_ref(), field::SRC_ADDR.start)
    }

    /// Destination address
    pub fn dst_addr(&self) -> Ipv4Addr {
        read_addr(self.buffer.as_ref(), field::DST_ADDR.start)
    }

    /// Checksum of the header as it currently stands.
    ///
    /// Zero when the checksum field holds the correct value.
    pub fn calculate_checksum(&self) -> u16 {
        !checksum(&self.buffer.as_ref()[..self.header_len()], 0)
    }

    /// Whether the stored checksum matches the header contents
    pub fn is_checksum_valid(&self) -> bool {
        self.calculate_checksum() == 0
    }

    /// Transport payload, bounded by the total length field
    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        let end = usize::from(self.total_length()).min(data.len());
        &data[self.header_len().min(end)..end]
    }

    /// Decode all header fields
    pub fn fields(&self) -> Ipv4Fields {
        // IHL nibble * 4 is at most 60
        #[allow(clippy::cast_possible_truncation)]
        let ihl = self.header_len() as u8;
        Ipv4Fields {
            ihl,
            total_length: self.total_length(),
            id: self.ident(),
            ttl: self.ttl(),
            protocol: self.protocol(),
            src: self.src_addr(),
            dst: self.dst_addr(),
        }
    }

    /// Consume the view and return the buffer
    pub fn into_inner(self) -> T {
        self.buffer
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4Header<T> {
    /// Write every header field; the checksum field is zeroed.
    ///
    /// Option bytes between 20 and `ihl` are zeroed (end-of-options).
    pub fn encode(&mut self, fields: &Ipv4Fields) {
        let data = self.buffer.as_mut();
        let ihl = usize::from(fields.ihl);
        data[field::VER_IHL] = (IPV4_VERSION << 4) | (fields.ihl / 4);
        data[field::TOS] = 0;
        write_u16(data, field::LENGTH.start, fields.total_length);
        write_u16(data, field::IDENT.start, fields.id);
        write_u16(data, field::FLG_OFF.start, FLAG_DONT_FRAGMENT);
        data[field::TTL] = fields.ttl;
        data[field::PROTOCOL] = fields.protocol;
        write_u16(data, field::CHECKSUM.start, 0);
        data[field::SRC_ADDR].copy_from_slice(&fields.src.octets());
        data[field::DST_ADDR].copy_from_slice(&fields.dst.octets());
        data[IPV4_MIN_HEADER_LEN..ihl].fill(0);
    }

    /// Set the checksum field
    pub fn set_checksum(&mut self, value: u16) {
        write_u16(self.buffer.as_mut(), field::CHECKSUM.start, value);
    }

    /// Compute and store the header checksum
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let sum = self.calculate_checksum();
        self.set_checksum(sum);
    }
}

pub(crate) fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

pub(crate) fn write_u16(data: &mut [u8], at: usize, value: u16) {
    data[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub(crate) fn write_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn read_addr(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}
