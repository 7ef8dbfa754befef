//! UDP header view and encoder

use std::net::Ipv4Addr;

use super::checksum::{checksum, pseudo_header_checksum};
use super::error::PacketError;
use super::ipv4::{read_u16, write_u16, IPV4_MIN_HEADER_LEN};
use super::IPPROTO_UDP;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// Largest UDP payload that fits in a single IPv4 datagram
/// (65535 - 20 byte IPv4 header - 8 byte UDP header)
pub const MAX_UDP_PAYLOAD: usize = 65_535 - IPV4_MIN_HEADER_LEN - UDP_HEADER_LEN;

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const LENGTH: usize = 4;
    pub const CHECKSUM: usize = 6;
}

/// Values written by [`UdpHeader::encode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpFields {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload length
    pub length: u16,
}

/// Typed view over a UDP datagram (header and payload)
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> UdpHeader<T> {
    /// Wrap a buffer without validation
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wrap a buffer, checking the header fits and the length field is sane.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the datagram is truncated.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let header = Self::new_unchecked(buffer);
        let len = header.buffer.as_ref().len();
        if len < UDP_HEADER_LEN {
            return Err(PacketError::truncated("UDP", UDP_HEADER_LEN, len));
        }
        let declared = usize::from(header.length());
        if declared < UDP_HEADER_LEN || declared > len {
            return Err(PacketError::bad_header_length("UDP", declared));
        }
        Ok(header)
    }

    pub fn src_port(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::SRC_PORT)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::DST_PORT)
    }

    /// Length field (header plus payload)
    pub fn length(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::LENGTH)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::CHECKSUM)
    }

    /// Datagram payload, bounded by the length field
    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        let end = usize::from(self.length()).clamp(UDP_HEADER_LEN, data.len());
        &data[UDP_HEADER_LEN..end]
    }

    /// Checksum of header and payload under the IPv4 pseudo-header.
    ///
    /// Zero when the checksum field is correct.
    pub fn calculate_checksum(&self, src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
        let len = usize::from(self.length()).min(self.buffer.as_ref().len());
        let datagram = &self.buffer.as_ref()[..len];
        !checksum(datagram, pseudo_header_checksum(IPPROTO_UDP, src, dst, self.length()))
    }

    /// Valid when the checksum matches or the sender did not compute one
    pub fn is_checksum_valid(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        self.checksum() == 0 || self.calculate_checksum(src, dst) == 0
    }

    pub fn fields(&self) -> UdpFields {
        UdpFields {
            src_port: self.src_port(),
            dst_port: self.dst_port(),
            length: self.length(),
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpHeader<T> {
    /// Write the header; the checksum field is zeroed.
    pub fn encode(&mut self, fields: &UdpFields) {
        let data = self.buffer.as_mut();
        write_u16(data, field::SRC_PORT, fields.src_port);
        write_u16(data, field::DST_PORT, fields.dst_port);
        write_u16(data, field::LENGTH, fields.length);
        write_u16(data, field::CHECKSUM, 0);
    }

    pub fn set_checksum(&mut self, value: u16) {
        write_u16(self.buffer.as_mut(), field::CHECKSUM, value);
    }

    /// Compute and store the checksum. A computed zero is sent as 0xFFFF,
    /// since zero on the wire means "no checksum".
    pub fn fill_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.set_checksum(0);
        let sum = self.calculate_checksum(src, dst);
        self.set_checksum(if sum == 0 { 0xFFFF } else { sum });
    }
}
