//! IPv4/TCP/UDP decoding and encoding
//!
//! Everything in this module is stateless and allocation-free: decoders borrow
//! the frame, encoders write into a caller-supplied slice (normally a pooled
//! transmit buffer) and return the number of bytes written.
//!
//! # Layout
//!
//! ```text
//! frame ──► decode() ──► L3Packet { src, dst, protocol, payload }
//!                                              │
//!                         ┌────────────────────┴───────────────┐
//!                         ▼                                    ▼
//!                    TcpHeader<&[u8]>                     UdpHeader<&[u8]>
//!
//! encode_tcp_segment() / encode_udp_datagram()
//!     └── Ipv4Header::encode + {Tcp,Udp}Header::encode + fill_checksum
//! ```

pub mod checksum;
pub mod error;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use std::net::{Ipv4Addr, SocketAddrV4};

pub use error::PacketError;
pub use ipv4::{Ipv4Fields, Ipv4Header, DEFAULT_TTL, IPV4_MIN_HEADER_LEN};
pub use tcp::{
    encode_syn_options, parse_syn_options, syn_options_len, tcp_flags, SynOptions, TcpFields,
    TcpHeader, DEFAULT_MSS, TCP_MIN_HEADER_LEN,
};
pub use udp::{UdpFields, UdpHeader, MAX_UDP_PAYLOAD, UDP_HEADER_LEN};

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Result of decoding the network layer of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Packet<'a> {
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
    /// Transport protocol number
    pub protocol: u8,
    /// IPv4 header length in bytes
    pub header_len: usize,
    /// Transport segment/datagram, bounded by the IPv4 total length
    pub payload: &'a [u8],
}

impl L3Packet<'_> {
    /// Human readable protocol name for logging
    #[must_use]
    pub const fn protocol_name(&self) -> &'static str {
        match self.protocol {
            IPPROTO_TCP => "tcp",
            IPPROTO_UDP => "udp",
            1 => "icmp",
            _ => "other",
        }
    }
}

/// Decode the IPv4 header of a raw frame.
///
/// # Errors
///
/// Returns `PacketError::UnsupportedProtocol` for any IP version other than 4,
/// or a length error if the header is malformed.
pub fn decode(frame: &[u8]) -> Result<L3Packet<'_>, PacketError> {
    let header = Ipv4Header::new_checked(frame)?;
    Ok(L3Packet {
        src: header.src_addr(),
        dst: header.dst_addr(),
        protocol: header.protocol(),
        header_len: header.header_len(),
        payload: header_payload(frame, &header),
    })
}

fn header_payload<'a>(frame: &'a [u8], header: &Ipv4Header<&[u8]>) -> &'a [u8] {
    let end = usize::from(header.total_length()).min(frame.len());
    &frame[header.header_len().min(end)..end]
}

/// Parameters of one outbound TCP segment
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpec<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub ident: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: Option<&'a SynOptions>,
    pub payload: &'a [u8],
}

/// Encode a complete IPv4 + TCP frame into `out`.
///
/// Returns the frame length.
///
/// # Errors
///
/// Returns `PacketError::BufferTooSmall` if `out` cannot hold the frame.
pub fn encode_tcp_segment(out: &mut [u8], spec: &SegmentSpec<'_>) -> Result<usize, PacketError> {
    let opts_len = spec.options.map_or(0, syn_options_len);
    let tcp_len = TCP_MIN_HEADER_LEN + opts_len + spec.payload.len();
    let total = IPV4_MIN_HEADER_LEN + tcp_len;
    let total_u16 = u16::try_from(total).map_err(|_| PacketError::BufferTooSmall {
        needed: total,
        available: usize::from(u16::MAX),
    })?;
    if out.len() < total {
        return Err(PacketError::BufferTooSmall {
            needed: total,
            available: out.len(),
        });
    }
    let (ip_buf, rest) = out[..total].split_at_mut(IPV4_MIN_HEADER_LEN);

    let mut ip = Ipv4Header::new_unchecked(ip_buf);
    ip.encode(&Ipv4Fields {
        id: spec.ident,
        ..Ipv4Fields::new(
            IPPROTO_TCP,
            *spec.src.ip(),
            *spec.dst.ip(),
            total_u16 - IPV4_MIN_HEADER_LEN as u16,
        )
    });
    ip.fill_checksum();

    if let Some(options) = spec.options {
        encode_syn_options(options, &mut rest[TCP_MIN_HEADER_LEN..TCP_MIN_HEADER_LEN + opts_len])?;
    }
    rest[TCP_MIN_HEADER_LEN + opts_len..].copy_from_slice(spec.payload);

    let mut tcp = TcpHeader::new_unchecked(rest);
    // Options are at most 40 bytes, so the offset fits in a u8
    #[allow(clippy::cast_possible_truncation)]
    let data_offset = (TCP_MIN_HEADER_LEN + opts_len) as u8;
    tcp.encode(&TcpFields {
        src_port: spec.src.port(),
        dst_port: spec.dst.port(),
        seq_num: spec.seq,
        ack_num: spec.ack,
        data_offset,
        flags: spec.flags,
        window: spec.window,
    });
    tcp.fill_checksum(*spec.src.ip(), *spec.dst.ip());

    Ok(total)
}

/// Encode a complete IPv4 + UDP frame into `out`.
///
/// Returns the frame length.
///
/// # Errors
///
/// Returns `PacketError::BufferTooSmall` if `out` cannot hold the frame or the
/// payload exceeds [`MAX_UDP_PAYLOAD`].
pub fn encode_udp_datagram(
    out: &mut [u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    ident: u16,
    payload: &[u8],
) -> Result<usize, PacketError> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(PacketError::BufferTooSmall {
            needed: payload.len(),
            available: MAX_UDP_PAYLOAD,
        });
    }
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total = IPV4_MIN_HEADER_LEN + udp_len;
    if out.len() < total {
        return Err(PacketError::BufferTooSmall {
            needed: total,
            available: out.len(),
        });
    }
    // Bounded by MAX_UDP_PAYLOAD above
    #[allow(clippy::cast_possible_truncation)]
    let udp_len_u16 = udp_len as u16;
    let (ip_buf, rest) = out[..total].split_at_mut(IPV4_MIN_HEADER_LEN);

    let mut ip = Ipv4Header::new_unchecked(ip_buf);
    ip.encode(&Ipv4Fields {
        id: ident,
        ..Ipv4Fields::new(IPPROTO_UDP, *src.ip(), *dst.ip(), udp_len_u16)
    });
    ip.fill_checksum();

    rest[UDP_HEADER_LEN..].copy_from_slice(payload);
    let mut udp = UdpHeader::new_unchecked(rest);
    udp.encode(&UdpFields {
        src_port: src.port(),
        dst_port: dst.port(),
        length: udp_len_u16,
    });
    udp.fill_checksum(*src.ip(), *dst.ip());

    Ok(total)
}
