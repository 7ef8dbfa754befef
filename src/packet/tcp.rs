//! TCP header view, encoder and SYN options
//!
//! Only the options that appear on SYN segments are modelled: MSS, window
//! scale, SACK-permitted and timestamps. Emitted options follow the order the
//! Linux stack uses so captures look familiar:
//!
//! ```text
//! MSS 4 mss(2)
//! SACK-permitted + TS:  SACK 2 TS 10 tsval tsecr
//! TS only:              NOP NOP TS 10 tsval tsecr
//! SACK-permitted only:  NOP NOP SACK 2
//! NOP WS 3 shift(1)
//! ```

use std::net::Ipv4Addr;

use super::checksum::{checksum, pseudo_header_checksum};
use super::error::PacketError;
use super::ipv4::{read_u16, read_u32, write_u16, write_u32};
use super::IPPROTO_TCP;

/// Minimum (option-less) TCP header length
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// Maximum space available for options
pub const MAX_OPTION_SIZE: usize = 40;

/// Largest window scale shift allowed by RFC 7323
pub const MAX_WINDOW_SCALE: u8 = 14;

/// MSS assumed when the peer's SYN carries no MSS option (RFC 1122)
pub const DEFAULT_MSS: u16 = 536;

/// TCP flag bits
pub mod tcp_flags {
    /// FIN flag - connection close request
    pub const FIN: u8 = 0x01;
    /// SYN flag - connection open request
    pub const SYN: u8 = 0x02;
    /// RST flag - connection reset
    pub const RST: u8 = 0x04;
    /// PSH flag - push data immediately
    pub const PSH: u8 = 0x08;
    /// ACK flag - acknowledgment
    pub const ACK: u8 = 0x10;
    /// URG flag - urgent pointer valid
    pub const URG: u8 = 0x20;
}

/// TCP option kinds
pub mod option_kind {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const SACK: u8 = 5;
    pub const TIMESTAMP: u8 = 8;
}

const MSS_OPTION_LEN: usize = 4;
const WS_OPTION_LEN: usize = 3;
const SACK_PERMITTED_OPTION_LEN: usize = 2;
const TS_OPTION_LEN: usize = 10;

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const SEQ_NUM: usize = 4;
    pub const ACK_NUM: usize = 8;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: usize = 14;
    pub const CHECKSUM: usize = 16;
    pub const URGENT: usize = 18;
}

/// Values written by [`TcpHeader::encode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Header length in bytes, options included
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
}

/// TCP timestamp option values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub val: u32,
    pub ecr: u32,
}

/// Options carried on SYN and SYN|ACK segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynOptions {
    /// Maximum segment size
    pub mss: u16,
    /// Window scale shift, `None` when the option is absent
    pub window_scale: Option<u8>,
    /// SACK-permitted option present
    pub sack_permitted: bool,
    /// Timestamp option, if present
    pub timestamp: Option<Timestamp>,
}

impl Default for SynOptions {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            window_scale: None,
            sack_permitted: false,
            timestamp: None,
        }
    }
}

/// Typed view over a TCP segment (header, options and payload)
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> TcpHeader<T> {
    /// Wrap a buffer without validation
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wrap a buffer, checking that the header and its options fit.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the segment is truncated or the data offset is invalid.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let header = Self::new_unchecked(buffer);
        let len = header.buffer.as_ref().len();
        if len < TCP_MIN_HEADER_LEN {
            return Err(PacketError::truncated("TCP", TCP_MIN_HEADER_LEN, len));
        }
        let offset = header.data_offset();
        if offset < TCP_MIN_HEADER_LEN || offset > len {
            return Err(PacketError::bad_header_length("TCP", offset));
        }
        Ok(header)
    }

    pub fn src_port(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::SRC_PORT)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::DST_PORT)
    }

    pub fn seq_number(&self) -> u32 {
        read_u32(self.buffer.as_ref(), field::SEQ_NUM)
    }

    pub fn ack_number(&self) -> u32 {
        read_u32(self.buffer.as_ref(), field::ACK_NUM)
    }

    /// Header length in bytes
    pub fn data_offset(&self) -> usize {
        usize::from(self.buffer.as_ref()[field::DATA_OFFSET] >> 4) * 4
    }

    pub fn flags(&self) -> u8 {
        self.buffer.as_ref()[field::FLAGS]
    }

    /// True when every bit in `flags` is set
    pub fn has_flags(&self, flags: u8) -> bool {
        self.flags() & flags == flags
    }

    pub fn window(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::WINDOW)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::CHECKSUM)
    }

    /// Raw option bytes
    pub fn options(&self) -> &[u8] {
        &self.buffer.as_ref()[TCP_MIN_HEADER_LEN..self.data_offset()]
    }

    /// Segment payload
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.data_offset()..]
    }

    /// Checksum of the whole segment (header, options, payload) under the
    /// IPv4 pseudo-header. Zero when the checksum field is correct.
    pub fn calculate_checksum(&self, src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
        let segment = self.buffer.as_ref();
        // Segment length is bounded by the IPv4 total length field
        #[allow(clippy::cast_possible_truncation)]
        let len = segment.len() as u16;
        !checksum(segment, pseudo_header_checksum(IPPROTO_TCP, src, dst, len))
    }

    pub fn is_checksum_valid(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        self.calculate_checksum(src, dst) == 0
    }

    /// Decode the fixed header fields
    pub fn fields(&self) -> TcpFields {
        #[allow(clippy::cast_possible_truncation)]
        let data_offset = self.data_offset() as u8;
        TcpFields {
            src_port: self.src_port(),
            dst_port: self.dst_port(),
            seq_num: self.seq_number(),
            ack_num: self.ack_number(),
            data_offset,
            flags: self.flags(),
            window: self.window(),
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpHeader<T> {
    /// Write the fixed header; checksum and urgent pointer are zeroed.
    pub fn encode(&mut self, fields: &TcpFields) {
        let data = self.buffer.as_mut();
        write_u16(data, field::SRC_PORT, fields.src_port);
        write_u16(data, field::DST_PORT, fields.dst_port);
        write_u32(data, field::SEQ_NUM, fields.seq_num);
        write_u32(data, field::ACK_NUM, fields.ack_num);
        data[field::DATA_OFFSET] = (fields.data_offset / 4) << 4;
        data[field::FLAGS] = fields.flags;
        write_u16(data, field::WINDOW, fields.window);
        write_u16(data, field::CHECKSUM, 0);
        write_u16(data, field::URGENT, 0);
    }

    pub fn set_checksum(&mut self, value: u16) {
        write_u16(self.buffer.as_mut(), field::CHECKSUM, value);
    }

    /// Compute and store the segment checksum
    pub fn fill_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.set_checksum(0);
        let sum = self.calculate_checksum(src, dst);
        self.set_checksum(sum);
    }
}

/// Parse the options of a SYN or SYN|ACK segment.
///
/// Unknown options are skipped; a malformed option ends parsing and the
/// values seen so far are returned. The timestamp echo reply is only
/// meaningful on a SYN|ACK, so it is left at zero when `is_ack` is false.
#[must_use]
pub fn parse_syn_options(opts: &[u8], is_ack: bool) -> SynOptions {
    let mut parsed = SynOptions::default();
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            option_kind::END => break,
            option_kind::NOP => {
                i += 1;
                continue;
            }
            _ => {}
        }
        if i + 1 >= opts.len() {
            break;
        }
        let kind = opts[i];
        let len = usize::from(opts[i + 1]);
        if len < 2 || i + len > opts.len() {
            break;
        }
        let body = &opts[i + 2..i + len];
        match kind {
            option_kind::MSS if len == MSS_OPTION_LEN => {
                let mss = u16::from_be_bytes([body[0], body[1]]);
                if mss == 0 {
                    break;
                }
                parsed.mss = mss;
            }
            option_kind::WINDOW_SCALE if len == WS_OPTION_LEN => {
                parsed.window_scale = Some(body[0].min(MAX_WINDOW_SCALE));
            }
            option_kind::SACK_PERMITTED if len == SACK_PERMITTED_OPTION_LEN => {
                parsed.sack_permitted = true;
            }
            option_kind::TIMESTAMP if len == TS_OPTION_LEN => {
                let val = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let ecr = if is_ack {
                    u32::from_be_bytes([body[4], body[5], body[6], body[7]])
                } else {
                    0
                };
                parsed.timestamp = Some(Timestamp { val, ecr });
            }
            option_kind::MSS
            | option_kind::WINDOW_SCALE
            | option_kind::SACK_PERMITTED
            | option_kind::TIMESTAMP => break,
            _ => {}
        }
        i += len;
    }
    parsed
}

/// Encode the MSS option, returning bytes written
pub fn encode_mss_option(mss: u16, out: &mut [u8]) -> usize {
    out[0] = option_kind::MSS;
    out[1] = MSS_OPTION_LEN as u8;
    out[2..4].copy_from_slice(&mss.to_be_bytes());
    MSS_OPTION_LEN
}

/// Encode the window scale option, returning bytes written
pub fn encode_ws_option(shift: u8, out: &mut [u8]) -> usize {
    out[0] = option_kind::WINDOW_SCALE;
    out[1] = WS_OPTION_LEN as u8;
    out[2] = shift.min(MAX_WINDOW_SCALE);
    WS_OPTION_LEN
}

/// Encode the SACK-permitted option, returning bytes written
pub fn encode_sack_permitted_option(out: &mut [u8]) -> usize {
    out[0] = option_kind::SACK_PERMITTED;
    out[1] = SACK_PERMITTED_OPTION_LEN as u8;
    SACK_PERMITTED_OPTION_LEN
}

/// Encode the timestamp option, returning bytes written
pub fn encode_ts_option(ts: Timestamp, out: &mut [u8]) -> usize {
    out[0] = option_kind::TIMESTAMP;
    out[1] = TS_OPTION_LEN as u8;
    out[2..6].copy_from_slice(&ts.val.to_be_bytes());
    out[6..10].copy_from_slice(&ts.ecr.to_be_bytes());
    TS_OPTION_LEN
}

/// Encode a single NOP, returning bytes written
pub fn encode_nop(out: &mut [u8]) -> usize {
    out[0] = option_kind::NOP;
    1
}

/// Pad `options[..offset]` with NOPs up to a 4-byte boundary.
///
/// Returns the number of padding bytes added.
pub fn add_option_padding(options: &mut [u8], offset: usize) -> usize {
    let padded = (offset + 3) & !3;
    options[offset..padded].fill(option_kind::NOP);
    padded - offset
}

/// Encode SYN options in Linux order into `out`, returning the padded length.
///
/// # Errors
///
/// Returns `PacketError::BufferTooSmall` if `out` cannot hold the options.
pub fn encode_syn_options(opts: &SynOptions, out: &mut [u8]) -> Result<usize, PacketError> {
    let needed = syn_options_len(opts);
    if out.len() < needed {
        return Err(PacketError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    let mut offset = encode_mss_option(opts.mss, out);

    match (opts.timestamp, opts.sack_permitted) {
        (Some(ts), true) => {
            offset += encode_sack_permitted_option(&mut out[offset..]);
            offset += encode_ts_option(ts, &mut out[offset..]);
        }
        (Some(ts), false) => {
            offset += encode_nop(&mut out[offset..]);
            offset += encode_nop(&mut out[offset..]);
            offset += encode_ts_option(ts, &mut out[offset..]);
        }
        (None, true) => {
            offset += encode_nop(&mut out[offset..]);
            offset += encode_nop(&mut out[offset..]);
            offset += encode_sack_permitted_option(&mut out[offset..]);
        }
        (None, false) => {}
    }

    if let Some(shift) = opts.window_scale {
        offset += encode_nop(&mut out[offset..]);
        offset += encode_ws_option(shift, &mut out[offset..]);
    }

    offset += add_option_padding(out, offset);
    Ok(offset)
}

/// Length of the encoded SYN options, padding included
#[must_use]
pub fn syn_options_len(opts: &SynOptions) -> usize {
    let mut len = MSS_OPTION_LEN;
    len += match (opts.timestamp.is_some(), opts.sack_permitted) {
        (true, true) => SACK_PERMITTED_OPTION_LEN + TS_OPTION_LEN,
        (true, false) => 2 + TS_OPTION_LEN,
        (false, true) => 2 + SACK_PERMITTED_OPTION_LEN,
        (false, false) => 0,
    };
    if opts.window_scale.is_some() {
        len += 1 + WS_OPTION_LEN;
    }
    (len + 3) & !3
}
