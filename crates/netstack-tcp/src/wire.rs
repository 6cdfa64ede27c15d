//! On-wire TCP segment parse/build (RFC 793), mirroring `netstack-udp::checksum`'s split between
//! a `*Slice` parse path and a struct-literal build path.

use std::net::Ipv4Addr;

use etherparse::{IpNumber, Ipv4Header, TcpHeader, TcpOptionElement, TcpSlice};
use netstack_error::{Error, Result};

pub struct ParsedSegment<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack_flag: bool,
    pub psh: bool,
    pub window_size: u16,
    pub checksum_ok_against: Option<u16>,
    pub mss: Option<u16>,
    /// RFC 7323 window scale shift count, if the peer sent one (SYN/SYN-ACK only in practice).
    /// Always parsed regardless of `tcp-extended-options`; only the engine's handshake code
    /// decides whether to act on it.
    pub window_scale: Option<u8>,
    /// RFC 7323 `(TSval, TSecr)`, if present.
    pub timestamp: Option<(u32, u32)>,
    pub payload: &'a [u8],
}

pub fn parse<'a>(src: Ipv4Addr, dst: Ipv4Addr, bytes: &'a [u8]) -> Result<ParsedSegment<'a>> {
    let slice = TcpSlice::from_slice(bytes).map_err(|_| Error::Buffer)?;
    let header = slice.header();
    let payload = slice.payload();

    let mut mss = None;
    let mut window_scale = None;
    let mut timestamp = None;
    for opt in header.options_iterator().filter_map(|opt| opt.ok()) {
        match opt {
            TcpOptionElement::MaximumSegmentSize(v) => mss = Some(v),
            TcpOptionElement::WindowScale(v) => window_scale = Some(v),
            TcpOptionElement::Timestamp(tsval, tsecr) => timestamp = Some((tsval, tsecr)),
            // SelectiveAcknowledgementPermitted / SelectiveAcknowledgement: parsed away by
            // `options_iterator` but never acted on — SACK isn't implemented.
            _ => {}
        }
    }

    let checksum_ok = verify_checksum(src, dst, &header.to_header(), payload);

    Ok(ParsedSegment {
        source_port: header.source_port(),
        destination_port: header.destination_port(),
        seq: header.sequence_number(),
        ack: header.acknowledgment_number(),
        syn: header.syn(),
        fin: header.fin(),
        rst: header.rst(),
        ack_flag: header.ack(),
        psh: header.psh(),
        window_size: header.window_size(),
        checksum_ok_against: checksum_ok.then_some(header.checksum()),
        mss,
        window_scale,
        timestamp,
        payload,
    })
}

fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, header: &TcpHeader, payload: &[u8]) -> bool {
    let Ok(ip_header) = Ipv4Header::new(
        header.header_len() as u16 + payload.len() as u16,
        64,
        IpNumber::TCP,
        src.octets(),
        dst.octets(),
    ) else {
        return false;
    };
    header
        .calc_checksum_ipv4(&ip_header, payload)
        .map(|c| c == header.checksum)
        .unwrap_or(false)
}

/// Flags to set on a built segment; most builds only need a handful of these.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
    pub psh: bool,
}

/// Options to attach to a built segment. `window_scale` only makes sense on SYN/SYN-ACK
/// segments; callers outside the handshake leave it `None`. Populated from real negotiated
/// state only when the `tcp-extended-options` feature is on — with it off, every caller
/// passes `Default::default()` and the wire format is unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub timestamp: Option<(u32, u32)>,
}

#[allow(clippy::too_many_arguments)]
pub fn build(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    source_port: u16,
    destination_port: u16,
    seq: u32,
    ack: u32,
    window_size: u16,
    flags: BuildFlags,
    opts: SegmentOptions,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut header = TcpHeader::new(source_port, destination_port, seq, window_size);
    header.acknowledgment_number = ack;
    header.syn = flags.syn;
    header.fin = flags.fin;
    header.rst = flags.rst;
    header.ack = flags.ack;
    header.psh = flags.psh;

    let mut elements = Vec::with_capacity(3);
    if let Some(mss) = opts.mss {
        elements.push(TcpOptionElement::MaximumSegmentSize(mss));
    }
    if let Some(shift) = opts.window_scale {
        elements.push(TcpOptionElement::WindowScale(shift));
    }
    if let Some((tsval, tsecr)) = opts.timestamp {
        elements.push(TcpOptionElement::Timestamp(tsval, tsecr));
    }
    if !elements.is_empty() {
        header.set_options(&elements).map_err(|_| Error::Buffer)?;
    }

    let ip_header = Ipv4Header::new(
        header.header_len() as u16 + payload.len() as u16,
        64,
        IpNumber::TCP,
        src.octets(),
        dst.octets(),
    )
    .map_err(|_| Error::Buffer)?;
    header.checksum = header.calc_checksum_ipv4(&ip_header, payload).map_err(|_| Error::Buffer)?;

    let mut bytes = Vec::with_capacity(header.header_len() as usize + payload.len());
    header.write(&mut bytes).map_err(|_| Error::Buffer)?;
    bytes.extend_from_slice(payload);
    Ok(bytes)
}
