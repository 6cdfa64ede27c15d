//! An owned, contiguous IPv4 datagram with header accessors and checksum maintenance.
//!
//! A thin wrapper around a byte buffer plus `etherparse` header slices, rather than a
//! hand-rolled binary parser. IPv4-only, and not pool-backed — reassembly and fragmentation
//! already need contiguous, independently owned buffers, so a plain `Vec<u8>` is the simplest
//! correct representation.

use std::net::Ipv4Addr;

use etherparse::{IpNumber, Ipv4Header, Ipv4HeaderSlice};
use netstack_error::{Error, Result};

/// The maximum IPv4 datagram size this stack will construct or accept (matches the historical
/// `65535` wire limit; fragmentation keeps individual frames under the interface MTU).
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    bytes: Vec<u8>,
}

impl Ipv4Packet {
    /// Parses and validates `bytes` as an IPv4 datagram. Checksum is *not* verified here (the
    /// caller — the IP engine's `input` — does that explicitly so it can count the failure
    /// distinctly from "malformed").
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        Ipv4HeaderSlice::from_slice(&bytes).map_err(|e| {
            tracing::debug!(error = %e, "malformed IPv4 header");
            Error::Buffer
        })?;

        Ok(Self { bytes })
    }

    pub fn header(&self) -> Ipv4HeaderSlice<'_> {
        Ipv4HeaderSlice::from_slice(&self.bytes).expect("validated in `parse`")
    }

    pub fn header_owned(&self) -> Ipv4Header {
        self.header().to_header()
    }

    pub fn source(&self) -> Ipv4Addr {
        self.header().source_addr()
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.header().destination_addr()
    }

    pub fn protocol(&self) -> IpNumber {
        self.header().protocol()
    }

    pub fn ttl(&self) -> u8 {
        self.header().ttl()
    }

    pub fn identification(&self) -> u16 {
        self.header().identification()
    }

    pub fn dont_fragment(&self) -> bool {
        self.header().dont_fragment()
    }

    pub fn more_fragments(&self) -> bool {
        self.header().more_fragments()
    }

    pub fn fragment_offset(&self) -> u16 {
        self.header().fragments_offset()
    }

    pub fn is_fragmented(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    fn header_len(&self) -> usize {
        self.header().slice().len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header_len()..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn checksum_ok(&self) -> bool {
        self.header().to_header().calc_header_checksum() == self.header().header_checksum()
    }

    /// Recomputes and writes the header checksum in place.
    pub fn fix_checksum(&mut self) {
        let mut header = self.header_owned();
        header.header_checksum = header.calc_header_checksum();
        header
            .write(&mut &mut self.bytes[..header.header_len()])
            .expect("header slice is exactly header_len bytes");
    }

    /// Decrements TTL by one and incrementally updates the header checksum per RFC 1141, then
    /// falls back to a full recompute (simplicity over micro-optimization; both are correct).
    pub fn decrement_ttl(&mut self) -> Result<()> {
        if self.ttl() == 0 {
            return Err(Error::IllegalOperation);
        }

        let new_ttl = self.ttl() - 1;
        let header_len = self.header_len();
        self.bytes[8] = new_ttl;
        let mut header = Ipv4HeaderSlice::from_slice(&self.bytes[..header_len])
            .expect("still valid")
            .to_header();
        header.header_checksum = header.calc_header_checksum();
        header
            .write(&mut &mut self.bytes[..header_len])
            .expect("header slice is exactly header_len bytes");

        Ok(())
    }

    /// Builds a fresh IPv4 datagram with the given header fields and payload, computing the
    /// header checksum.
    pub fn build(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        ttl: u8,
        id: u16,
        dont_fragment: bool,
        more_fragments: bool,
        fragment_offset: u16,
        protocol: IpNumber,
        payload: &[u8],
    ) -> Result<Self> {
        let mut header = Ipv4Header::new(payload.len() as u16, ttl, protocol, src.octets(), dst.octets())
            .map_err(|_| Error::Buffer)?;
        header.identification = id;
        header.dont_fragment = dont_fragment;
        header.more_fragments = more_fragments;
        header.fragments_offset = fragment_offset;
        header.header_checksum = header.calc_header_checksum();

        let mut bytes = Vec::with_capacity(header.header_len() + payload.len());
        header.write(&mut bytes).map_err(|_| Error::Buffer)?;
        bytes.extend_from_slice(payload);

        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_round_trips() {
        let packet = Ipv4Packet::build(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            64,
            7,
            true,
            false,
            0,
            IpNumber::UDP,
            b"hello",
        )
        .unwrap();

        let parsed = Ipv4Packet::parse(packet.into_bytes()).unwrap();
        assert_eq!(parsed.source(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.destination(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parsed.payload(), b"hello");
        assert!(parsed.checksum_ok());
    }

    #[test]
    fn decrement_ttl_keeps_checksum_valid() {
        let mut packet = Ipv4Packet::build(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            2,
            1,
            false,
            false,
            0,
            IpNumber::UDP,
            b"x",
        )
        .unwrap();

        packet.decrement_ttl().unwrap();
        assert_eq!(packet.ttl(), 1);
        assert!(packet.checksum_ok());

        packet.decrement_ttl().unwrap();
        assert_eq!(packet.ttl(), 0);
        assert!(matches!(packet.decrement_ttl(), Err(Error::IllegalOperation)));
    }
}
