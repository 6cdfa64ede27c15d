//! ICMP engine.
//!
//! Echo request/reply and the two error messages the IP engine can provoke
//! (destination-unreachable, time-exceeded). Everything else is silently ignored. Built with
//! `PacketBuilder`, incoming ICMP parsed with `Icmpv4Slice`.

use std::net::Ipv4Addr;

use etherparse::{icmpv4, Icmpv4Slice, Icmpv4Type, PacketBuilder};
use netstack_config::StackConfig;
use netstack_error::{Error, Result};

use crate::packet::Ipv4Packet;

/// `destination-unreachable` codes this stack emits (the RFC 792 §3.1 subset the IP engine needs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unreachable {
    Protocol,
    Port,
}

/// How many bytes of the original datagram RFC 792 asks an ICMP error to quote: the IP header
/// plus the first 8 bytes of its payload.
const QUOTE_LEN: usize = 8;

fn quoted_original(original: &Ipv4Packet) -> Vec<u8> {
    let header_len = original.header().slice().len();
    let payload = original.payload();
    let take = payload.len().min(QUOTE_LEN);
    let mut out = Vec::with_capacity(header_len + take);
    out.extend_from_slice(&original.as_bytes()[..header_len]);
    out.extend_from_slice(&payload[..take]);
    out
}

fn finish(builder: PacketBuilder, payload: &[u8]) -> Result<Ipv4Packet> {
    let mut bytes = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut bytes, payload)
        .map_err(|_| Error::Buffer)?;
    Ipv4Packet::parse(bytes)
}

/// Builds an echo reply for `request`, which must carry an ICMP echo request payload. Swaps
/// source/destination and recomputes both checksums.
pub fn echo_reply(
    config: &StackConfig,
    request: &Ipv4Packet,
    our_addr: Ipv4Addr,
) -> Result<Option<Ipv4Packet>> {
    if !config.icmp_enabled {
        return Ok(None);
    }

    let icmp = match Icmpv4Slice::from_slice(request.payload()) {
        Ok(icmp) => icmp,
        Err(e) => {
            tracing::debug!(error = %e, "malformed ICMP payload, dropping");
            return Ok(None);
        }
    };

    let Icmpv4Type::EchoRequest(echo) = icmp.icmp_type() else {
        return Ok(None);
    };

    let builder = PacketBuilder::ipv4(
        our_addr.octets(),
        request.source().octets(),
        config.ip_default_ttl,
    )
    .icmpv4_echo_reply(echo.id, echo.seq);

    Ok(Some(finish(builder, icmp.payload())?))
}

/// Builds a destination-unreachable message quoting `original`.
pub fn destination_unreachable(
    config: &StackConfig,
    original: &Ipv4Packet,
    our_addr: Ipv4Addr,
    kind: Unreachable,
) -> Result<Option<Ipv4Packet>> {
    if !config.icmp_enabled {
        return Ok(None);
    }

    // Never reply to an ICMP message with an error: avoids ICMP storms between two hosts.
    if original.protocol() == etherparse::IpNumber::ICMP {
        return Ok(None);
    }

    let code = match kind {
        Unreachable::Protocol => icmpv4::DestUnreachableHeader::Protocol,
        Unreachable::Port => icmpv4::DestUnreachableHeader::Port,
    };

    let builder = PacketBuilder::ipv4(
        our_addr.octets(),
        original.source().octets(),
        config.ip_default_ttl,
    )
    .icmpv4(Icmpv4Type::DestinationUnreachable(code));

    Ok(Some(finish(builder, &quoted_original(original))?))
}

/// Builds a time-exceeded (TTL expired in transit, or reassembly timeout) message.
pub fn time_exceeded(
    config: &StackConfig,
    original: &Ipv4Packet,
    our_addr: Ipv4Addr,
) -> Result<Option<Ipv4Packet>> {
    if !config.icmp_enabled || original.protocol() == etherparse::IpNumber::ICMP {
        return Ok(None);
    }

    let builder = PacketBuilder::ipv4(
        our_addr.octets(),
        original.source().octets(),
        config.ip_default_ttl,
    )
    .icmpv4(Icmpv4Type::TimeExceeded(
        icmpv4::TimeExceededCode::TtlExceededInTransit,
    ));

    Ok(Some(finish(builder, &quoted_original(original))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::IpNumber;

    fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Ipv4Packet {
        let builder = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(4000, 7);
        let payload = b"payload12";
        let mut bytes = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut bytes, payload).unwrap();
        Ipv4Packet::parse(bytes).unwrap()
    }

    fn echo_request_packet(src: Ipv4Addr, dst: Ipv4Addr, id: u16, seq: u16) -> Ipv4Packet {
        let builder = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).icmpv4_echo_request(id, seq);
        let payload = b"abc";
        let mut bytes = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut bytes, payload).unwrap();
        Ipv4Packet::parse(bytes).unwrap()
    }

    #[test]
    fn echo_reply_swaps_addresses_and_preserves_id_seq() {
        let config = StackConfig::default();
        let request = echo_request_packet(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1), 7, 1);

        let reply = echo_reply(&config, &request, Ipv4Addr::new(10, 0, 0, 1))
            .unwrap()
            .expect("echo request should produce a reply");

        assert_eq!(reply.source(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reply.destination(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(reply.checksum_ok());

        let icmp = Icmpv4Slice::from_slice(reply.payload()).unwrap();
        assert!(matches!(icmp.icmp_type(), Icmpv4Type::EchoReply(h) if h.id == 7 && h.seq == 1));
        assert_eq!(icmp.payload(), b"abc");
    }

    #[test]
    fn no_error_reply_to_an_icmp_message() {
        let config = StackConfig::default();
        let original = echo_request_packet(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1), 1, 1);

        assert!(time_exceeded(&config, &original, Ipv4Addr::new(10, 0, 0, 1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn disabled_icmp_suppresses_all_replies() {
        let mut config = StackConfig::default();
        config.icmp_enabled = false;
        let original = udp_packet(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));

        assert!(destination_unreachable(
            &config,
            &original,
            Ipv4Addr::new(10, 0, 0, 1),
            Unreachable::Port
        )
        .unwrap()
        .is_none());
    }

    #[test]
    fn destination_unreachable_quotes_original_header_and_first_8_bytes() {
        let config = StackConfig::default();
        let original = udp_packet(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));

        let reply = destination_unreachable(
            &config,
            &original,
            Ipv4Addr::new(10, 0, 0, 1),
            Unreachable::Port,
        )
        .unwrap()
        .unwrap();

        assert_eq!(reply.protocol(), IpNumber::ICMP);
        let icmp = Icmpv4Slice::from_slice(reply.payload()).unwrap();
        assert!(matches!(
            icmp.icmp_type(),
            Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Port)
        ));
        assert_eq!(icmp.payload().len(), original.header().slice().len() + 8);
    }
}
