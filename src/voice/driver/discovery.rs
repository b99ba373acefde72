//! External IP discovery, used to learn the address Discord sees for our UDP socket.

use super::connection::error::{Error, Result};
use crate::constants::{IP_DISCOVERY_BODY_LEN, IP_DISCOVERY_LEN};
use discortp::discord::{IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket};
use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

/// Builds the 74-byte discovery request for `ssrc`.
#[must_use]
pub fn request(ssrc: u32) -> [u8; IP_DISCOVERY_LEN] {
    let mut bytes = [0; IP_DISCOVERY_LEN];
    {
        let mut view = MutableIpDiscoveryPacket::new(&mut bytes[..]).expect(
            "Too few bytes in 'bytes' for IPDiscovery packet.\
                (Blame: IP_DISCOVERY_LEN?)",
        );
        view.set_pkt_type(IpDiscoveryType::Request);
        view.set_length(IP_DISCOVERY_BODY_LEN);
        view.set_ssrc(ssrc);
    }

    bytes
}

/// Extracts the external address and port from a discovery response.
pub fn parse_response(bytes: &[u8]) -> Result<SocketAddr> {
    let view = IpDiscoveryPacket::new(bytes).ok_or(Error::IllegalDiscoveryResponse)?;

    if view.get_pkt_type() != IpDiscoveryType::Response {
        return Err(Error::IllegalDiscoveryResponse);
    }

    // UDP spoofing means the tail of the address field cannot be trusted to be
    // all '\0's: take the first one.
    let raw = view.get_address_raw();
    let nul_byte_index = raw.iter().position(|&b| b == 0).ok_or(Error::IllegalIp)?;

    let address_str = std::str::from_utf8(&raw[..nul_byte_index]).map_err(|_| Error::IllegalIp)?;
    let address = IpAddr::from_str(address_str).map_err(|_| Error::IllegalIp)?;

    Ok(SocketAddr::new(address, view.get_port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(ip: &str, port: u16) -> [u8; IP_DISCOVERY_LEN] {
        let mut bytes = [0u8; IP_DISCOVERY_LEN];
        bytes[..2].copy_from_slice(&2u16.to_be_bytes());
        bytes[2..4].copy_from_slice(&IP_DISCOVERY_BODY_LEN.to_be_bytes());
        bytes[4..8].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        bytes[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
        bytes[72..].copy_from_slice(&port.to_be_bytes());
        bytes
    }

    #[test]
    fn request_layout() {
        let bytes = request(0x0102_0304);
        assert_eq!(bytes.len(), 74);
        assert_eq!(&bytes[..8], &[0, 1, 0, 70, 1, 2, 3, 4]);
        assert!(bytes[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn address_is_read_up_to_nul() {
        let addr = parse_response(&response("203.0.113.57", 50_004)).unwrap();
        assert_eq!(addr, "203.0.113.57:50004".parse().unwrap());
    }

    #[test]
    fn garbage_after_nul_is_ignored() {
        let mut bytes = response("10.0.0.1", 1);
        bytes[30] = b'x';
        assert_eq!(parse_response(&bytes).unwrap().ip().to_string(), "10.0.0.1");
    }

    #[test]
    fn bad_responses_are_rejected() {
        let mut wrong_type = response("10.0.0.1", 1);
        wrong_type[1] = 1;
        assert!(matches!(
            parse_response(&wrong_type),
            Err(Error::IllegalDiscoveryResponse)
        ));

        assert!(matches!(
            parse_response(&[0, 2, 0]),
            Err(Error::IllegalDiscoveryResponse)
        ));

        let mut no_nul = response("", 1);
        no_nul[8..72].fill(b'1');
        assert!(matches!(parse_response(&no_nul), Err(Error::IllegalIp)));

        assert!(matches!(
            parse_response(&response("not-an-ip", 1)),
            Err(Error::IllegalIp)
        ));
    }
}
