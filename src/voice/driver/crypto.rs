//! Encryption schemes offered during voice protocol selection.
use byteorder::{NetworkEndian, WriteBytesExt};
use crypto_secretbox::{
    AeadInPlace,
    Error as CryptoError,
    Nonce,
    SecretBox,
    Tag,
    XSalsa20Poly1305,
};
use discortp::{rtp::RtpPacket, MutablePacket};
use rand::Rng;
use std::num::Wrapping;

/// Authenticated cipher used for voice media.
pub type Cipher = XSalsa20Poly1305;

/// Length of the Poly1305 tag placed before each encrypted payload.
pub const TAG_SIZE: usize = SecretBox::<()>::TAG_SIZE;

/// Nonce width of the cipher.
pub const NONCE_SIZE: usize = SecretBox::<()>::NONCE_SIZE;

/// Length of the secret key sent in the session description.
pub const KEY_SIZE: usize = SecretBox::<()>::KEY_SIZE;

/// Variants of the XSalsa20Poly1305 encryption scheme.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CryptoMode {
    /// The RTP header, zero-padded to 24B, is the packet's nonce.
    ///
    /// No extra bytes are sent: the sequence number and timestamp are the
    /// varying quantities.
    #[default]
    Normal,
    /// A random 24B nonce is appended to each packet.
    Suffix,
    /// A 4B nonce, incremented once per packet, is appended to each packet.
    Lite,
}

impl CryptoMode {
    /// Name of the mode as it appears during negotiation.
    #[must_use]
    pub fn to_request_str(self) -> &'static str {
        match self {
            CryptoMode::Normal => "xsalsa20_poly1305",
            CryptoMode::Suffix => "xsalsa20_poly1305_suffix",
            CryptoMode::Lite => "xsalsa20_poly1305_lite",
        }
    }

    /// Parses a negotiated mode name.
    #[must_use]
    pub fn from_request_str(name: &str) -> Option<Self> {
        [CryptoMode::Normal, CryptoMode::Suffix, CryptoMode::Lite]
            .into_iter()
            .find(|mode| mode.to_request_str() == name)
    }

    /// Number of bytes each nonce occupies within a packet.
    #[must_use]
    pub fn nonce_size(self) -> usize {
        match self {
            CryptoMode::Normal => RtpPacket::minimum_packet_size(),
            CryptoMode::Suffix => NONCE_SIZE,
            CryptoMode::Lite => 4,
        }
    }

    /// Bytes added by the scheme before the payload.
    #[must_use]
    pub fn payload_prefix_len(self) -> usize {
        TAG_SIZE
    }

    /// Bytes added by the scheme after the payload.
    #[must_use]
    pub fn payload_suffix_len(self) -> usize {
        match self {
            CryptoMode::Normal => 0,
            CryptoMode::Suffix | CryptoMode::Lite => self.nonce_size(),
        }
    }

    /// Total bytes added compared to an unencrypted payload.
    #[must_use]
    pub fn payload_overhead(self) -> usize {
        self.payload_prefix_len() + self.payload_suffix_len()
    }

    /// Splits a packet body into the bytes used as the nonce, and the tag+payload.
    fn nonce_slice<'a>(
        self,
        header: &'a [u8],
        body: &'a mut [u8],
    ) -> Result<(&'a [u8], &'a mut [u8]), CryptoError> {
        match self {
            CryptoMode::Normal => Ok((header, body)),
            CryptoMode::Suffix | CryptoMode::Lite => {
                let len = body.len();
                if len < self.payload_suffix_len() {
                    Err(CryptoError)
                } else {
                    let (body_left, nonce_loc) = body.split_at_mut(len - self.payload_suffix_len());
                    Ok((&nonce_loc[..self.nonce_size()], body_left))
                }
            },
        }
    }

    fn expand_nonce(self, slice: &[u8]) -> Nonce {
        let mut nonce = Nonce::default();
        let len = slice.len().min(NONCE_SIZE);
        nonce[..len].copy_from_slice(&slice[..len]);
        nonce
    }

    /// Encrypts the payload of an RTP packet in place.
    ///
    /// `payload_len` counts every byte after the header: tag space, Opus data,
    /// and any nonce already written by [`CryptoState::write_packet_nonce`].
    pub fn encrypt_in_place(
        self,
        packet: &mut impl MutablePacket,
        cipher: &Cipher,
        payload_len: usize,
    ) -> Result<(), CryptoError> {
        let header_len = packet.packet().len() - packet.payload().len();
        let (header, body) = packet.packet_mut().split_at_mut(header_len);

        if payload_len > body.len() {
            return Err(CryptoError);
        }

        let (nonce_bytes, body_remaining) = self.nonce_slice(header, &mut body[..payload_len])?;
        let nonce = self.expand_nonce(nonce_bytes);

        if body_remaining.len() < TAG_SIZE {
            return Err(CryptoError);
        }

        let tag = cipher.encrypt_in_place_detached(&nonce, b"", &mut body_remaining[TAG_SIZE..])?;
        body_remaining[..TAG_SIZE].copy_from_slice(&tag[..]);

        Ok(())
    }

    /// Decrypts the payload of an RTP packet in place.
    ///
    /// Returns the number of bytes to ignore at the start and end of the payload.
    pub fn decrypt_in_place(
        self,
        packet: &mut impl MutablePacket,
        cipher: &Cipher,
    ) -> Result<(usize, usize), CryptoError> {
        let header_len = packet.packet().len() - packet.payload().len();
        let (header, body) = packet.packet_mut().split_at_mut(header_len);
        let (nonce_bytes, body_remaining) = self.nonce_slice(header, body)?;
        let nonce = self.expand_nonce(nonce_bytes);

        let body_start = self.payload_prefix_len();
        let body_tail = self.payload_suffix_len();

        if body_start > body_remaining.len() {
            return Err(CryptoError);
        }

        let (tag_bytes, data_bytes) = body_remaining.split_at_mut(body_start);
        let tag = Tag::from_slice(tag_bytes);

        cipher
            .decrypt_in_place_detached(&nonce, b"", data_bytes, tag)
            .map(|_| (body_start, body_tail))
    }
}

/// A [`CryptoMode`] plus any per-packet state it needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CryptoState {
    /// See [`CryptoMode::Normal`].
    Normal,
    /// See [`CryptoMode::Suffix`].
    Suffix,
    /// See [`CryptoMode::Lite`], holding the next nonce.
    Lite(Wrapping<u32>),
}

impl From<CryptoMode> for CryptoState {
    fn from(val: CryptoMode) -> Self {
        match val {
            CryptoMode::Normal => CryptoState::Normal,
            CryptoMode::Suffix => CryptoState::Suffix,
            CryptoMode::Lite => CryptoState::Lite(Wrapping(rand::random::<u32>())),
        }
    }
}

impl CryptoState {
    /// Writes the packet nonce after the payload, if the mode needs one.
    ///
    /// Returns the new payload length.
    pub fn write_packet_nonce(
        &mut self,
        packet: &mut impl MutablePacket,
        payload_end: usize,
    ) -> usize {
        let endpoint = payload_end + self.kind().payload_suffix_len();

        match self {
            CryptoState::Suffix => {
                rand::thread_rng().fill(&mut packet.payload_mut()[payload_end..endpoint]);
            },
            CryptoState::Lite(i) => {
                (&mut packet.payload_mut()[payload_end..endpoint])
                    .write_u32::<NetworkEndian>(i.0)
                    .expect("Nonce size is guaranteed to be sufficient to write u32 for lite tagging.");
                *i += Wrapping(1);
            },
            CryptoState::Normal => {},
        }

        endpoint
    }

    /// The stateless mode in use.
    #[must_use]
    pub fn kind(&self) -> CryptoMode {
        match self {
            CryptoState::Normal => CryptoMode::Normal,
            CryptoState::Suffix => CryptoMode::Suffix,
            CryptoState::Lite(_) => CryptoMode::Lite,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crypto_secretbox::KeyInit;
    use discortp::{rtp::MutableRtpPacket, Packet};

    const MODES: [CryptoMode; 3] = [CryptoMode::Normal, CryptoMode::Suffix, CryptoMode::Lite];

    #[test]
    fn small_packet_decrypts_error() {
        let mut buf = [0u8; RtpPacket::minimum_packet_size()];
        let mut pkt = MutableRtpPacket::new(&mut buf[..]).unwrap();
        let cipher = Cipher::new_from_slice(&[1u8; KEY_SIZE]).unwrap();

        for mode in MODES {
            assert!(mode.decrypt_in_place(&mut pkt, &cipher).is_err());
        }
    }

    #[test]
    fn symmetric_encrypt_decrypt() {
        const TRUE_PAYLOAD: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let cipher = Cipher::new_from_slice(&[7u8; KEY_SIZE]).unwrap();

        for mode in MODES {
            let mut buf =
                [0u8; RtpPacket::minimum_packet_size() + TRUE_PAYLOAD.len() + TAG_SIZE + NONCE_SIZE];
            let mut pkt = MutableRtpPacket::new(&mut buf[..]).unwrap();
            pkt.set_sequence(77.into());
            let mut crypto_state = CryptoState::from(mode);
            pkt.payload_mut()[TAG_SIZE..TAG_SIZE + TRUE_PAYLOAD.len()]
                .copy_from_slice(&TRUE_PAYLOAD[..]);

            let final_payload_size =
                crypto_state.write_packet_nonce(&mut pkt, TAG_SIZE + TRUE_PAYLOAD.len());
            assert_eq!(final_payload_size, TRUE_PAYLOAD.len() + mode.payload_overhead());

            mode.encrypt_in_place(&mut pkt, &cipher, final_payload_size)
                .unwrap();
            assert_ne!(
                &pkt.payload()[TAG_SIZE..TAG_SIZE + TRUE_PAYLOAD.len()],
                &TRUE_PAYLOAD[..]
            );

            let final_pkt_len = RtpPacket::minimum_packet_size() + final_payload_size;
            let mut pkt = MutableRtpPacket::new(&mut buf[..final_pkt_len]).unwrap();
            let (start, end) = mode.decrypt_in_place(&mut pkt, &cipher).unwrap();

            let payload = pkt.payload();
            assert_eq!(&payload[start..payload.len() - end], &TRUE_PAYLOAD[..]);
        }
    }

    #[test]
    fn lite_nonce_increments_per_packet() {
        let mut state = CryptoState::Lite(Wrapping(u32::MAX));
        let mut buf = [0u8; 64];

        for expected in [u32::MAX, 0, 1] {
            let mut pkt = MutableRtpPacket::new(&mut buf[..]).unwrap();
            let end = state.write_packet_nonce(&mut pkt, TAG_SIZE);
            assert_eq!(end, TAG_SIZE + 4);
            assert_eq!(&pkt.payload()[TAG_SIZE..end], &expected.to_be_bytes());
        }
    }

    #[test]
    fn mode_names_round_trip() {
        for mode in MODES {
            assert_eq!(CryptoMode::from_request_str(mode.to_request_str()), Some(mode));
        }
        assert_eq!(CryptoMode::from_request_str("aead_aes256_gcm"), None);
    }
}
