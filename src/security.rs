//! RMCP+ security algorithms and the per-session security context.
//!
//! Each algorithm family is a closed enum. A [`CipherSuite`] bundles one
//! algorithm of each family and is validated once, when it is built; a
//! [`SecurityContext`] pairs a suite with keys of the lengths the suite
//! expects. Packet processing never re-validates either.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{
    SecretBytes, aes128_cbc_decrypt, aes128_cbc_encrypt, hmac_md5, hmac_sha1, hmac_sha256,
    md5_128, normalize_key,
};
use crate::error::{Error, Result};

const AES_BLOCK_LEN: usize = 16;

// K1/K2 derivation constants are 20 bytes for every authentication algorithm.
const KEY_CONSTANT_LEN: usize = 20;

/// Authentication algorithm negotiated during Open Session (RAKP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationAlgorithm {
    /// RAKP-none: no key exchange authentication.
    None,
    /// RAKP-HMAC-SHA1.
    RakpHmacSha1,
    /// RAKP-HMAC-MD5.
    RakpHmacMd5,
    /// RAKP-HMAC-SHA256.
    RakpHmacSha256,
}

impl AuthenticationAlgorithm {
    /// Algorithm number used on the wire.
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::RakpHmacSha1 => 0x01,
            Self::RakpHmacMd5 => 0x02,
            Self::RakpHmacSha256 => 0x03,
        }
    }

    /// Length of the key exchange authentication code (full HMAC output).
    pub fn digest_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::RakpHmacSha1 => 20,
            Self::RakpHmacMd5 => 16,
            Self::RakpHmacSha256 => 32,
        }
    }

    /// Length of the RAKP Message 4 integrity check value.
    pub fn icv_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::RakpHmacSha1 => 12,
            Self::RakpHmacMd5 => 16,
            Self::RakpHmacSha256 => 16,
        }
    }

    pub(crate) fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        Ok(match self {
            Self::None => Vec::new(),
            Self::RakpHmacSha1 => hmac_sha1(key, data)?.to_vec(),
            Self::RakpHmacMd5 => hmac_md5(key, data)?.to_vec(),
            Self::RakpHmacSha256 => hmac_sha256(key, data)?.to_vec(),
        })
    }
}

impl TryFrom<u8> for AuthenticationAlgorithm {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::RakpHmacSha1),
            0x02 => Ok(Self::RakpHmacMd5),
            0x03 => Ok(Self::RakpHmacSha256),
            _ => Err(Error::Unsupported("unknown authentication algorithm")),
        }
    }
}

/// Integrity algorithm protecting session packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrityAlgorithm {
    /// No integrity protection.
    None,
    /// HMAC-SHA1 truncated to 96 bits.
    HmacSha1_96,
    /// HMAC-MD5, 128 bits.
    HmacMd5_128,
    /// MD5 over key, data and key, 128 bits.
    Md5_128,
    /// HMAC-SHA256 truncated to 128 bits.
    HmacSha256_128,
}

impl IntegrityAlgorithm {
    /// Algorithm number used on the wire.
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::HmacSha1_96 => 0x01,
            Self::HmacMd5_128 => 0x02,
            Self::Md5_128 => 0x03,
            Self::HmacSha256_128 => 0x04,
        }
    }

    /// Length of the integrity key this algorithm expects.
    pub fn key_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::HmacSha1_96 => 20,
            Self::HmacMd5_128 | Self::Md5_128 => 16,
            Self::HmacSha256_128 => 32,
        }
    }

    /// Length of the authentication code appended to each packet.
    pub fn auth_code_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::HmacSha1_96 => 12,
            Self::HmacMd5_128 | Self::Md5_128 | Self::HmacSha256_128 => 16,
        }
    }
}

impl TryFrom<u8> for IntegrityAlgorithm {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::HmacSha1_96),
            0x02 => Ok(Self::HmacMd5_128),
            0x03 => Ok(Self::Md5_128),
            0x04 => Ok(Self::HmacSha256_128),
            _ => Err(Error::Unsupported("unknown integrity algorithm")),
        }
    }
}

/// Confidentiality algorithm encrypting session payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfidentialityAlgorithm {
    /// Payloads are sent in the clear.
    None,
    /// AES-128 in CBC mode with a per-packet IV.
    AesCbc128,
}

impl ConfidentialityAlgorithm {
    /// Algorithm number used on the wire.
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::AesCbc128 => 0x01,
        }
    }

    /// Length of the confidentiality key this algorithm expects.
    pub fn key_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::AesCbc128 => 16,
        }
    }
}

impl TryFrom<u8> for ConfidentialityAlgorithm {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::AesCbc128),
            0x02 | 0x03 => Err(Error::Unsupported("xRC4 confidentiality is not supported")),
            _ => Err(Error::Unsupported("unknown confidentiality algorithm")),
        }
    }
}

/// A validated (authentication, integrity, confidentiality) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSuite {
    authentication: AuthenticationAlgorithm,
    integrity: IntegrityAlgorithm,
    confidentiality: ConfidentialityAlgorithm,
}

impl CipherSuite {
    /// RAKP-HMAC-SHA1 / HMAC-SHA1-96 / AES-CBC-128 (cipher suite 3).
    pub const SHA1_AES: Self = Self {
        authentication: AuthenticationAlgorithm::RakpHmacSha1,
        integrity: IntegrityAlgorithm::HmacSha1_96,
        confidentiality: ConfidentialityAlgorithm::AesCbc128,
    };

    /// RAKP-HMAC-SHA256 / HMAC-SHA256-128 / AES-CBC-128 (cipher suite 17).
    pub const SHA256_AES: Self = Self {
        authentication: AuthenticationAlgorithm::RakpHmacSha256,
        integrity: IntegrityAlgorithm::HmacSha256_128,
        confidentiality: ConfidentialityAlgorithm::AesCbc128,
    };

    /// Combine three algorithms, rejecting combinations that cannot work.
    pub fn new(
        authentication: AuthenticationAlgorithm,
        integrity: IntegrityAlgorithm,
        confidentiality: ConfidentialityAlgorithm,
    ) -> Result<Self> {
        use AuthenticationAlgorithm as A;
        use IntegrityAlgorithm as I;

        if authentication == A::None && integrity != I::None {
            return Err(Error::InvalidArgument(
                "integrity requires an authentication algorithm",
            ));
        }
        if integrity == I::None && confidentiality != ConfidentialityAlgorithm::None {
            return Err(Error::InvalidArgument(
                "confidentiality requires an integrity algorithm",
            ));
        }
        let hash_matches = match integrity {
            I::None | I::Md5_128 => true,
            I::HmacSha1_96 => authentication == A::RakpHmacSha1,
            I::HmacMd5_128 => authentication == A::RakpHmacMd5,
            I::HmacSha256_128 => authentication == A::RakpHmacSha256,
        };
        if !hash_matches {
            return Err(Error::InvalidArgument(
                "HMAC integrity must use the authentication hash",
            ));
        }

        Ok(Self {
            authentication,
            integrity,
            confidentiality,
        })
    }

    /// Look up one of the standard cipher suite ids (0 to 17).
    pub fn from_id(id: u8) -> Result<Self> {
        use AuthenticationAlgorithm as A;
        use ConfidentialityAlgorithm as C;
        use IntegrityAlgorithm as I;

        let (a, i, c) = match id {
            0 => (A::None, I::None, C::None),
            1 => (A::RakpHmacSha1, I::None, C::None),
            2 => (A::RakpHmacSha1, I::HmacSha1_96, C::None),
            3 => (A::RakpHmacSha1, I::HmacSha1_96, C::AesCbc128),
            6 => (A::RakpHmacMd5, I::None, C::None),
            7 => (A::RakpHmacMd5, I::HmacMd5_128, C::None),
            8 => (A::RakpHmacMd5, I::HmacMd5_128, C::AesCbc128),
            11 => (A::RakpHmacMd5, I::Md5_128, C::None),
            12 => (A::RakpHmacMd5, I::Md5_128, C::AesCbc128),
            15 => (A::RakpHmacSha256, I::None, C::None),
            16 => (A::RakpHmacSha256, I::HmacSha256_128, C::None),
            17 => (A::RakpHmacSha256, I::HmacSha256_128, C::AesCbc128),
            4 | 5 | 9 | 10 | 13 | 14 => {
                return Err(Error::Unsupported(
                    "cipher suite uses xRC4 confidentiality",
                ));
            }
            _ => return Err(Error::Unsupported("unknown cipher suite id")),
        };
        Self::new(a, i, c)
    }

    /// Authentication algorithm.
    pub fn authentication(&self) -> AuthenticationAlgorithm {
        self.authentication
    }

    /// Integrity algorithm.
    pub fn integrity(&self) -> IntegrityAlgorithm {
        self.integrity
    }

    /// Confidentiality algorithm.
    pub fn confidentiality(&self) -> ConfidentialityAlgorithm {
        self.confidentiality
    }

    /// Suites offered during Open Session when the caller does not pin one,
    /// strongest first.
    pub(crate) fn fallback_order(authentication: AuthenticationAlgorithm) -> Vec<Self> {
        use ConfidentialityAlgorithm as C;
        use IntegrityAlgorithm as I;

        let integrity = match authentication {
            AuthenticationAlgorithm::None => I::None,
            AuthenticationAlgorithm::RakpHmacSha1 => I::HmacSha1_96,
            AuthenticationAlgorithm::RakpHmacMd5 => I::HmacMd5_128,
            AuthenticationAlgorithm::RakpHmacSha256 => I::HmacSha256_128,
        };
        [
            (integrity, C::AesCbc128),
            (integrity, C::None),
            (I::None, C::None),
        ]
        .into_iter()
        .filter_map(|(i, c)| Self::new(authentication, i, c).ok())
        .fold(Vec::new(), |mut acc, suite| {
            if !acc.contains(&suite) {
                acc.push(suite);
            }
            acc
        })
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        Self::SHA1_AES
    }
}

/// Keys and algorithms applied to every packet of one session.
///
/// The context is immutable once built; key lengths are checked here so
/// packet assembly never has to.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    suite: CipherSuite,
    integrity_key: SecretBytes,
    confidentiality_key: SecretBytes,
}

impl SecurityContext {
    /// Build a context from explicit keys.
    ///
    /// Keys for algorithms set to none are ignored; any other key must have
    /// exactly the length its algorithm expects.
    pub fn new(
        suite: CipherSuite,
        integrity_key: &[u8],
        confidentiality_key: &[u8],
    ) -> Result<Self> {
        let integrity_key = match suite.integrity {
            IntegrityAlgorithm::None => SecretBytes::empty(),
            alg if integrity_key.len() == alg.key_len() => {
                SecretBytes::new(integrity_key.to_vec())
            }
            _ => return Err(Error::InvalidArgument("integrity key has the wrong length")),
        };
        let confidentiality_key = match suite.confidentiality {
            ConfidentialityAlgorithm::None => SecretBytes::empty(),
            alg if confidentiality_key.len() == alg.key_len() => {
                SecretBytes::new(confidentiality_key.to_vec())
            }
            _ => {
                return Err(Error::InvalidArgument(
                    "confidentiality key has the wrong length",
                ));
            }
        };

        Ok(Self {
            suite,
            integrity_key,
            confidentiality_key,
        })
    }

    /// Derive session keys from the Session Integrity Key.
    ///
    /// `K1 = HMAC(SIK, 0x01 * 20)` keys HMAC integrity, `K2 = HMAC(SIK,
    /// 0x02 * 20)` truncated to 16 bytes keys AES. MD5-128 integrity is keyed
    /// with the user password instead.
    pub(crate) fn derive(suite: CipherSuite, sik: &[u8], password: &SecretBytes) -> Result<Self> {
        let auth = suite.authentication;

        let integrity_key = Zeroizing::new(match suite.integrity {
            IntegrityAlgorithm::None => Vec::new(),
            IntegrityAlgorithm::Md5_128 => password.to_key::<16>().to_vec(),
            _ => auth.hmac(sik, &[0x01; KEY_CONSTANT_LEN])?,
        });
        let confidentiality_key = Zeroizing::new(match suite.confidentiality {
            ConfidentialityAlgorithm::None => Vec::new(),
            ConfidentialityAlgorithm::AesCbc128 => {
                let k2 = auth.hmac(sik, &[0x02; KEY_CONSTANT_LEN])?;
                k2.get(..AES_BLOCK_LEN)
                    .ok_or(Error::Crypto("K2 shorter than an AES key"))?
                    .to_vec()
            }
        });

        Self::new(suite, &integrity_key, &confidentiality_key)
    }

    /// Negotiated cipher suite.
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Whether packets of this session carry an authentication code.
    pub fn integrity_enabled(&self) -> bool {
        self.suite.integrity != IntegrityAlgorithm::None
    }

    /// Whether payloads of this session are encrypted.
    pub fn confidentiality_enabled(&self) -> bool {
        self.suite.confidentiality != ConfidentialityAlgorithm::None
    }

    pub(crate) fn auth_code_len(&self) -> usize {
        self.suite.integrity.auth_code_len()
    }

    /// Authentication code over the range from the session auth type through
    /// the trailer's next header byte.
    pub(crate) fn auth_code(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.integrity_key.expose();
        let mut code = match self.suite.integrity {
            IntegrityAlgorithm::None => return Ok(Vec::new()),
            IntegrityAlgorithm::HmacSha1_96 => hmac_sha1(key, data)?.to_vec(),
            IntegrityAlgorithm::HmacMd5_128 => hmac_md5(key, data)?.to_vec(),
            IntegrityAlgorithm::Md5_128 => md5_128(&normalize_key::<16>(key), data).to_vec(),
            IntegrityAlgorithm::HmacSha256_128 => hmac_sha256(key, data)?.to_vec(),
        };
        code.truncate(self.auth_code_len());
        Ok(code)
    }

    /// Encrypt a payload with a fresh random IV.
    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; AES_BLOCK_LEN];
        rand::rng().fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, &iv)
    }

    /// Encrypt a payload: `iv || AES-CBC(payload || 1, 2, .. || pad_len)`.
    pub(crate) fn encrypt_with_iv(&self, plaintext: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>> {
        match self.suite.confidentiality {
            ConfidentialityAlgorithm::None => Ok(plaintext.to_vec()),
            ConfidentialityAlgorithm::AesCbc128 => {
                let key: [u8; 16] = self.confidentiality_key.to_key();

                let base = plaintext.len() + 1;
                let pad_len = (AES_BLOCK_LEN - base % AES_BLOCK_LEN) % AES_BLOCK_LEN;

                let mut block = Vec::with_capacity(base + pad_len);
                block.extend_from_slice(plaintext);
                block.extend((1..=pad_len).map(|i| i as u8));
                block.push(pad_len as u8);

                let ciphertext = aes128_cbc_encrypt(&key, iv, &block)?;
                let mut out = Vec::with_capacity(AES_BLOCK_LEN + ciphertext.len());
                out.extend_from_slice(iv);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Reverse [`Self::encrypt`], checking the confidentiality trailer.
    pub(crate) fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.suite.confidentiality {
            ConfidentialityAlgorithm::None => Ok(payload.to_vec()),
            ConfidentialityAlgorithm::AesCbc128 => {
                let key: [u8; 16] = self.confidentiality_key.to_key();

                let (iv, ciphertext) = payload
                    .split_first_chunk::<AES_BLOCK_LEN>()
                    .ok_or(Error::Protocol("encrypted payload too short"))?;
                if ciphertext.is_empty() || !ciphertext.len().is_multiple_of(AES_BLOCK_LEN) {
                    return Err(Error::Protocol("invalid AES-CBC ciphertext length"));
                }

                let mut plaintext = aes128_cbc_decrypt(&key, iv, ciphertext)?;
                let pad_len = *plaintext
                    .last()
                    .ok_or(Error::Protocol("missing confidentiality pad length"))?
                    as usize;
                if pad_len >= AES_BLOCK_LEN || pad_len > plaintext.len() - 1 {
                    return Err(Error::Protocol("invalid confidentiality pad length"));
                }

                let data_end = plaintext.len() - 1 - pad_len;
                let pad = &plaintext[data_end..plaintext.len() - 1];
                if pad.iter().enumerate().any(|(i, &b)| b != i as u8 + 1) {
                    return Err(Error::Protocol("invalid confidentiality pad bytes"));
                }

                plaintext.truncate(data_end);
                Ok(plaintext)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_suite_table() {
        let suite = CipherSuite::from_id(3).expect("suite 3");
        assert_eq!(suite, CipherSuite::SHA1_AES);

        let suite = CipherSuite::from_id(12).expect("suite 12");
        assert_eq!(suite.authentication(), AuthenticationAlgorithm::RakpHmacMd5);
        assert_eq!(suite.integrity(), IntegrityAlgorithm::Md5_128);

        assert_eq!(CipherSuite::from_id(17).expect("17"), CipherSuite::SHA256_AES);

        for id in [4, 5, 9, 10, 13, 14, 18, 0xFF] {
            assert!(matches!(
                CipherSuite::from_id(id),
                Err(Error::Unsupported(_))
            ));
        }
    }

    #[test]
    fn incoherent_suites_are_rejected() {
        use AuthenticationAlgorithm as A;
        use ConfidentialityAlgorithm as C;
        use IntegrityAlgorithm as I;

        assert!(CipherSuite::new(A::None, I::HmacSha1_96, C::None).is_err());
        assert!(CipherSuite::new(A::RakpHmacSha1, I::None, C::AesCbc128).is_err());
        assert!(CipherSuite::new(A::RakpHmacSha1, I::HmacSha256_128, C::None).is_err());
        assert!(CipherSuite::new(A::RakpHmacSha256, I::Md5_128, C::None).is_ok());
    }

    #[test]
    fn xrc4_is_recognized_but_unsupported() {
        assert!(matches!(
            ConfidentialityAlgorithm::try_from(0x02),
            Err(Error::Unsupported("xRC4 confidentiality is not supported"))
        ));
        assert!(matches!(
            IntegrityAlgorithm::try_from(0x05),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn key_length_mismatch_fails_at_construction() {
        let err = SecurityContext::new(CipherSuite::SHA1_AES, &[0u8; 16], &[0u8; 16]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = SecurityContext::new(CipherSuite::SHA1_AES, &[0u8; 20], &[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let none = CipherSuite::from_id(0).expect("suite 0");
        SecurityContext::new(none, &[1, 2, 3], &[]).expect("keys ignored for none");
    }

    #[test]
    fn aes_payload_round_trip_and_padding() {
        let ctx = SecurityContext::new(CipherSuite::SHA1_AES, &[0x11; 20], &[0x22; 16])
            .expect("context");

        for len in [0usize, 1, 14, 15, 16, 31] {
            let plaintext: Vec<u8> = (0..len as u8).collect();
            let sealed = ctx.encrypt_with_iv(&plaintext, &[0x33; 16]).expect("encrypt");
            assert_eq!(sealed.len() % 16, 0);
            assert_eq!(&sealed[..16], &[0x33; 16]);
            assert_eq!(ctx.decrypt(&sealed).expect("decrypt"), plaintext);
        }
    }

    #[test]
    fn decrypt_rejects_short_payload() {
        let ctx = SecurityContext::new(CipherSuite::SHA1_AES, &[0x11; 20], &[0x22; 16])
            .expect("context");
        assert!(matches!(ctx.decrypt(&[0u8; 16]), Err(Error::Protocol(_))));
        assert!(matches!(ctx.decrypt(&[0u8; 20]), Err(Error::Protocol(_))));
    }

    #[test]
    fn auth_code_lengths_follow_integrity_algorithm() {
        let cases = [
            (2u8, 20usize, 12usize),
            (7, 16, 16),
            (11, 16, 16),
            (16, 32, 16),
        ];
        for (id, key_len, code_len) in cases {
            let suite = CipherSuite::from_id(id).expect("suite");
            let ctx = SecurityContext::new(suite, &vec![0x5A; key_len], &[]).expect("context");
            assert_eq!(ctx.auth_code(b"payload").expect("code").len(), code_len);
        }
    }

    #[test]
    fn derived_keys_have_expected_lengths() {
        let password = SecretBytes::new(b"password".to_vec());
        let ctx = SecurityContext::derive(CipherSuite::SHA256_AES, &[0x42; 32], &password)
            .expect("derive");
        assert!(ctx.integrity_enabled());
        assert!(ctx.confidentiality_enabled());
        assert_eq!(ctx.auth_code_len(), 16);

        let md5 = CipherSuite::from_id(12).expect("suite 12");
        let ctx = SecurityContext::derive(md5, &[0x42; 16], &password).expect("derive md5");
        assert_eq!(ctx.auth_code(b"x").expect("code").len(), 16);
    }

    #[test]
    fn fallback_order_prefers_encryption() {
        let order = CipherSuite::fallback_order(AuthenticationAlgorithm::RakpHmacSha1);
        assert_eq!(
            order,
            vec![
                CipherSuite::from_id(3).expect("3"),
                CipherSuite::from_id(2).expect("2"),
                CipherSuite::from_id(1).expect("1"),
            ]
        );
        assert_eq!(
            CipherSuite::fallback_order(AuthenticationAlgorithm::None),
            vec![CipherSuite::from_id(0).expect("0")]
        );
    }
}
