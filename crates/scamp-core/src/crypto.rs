//! RSA-SHA256 payload signatures for tickets and other signed envelopes.
//!
//! Signatures are RSASSA-PKCS1-v1_5 over the SHA-256 digest of the payload,
//! carried as base64 text. Verification accepts standard or URL-safe base64,
//! padded or not.

use crate::error::{ScampError, ScampResult};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{self, KeyPair, RsaKeyPair, RsaPublicKeyComponents};
use sha2::{Digest, Sha256};

const MIN_MODULUS_BITS: usize = 2048;
const MAX_MODULUS_BITS: usize = 8192;

/// An RSA private key used to sign payloads.
pub struct SigningKey {
    inner: RsaKeyPair,
}

impl SigningKey {
    /// Load a PKCS#8 `PrivateKeyInfo` DER document.
    pub fn from_pkcs8_der(der: &[u8]) -> ScampResult<Self> {
        Ok(Self {
            inner: RsaKeyPair::from_pkcs8(der)?,
        })
    }

    /// Load a PKCS#1 `RSAPrivateKey` DER document.
    pub fn from_pkcs1_der(der: &[u8]) -> ScampResult<Self> {
        Ok(Self {
            inner: RsaKeyPair::from_der(der)?,
        })
    }

    /// Load the first RSA private key (`PRIVATE KEY` or `RSA PRIVATE KEY`) in a PEM document.
    pub fn from_pem(pem: &str) -> ScampResult<Self> {
        let mut reader = pem.as_bytes();
        loop {
            match rustls_pemfile::read_one(&mut reader)? {
                Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                    return Self::from_pkcs8_der(key.secret_pkcs8_der())
                }
                Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                    return Self::from_pkcs1_der(key.secret_pkcs1_der())
                }
                Some(_) => continue,
                None => {
                    return Err(ScampError::KeyRejected(
                        "no RSA private key found in PEM".into(),
                    ))
                }
            }
        }
    }

    /// The matching public key.
    pub fn verifying_key(&self) -> ScampResult<VerifyingKey> {
        VerifyingKey::from_pkcs1_der(self.inner.public_key().as_ref())
    }

    /// Modulus length in bytes, which is also the raw signature length.
    pub fn modulus_len(&self) -> usize {
        self.inner.public().modulus_len()
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("modulus_bits", &(self.modulus_len() * 8))
            .finish_non_exhaustive()
    }
}

/// An RSA public key used to verify payload signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyingKey {
    n: Vec<u8>,
    e: Vec<u8>,
}

impl VerifyingKey {
    /// Parse a PKCS#1 `RSAPublicKey` DER document: `SEQUENCE { n INTEGER, e INTEGER }`.
    pub fn from_pkcs1_der(der: &[u8]) -> ScampResult<Self> {
        let (body, rest) = der_element(der, TAG_SEQUENCE)?;
        if !rest.is_empty() {
            return Err(ScampError::KeyRejected("trailing bytes after RSAPublicKey".into()));
        }
        let (n, body) = der_element(body, TAG_INTEGER)?;
        let (e, body) = der_element(body, TAG_INTEGER)?;
        if !body.is_empty() {
            return Err(ScampError::KeyRejected("unexpected fields in RSAPublicKey".into()));
        }
        Self::from_components(n, e)
    }

    /// Build from big-endian modulus and public exponent.
    pub fn from_components(n: &[u8], e: &[u8]) -> ScampResult<Self> {
        let n = strip_leading_zeros(n);
        let e = strip_leading_zeros(e);

        let bits = bit_length(n);
        if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&bits) {
            return Err(ScampError::KeyRejected(format!(
                "modulus is {bits} bits (expected {MIN_MODULUS_BITS}..={MAX_MODULUS_BITS})"
            )));
        }
        if n[n.len() - 1] & 1 == 0 {
            return Err(ScampError::KeyRejected("modulus is even".into()));
        }
        // ring accepts odd exponents in 3..2^33
        let valid_exponent = !e.is_empty()
            && e.len() <= 5
            && e[e.len() - 1] & 1 == 1
            && !(e.len() == 1 && e[0] < 3)
            && !(e.len() == 5 && e[0] > 1);
        if !valid_exponent {
            return Err(ScampError::KeyRejected("unsupported public exponent".into()));
        }

        Ok(Self {
            n: n.to_vec(),
            e: e.to_vec(),
        })
    }

    /// Size of the modulus in bits.
    pub fn modulus_bits(&self) -> usize {
        bit_length(&self.n)
    }

    /// Hex SHA-256 over modulus and exponent, for log lines.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.n);
        hasher.update(&self.e);
        hex::encode(hasher.finalize())
    }
}

/// Sign `payload` and return the signature as standard padded base64.
pub fn sign_sha256(payload: &[u8], key: &SigningKey) -> ScampResult<String> {
    let rng = SystemRandom::new();
    let mut sig = vec![0u8; key.modulus_len()];
    key.inner
        .sign(&signature::RSA_PKCS1_SHA256, &rng, payload, &mut sig)
        .map_err(|_| ScampError::Crypto("RSA signing failed".into()))?;
    Ok(STANDARD.encode(sig))
}

/// Verify a base64 signature over `payload`.
///
/// Returns `Ok(false)` for a well-formed signature that does not match, and an
/// error only when the signature text is not valid base64.
pub fn verify_sha256(
    payload: &[u8],
    key: &VerifyingKey,
    encoded_signature: &[u8],
    is_url_encoded: bool,
) -> ScampResult<bool> {
    let sig = decode_unpadded_base64(encoded_signature, is_url_encoded)?;
    let components = RsaPublicKeyComponents {
        n: key.n.as_slice(),
        e: key.e.as_slice(),
    };
    Ok(components
        .verify(&signature::RSA_PKCS1_2048_8192_SHA256, payload, &sig)
        .is_ok())
}

/// Decode base64 that may have had its trailing `=` padding stripped.
pub fn decode_unpadded_base64(incoming: &[u8], is_url_encoded: bool) -> ScampResult<Vec<u8>> {
    let mut padded = incoming.to_vec();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.resize(padded.len() + 4 - rem, b'=');
    }
    let decoded = if is_url_encoded {
        URL_SAFE.decode(&padded)?
    } else {
        STANDARD.decode(&padded)?
    };
    Ok(decoded)
}

// ── Minimal DER reader for RSAPublicKey ───────────────────────────────

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;

/// Read one TLV with the expected tag, returning `(contents, remainder)`.
fn der_element(input: &[u8], tag: u8) -> ScampResult<(&[u8], &[u8])> {
    let malformed = || ScampError::KeyRejected("malformed RSAPublicKey DER".into());

    let (&actual, rest) = input.split_first().ok_or_else(malformed)?;
    if actual != tag {
        return Err(malformed());
    }
    let (&first, rest) = rest.split_first().ok_or_else(malformed)?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 2 || rest.len() < count {
            return Err(malformed());
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, &rest[count..])
    };
    if rest.len() < len {
        return Err(malformed());
    }
    Ok((&rest[..len], &rest[len..]))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn bit_length(be: &[u8]) -> usize {
    match be.first() {
        Some(&top) => (be.len() - 1) * 8 + (8 - top.leading_zeros() as usize),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_PEM: &str = include_str!("../testdata/rsa2048.pem");
    const OTHER_KEY_PEM: &str = include_str!("../testdata/rsa2048-other.pkcs1.pem");

    fn test_key() -> SigningKey {
        SigningKey::from_pem(TEST_KEY_PEM).unwrap()
    }

    fn to_unpadded_url(standard: &str) -> String {
        standard
            .trim_end_matches('=')
            .replace('+', "-")
            .replace('/', "_")
    }

    #[test]
    fn sign_and_verify() {
        let key = test_key();
        let public = key.verifying_key().unwrap();
        assert_eq!(public.modulus_bits(), 2048);

        let sig = sign_sha256(b"hello", &key).unwrap();
        assert_eq!(sig.len(), 344);
        assert!(verify_sha256(b"hello", &public, sig.as_bytes(), false).unwrap());
    }

    #[test]
    fn unpadded_url_safe_matches_standard() {
        let key = test_key();
        let public = key.verifying_key().unwrap();
        let sig = sign_sha256(b"hello", &key).unwrap();

        let url = to_unpadded_url(&sig);
        // 256-byte signature: 344 padded chars, 342 unpadded
        assert_ne!(url.len() % 4, 0);
        let standard = verify_sha256(b"hello", &public, sig.as_bytes(), false).unwrap();
        let url_safe = verify_sha256(b"hello", &public, url.as_bytes(), true).unwrap();
        assert_eq!(standard, url_safe);
        assert!(url_safe);

        assert!(!verify_sha256(b"goodbye", &public, url.as_bytes(), true).unwrap());
    }

    #[test]
    fn standard_signature_without_padding_is_accepted() {
        let key = test_key();
        let public = key.verifying_key().unwrap();
        let sig = sign_sha256(b"payload", &key).unwrap();
        let trimmed = sig.trim_end_matches('=');
        assert!(verify_sha256(b"payload", &public, trimmed.as_bytes(), false).unwrap());
    }

    #[test]
    fn single_bit_payload_mutation_is_invalid_not_error() {
        let key = test_key();
        let public = key.verifying_key().unwrap();
        let payload = b"ticket:user=42,expires=1700000000".to_vec();
        let sig = sign_sha256(&payload, &key).unwrap();

        for bit in [0usize, 7, 63, payload.len() * 8 - 1] {
            let mut mutated = payload.clone();
            mutated[bit / 8] ^= 1 << (bit % 8);
            assert!(!verify_sha256(&mutated, &public, sig.as_bytes(), false).unwrap());
        }
    }

    #[test]
    fn single_bit_signature_mutation_is_invalid_not_error() {
        let key = test_key();
        let public = key.verifying_key().unwrap();
        let sig = STANDARD.decode(sign_sha256(b"hello", &key).unwrap()).unwrap();

        for bit in [0usize, 100, sig.len() * 8 - 1] {
            let mut mutated = sig.clone();
            mutated[bit / 8] ^= 1 << (bit % 8);
            let encoded = STANDARD.encode(&mutated);
            assert!(!verify_sha256(b"hello", &public, encoded.as_bytes(), false).unwrap());
        }
    }

    #[test]
    fn wrong_key_is_invalid() {
        let other = SigningKey::from_pem(OTHER_KEY_PEM).unwrap();
        let sig = sign_sha256(b"hello", &test_key()).unwrap();
        let public = other.verifying_key().unwrap();
        assert!(!verify_sha256(b"hello", &public, sig.as_bytes(), false).unwrap());
    }

    #[test]
    fn malformed_base64_is_an_error() {
        let public = test_key().verifying_key().unwrap();
        let err = verify_sha256(b"hello", &public, b"not*base64!", false).unwrap_err();
        assert!(matches!(err, ScampError::Decode(_)));

        // a lone trailing sextet cannot be re-padded into a valid quantum
        assert!(verify_sha256(b"hello", &public, b"QUJDR", true).is_err());
    }

    #[test]
    fn url_alphabet_rejected_in_standard_mode() {
        let key = test_key();
        let public = key.verifying_key().unwrap();
        let mut sig = None;
        for i in 0..64u8 {
            let candidate = sign_sha256(&[i], &key).unwrap();
            if candidate.contains('+') || candidate.contains('/') {
                sig = Some((i, candidate));
                break;
            }
        }
        let (payload, sig) = sig.expect("some signature uses + or /");
        let url = to_unpadded_url(&sig);
        assert!(verify_sha256(&[payload], &public, url.as_bytes(), false).is_err());
    }

    #[test]
    fn short_modulus_is_rejected() {
        let err = VerifyingKey::from_components(&[0xff; 128], &[0x01, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, ScampError::KeyRejected(_)));
    }

    #[test]
    fn even_modulus_is_rejected_at_construction() {
        let mut n = [0xff; 256];
        n[255] = 0xfe;
        let err = VerifyingKey::from_components(&n, &[0x01, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, ScampError::KeyRejected(_)));

        n[255] = 0xff;
        assert!(VerifyingKey::from_components(&n, &[0x01, 0x00, 0x01]).is_ok());
    }

    #[test]
    fn garbage_der_is_rejected() {
        assert!(VerifyingKey::from_pkcs1_der(&[]).is_err());
        assert!(VerifyingKey::from_pkcs1_der(&[0x30, 0x05, 0x02, 0x01]).is_err());
        assert!(VerifyingKey::from_pkcs1_der(b"-----BEGIN PUBLIC KEY-----").is_err());
    }

    #[test]
    fn pkcs1_der_round_trips_through_components() {
        let public = test_key().verifying_key().unwrap();
        let again = VerifyingKey::from_components(&public.n, &public.e).unwrap();
        assert_eq!(public, again);
        assert_eq!(public.fingerprint().len(), 64);
    }

    #[test]
    fn pem_without_private_key_is_rejected() {
        let err = SigningKey::from_pem("-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n");
        assert!(err.is_err());
    }
}
