//! Address and identifier codecs.
//!
//! - [`LedgerAddress`]: a 20-byte value shown as `NQxx XXXX ...` using a
//!   restricted 32-symbol alphabet with two mod-97 check digits.
//! - [`base58`]: big-integer base-58 encoding used for blob and account
//!   identifiers, preserving leading zero bytes.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Symbols used for the address body. No I, O, W or Z.
const ADDRESS_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKLMNPQRSTUVXY";

const COUNTRY_CODE: &str = "NQ";

/// Length of the user-friendly form without spaces.
const FRIENDLY_LEN: usize = 36;

/// 20-byte ledger account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LedgerAddress([u8; 20]);

impl LedgerAddress {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)
            .map_err(|e| Error::InvalidAddress(format!("{:?}: {}", s, e)))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `NQ` + check digits + body, grouped in blocks of four.
    pub fn to_user_friendly(&self) -> String {
        let body = encode_body(&self.0);
        let compact = format!("{}{:02}{}", COUNTRY_CODE, check_digits(&body), body);
        compact
            .as_bytes()
            .chunks(4)
            .map(|group| String::from_utf8_lossy(group).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Decode the body of a user-friendly address without checking the
    /// check digits. Writers are trusted on the read path.
    pub fn from_user_friendly(s: &str) -> Result<Self> {
        let compact = compact_form(s)?;
        decode_body(&compact[4..]).map(Self)
    }

    /// Decode and reject addresses whose check digits do not match.
    pub fn from_user_friendly_checked(s: &str) -> Result<Self> {
        let compact = compact_form(s)?;
        let body = &compact[4..];
        let expected = format!("{:02}", check_digits(body));
        if compact[2..4] != expected {
            return Err(Error::InvalidAddress(format!(
                "{:?} has check digits {} (expected {})",
                s,
                &compact[2..4],
                expected
            )));
        }
        decode_body(body).map(Self)
    }
}

impl fmt::Display for LedgerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_user_friendly())
    }
}

impl fmt::Debug for LedgerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LedgerAddress({})", self.to_user_friendly())
    }
}

impl FromStr for LedgerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_user_friendly_checked(s)
    }
}

fn compact_form(s: &str) -> Result<String> {
    let compact: String = s
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if compact.len() != FRIENDLY_LEN || !compact.starts_with(COUNTRY_CODE) {
        return Err(Error::InvalidAddress(format!(
            "{:?} is not a {}-character {} address",
            s, FRIENDLY_LEN, COUNTRY_CODE
        )));
    }
    if !compact[2..4].bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidAddress(format!(
            "{:?} has non-numeric check digits",
            s
        )));
    }
    Ok(compact)
}

fn encode_body(bytes: &[u8; 20]) -> String {
    let mut out = String::with_capacity(32);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ADDRESS_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    out
}

fn decode_body(body: &str) -> Result<[u8; 20]> {
    let mut out = [0u8; 20];
    let mut written = 0;
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for symbol in body.bytes() {
        let value = ADDRESS_ALPHABET
            .iter()
            .position(|s| *s == symbol)
            .ok_or_else(|| {
                Error::InvalidAddress(format!("invalid address symbol {:?}", symbol as char))
            })?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out[written] = ((buffer >> bits) & 0xff) as u8;
            written += 1;
        }
    }
    Ok(out)
}

/// IBAN style: `98 - (body + "NQ00") mod 97`, letters mapped A=10..Z=35.
fn check_digits(body: &str) -> u32 {
    let rearranged = format!("{}{}00", body, COUNTRY_CODE);
    let mut remainder: u32 = 0;
    for c in rearranged.chars() {
        let value = match c.to_digit(36) {
            Some(v) => v,
            None => continue,
        };
        remainder = if value >= 10 {
            (remainder * 100 + value) % 97
        } else {
            (remainder * 10 + value) % 97
        };
    }
    98 - remainder
}

/// Base-58 with the Bitcoin alphabet.
pub mod base58 {
    use crate::error::{Error, Result};

    const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

    pub fn encode(input: &[u8]) -> String {
        let zeros = input.iter().take_while(|b| **b == 0).count();
        // little-endian base-58 digits
        let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 138 / 100 + 1);
        for &byte in &input[zeros..] {
            let mut carry = byte as u32;
            for digit in digits.iter_mut() {
                carry += (*digit as u32) << 8;
                *digit = (carry % 58) as u8;
                carry /= 58;
            }
            while carry > 0 {
                digits.push((carry % 58) as u8);
                carry /= 58;
            }
        }
        let mut out = String::with_capacity(zeros + digits.len());
        out.extend(std::iter::repeat('1').take(zeros));
        out.extend(digits.iter().rev().map(|d| ALPHABET[*d as usize] as char));
        out
    }

    pub fn decode(input: &str) -> Result<Vec<u8>> {
        let zeros = input.bytes().take_while(|c| *c == b'1').count();
        // little-endian base-256 bytes
        let mut bytes: Vec<u8> = Vec::with_capacity(input.len());
        for c in input.bytes().skip(zeros) {
            let value = ALPHABET.iter().position(|a| *a == c).ok_or_else(|| {
                Error::InvalidAddress(format!("invalid base58 character {:?}", c as char))
            })?;
            let mut carry = value as u32;
            for byte in bytes.iter_mut() {
                carry += (*byte as u32) * 58;
                *byte = (carry & 0xff) as u8;
                carry >>= 8;
            }
            while carry > 0 {
                bytes.push((carry & 0xff) as u8);
                carry >>= 8;
            }
        }
        let mut out = vec![0u8; zeros];
        out.extend(bytes.iter().rev());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LedgerAddress {
        let mut bytes = [0u8; 20];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        LedgerAddress::from_bytes(bytes)
    }

    #[test]
    fn user_friendly_round_trip() {
        let address = sample();
        let friendly = address.to_user_friendly();
        assert!(friendly.starts_with("NQ"));
        assert_eq!(friendly.len(), 44);
        assert_eq!(friendly.split(' ').count(), 9);
        assert_eq!(LedgerAddress::from_user_friendly(&friendly).unwrap(), address);
        assert_eq!(friendly.parse::<LedgerAddress>().unwrap(), address);
    }

    #[test]
    fn zero_address_has_known_form() {
        let friendly = LedgerAddress::default().to_user_friendly();
        assert_eq!(friendly, "NQ07 0000 0000 0000 0000 0000 0000 0000 0000");
    }

    #[test]
    fn check_digits_are_only_enforced_when_validating() {
        let friendly = sample().to_user_friendly();
        let digits: u32 = friendly[2..4].parse().unwrap();
        let tampered = format!("NQ{:02}{}", (digits + 1) % 100, &friendly[4..]);
        assert!(LedgerAddress::from_user_friendly_checked(&tampered).is_err());
        assert_eq!(LedgerAddress::from_user_friendly(&tampered).unwrap(), sample());
    }

    #[test]
    fn rejects_foreign_symbols_and_lengths() {
        assert!(LedgerAddress::from_user_friendly("NQ07 0000").is_err());
        let bad = "NQ07 000O 0000 0000 0000 0000 0000 0000 0000";
        assert!(LedgerAddress::from_user_friendly(bad).is_err());
    }

    #[test]
    fn lowercase_input_is_accepted() {
        let friendly = sample().to_user_friendly().to_lowercase();
        assert_eq!(LedgerAddress::from_user_friendly_checked(&friendly).unwrap(), sample());
    }

    #[test]
    fn base58_known_vectors() {
        assert_eq!(base58::encode(b"hello world"), "StV1DL6CwTryKyV");
        assert_eq!(base58::encode(&[]), "");
        assert_eq!(base58::decode("StV1DL6CwTryKyV").unwrap(), b"hello world");
    }

    #[test]
    fn base58_preserves_leading_zeros() {
        let input = [0u8, 0, 0, 1, 2, 255];
        let encoded = base58::encode(&input);
        assert!(encoded.starts_with("111"));
        assert!(!encoded[3..].starts_with('1'));
        assert_eq!(base58::decode(&encoded).unwrap(), input);
        assert_eq!(base58::decode("11").unwrap(), vec![0, 0]);
    }

    #[test]
    fn base58_rejects_ambiguous_characters() {
        assert!(base58::decode("0OIl").is_err());
    }
}
