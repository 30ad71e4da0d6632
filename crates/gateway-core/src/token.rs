//! Fuel Tokens
//!
//! Bearer capability tokens carrying a single `balance = <sats>` caveat.
//!
//! Tokens use the macaroon V1 binary layout:
//!
//! ```text
//! ┌──────┬─────────────────────┐
//! │ 0031 │ location https://…\n│   4 hex digits = whole packet length
//! ├──────┼─────────────────────┤
//! │ 0017 │ identifier dep1\n   │
//! ├──────┼─────────────────────┤
//! │ 0017 │ cid balance = 995\n │   one packet per caveat
//! ├──────┼─────────────────────┤
//! │ 002f │ signature <32 raw>\n│
//! └──────┴─────────────────────┘
//!           base64url, unpadded
//! ```
//!
//! The signature is an HMAC-SHA256 chain: a key derived from the mint secret
//! signs the identifier, and each caveat is signed with the previous
//! signature as key. Changing any caveat breaks the final link.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{MintError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Caveat prefix asserting the token's balance in sats
pub const BALANCE_PREFIX: &str = "balance = ";

/// Identifier prefix reserved for change tokens
pub const CHANGE_PREFIX: &str = "change_";

const KEY_GENERATOR: &[u8] = b"macaroons-key-generator";
const SIGNATURE_LEN: usize = 32;
const PACKET_HEADER_LEN: usize = 4;
const MAX_PACKET_LEN: usize = 0xffff;

/// Server-held signing key (derived from the mint secret)
#[derive(Clone)]
pub struct TokenKey {
    derived: [u8; SIGNATURE_LEN],
}

impl TokenKey {
    /// Derive the signing key from a raw secret
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(MintError::Config("mint secret must not be empty".into()));
        }
        Ok(Self {
            derived: hmac_link(KEY_GENERATOR, secret)?,
        })
    }
}

impl std::fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKey(<redacted>)")
    }
}

/// A parsed fuel token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuelToken {
    location: String,
    identifier: String,
    caveats: Vec<String>,
    signature: [u8; SIGNATURE_LEN],
}

impl FuelToken {
    /// Issue a token asserting `balance` for `identifier`
    pub fn issue(
        key: &TokenKey,
        location: impl Into<String>,
        identifier: impl Into<String>,
        balance: u64,
    ) -> Result<Self> {
        let location = location.into();
        let identifier = identifier.into();
        check_packet_len(b"location", &location)?;
        check_packet_len(b"identifier", &identifier)?;

        let caveats = vec![balance_caveat(balance)];
        let signature = chain_signature(key, &identifier, &caveats)?;

        Ok(Self {
            location,
            identifier,
            caveats,
            signature,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn caveats(&self) -> &[String] {
        &self.caveats
    }

    /// Whether this token was issued as change from a spend
    pub fn is_change(&self) -> bool {
        self.identifier.starts_with(CHANGE_PREFIX)
    }

    /// Balance asserted by the caveat, read without verifying the signature
    pub fn claimed_balance(&self) -> Result<u64> {
        let caveat = self
            .caveats
            .iter()
            .rev()
            .find_map(|c| c.strip_prefix(BALANCE_PREFIX))
            .ok_or_else(|| MintError::Malformed("missing balance caveat".into()))?;

        caveat
            .trim()
            .parse()
            .map_err(|_| MintError::Malformed(format!("bad balance caveat: {caveat}")))
    }

    /// Verify the token, accepting exactly `balance` as the caveat value
    ///
    /// Every caveat must be satisfied and the chained signature must match.
    pub fn verify(&self, key: &TokenKey, location: &str, balance: u64) -> Result<()> {
        if self.location != location {
            return Err(MintError::InvalidSignature);
        }

        let accepted = balance_caveat(balance);
        if self.caveats.iter().any(|c| *c != accepted) {
            return Err(MintError::InvalidSignature);
        }

        let Some((last, rest)) = self.caveats.split_last() else {
            return Err(MintError::InvalidSignature);
        };

        let mut sig = hmac_link(&key.derived, self.identifier.as_bytes())?;
        for caveat in rest {
            sig = hmac_link(&sig, caveat.as_bytes())?;
        }

        let mut mac = new_mac(&sig)?;
        mac.update(last.as_bytes());
        mac.verify_slice(&self.signature)
            .map_err(|_| MintError::InvalidSignature)
    }

    /// Encode to the bearer string handed to clients
    pub fn serialize(&self) -> String {
        let mut raw = Vec::with_capacity(128);
        push_packet(&mut raw, b"location", self.location.as_bytes());
        push_packet(&mut raw, b"identifier", self.identifier.as_bytes());
        for caveat in &self.caveats {
            push_packet(&mut raw, b"cid", caveat.as_bytes());
        }
        push_packet(&mut raw, b"signature", &self.signature);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a bearer string
    pub fn deserialize(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim().trim_end_matches('=');
        let raw = URL_SAFE_NO_PAD
            .decode(trimmed)
            .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
            .map_err(|e| MintError::Malformed(format!("base64: {e}")))?;

        let packets = read_packets(&raw)?;
        let mut iter = packets.into_iter();

        let location = expect_text(iter.next(), "location")?;
        let identifier = expect_text(iter.next(), "identifier")?;

        let mut caveats = Vec::new();
        let mut signature = None;
        for (name, value) in iter.by_ref() {
            match name {
                b"cid" => caveats.push(utf8(value, "cid")?),
                b"vid" | b"cl" => {
                    return Err(MintError::Malformed("third-party caveats are not supported".into()));
                }
                b"signature" => {
                    let bytes: [u8; SIGNATURE_LEN] = value
                        .try_into()
                        .map_err(|_| MintError::Malformed("signature must be 32 bytes".into()))?;
                    signature = Some(bytes);
                    break;
                }
                other => {
                    return Err(MintError::Malformed(format!(
                        "unexpected packet: {}",
                        String::from_utf8_lossy(other)
                    )));
                }
            }
        }

        if iter.next().is_some() {
            return Err(MintError::Malformed("trailing data after signature".into()));
        }
        let signature = signature.ok_or_else(|| MintError::Malformed("missing signature".into()))?;

        Ok(Self {
            location,
            identifier,
            caveats,
            signature,
        })
    }
}

impl std::fmt::Display for FuelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialize())
    }
}

fn balance_caveat(balance: u64) -> String {
    format!("{BALANCE_PREFIX}{balance}")
}

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| MintError::Config(format!("hmac key: {e}")))
}

fn hmac_link(key: &[u8], message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let mut mac = new_mac(key)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

fn chain_signature(key: &TokenKey, identifier: &str, caveats: &[String]) -> Result<[u8; SIGNATURE_LEN]> {
    let mut sig = hmac_link(&key.derived, identifier.as_bytes())?;
    for caveat in caveats {
        sig = hmac_link(&sig, caveat.as_bytes())?;
    }
    Ok(sig)
}

/// Largest value that still fits a packet under `name`
const fn max_packet_value(name: &[u8]) -> usize {
    MAX_PACKET_LEN - PACKET_HEADER_LEN - name.len() - 2
}

fn check_packet_len(name: &[u8], value: &str) -> Result<()> {
    if value.len() > max_packet_value(name) {
        return Err(MintError::Malformed(format!(
            "{} exceeds {} bytes",
            String::from_utf8_lossy(name),
            max_packet_value(name)
        )));
    }
    Ok(())
}

fn push_packet(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    let len = PACKET_HEADER_LEN + name.len() + 1 + value.len() + 1;
    out.extend_from_slice(format!("{len:04x}").as_bytes());
    out.extend_from_slice(name);
    out.push(b' ');
    out.extend_from_slice(value);
    out.push(b'\n');
}

fn read_packets(raw: &[u8]) -> Result<Vec<(&[u8], &[u8])>> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < raw.len() {
        let header = raw
            .get(pos..pos + PACKET_HEADER_LEN)
            .ok_or_else(|| MintError::Malformed("truncated packet header".into()))?;
        let header = std::str::from_utf8(header)
            .map_err(|_| MintError::Malformed("packet header is not hex".into()))?;
        let len = usize::from_str_radix(header, 16)
            .map_err(|_| MintError::Malformed("packet header is not hex".into()))?;

        if len <= PACKET_HEADER_LEN + 1 || len > MAX_PACKET_LEN {
            return Err(MintError::Malformed(format!("bad packet length {len}")));
        }
        let body = raw
            .get(pos + PACKET_HEADER_LEN..pos + len)
            .ok_or_else(|| MintError::Malformed("truncated packet".into()))?;
        let Some((&b'\n', body)) = body.split_last() else {
            return Err(MintError::Malformed("packet missing terminator".into()));
        };
        let split = body
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| MintError::Malformed("packet missing separator".into()))?;

        packets.push((&body[..split], &body[split + 1..]));
        pos += len;
    }

    Ok(packets)
}

fn expect_text(packet: Option<(&[u8], &[u8])>, name: &str) -> Result<String> {
    match packet {
        Some((key, value)) if key == name.as_bytes() => utf8(value, name),
        _ => Err(MintError::Malformed(format!("expected {name} packet"))),
    }
}

fn utf8(value: &[u8], field: &str) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| MintError::Malformed(format!("{field} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCATION: &str = "https://gateway.test";

    fn key() -> TokenKey {
        TokenKey::new("test-secret").unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let token = FuelToken::issue(&key(), LOCATION, "dep1", 1000).unwrap();
        let parsed = FuelToken::deserialize(&token.serialize()).unwrap();

        assert_eq!(parsed, token);
        assert_eq!(parsed.identifier(), "dep1");
        assert_eq!(parsed.claimed_balance().unwrap(), 1000);
        assert!(parsed.verify(&key(), LOCATION, 1000).is_ok());
    }

    #[test]
    fn test_tampered_caveat_rejected() {
        let mut token = FuelToken::issue(&key(), LOCATION, "dep1", 10).unwrap();
        token.caveats = vec![balance_caveat(1_000_000)];

        let forged = FuelToken::deserialize(&token.serialize()).unwrap();
        assert_eq!(forged.claimed_balance().unwrap(), 1_000_000);
        assert!(matches!(
            forged.verify(&key(), LOCATION, 1_000_000),
            Err(MintError::InvalidSignature)
        ));
    }

    #[test]
    fn test_verifier_accepts_exact_balance_only() {
        let token = FuelToken::issue(&key(), LOCATION, "dep1", 10).unwrap();
        assert!(matches!(
            token.verify(&key(), LOCATION, 11),
            Err(MintError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_or_location() {
        let token = FuelToken::issue(&key(), LOCATION, "dep1", 10).unwrap();
        let other = TokenKey::new("other-secret").unwrap();

        assert!(token.verify(&other, LOCATION, 10).is_err());
        assert!(token.verify(&key(), "https://elsewhere.test", 10).is_err());
    }

    #[test]
    fn test_padded_encoding_accepted() {
        let token = FuelToken::issue(&key(), LOCATION, "dep-padding", 7).unwrap();
        let mut encoded = token.serialize();
        while encoded.len() % 4 != 0 {
            encoded.push('=');
        }
        assert_eq!(FuelToken::deserialize(&encoded).unwrap(), token);
    }

    #[test]
    fn test_garbage_is_malformed() {
        for input in ["", "not a token!", "AAAA", "MDAwMWxvY2F0aW9u"] {
            assert!(matches!(
                FuelToken::deserialize(input),
                Err(MintError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_oversized_identifier_rejected_at_issue() {
        let longest = "a".repeat(max_packet_value(b"identifier"));
        let token = FuelToken::issue(&key(), LOCATION, longest.as_str(), 1).unwrap();
        assert_eq!(FuelToken::deserialize(&token.serialize()).unwrap(), token);

        let too_long = format!("{longest}a");
        assert!(matches!(
            FuelToken::issue(&key(), LOCATION, too_long, 1),
            Err(MintError::Malformed(_))
        ));
        assert!(matches!(
            FuelToken::issue(&key(), "x".repeat(70_000), "dep", 1),
            Err(MintError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(TokenKey::new(""), Err(MintError::Config(_))));
    }
}
