//! Primitive new-types shared across the StageGate services.
//!
//! The mirrored marketplace runs on an EVM chain, so accounts and ticket
//! contracts are 20-byte addresses displayed as lowercase, “0x”-prefixed hex.

use std::{fmt, str::FromStr};

use hex::FromHex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Monetary amount in the smallest currency unit (wei-scale). 128 bits is
/// enough for 1e29 units at 18 decimals.
pub type Amount = u128;
/// On-chain block height.
pub type BlockNumber = u64;

/// Result alias pre-filled with [`SgCommonError`].
pub type Result<T, E = SgCommonError> = std::result::Result<T, E>;

/// Error type shared by the helpers contained in this crate.
///
/// Specialised subsystems create their own error enums and `#[from]` this one
/// where parsing is involved.
#[derive(Debug, Error)]
pub enum SgCommonError {
    /// Malformed address or id strings.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Hex decoding failure.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

/// A 20-byte account or contract address.
///
/// Display/parse as lowercase, “0x”-prefixed hex. Serialises as the display
/// string so the type is directly usable in JSON wire formats.
#[derive(Copy, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    #[inline]
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = SgCommonError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s).to_ascii_lowercase();

        if raw.len() != Self::LEN * 2 {
            return Err(SgCommonError::Malformed(format!(
                "address length mismatch (expected {} hex chars, got {})",
                Self::LEN * 2,
                raw.len()
            )));
        }

        let bytes = <[u8; Self::LEN]>::from_hex(raw)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Ticket token id within a single event contract.
#[derive(
    Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TokenId {
    fn from(v: u64) -> Self {
        TokenId(v)
    }
}

impl From<TokenId> for u64 {
    fn from(v: TokenId) -> Self {
        v.0
    }
}

/// Composite key identifying a single ticket NFT on the marketplace:
/// the event contract address plus the token id within it.
///
/// At most one Active listing may exist per key at any time.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub event: Address,
    pub token: TokenId,
}

impl ListingKey {
    pub fn new(event: Address, token: impl Into<TokenId>) -> Self {
        Self {
            event,
            token: token.into(),
        }
    }

    /// 32-byte digest of the key, matching the opaque listing id the
    /// marketplace contract derives from (contract, tokenId).
    pub fn listing_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.event.as_bytes());
        hasher.update(self.token.0.to_be_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.event, self.token)
    }
}

/// Seat tier carried in ticket metadata. Used by marketplace query filters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketTier {
    Normal,
    Vip,
}

impl fmt::Display for TicketTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketTier::Normal => f.write_str("normal"),
            TicketTier::Vip => f.write_str("vip"),
        }
    }
}

impl FromStr for TicketTier {
    type Err = SgCommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(TicketTier::Normal),
            "vip" => Ok(TicketTier::Vip),
            other => Err(SgCommonError::Malformed(format!(
                "unknown ticket tier `{other}`"
            ))),
        }
    }
}
