//! Trading Pair Identity
//!
//! A trading pair is identified by the addresses of its base and quote
//! tokens. Both addresses are validated before a pair can exist, so every
//! `PairKey` that reaches a registry is known to be well-formed and set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of a token address in bytes.
pub const ADDRESS_LEN: usize = 20;

// =============================================================================
// Address
// =============================================================================

/// A fixed-width token address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// The all-zero address, treated as "unset".
    pub const ZERO: Self = Self([0; ADDRESS_LEN]);

    /// Create an address from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Whether this is the unset (all-zero) address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Parse a hex address, with or without a `0x` prefix.
    ///
    /// # Errors
    ///
    /// Returns `AddressError` if the input is not exactly 40 hex digits.
    pub fn parse_hex(raw: &str) -> Result<Self, AddressError> {
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);

        if digits.len() != ADDRESS_LEN * 2 {
            return Err(AddressError::InvalidLength(digits.len()));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| AddressError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Address parsing error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Wrong number of hex digits.
    #[error("expected 40 hex digits, got {0}")]
    InvalidLength(usize),
    /// Non-hex characters present.
    #[error("address contains non-hex characters")]
    InvalidHex,
}

// =============================================================================
// Pair Key
// =============================================================================

/// Which side of a pair an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    /// Base token.
    Base,
    /// Quote token.
    Quote,
}

impl PairSide {
    /// Side name used in messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Quote => "quote",
        }
    }
}

impl fmt::Display for PairSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pair validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairError {
    /// Token identifier is not a valid address.
    #[error("invalid pair {side} token: {source}")]
    Malformed {
        /// Offending side.
        side: PairSide,
        /// Underlying parse error.
        source: AddressError,
    },
    /// Token identifier is the unset address.
    #[error("invalid pair {side} token: address is unset")]
    Unset {
        /// Offending side.
        side: PairSide,
    },
}

impl PairError {
    /// The side of the pair that failed validation.
    #[must_use]
    pub const fn side(&self) -> PairSide {
        match self {
            Self::Malformed { side, .. } | Self::Unset { side } => *side,
        }
    }

    /// Stable client-facing error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self.side() {
            PairSide::Base => "INVALID_PAIR_BASE_TOKEN",
            PairSide::Quote => "INVALID_PAIR_QUOTE_TOKEN",
        }
    }
}

/// Canonical identity of a trading pair.
///
/// Both tokens are guaranteed to be set. Equality and hashing are
/// structural, so a `PairKey` can key any map directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawPairKey")]
pub struct PairKey {
    base_token: Address,
    quote_token: Address,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPairKey {
    base_token: Address,
    quote_token: Address,
}

impl TryFrom<RawPairKey> for PairKey {
    type Error = PairError;

    fn try_from(raw: RawPairKey) -> Result<Self, Self::Error> {
        Self::new(raw.base_token, raw.quote_token)
    }
}

impl PairKey {
    /// Build a pair from two addresses.
    ///
    /// # Errors
    ///
    /// Returns `PairError::Unset` if either address is zero.
    pub fn new(base_token: Address, quote_token: Address) -> Result<Self, PairError> {
        if base_token.is_zero() {
            return Err(PairError::Unset {
                side: PairSide::Base,
            });
        }
        if quote_token.is_zero() {
            return Err(PairError::Unset {
                side: PairSide::Quote,
            });
        }
        Ok(Self {
            base_token,
            quote_token,
        })
    }

    /// Base token address.
    #[must_use]
    pub const fn base_token(&self) -> Address {
        self.base_token
    }

    /// Quote token address.
    #[must_use]
    pub const fn quote_token(&self) -> Address {
        self.quote_token
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base_token, self.quote_token)
    }
}

/// Parse and validate a pair from raw hex token identifiers.
///
/// # Errors
///
/// Returns `PairError` naming the failing side if either identifier is
/// malformed or unset. The base token is checked first.
pub fn parse_pair(raw_base: &str, raw_quote: &str) -> Result<PairKey, PairError> {
    let base = Address::parse_hex(raw_base).map_err(|source| PairError::Malformed {
        side: PairSide::Base,
        source,
    })?;
    if base.is_zero() {
        return Err(PairError::Unset {
            side: PairSide::Base,
        });
    }

    let quote = Address::parse_hex(raw_quote).map_err(|source| PairError::Malformed {
        side: PairSide::Quote,
        source,
    })?;

    PairKey::new(base, quote)
}

// =============================================================================
// Tests
// =============================================================================
