use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HeraldError;

/// Ledger block height.
pub type BlockNumber = u64;

/// Numeric provider (MSA) identifier paying for submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub u64);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-chain schema identifier attached to a published batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaId(pub u16);

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! hash32_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Lowercase `0x`-prefixed hex rendering.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_hex()
            }
        }

        impl TryFrom<String> for $name {
            type Error = HeraldError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl FromStr for $name {
            type Err = HeraldError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(raw)
                    .map_err(|e| HeraldError::Decode(format!("{}: {e}", stringify!($name))))?;
                let arr: [u8; 32] = bytes.try_into().map_err(|_| {
                    HeraldError::Decode(format!("{}: expected 32 bytes", stringify!($name)))
                })?;
                Ok(Self(arr))
            }
        }
    };
}

hash32_newtype!(
    /// Hash of a submitted extrinsic.
    TxHash
);
hash32_newtype!(
    /// Hash of a ledger block.
    BlockHash
);

/// Identifier of one batch, minted when a queue goes from empty to non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Mints a new random batch identifier.
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of content-change event; each kind is accumulated on its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementType {
    Broadcast,
    Reply,
    Reaction,
    Update,
    Profile,
    Tombstone,
}

impl AnnouncementType {
    pub const ALL: [AnnouncementType; 6] = [
        AnnouncementType::Broadcast,
        AnnouncementType::Reply,
        AnnouncementType::Reaction,
        AnnouncementType::Update,
        AnnouncementType::Profile,
        AnnouncementType::Tombstone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnnouncementType::Broadcast => "broadcast",
            AnnouncementType::Reply => "reply",
            AnnouncementType::Reaction => "reaction",
            AnnouncementType::Update => "update",
            AnnouncementType::Profile => "profile",
            AnnouncementType::Tombstone => "tombstone",
        }
    }

    /// Name of the intake queue that accumulates this kind.
    pub fn queue_name(self) -> &'static str {
        match self {
            AnnouncementType::Broadcast => "broadcastQueue",
            AnnouncementType::Reply => "replyQueue",
            AnnouncementType::Reaction => "reactionQueue",
            AnnouncementType::Update => "updateQueue",
            AnnouncementType::Profile => "profileQueue",
            AnnouncementType::Tombstone => "tombstoneQueue",
        }
    }

    pub fn from_queue_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.queue_name() == name)
    }
}

impl fmt::Display for AnnouncementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnnouncementType {
    type Err = HeraldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| HeraldError::InvalidInput(format!("unknown announcement type {s:?}")))
    }
}

/// Deployment environment; selects the schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Rococo,
    Mainnet,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Dev => "dev",
            Environment::Rococo => "rococo",
            Environment::Mainnet => "mainnet",
        })
    }
}

impl FromStr for Environment {
    type Err = HeraldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "rococo" => Ok(Environment::Rococo),
            "mainnet" => Ok(Environment::Mainnet),
            other => Err(HeraldError::InvalidInput(format!(
                "unknown environment {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AnnouncementType, BatchId, Environment, TxHash};

    #[test]
    fn queue_names_round_trip() {
        for kind in AnnouncementType::ALL {
            assert_eq!(AnnouncementType::from_queue_name(kind.queue_name()), Some(kind));
        }
        assert_eq!(AnnouncementType::from_queue_name("assetQueue"), None);
    }

    #[test]
    fn announcement_type_parses_case_insensitively() {
        assert_eq!(
            "Tombstone".parse::<AnnouncementType>().expect("parse"),
            AnnouncementType::Tombstone
        );
        assert!("note".parse::<AnnouncementType>().is_err());
    }

    #[test]
    fn tx_hash_serializes_as_prefixed_hex() {
        let hash = TxHash([0xAB; 32]);
        let json = serde_json::to_string(&hash).expect("encode");
        assert_eq!(json, format!("\"0x{}\"", "ab".repeat(32)));
        let back: TxHash = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, hash);
    }

    #[test]
    fn tx_hash_rejects_short_input() {
        assert!("0xabcd".parse::<TxHash>().is_err());
    }

    #[test]
    fn fresh_batch_ids_are_distinct() {
        assert_ne!(BatchId::fresh(), BatchId::fresh());
    }

    #[test]
    fn environment_parses_known_names() {
        assert_eq!("MAINNET".parse::<Environment>().expect("env"), Environment::Mainnet);
        assert!("staging".parse::<Environment>().is_err());
    }
}
