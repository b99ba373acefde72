//! Newtypes around Discord IDs.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

macro_rules! impl_id {
    ($Id:ident) => {
        impl $Id {
            /// Returns the u64 representation of this Id.
            #[must_use]
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl Display for $Id {
            fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
                Display::fmt(&self.0, f)
            }
        }

        impl From<u64> for $Id {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl FromStr for $Id {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        // Snowflakes travel as strings in JSON, but as integers in ETF.
        impl<'de> Deserialize<'de> for $Id {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(SnowflakeVisitor).map(Self)
            }
        }

        impl Serialize for $Id {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }
    };
}

struct SnowflakeVisitor;

impl<'de> de::Visitor<'de> for SnowflakeVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("a snowflake as a string or integer")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::custom("negative snowflake"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        v.parse().map_err(E::custom)
    }
}

/// ID of a Discord voice/text channel.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChannelId(pub u64);

/// ID of a Discord guild (colloquially, "server").
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GuildId(pub u64);

/// ID of a Discord user.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UserId(pub u64);

/// ID of a Discord message.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub u64);

/// ID of a Discord interaction.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InteractionId(pub u64);

impl_id! {ChannelId}
impl_id! {GuildId}
impl_id! {UserId}
impl_id! {MessageId}
impl_id! {InteractionId}

/// Computes the shard responsible for a guild.
#[must_use]
pub fn shard_id(guild_id: GuildId, shard_count: u64) -> u64 {
    (guild_id.get() >> 22) % shard_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflakes_accept_strings_and_integers() {
        let a: GuildId = serde_json::from_str("\"81384788765712384\"").unwrap();
        let b: GuildId = serde_json::from_str("81384788765712384").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"81384788765712384\"");
    }

    #[test]
    fn shard_routing_uses_timestamp_bits() {
        let guild = GuildId(81_384_788_765_712_384);
        assert_eq!(shard_id(guild, 1), 0);
        assert_eq!(shard_id(guild, 16), (81_384_788_765_712_384u64 >> 22) % 16);
    }
}
