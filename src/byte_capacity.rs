pub const KILOBYTE: u64 = 1000;
pub const MEGABYTE: u64 = 1000 * KILOBYTE;
pub const GIGABYTE: u64 = 1000 * MEGABYTE;
pub const TERABYTE: u64 = 1000 * GIGABYTE;

/// A byte size for stream limits, in decimal units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteCapacity {
    B(u64),
    KB(u64),
    MB(u64),
    GB(u64),
    TB(u64),
}

impl ByteCapacity {
    pub fn bytes(&self) -> u64 {
        match self {
            ByteCapacity::B(x) => *x,
            ByteCapacity::KB(x) => x.saturating_mul(KILOBYTE),
            ByteCapacity::MB(x) => x.saturating_mul(MEGABYTE),
            ByteCapacity::GB(x) => x.saturating_mul(GIGABYTE),
            ByteCapacity::TB(x) => x.saturating_mul(TERABYTE),
        }
    }

    /// The size as a stream `max_bytes` limit.
    pub fn as_limit(&self) -> i64 {
        i64::try_from(self.bytes()).unwrap_or(i64::MAX)
    }

    fn parse(value: &str) -> Result<ByteCapacity, std::num::ParseIntError> {
        let units: [(&str, fn(u64) -> ByteCapacity); 5] = [
            ("TB", ByteCapacity::TB),
            ("GB", ByteCapacity::GB),
            ("MB", ByteCapacity::MB),
            ("KB", ByteCapacity::KB),
            ("B", ByteCapacity::B),
        ];
        for (suffix, unit) in units {
            if let Some(number) = value.strip_suffix(suffix) {
                return number.trim().parse().map(unit);
            }
        }
        value.trim().parse().map(ByteCapacity::B)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for ByteCapacity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Visitor;
        use std::fmt;

        struct U64OrStringVisitor;

        impl Visitor<'_> for U64OrStringVisitor {
            type Value = ByteCapacity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a u64 or a \\d+(B|KB|MB|GB|TB) string")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ByteCapacity::B(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                ByteCapacity::parse(v).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(U64OrStringVisitor)
    }
}
