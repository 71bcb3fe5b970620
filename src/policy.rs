//! Symbolic configuration values, as found in caller configs, resolved to
//! the policy enums.
pub use nats_jetstream_protocol::{
    AckPolicy, DeliverPolicy, DiscardPolicy, ReplayPolicy, RetentionPolicy, StorageType,
};
use time::OffsetDateTime;

/// Total translation from a symbol to a policy.
///
/// Symbols are matched exactly: `"workqueue"` resolves, `"WorkQueue"` does not.
pub trait FromSymbol: Sized + Default {
    /// Strict lookup, `None` for anything unrecognized.
    fn try_from_symbol(symbol: &str) -> Option<Self>;

    /// Unrecognized or empty symbols resolve to the default policy.
    fn from_symbol(symbol: &str) -> Self {
        Self::try_from_symbol(symbol).unwrap_or_default()
    }

    /// The wire name of the policy.
    fn symbol(&self) -> &'static str;
}

/// The start positions carried by `by_start_sequence` and `by_start_time` are
/// left at zero here and filled in from the consumer config.
impl FromSymbol for DeliverPolicy {
    fn try_from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "all" => Some(DeliverPolicy::All),
            "last" => Some(DeliverPolicy::Last),
            "new" => Some(DeliverPolicy::New),
            "by_start_sequence" => Some(DeliverPolicy::ByStartSequence { start_sequence: 0 }),
            "by_start_time" => Some(DeliverPolicy::ByStartTime {
                start_time: OffsetDateTime::UNIX_EPOCH,
            }),
            "last_per_subject" => Some(DeliverPolicy::LastPerSubject),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            DeliverPolicy::All => "all",
            DeliverPolicy::Last => "last",
            DeliverPolicy::New => "new",
            DeliverPolicy::ByStartSequence { .. } => "by_start_sequence",
            DeliverPolicy::ByStartTime { .. } => "by_start_time",
            DeliverPolicy::LastPerSubject => "last_per_subject",
        }
    }
}

impl FromSymbol for AckPolicy {
    fn try_from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "none" => Some(AckPolicy::None),
            "all" => Some(AckPolicy::All),
            "explicit" => Some(AckPolicy::Explicit),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            AckPolicy::None => "none",
            AckPolicy::All => "all",
            AckPolicy::Explicit => "explicit",
        }
    }
}

impl FromSymbol for ReplayPolicy {
    fn try_from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "instant" => Some(ReplayPolicy::Instant),
            "original" => Some(ReplayPolicy::Original),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            ReplayPolicy::Instant => "instant",
            ReplayPolicy::Original => "original",
        }
    }
}

impl FromSymbol for RetentionPolicy {
    fn try_from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "limits" => Some(RetentionPolicy::Limits),
            "interest" => Some(RetentionPolicy::Interest),
            "workqueue" => Some(RetentionPolicy::WorkQueue),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            RetentionPolicy::Limits => "limits",
            RetentionPolicy::Interest => "interest",
            RetentionPolicy::WorkQueue => "workqueue",
        }
    }
}

impl FromSymbol for DiscardPolicy {
    fn try_from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "old" => Some(DiscardPolicy::Old),
            "new" => Some(DiscardPolicy::New),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            DiscardPolicy::Old => "old",
            DiscardPolicy::New => "new",
        }
    }
}

impl FromSymbol for StorageType {
    fn try_from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "file" => Some(StorageType::File),
            "memory" => Some(StorageType::Memory),
            _ => None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            StorageType::File => "file",
            StorageType::Memory => "memory",
        }
    }
}
