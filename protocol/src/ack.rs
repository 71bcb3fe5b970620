use std::time::Duration;

use async_nats::jetstream::AckKind;
use chrono::{DateTime, TimeZone, Utc};

pub const ACK_PREFIX: &str = "$JS.ACK";

/// Metadata the server encodes in the reply subject of every delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered, this one included.
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub published: DateTime<Utc>,
    pub pending: u64,
}

impl MessageInfo {
    /// Parses `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
    /// and the v2 layout that inserts domain and account hash after the prefix.
    pub fn parse(reply: &str) -> Option<MessageInfo> {
        let tokens: Vec<&str> = reply.split('.').collect();
        if tokens.len() < 9 || tokens[0] != "$JS" || tokens[1] != "ACK" {
            return None;
        }

        let (domain, rest) = match tokens.len() {
            9 => (None, &tokens[2..]),
            n if n >= 11 => {
                let domain = match tokens[2] {
                    "_" => None,
                    domain => Some(domain.to_owned()),
                };
                (domain, &tokens[4..])
            }
            _ => return None,
        };

        let published = rest[5].parse::<i64>().ok()?;

        Some(MessageInfo {
            domain,
            stream: rest[0].to_owned(),
            consumer: rest[1].to_owned(),
            delivered: rest[2].parse().ok()?,
            stream_sequence: rest[3].parse().ok()?,
            consumer_sequence: rest[4].parse().ok()?,
            published: Utc.timestamp_nanos(published),
            pending: rest[6].parse().ok()?,
        })
    }

    /// Builds the v1 reply subject for this metadata.
    pub fn reply_subject(&self) -> String {
        format!(
            "{ACK_PREFIX}.{}.{}.{}.{}.{}.{}.{}",
            self.stream,
            self.consumer,
            self.delivered,
            self.stream_sequence,
            self.consumer_sequence,
            self.published.timestamp_nanos_opt().unwrap_or_default(),
            self.pending
        )
    }
}

/// Decodes an acknowledgment payload published to a reply subject.
///
/// An empty body counts as a plain ack, as it does on the server.
pub fn parse_ack(payload: &[u8]) -> Option<AckKind> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    match text {
        "" | "+ACK" => Some(AckKind::Ack),
        "-NAK" => Some(AckKind::Nak(None)),
        "+WPI" => Some(AckKind::Progress),
        "+NXT" => Some(AckKind::Next),
        "+TERM" => Some(AckKind::Term),
        nak if nak.starts_with("-NAK") => {
            let body: serde_json::Value = serde_json::from_str(nak[4..].trim()).ok()?;
            let delay = body.get("delay")?.as_u64()?;
            Some(AckKind::Nak(Some(Duration::from_nanos(delay))))
        }
        _ => None,
    }
}
