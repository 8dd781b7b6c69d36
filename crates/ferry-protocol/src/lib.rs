//! Wire types for the cache coordinator.
//!
//! Every request travels as `{ "id": .., "type": .., "payload": .. }` and is
//! answered by exactly one reply carrying the same `id`. Notices are pushed by
//! the coordinator without an `id` and are never requested directly.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage class of a cache entry; drives the split counts in [`CacheSummary`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryClass {
    Static,
    Model,
}

impl EntryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryClass::Static => "static",
            EntryClass::Model => "model",
        }
    }
}

/// Which entries a `CACHE_CLEAR` removes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", content = "url", rename_all = "snake_case")]
pub enum ClearScope {
    All,
    Models,
    Static,
    Url(String),
}

impl ClearScope {
    pub fn matches(&self, url: &str, class: EntryClass) -> bool {
        match self {
            ClearScope::All => true,
            ClearScope::Models => class == EntryClass::Model,
            ClearScope::Static => class == EntryClass::Static,
            ClearScope::Url(target) => target == url,
        }
    }
}

/// Metadata returned alongside a cache hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMeta {
    pub url: String,
    pub size_bytes: u64,
    pub stored_at: DateTime<Utc>,
    pub generation: String,
    pub class: EntryClass,
    /// On-disk handle for callers that prefer to map the blob themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CacheSummary {
    pub static_asset_count: u64,
    pub model_count: u64,
    pub total_bytes: u64,
    pub generation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheRequest {
    CacheStore {
        url: String,
        #[serde(with = "b64")]
        bytes: Bytes,
        class: EntryClass,
    },
    CacheLookup {
        url: String,
    },
    CacheClear(ClearScope),
    CacheStatus,
}

impl CacheRequest {
    pub fn type_name(&self) -> &'static str {
        match self {
            CacheRequest::CacheStore { .. } => "CACHE_STORE",
            CacheRequest::CacheLookup { .. } => "CACHE_LOOKUP",
            CacheRequest::CacheClear(_) => "CACHE_CLEAR",
            CacheRequest::CacheStatus => "CACHE_STATUS",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheReply {
    Ack {
        #[serde(default)]
        removed: u64,
    },
    Hit {
        #[serde(with = "b64")]
        bytes: Bytes,
        meta: EntryMeta,
    },
    Miss,
    Status(CacheSummary),
    Error {
        message: String,
    },
}

impl CacheReply {
    pub fn type_name(&self) -> &'static str {
        match self {
            CacheReply::Ack { .. } => "ACK",
            CacheReply::Hit { .. } => "HIT",
            CacheReply::Miss => "MISS",
            CacheReply::Status(_) => "STATUS",
            CacheReply::Error { .. } => "ERROR",
        }
    }
}

/// Out-of-band notifications pushed by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheNotice {
    CacheUpdated {
        url: String,
        size_bytes: u64,
        class: EntryClass,
    },
    OfflineReady {
        generation: String,
        entries: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub request: CacheRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub reply: CacheReply,
}

/// Anything the coordinator emits: a correlated reply or an uncorrelated notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WorkerMessage {
    Notice(CacheNotice),
    Reply(ReplyEnvelope),
}

/// Encode one message as a single newline-free JSON line.
pub fn to_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

pub fn from_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_uses_flat_type_and_payload() {
        let env = RequestEnvelope {
            id: "c-1".into(),
            request: CacheRequest::CacheStore {
                url: "https://cdn.example/m.onnx".into(),
                bytes: Bytes::from_static(b"abc"),
                class: EntryClass::Model,
            },
        };
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "c-1",
                "type": "CACHE_STORE",
                "payload": {"url": "https://cdn.example/m.onnx", "bytes": "YWJj", "class": "model"}
            })
        );
        let back: RequestEnvelope = from_line(&to_line(&env).unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn status_request_needs_no_payload() {
        let env: RequestEnvelope = from_line(r#"{"id":"x","type":"CACHE_STATUS"}"#).unwrap();
        assert_eq!(env.request, CacheRequest::CacheStatus);
        assert_eq!(env.request.type_name(), "CACHE_STATUS");
    }

    #[test]
    fn worker_messages_split_notices_from_replies() {
        let notice: WorkerMessage =
            from_line(r#"{"type":"OFFLINE_READY","payload":{"generation":"g2","entries":3}}"#)
                .unwrap();
        assert!(matches!(
            notice,
            WorkerMessage::Notice(CacheNotice::OfflineReady { entries: 3, .. })
        ));

        let reply: WorkerMessage = from_line(r#"{"id":"r-9","type":"MISS"}"#).unwrap();
        match reply {
            WorkerMessage::Reply(env) => {
                assert_eq!(env.id, "r-9");
                assert_eq!(env.reply, CacheReply::Miss);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn clear_scope_matches_by_class_and_url() {
        assert!(ClearScope::All.matches("a", EntryClass::Static));
        assert!(ClearScope::Models.matches("a", EntryClass::Model));
        assert!(!ClearScope::Models.matches("a", EntryClass::Static));
        assert!(ClearScope::Url("a".into()).matches("a", EntryClass::Static));
        assert!(!ClearScope::Url("a".into()).matches("b", EntryClass::Static));
    }
}
