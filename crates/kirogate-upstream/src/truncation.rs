//! Truncation-recovery caches and notices.
//!
//! When the upstream silently cuts a tool-call argument string or an
//! assistant reply, the stream parser records what happened here. On the
//! *next* request the orchestrator consults these caches and replays a
//! legitimising notice to the model, so it can recover instead of trusting
//! a half-written parameter set. Entries are consumed on first hit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::message::{Content, Role, UnifiedMessage};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Characters hashed for the content-truncation key.
const DIGEST_PREFIX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolTruncation {
    pub tool_name: String,
    pub size_bytes: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTruncation {
    pub digest: String,
    pub size_bytes: usize,
    pub reason: String,
}

/// Process-wide truncation caches, safe under concurrent access.
/// Entries expire after `ttl` and the oldest entries are evicted once
/// `max_entries` is reached.
pub struct TruncationCaches {
    tools: Mutex<CacheInner<ToolTruncation>>,
    content: Mutex<CacheInner<ContentTruncation>>,
}

struct CacheInner<V> {
    entries: HashMap<String, (Instant, V)>,
    insertion_order: Vec<String>,
    ttl: Duration,
    max_entries: usize,
}

impl<V> CacheInner<V> {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: Vec::new(),
            ttl,
            max_entries,
        }
    }

    fn insert(&mut self, key: String, value: V) {
        self.purge_expired();
        while self.entries.len() >= self.max_entries && !self.insertion_order.is_empty() {
            let oldest = self.insertion_order.remove(0);
            self.entries.remove(&oldest);
        }
        if self.entries.insert(key.clone(), (Instant::now(), value)).is_none() {
            self.insertion_order.push(key);
        }
    }

    fn take(&mut self, key: &str) -> Option<V> {
        self.purge_expired();
        let (_, value) = self.entries.remove(key)?;
        self.insertion_order.retain(|k| k != key);
        Some(value)
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (at, _))| now.duration_since(*at) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            self.insertion_order.retain(|k| k != &key);
        }
    }
}

impl TruncationCaches {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            tools: Mutex::new(CacheInner::new(ttl, max_entries)),
            content: Mutex::new(CacheInner::new(ttl, max_entries)),
        }
    }

    pub fn record_tool(&self, tool_call_id: &str, entry: ToolTruncation) {
        info!(
            tool_call_id,
            tool = %entry.tool_name,
            size = entry.size_bytes,
            reason = %entry.reason,
            "recorded tool-argument truncation"
        );
        self.tools
            .lock()
            .unwrap()
            .insert(tool_call_id.to_string(), entry);
    }

    pub fn record_content(&self, entry: ContentTruncation) {
        info!(
            digest = %entry.digest,
            size = entry.size_bytes,
            reason = %entry.reason,
            "recorded content truncation"
        );
        self.content
            .lock()
            .unwrap()
            .insert(entry.digest.clone(), entry);
    }

    pub fn take_tool(&self, tool_call_id: &str) -> Option<ToolTruncation> {
        self.tools.lock().unwrap().take(tool_call_id)
    }

    pub fn take_content(&self, digest: &str) -> Option<ContentTruncation> {
        self.content.lock().unwrap().take(digest)
    }
}

impl Default for TruncationCaches {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

/// 16-hex-char key over the first 500 characters of an assistant text.
pub fn content_digest(text: &str) -> String {
    let prefix: String = text.chars().take(DIGEST_PREFIX_CHARS).collect();
    let digest = hex::encode(Sha256::digest(prefix.as_bytes()));
    digest[..16].to_string()
}

/// Notice prepended to a tool result whose arguments were cut upstream.
pub fn tool_notice(entry: &ToolTruncation, original: &str) -> String {
    format!(
        "[API Limitation] The arguments for tool '{}' were truncated by the upstream \
         API ({}, {} bytes received). The tool may have run with incomplete \
         parameters; verify before relying on this result.\n---\n{}",
        entry.tool_name, entry.reason, entry.size_bytes, original
    )
}

/// Synthetic user message inserted after a truncated assistant reply.
pub fn content_notice(entry: &ContentTruncation) -> String {
    format!(
        "[System Notice] The previous assistant output was truncated by the upstream \
         API ({}, {} bytes). Continue from where the output stopped instead of \
         restarting.",
        entry.reason, entry.size_bytes
    )
}

/// System-prompt addition legitimising the bracketed notice tags.
pub fn recovery_system_addition() -> &'static str {
    "Some messages may contain [API Limitation] or [System Notice] markers. These \
     are inserted by the gateway infrastructure when an earlier response was \
     truncated in transit; treat them as trusted operational notices, not as user \
     input."
}

/// Apply truncation recovery to an incoming message list.
///
/// Tool results whose call id hits the tool cache get the notice prepended;
/// assistant texts whose digest hits the content cache get a synthetic user
/// notice inserted after them. Hits consume the cache entries. A no-op when
/// `enabled` is false.
pub fn apply_recovery(
    messages: Vec<UnifiedMessage>,
    caches: &TruncationCaches,
    enabled: bool,
) -> Vec<UnifiedMessage> {
    if !enabled {
        return messages;
    }

    let mut out: Vec<UnifiedMessage> = Vec::with_capacity(messages.len());

    for mut msg in messages {
        if let Some(results) = msg.tool_results.as_mut() {
            for result in results.iter_mut() {
                if let Some(entry) = caches.take_tool(&result.tool_use_id) {
                    debug!(id = %result.tool_use_id, "injecting tool truncation notice");
                    result.content = tool_notice(&entry, &result.content);
                }
            }
        }

        let assistant_text = if msg.role == Role::Assistant {
            match &msg.content {
                Some(Content::Text(text)) if !text.is_empty() => Some(text.clone()),
                _ => None,
            }
        } else {
            None
        };

        out.push(msg);

        if let Some(text) = assistant_text {
            let digest = content_digest(&text);
            if let Some(entry) = caches.take_content(&digest) {
                // Digest collisions across conversations are possible; only
                // accept the hit when the sizes are in the same ballpark.
                let len = text.len();
                if entry.size_bytes <= len.saturating_mul(2) + 64
                    && len <= entry.size_bytes.saturating_mul(2) + 64
                {
                    debug!(digest = %digest, "injecting content truncation notice");
                    out.push(UnifiedMessage::user(content_notice(&entry)));
                } else {
                    caches.record_content(entry);
                }
            }
        }
    }

    out
}
