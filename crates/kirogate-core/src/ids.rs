use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Completion id in the shape OpenAI clients expect.
pub fn generate_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

/// Tool-call id for synthesised calls (bracket-style fallback parsing).
pub fn generate_tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Conversation id attached to the upstream payload.
///
/// Deterministic over the conversation so retries and follow-ups land in the
/// same upstream conversation: hashes the first few message texts plus the
/// message count into a UUID-shaped string. Random when there are no
/// messages.
pub fn generate_conversation_id(texts: &[&str]) -> String {
    if texts.is_empty() {
        return Uuid::new_v4().to_string();
    }

    let mut hasher = Sha256::new();
    for text in texts.iter().take(3) {
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(texts.len().to_le_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_id_has_prefix() {
        assert!(generate_completion_id().starts_with("chatcmpl-"));
    }

    #[test]
    fn tool_call_ids_are_unique() {
        assert_ne!(generate_tool_call_id(), generate_tool_call_id());
    }

    #[test]
    fn conversation_id_deterministic_for_same_messages() {
        let a = generate_conversation_id(&["hello", "world"]);
        let b = generate_conversation_id(&["hello", "world"]);
        assert_eq!(a, b);
    }

    #[test]
    fn conversation_id_varies_with_content() {
        let a = generate_conversation_id(&["hello"]);
        let b = generate_conversation_id(&["goodbye"]);
        assert_ne!(a, b);
    }

    #[test]
    fn conversation_id_random_without_messages() {
        assert_ne!(generate_conversation_id(&[]), generate_conversation_id(&[]));
    }

    #[test]
    fn conversation_id_parses_as_uuid() {
        let id = generate_conversation_id(&["seed"]);
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
