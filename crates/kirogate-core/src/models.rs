/// Client-facing model names mapped to upstream model ids.
///
/// The gateway accepts the Anthropic-style names clients already use and
/// translates them to the ids the upstream expects. Unknown names pass
/// through unchanged so new upstream models work without a gateway release.
const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
    ("claude-haiku-4-5-20251001", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-3-7-sonnet", "CLAUDE_3_7_SONNET_20250219_V1_0"),
];

/// Resolve a client model name to the upstream model id.
pub fn resolve_model(name: &str) -> &str {
    MODEL_MAP
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, id)| *id)
        .unwrap_or(name)
}

/// Canonical client-facing names for `GET /v1/models` (aliases excluded).
pub fn available_models() -> Vec<&'static str> {
    let mut seen = Vec::new();
    let mut names = Vec::new();
    for (alias, id) in MODEL_MAP {
        if !seen.contains(id) {
            seen.push(id);
            names.push(*alias);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve() {
        assert_eq!(
            resolve_model("claude-sonnet-4-5"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        assert_eq!(
            resolve_model("claude-sonnet-4-5-20250929"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
    }

    #[test]
    fn unknown_model_passes_through() {
        assert_eq!(resolve_model("claude-next-9"), "claude-next-9");
    }

    #[test]
    fn listing_has_no_duplicate_ids() {
        let models = available_models();
        assert!(models.contains(&"claude-sonnet-4-5"));
        // one canonical name per upstream id
        assert!(!models.contains(&"claude-sonnet-4-5-20250929"));
    }
}
