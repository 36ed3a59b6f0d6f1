use serde_json::Value;
use shared::domain::{ProviderAvailability, ProviderKind, ProviderSettings, ResolvedProvider};

/// Marker substituted when a completion reply arrives as well-formed JSON
/// in none of the known shapes.
pub const UNREADABLE_REPLY: &str = "[unreadable response]";

/// Picks the provider and model a send should target. Pure: identical
/// inputs always route identically, and nothing here touches the network.
///
/// Fallback rules:
/// - OpenAI preferred but no API key: use Ollama with its configured model,
///   or the first discovered model when the configured one is absent from
///   the discovery list.
/// - Ollama preferred but the discovery list is empty or does not contain
///   the configured model: use OpenAI with its configured model, even
///   without a verified key. The send then fails with an explainable
///   network error instead of being blocked client-side.
pub fn resolve(
    settings: &ProviderSettings,
    availability: &ProviderAvailability,
) -> ResolvedProvider {
    match settings.provider {
        ProviderKind::OpenAi if !availability.openai_key_present => {
            match usable_ollama_model(settings, availability) {
                Some(model) => ResolvedProvider {
                    provider: ProviderKind::Ollama,
                    model,
                },
                None => openai(settings),
            }
        }
        ProviderKind::OpenAi => openai(settings),
        ProviderKind::Ollama => {
            if availability.ollama_models.contains(&settings.ollama_model) {
                ResolvedProvider {
                    provider: ProviderKind::Ollama,
                    model: settings.ollama_model.clone(),
                }
            } else {
                openai(settings)
            }
        }
    }
}

fn openai(settings: &ProviderSettings) -> ResolvedProvider {
    ResolvedProvider {
        provider: ProviderKind::OpenAi,
        model: settings.openai_model.clone(),
    }
}

fn usable_ollama_model(
    settings: &ProviderSettings,
    availability: &ProviderAvailability,
) -> Option<String> {
    if availability.ollama_models.contains(&settings.ollama_model) {
        return Some(settings.ollama_model.clone());
    }
    availability.ollama_models.first().cloned()
}

/// Pulls display text out of a completion reply, whatever its shape.
///
/// Known shapes are tried in a fixed priority order: a bare string, `text`,
/// `content`, the OpenAI-style `choices[0].message.content` path, then
/// `answer`. Any other well-formed payload yields [`UNREADABLE_REPLY`];
/// this never panics.
pub fn extract_reply_text(payload: &Value) -> String {
    let extractors: [fn(&Value) -> Option<&str>; 5] = [
        |value| value.as_str(),
        |value| value.get("text")?.as_str(),
        |value| value.get("content")?.as_str(),
        |value| {
            value
                .get("choices")?
                .get(0)?
                .get("message")?
                .get("content")?
                .as_str()
        },
        |value| value.get("answer")?.as_str(),
    ];

    extractors
        .iter()
        .find_map(|extract| extract(payload))
        .unwrap_or(UNREADABLE_REPLY)
        .to_string()
}

#[cfg(test)]
#[path = "tests/provider_tests.rs"]
mod tests;
