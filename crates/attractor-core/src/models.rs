use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    fn matches(&self, name: &str) -> bool {
        self.id.eq_ignore_ascii_case(name)
            || self
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(name))
    }
}

/// Registry the backend consults for per-stage `llm_model` overrides. A host
/// can install its own catalog; `resolve_model` falls back to the builtin
/// table when the host registry misses.
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    models: Vec<ModelInfo>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models<I>(models: I) -> Self
    where
        I: IntoIterator<Item = ModelInfo>,
    {
        Self {
            models: models.into_iter().collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::with_models([
            ModelInfo::new("claude-opus-4", "anthropic").with_aliases(["opus"]),
            ModelInfo::new("claude-sonnet-4", "anthropic").with_aliases(["sonnet"]),
            ModelInfo::new("claude-haiku-3-5", "anthropic").with_aliases(["haiku"]),
            ModelInfo::new("gpt-5", "openai"),
            ModelInfo::new("gpt-5-mini", "openai"),
            ModelInfo::new("gemini-2.5-pro", "google").with_aliases(["gemini-pro"]),
            ModelInfo::new("gemini-2.5-flash", "google").with_aliases(["gemini-flash"]),
        ])
    }

    pub fn register(&mut self, model: ModelInfo) {
        self.models.push(model);
    }

    pub fn resolve(&self, name: &str) -> Option<&ModelInfo> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.models.iter().find(|model| model.matches(name))
    }

    pub fn list(&self, provider: Option<&str>) -> Vec<&ModelInfo> {
        self.models
            .iter()
            .filter(|model| {
                provider.is_none_or(|provider| model.provider.eq_ignore_ascii_case(provider))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Host registry first, builtin table second.
pub fn resolve_model(registry: &ModelRegistry, name: &str) -> Option<ModelInfo> {
    registry
        .resolve(name)
        .cloned()
        .or_else(|| ModelRegistry::builtin().resolve(name).cloned())
}
