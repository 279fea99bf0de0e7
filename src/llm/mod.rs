//! Classification backends
//!
//! The plan builder only needs two questions answered: which goals does this
//! change set contain, and which goal does one hunk belong to. Backends are
//! resolved once into a [`Capability`] and called through
//! [`ClassificationPort`].

pub mod client;
pub mod parse;
pub mod prompts;

pub use client::HttpClassifier;

use crate::diff::Hunk;
use crate::plan::Goal;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

pub const DEFAULT_GEMINI_MODEL: &str = "models/gemini-2.5-flash-lite";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2:3b";

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Gemini,
    OpenAi,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
            Provider::Ollama => "ollama",
        }
    }

    /// Environment variable holding a single fallback key
    pub fn key_env_var(&self) -> Option<&'static str> {
        match self {
            Provider::Gemini => Some("GOOGLE_API_KEY"),
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Ollama => None,
        }
    }

    pub fn requires_key(&self) -> bool {
        self.key_env_var().is_some()
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Gemini => DEFAULT_GEMINI_MODEL,
            Provider::OpenAi => DEFAULT_OPENAI_MODEL,
            Provider::Ollama => DEFAULT_OLLAMA_MODEL,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Provider::Gemini),
            "openai" => Ok(Provider::OpenAi),
            "ollama" => Ok(Provider::Ollama),
            other => Err(format!(
                "unknown provider '{}' (expected gemini, openai or ollama)",
                other
            )),
        }
    }
}

/// Resolved connection details for one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub model: String,
    /// Only consulted for Ollama and OpenAI-compatible overrides
    pub base_url: Option<String>,
}

/// How classification requests will be made, decided once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Native JSON mode with a response schema (Gemini)
    StructuredOutput { endpoint: Url, model: String },
    /// OpenAI-compatible chat completions over plain HTTP (OpenAI, Ollama)
    RawHttp { endpoint: Url, model: String },
    Unavailable(String),
}

impl Capability {
    /// `has_credentials` is true when either the pool or the environment
    /// supplies a key for the provider.
    pub fn resolve(settings: &ProviderSettings, has_credentials: bool) -> Self {
        let provider = settings.provider;
        if provider.requires_key() && !has_credentials {
            let hint = provider.key_env_var().unwrap_or_default();
            return Capability::Unavailable(format!(
                "no API key for {}: add one with `git-split api-key add {}` or set {}",
                provider, provider, hint
            ));
        }

        let model = settings.model.trim();
        if model.is_empty() {
            return Capability::Unavailable(format!("no model configured for {}", provider));
        }

        match provider {
            Provider::Gemini => {
                let model = if model.starts_with("models/") {
                    model.to_string()
                } else {
                    format!("models/{}", model)
                };
                let base = settings.base_url.as_deref().unwrap_or(GEMINI_BASE_URL);
                match join_endpoint(base, &format!("{}:generateContent", model)) {
                    Ok(endpoint) => Capability::StructuredOutput { endpoint, model },
                    Err(reason) => Capability::Unavailable(reason),
                }
            }
            Provider::OpenAi | Provider::Ollama => {
                let default_base = if provider == Provider::Ollama {
                    DEFAULT_OLLAMA_BASE_URL
                } else {
                    OPENAI_BASE_URL
                };
                let base = settings.base_url.as_deref().unwrap_or(default_base);
                match join_endpoint(base, "v1/chat/completions") {
                    Ok(endpoint) => Capability::RawHttp {
                        endpoint,
                        model: model.to_string(),
                    },
                    Err(reason) => Capability::Unavailable(reason),
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, Capability::Unavailable(_))
    }
}

fn join_endpoint(base: &str, path: &str) -> Result<Url, String> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = Url::parse(&base).map_err(|e| format!("invalid base URL '{}': {}", base, e))?;
    base.join(path)
        .map_err(|e| format!("invalid endpoint path '{}': {}", path, e))
}

/// Credential handed to one backend call
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Auth {
    /// Pool id when the secret came from the credential store
    pub credential_id: Option<i64>,
    pub secret: Option<String>,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("credential_id", &self.credential_id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimit,
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Server hint in seconds, when one was given
    pub retry_after: Option<u64>,
}

impl ProviderError {
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimit,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Other,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify by message text, the way provider SDK errors surface
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            Self::rate_limit(message)
        } else {
            Self::other(message)
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimit
    }
}

pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    message.contains("RESOURCE_EXHAUSTED")
        || lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("quota")
}

/// A backend able to identify goals and classify hunks
#[allow(async_fn_in_trait)]
pub trait ClassificationPort {
    async fn identify_goals(
        &self,
        auth: &Auth,
        hunks: &[Hunk],
        context: &str,
    ) -> Result<Vec<Goal>, ProviderError>;

    async fn classify(
        &self,
        auth: &Auth,
        hunk: &Hunk,
        goals: &[Goal],
        context: &str,
    ) -> Result<u32, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(provider: Provider, base_url: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            provider,
            model: provider.default_model().to_string(),
            base_url: base_url.map(str::to_string),
        }
    }

    #[test]
    fn test_gemini_resolves_to_structured_output() {
        match Capability::resolve(&settings(Provider::Gemini, None), true) {
            Capability::StructuredOutput { endpoint, model } => {
                assert_eq!(model, "models/gemini-2.5-flash-lite");
                assert_eq!(
                    endpoint.as_str(),
                    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-lite:generateContent"
                );
            }
            other => panic!("unexpected capability {:?}", other),
        }
    }

    #[test]
    fn test_ollama_needs_no_key_and_uses_base_url() {
        let cap = Capability::resolve(&settings(Provider::Ollama, Some("http://gpu-box:11434")), false);
        match cap {
            Capability::RawHttp { endpoint, model } => {
                assert_eq!(endpoint.as_str(), "http://gpu-box:11434/v1/chat/completions");
                assert_eq!(model, "llama3.2:3b");
            }
            other => panic!("unexpected capability {:?}", other),
        }
    }

    #[test]
    fn test_missing_key_is_unavailable() {
        let cap = Capability::resolve(&settings(Provider::OpenAi, None), false);
        assert!(!cap.is_available());
        match cap {
            Capability::Unavailable(reason) => assert!(reason.contains("OPENAI_API_KEY")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_bad_base_url_is_unavailable() {
        let cap = Capability::resolve(&settings(Provider::Ollama, Some("not a url")), false);
        assert!(matches!(cap, Capability::Unavailable(_)));
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(ProviderError::from_message("429 Too Many Requests").is_rate_limit());
        assert!(ProviderError::from_message("status: RESOURCE_EXHAUSTED").is_rate_limit());
        assert!(ProviderError::from_message("You exceeded your current Quota").is_rate_limit());
        assert!(ProviderError::from_message("Rate limit reached for gpt-4o-mini").is_rate_limit());
        assert!(!ProviderError::from_message("invalid request: missing field").is_rate_limit());
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("Gemini".parse::<Provider>().unwrap(), Provider::Gemini);
        assert_eq!("openai".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert!("claude".parse::<Provider>().is_err());
    }

    #[test]
    fn test_auth_debug_hides_secret() {
        let auth = Auth {
            credential_id: Some(3),
            secret: Some("sk-very-secret".to_string()),
        };
        let shown = format!("{:?}", auth);
        assert!(!shown.contains("very-secret"));
    }
}
