use super::parse::{parse_goal_id, parse_structured_content, redact_secret, sanitize_api_response};
use super::prompts::{classify_user_prompt, goals_user_prompt, CLASSIFY_SYSTEM, GOALS_SYSTEM};
use super::{Auth, Capability, ClassificationPort, ProviderError};
use crate::diff::Hunk;
use crate::plan::Goal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use url::Url;

pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Classification over HTTP for whichever backend the capability names
pub struct HttpClassifier {
    http: reqwest::Client,
    capability: Capability,
}

#[derive(Debug, Deserialize)]
struct GoalsResponse {
    goals: Vec<Goal>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

/// Create a configured HTTP client for provider requests
pub fn create_http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

impl HttpClassifier {
    pub fn new(capability: Capability, timeout_secs: u64) -> anyhow::Result<Self> {
        if let Capability::Unavailable(reason) = &capability {
            anyhow::bail!("Classification unavailable: {}", reason);
        }
        Ok(Self {
            http: create_http_client(timeout_secs)?,
            capability,
        })
    }

    async fn complete(
        &self,
        auth: &Auth,
        system: &str,
        user: &str,
        json_reply: bool,
    ) -> Result<String, ProviderError> {
        match &self.capability {
            Capability::StructuredOutput { endpoint, .. } => {
                let schema = json_reply.then(goals_schema);
                self.gemini_generate(endpoint, auth, system, user, schema)
                    .await
            }
            Capability::RawHttp { endpoint, model } => {
                self.chat_completion(endpoint, model, auth, system, user, json_reply)
                    .await
            }
            Capability::Unavailable(reason) => Err(ProviderError::other(reason.clone())),
        }
    }

    async fn gemini_generate(
        &self,
        endpoint: &Url,
        auth: &Auth,
        system: &str,
        user: &str,
        schema: Option<serde_json::Value>,
    ) -> Result<String, ProviderError> {
        let mut generation_config = json!({ "temperature": 0.2 });
        if let Some(schema) = schema {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = schema;
        }
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
            "generationConfig": generation_config,
        });

        let mut request = self.http.post(endpoint.clone()).json(&body);
        if let Some(secret) = &auth.secret {
            request = request.header("x-goog-api-key", secret);
        }
        let text = send(request, auth).await?;

        let parsed: GeminiResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::other(format!(
                "Unexpected Gemini response ({}): {}",
                e,
                sanitize_api_response(&text)
            ))
        })?;
        parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| ProviderError::other("Gemini returned no candidates"))
    }

    async fn chat_completion(
        &self,
        endpoint: &Url,
        model: &str,
        auth: &Auth,
        system: &str,
        user: &str,
        json_reply: bool,
    ) -> Result<String, ProviderError> {
        let messages = [
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ];
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": 0.3,
        });
        if json_reply {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let mut request = self.http.post(endpoint.clone()).json(&body);
        if let Some(secret) = &auth.secret {
            request = request.bearer_auth(secret);
        }
        let text = send(request, auth).await?;

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::other(format!(
                "Unexpected chat completion response ({}): {}",
                e,
                sanitize_api_response(&text)
            ))
        })?;
        parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| ProviderError::other("Chat completion returned no content"))
    }
}

impl ClassificationPort for HttpClassifier {
    async fn identify_goals(
        &self,
        auth: &Auth,
        hunks: &[Hunk],
        context: &str,
    ) -> Result<Vec<Goal>, ProviderError> {
        let user = goals_user_prompt(hunks, context);
        let reply = self.complete(auth, GOALS_SYSTEM, &user, true).await?;
        let parsed: GoalsResponse =
            parse_structured_content(&reply).map_err(ProviderError::other)?;
        Ok(parsed.goals)
    }

    async fn classify(
        &self,
        auth: &Auth,
        hunk: &Hunk,
        goals: &[Goal],
        context: &str,
    ) -> Result<u32, ProviderError> {
        let user = classify_user_prompt(hunk, goals, context);
        let reply = self.complete(auth, CLASSIFY_SYSTEM, &user, false).await?;
        parse_goal_id(&reply).ok_or_else(|| {
            ProviderError::other(format!(
                "No goal id in reply: {}",
                sanitize_api_response(&reply)
            ))
        })
    }
}

fn goals_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "goals": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "id": { "type": "INTEGER" },
                        "description": { "type": "STRING" }
                    },
                    "required": ["id", "description"]
                }
            }
        },
        "required": ["goals"]
    })
}

/// Send and map transport and HTTP failures to provider errors.
async fn send(request: reqwest::RequestBuilder, auth: &Auth) -> Result<String, ProviderError> {
    let secret = auth.secret.as_deref();
    let response = request.send().await.map_err(|err| {
        let message = if err.is_timeout() {
            "Provider request timed out".to_string()
        } else if err.is_connect() {
            "Could not connect to the provider. Check the base URL and your network.".to_string()
        } else {
            redact_secret(&err.to_string(), secret)
        };
        ProviderError::other(message)
    })?;

    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let text = response
        .text()
        .await
        .map_err(|err| ProviderError::other(redact_secret(&err.to_string(), secret)))?;

    if status.is_success() {
        return Ok(text);
    }
    Err(error_from_status(status.as_u16(), &text, retry_after))
}

fn error_from_status(status: u16, body: &str, retry_after: Option<u64>) -> ProviderError {
    let detail = sanitize_api_response(body);
    let mut err = match status {
        429 => ProviderError::rate_limit(format!("429 rate limited: {}", detail)),
        401 | 403 => ProviderError::other(format!("Provider rejected the API key ({})", status)),
        _ if body.contains("RESOURCE_EXHAUSTED") => {
            ProviderError::rate_limit(format!("{} RESOURCE_EXHAUSTED: {}", status, detail))
        }
        _ => ProviderError::from_message(format!("API error {}: {}", status, detail)),
    };
    err.retry_after = retry_after.filter(|secs| *secs > 0 && *secs < 300);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ProviderErrorKind, ProviderSettings, Provider};

    #[test]
    fn test_status_mapping() {
        let err = error_from_status(429, "slow down", Some(12));
        assert_eq!(err.kind, ProviderErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(12));

        let err = error_from_status(400, r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#, None);
        assert!(err.is_rate_limit());

        let err = error_from_status(401, "bad", None);
        assert_eq!(err.kind, ProviderErrorKind::Other);

        let err = error_from_status(500, "overloaded", Some(9999));
        assert!(!err.is_rate_limit());
        assert_eq!(err.retry_after, None);
    }

    #[test]
    fn test_unavailable_capability_is_rejected() {
        let result = HttpClassifier::new(Capability::Unavailable("no key".to_string()), 5);
        assert!(result.is_err());
    }

    #[test]
    fn test_available_capability_builds_client() {
        let settings = ProviderSettings {
            provider: Provider::Ollama,
            model: "llama3.2:3b".to_string(),
            base_url: None,
        };
        let cap = Capability::resolve(&settings, false);
        assert!(HttpClassifier::new(cap, REQUEST_TIMEOUT_SECS).is_ok());
    }

    #[test]
    fn test_goals_response_shape() {
        let parsed: GoalsResponse = parse_structured_content(
            r#"{"goals":[{"id":1,"description":"feat A"},{"id":2,"description":"fix B"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.goals, vec![Goal::new(1, "feat A"), Goal::new(2, "fix B")]);
    }
}
