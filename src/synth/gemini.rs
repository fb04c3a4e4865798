//! Gemini TTS backend over the REST `generateContent` endpoint.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use serde_json::Value;
use tracing::debug;

use super::{SynthesisError, Synthesizer};

/// Default TTS model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-preview-tts";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Enceladus";

lazy_static! {
    /// Shared HTTP agent (connection reuse across requests)
    static ref HTTP_AGENT: ureq::Agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build();
}

/// Blocking Gemini synthesis: one `generateContent` call configured for
/// audio-only output, returning the decoded inline PCM.
pub struct GeminiSynthesizer {
    model: String,
    voice: String,
}

impl GeminiSynthesizer {
    pub fn new() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
        }
    }

    pub fn with_voice(model: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            voice: voice.into(),
        }
    }
}

impl Default for GeminiSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synthesizer for GeminiSynthesizer {
    fn synthesize(&self, text: &str, api_key: &str) -> Result<Vec<u8>, SynthesisError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, api_key
        );

        let body = serde_json::json!({
            "contents": [{
                "parts": [{ "text": text }]
            }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": {
                            "voiceName": self.voice
                        }
                    }
                }
            }
        });

        debug!("requesting synthesis of {} chars", text.len());

        let response = HTTP_AGENT
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&body.to_string())
            .map_err(map_request_error)?;

        let payload: Value = response
            .into_json()
            .map_err(|err| SynthesisError::Transient(format!("malformed response: {err}")))?;

        extract_inline_audio(&payload)
            .ok_or_else(|| SynthesisError::Transient("no audio data in response".to_string()))
    }
}

fn map_request_error(err: ureq::Error) -> SynthesisError {
    match err {
        ureq::Error::Status(code, _) => classify_status(code),
        ureq::Error::Transport(transport) => SynthesisError::Transient(transport.to_string()),
    }
}

/// HTTP status -> error taxonomy: 429 means the quota window is spent,
/// 400/401/403 mean the key itself was rejected.
fn classify_status(code: u16) -> SynthesisError {
    match code {
        429 => SynthesisError::Quota,
        400 | 401 | 403 => SynthesisError::Auth,
        code => SynthesisError::Transient(format!("HTTP {code}")),
    }
}

/// Pull the first base64 `inlineData` blob out of the candidate parts.
fn extract_inline_audio(payload: &Value) -> Option<Vec<u8>> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    for part in parts {
        if let Some(data) = part
            .get("inlineData")
            .and_then(|d| d.get("data"))
            .and_then(|d| d.as_str())
        {
            if let Ok(bytes) = general_purpose::STANDARD.decode(data) {
                return Some(bytes);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(429), SynthesisError::Quota));
        assert!(matches!(classify_status(400), SynthesisError::Auth));
        assert!(matches!(classify_status(403), SynthesisError::Auth));
        assert!(matches!(classify_status(503), SynthesisError::Transient(_)));
    }

    #[test]
    fn extracts_inline_audio_from_candidates() {
        let encoded = general_purpose::STANDARD.encode([0u8, 1, 2, 3]);
        let payload = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "ignored" },
                        { "inlineData": { "mimeType": "audio/pcm", "data": encoded } }
                    ]
                }
            }]
        });
        assert_eq!(extract_inline_audio(&payload), Some(vec![0, 1, 2, 3]));
    }

    #[test]
    fn missing_audio_yields_none() {
        let payload = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "just text" }] } }]
        });
        assert_eq!(extract_inline_audio(&payload), None);
    }
}
