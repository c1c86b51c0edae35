use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use rig::completion::Prompt;
use tracing::warn;

/// Per-call completion timeout. Exceeding it counts as a transient failure.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(60);

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_JITTER: f64 = 0.2;
const MAX_ATTEMPTS: u32 = 5;

/// Single-shot completion client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String>;
}

/// OpenRouter-backed completion client.
pub struct OpenRouterLlm {
    api_key: String,
    model: String,
}

impl OpenRouterLlm {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn prompt_once(&self, system: &str, prompt: &str) -> anyhow::Result<String> {
        let client = rig::providers::openrouter::Client::new(&self.api_key);
        let agent = client.agent(&self.model).preamble(system).build();

        match tokio::time::timeout(LLM_TIMEOUT, agent.prompt(prompt)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(anyhow!("completion failed: {e}")),
            Err(_) => Err(anyhow!(
                "completion timed out after {}s",
                LLM_TIMEOUT.as_secs()
            )),
        }
    }
}

#[async_trait]
impl LlmClient for OpenRouterLlm {
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String> {
        retry_with_backoff(|| self.prompt_once(system, prompt)).await
    }
}

/// Retry an operation with exponential backoff on transient failures.
///
/// Base 1s, factor 2, ±20% jitter, at most 5 attempts. Non-transient errors
/// fail immediately so call sites can fall back to their safe defaults.
pub async fn retry_with_backoff<T, F, Fut>(op: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                let delay = backoff_delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient completion failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = 1.0 + BACKOFF_JITTER * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    Duration::from_millis((base * jitter).round() as u64)
}

pub(crate) fn is_transient(e: &anyhow::Error) -> bool {
    let text = format!("{e:#}").to_lowercase();
    ["429", "rate limit", "throttl", "timed out", "timeout", "overloaded", "502", "503", "500", "connection"]
        .iter()
        .any(|marker| text.contains(marker))
}

/// Strip markdown code fences that models like to wrap JSON in.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Extract the first balanced `{…}` substring, respecting string literals.
pub fn extract_json_object(raw: &str) -> Option<String> {
    extract_balanced(strip_code_fences(raw), '{', '}')
}

/// Extract the first balanced `[…]` substring, respecting string literals.
pub fn extract_json_array(raw: &str) -> Option<String> {
    extract_balanced(strip_code_fences(raw), '[', ']')
}

fn extract_balanced(raw: &str, open: char, close: char) -> Option<String> {
    let start = raw.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a list of strings out of an LLM response.
///
/// Tries a strict JSON array first, then a balanced substring, then falls
/// back to splitting lines and trimming bullet/number prefixes.
pub fn parse_string_array(raw: &str) -> Vec<String> {
    let cleaned = strip_code_fences(raw);

    if let Ok(items) = serde_json::from_str::<Vec<String>>(cleaned) {
        return prune(items);
    }
    if let Some(json) = extract_json_array(cleaned) {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(&json) {
            return prune(items);
        }
    }

    prune(
        cleaned
            .lines()
            .map(|line| {
                line.trim()
                    .trim_start_matches(|c: char| {
                        c.is_ascii_digit() || c == '-' || c == '*' || c == '.' || c == ')'
                    })
                    .trim()
                    .trim_matches('"')
                    .trim_end_matches(',')
                    .trim_matches('"')
                    .to_string()
            })
            .collect(),
    )
}

fn prune(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn balanced_object_is_extracted_from_prose() {
        let raw = "Sure! Here is the grade: {\"score\": 0.5, \"note\": \"a {nested} brace\"} hope it helps";
        let json = extract_json_object(raw).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["score"], 0.5);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let raw = r#"{"text": "open { but never closed"}"#;
        let json = extract_json_object(raw).unwrap();
        assert_eq!(json, raw);
    }

    #[test]
    fn string_array_parses_json_and_falls_back_to_lines() {
        assert_eq!(
            parse_string_array(r#"["a", "b"]"#),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            parse_string_array("here you go:\n1. first query\n2. second query"),
            vec![
                "here you go:".to_string(),
                "first query".to_string(),
                "second query".to_string()
            ]
        );
        assert!(parse_string_array("").is_empty());
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        for attempt in 1..=5 {
            let expected = 1_000u64 * 2u64.pow(attempt - 1);
            let low = (expected as f64 * 0.8).floor() as u128;
            let high = (expected as f64 * 1.2).ceil() as u128;
            let delay = backoff_delay(attempt).as_millis();
            assert!(delay >= low && delay <= high, "attempt {attempt}: {delay}ms");
        }
    }

    #[test]
    fn transient_errors_are_recognized() {
        assert!(is_transient(&anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_transient(&anyhow!("completion timed out after 60s")));
        assert!(!is_transient(&anyhow!("invalid api key")));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_on_non_transient_errors() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_with_backoff(|| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(anyhow!("invalid api key")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_after_five_transient_attempts() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_with_backoff(|| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(anyhow!("HTTP 503 service unavailable")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 5);
    }
}
