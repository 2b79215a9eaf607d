use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::PersonaConfig;
use crate::llm_client::GenerationBackend;

/// Turns role-primed prompts into host messages.
///
/// Holds no conversation state of its own: everything situational comes in
/// through `context` on each call.
#[derive(Clone)]
pub struct ResponseGenerator {
    backend: Arc<dyn GenerationBackend>,
    persona: PersonaConfig,
    temperature: f32,
}

impl ResponseGenerator {
    pub fn new(backend: Arc<dyn GenerationBackend>, persona: PersonaConfig, temperature: f32) -> Self {
        Self {
            backend,
            persona,
            temperature,
        }
    }

    pub fn persona(&self) -> &PersonaConfig {
        &self.persona
    }

    /// Reply to a user message, given the current shared summary.
    pub async fn reply(&self, user_message: &str, summary: &str) -> Result<String> {
        self.generate(user_message, summary)
            .await
            .context("error generating response")
    }

    /// Nudge a silent audience.
    pub async fn idle_prompt(&self, summary: &str) -> Result<String> {
        self.generate(&self.persona.idle_cue, summary)
            .await
            .context("error generating idle prompt")
    }

    /// Announce the current poll tallies.
    pub async fn poll_update_prompt(&self, poll_summary: &str) -> Result<String> {
        let context = format!("Poll update: {}", poll_summary);
        self.generate(&self.persona.poll_update_cue, &context)
            .await
            .context("error generating poll update prompt")
    }

    async fn generate(&self, input: &str, context: &str) -> Result<String> {
        let prompt = render_prompt(&self.persona, context, input);
        self.backend.generate(&prompt, self.temperature).await
    }
}

/// Fills the persona template in one left-to-right pass, so substituted text
/// is never scanned for placeholders again.
pub fn render_prompt(persona: &PersonaConfig, context: &str, input: &str) -> String {
    let max_words = persona.max_words.to_string();
    let placeholders = [
        ("{host}", persona.host_name.as_str()),
        ("{max_words}", max_words.as_str()),
        ("{context}", context),
        ("{input}", input),
    ];

    let mut rendered =
        String::with_capacity(persona.template.len() + context.len() + input.len());
    let mut rest = persona.template.as_str();
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open..];
        match placeholders
            .iter()
            .find(|(placeholder, _)| tail.starts_with(placeholder))
        {
            Some((placeholder, value)) => {
                rendered.push_str(value);
                rest = &tail[placeholder.len()..];
            }
            None => {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }
    rendered.push_str(rest);
    rendered
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;

    #[test]
    fn render_prompt_fills_every_placeholder() {
        let persona = PersonaConfig {
            host_name: "Ada".to_string(),
            max_words: 20,
            ..PersonaConfig::default()
        };
        let prompt = render_prompt(&persona, "Question: Best editor?", "hello there");
        assert!(prompt.starts_with("You're Ada, hosting"));
        assert!(prompt.contains("Current status:\nQuestion: Best editor?\n"));
        assert!(prompt.contains("User said: hello there"));
        assert!(prompt.contains("max 20 words"));
        assert!(prompt.contains("abusive"));
        assert!(!prompt.contains('{'));
    }

    #[test]
    fn render_prompt_does_not_expand_placeholders_in_user_text() {
        let persona = PersonaConfig::default();
        let prompt = render_prompt(&persona, "ctx", "what is {context}?");
        assert!(prompt.contains("User said: what is {context}?"));
    }

    #[test]
    fn substituted_values_are_never_rescanned() {
        let persona = PersonaConfig {
            host_name: "{input}".to_string(),
            template: "{host}|{context}|{input}|{unknown}".to_string(),
            ..PersonaConfig::default()
        };
        let prompt = render_prompt(&persona, "a\u{0}INPUT\u{0}b {input}", "USERTEXT");
        assert_eq!(prompt, "{input}|a\u{0}INPUT\u{0}b {input}|USERTEXT|{unknown}");
    }

    #[tokio::test]
    async fn poll_update_prompt_carries_poll_summary_in_context() {
        let backend = Arc::new(ScriptedBackend::default());
        let generator = ResponseGenerator::new(backend.clone(), PersonaConfig::default(), 1.0);

        let text = generator
            .poll_update_prompt("Question: Tabs or spaces?\nA - Tabs: 2 votes\n")
            .await
            .unwrap();
        assert_eq!(text, "reply #1");

        let prompts = backend.prompts();
        assert!(prompts[0].contains("Poll update: Question: Tabs or spaces?"));
        assert!(prompts[0].contains("User said: poll-update"));
    }

    #[tokio::test]
    async fn backend_errors_surface_without_retry() {
        let backend = Arc::new(ScriptedBackend::failing("model unavailable"));
        let generator = ResponseGenerator::new(backend.clone(), PersonaConfig::default(), 1.0);

        let err = generator.reply("hi", "").await.unwrap_err();
        assert!(format!("{:#}", err).contains("model unavailable"));
        assert!(backend.prompts().is_empty());
    }
}
