use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer;

use crate::chat::{ChatMessage, ChatTemplate};
use crate::pipeline::PipelineError;

/// A `tokenizer.json` tokenizer paired with the model's chat template.
pub struct ChatTokenizer {
    tokenizer: Tokenizer,
    template: Option<ChatTemplate>,
}

impl ChatTokenizer {
    pub fn new(tokenizer: Tokenizer, template: Option<ChatTemplate>) -> Self {
        Self {
            tokenizer,
            template,
        }
    }

    /// Loads `tokenizer.json` and whichever chat template the directory ships.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?;
        let template = ChatTemplate::from_model_dir(dir)?;
        if template.is_none() {
            tracing::warn!(dir = %dir.display(), "model directory has no chat template");
        }
        Ok(Self::new(tokenizer, template))
    }

    /// Replaces the template body, keeping the special tokens already known.
    pub fn set_chat_template(&mut self, source: impl Into<String>) {
        let template = match &self.template {
            Some(current) => current.with_source(source),
            None => ChatTemplate::new(source, "<bos>", "<eos>"),
        };
        self.template = Some(template);
    }

    pub fn chat_template(&self) -> Option<&ChatTemplate> {
        self.template.as_ref()
    }

    pub fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String> {
        let template = self
            .template
            .as_ref()
            .ok_or(PipelineError::MissingChatTemplate)?;
        template.render(messages, add_generation_prompt)
    }

    /// Encodes text as is. Rendered prompts already carry their special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids, true).map_err(anyhow::Error::msg)
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }
}
