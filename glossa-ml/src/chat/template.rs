use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, ErrorKind, Value, context};
use serde::Deserialize;

use crate::chat::ChatMessage;
use crate::loading::read_json;

const DEFAULT_BOS: &str = "<bos>";
const DEFAULT_EOS: &str = "<eos>";

/// A special token as written in `tokenizer_config.json`, either a bare
/// string or an `AddedToken` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Added { content: String },
}

impl SpecialToken {
    fn into_content(self) -> String {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Added { content } => content,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TemplateField {
    Single(String),
    Named(Vec<NamedTemplate>),
}

impl TemplateField {
    fn into_source(self) -> Option<String> {
        match self {
            TemplateField::Single(s) => Some(s),
            TemplateField::Named(list) => {
                let default = list.iter().position(|t| t.name == "default");
                list.into_iter()
                    .nth(default.unwrap_or(0))
                    .map(|t| t.template)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<TemplateField>,
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    #[serde(default)]
    eos_token: Option<SpecialToken>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    chat_template: Option<String>,
}

/// Reads the `chat_template` string out of a `chat_template.json` style file.
pub fn read_template_file(path: &Path) -> Result<String> {
    let file: TemplateFile = read_json(path)?;
    file.chat_template
        .with_context(|| format!("{} has no `chat_template` key", path.display()))
}

/// Hugging Face compatible chat template renderer backed by MiniJinja.
pub struct ChatTemplate {
    env: Environment<'static>,
    source: String,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(
        source: impl Into<String>,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Self {
        let mut env = Environment::new();
        // transformers renders chat templates with both options on
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function("raise_exception", |msg: String| -> Result<Value, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
        });

        Self {
            env,
            source: source.into(),
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        }
    }

    /// Finds the chat template shipped with a model directory.
    ///
    /// Looks at `chat_template.jinja`, then `chat_template.json`, then the
    /// `chat_template` field of `tokenizer_config.json`. Returns `None` when the
    /// directory has no template at all.
    pub fn from_model_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join("tokenizer_config.json");
        let config: TokenizerConfig = if config_path.is_file() {
            read_json(&config_path)?
        } else {
            TokenizerConfig::default()
        };

        let bos_token = config
            .bos_token
            .map(SpecialToken::into_content)
            .unwrap_or_else(|| DEFAULT_BOS.to_string());
        let eos_token = config
            .eos_token
            .map(SpecialToken::into_content)
            .unwrap_or_else(|| DEFAULT_EOS.to_string());

        let jinja_path = dir.join("chat_template.jinja");
        let json_path = dir.join("chat_template.json");
        let source = if jinja_path.is_file() {
            Some(
                std::fs::read_to_string(&jinja_path)
                    .with_context(|| format!("failed to read {}", jinja_path.display()))?,
            )
        } else if json_path.is_file() {
            Some(read_template_file(&json_path)?)
        } else {
            config.chat_template.and_then(TemplateField::into_source)
        };

        Ok(source.map(|source| Self::new(source, bos_token, eos_token)))
    }

    /// Same special tokens, different template body.
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self::new(source, self.bos_token.clone(), self.eos_token.clone())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bos_token(&self) -> &str {
        &self.bos_token
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        self.env
            .render_str(
                &self.source,
                context! {
                    messages => messages,
                    add_generation_prompt => add_generation_prompt,
                    bos_token => self.bos_token,
                    eos_token => self.eos_token,
                },
            )
            .context("failed to render chat template")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::LanguageCode;

    const TRANSLATE_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}<start_of_turn>{{ message['role'] }}\n{% for item in message['content'] %}{% if item['type'] == 'text' %}{{ item['source_lang_code'] }}->{{ item['target_lang_code'] }}: {{ item['text'] | trim }}{% else %}<start_of_image>{% endif %}{% endfor %}<end_of_turn>\n{% endfor %}{% if add_generation_prompt %}<start_of_turn>model\n{% endif %}";

    fn code(s: &str) -> LanguageCode {
        s.parse().unwrap()
    }

    #[test]
    fn text_translation_prompt_format() -> Result<()> {
        let template = ChatTemplate::new(TRANSLATE_TEMPLATE, "<bos>", "<eos>");
        let messages = [ChatMessage::translate_text(
            code("en"),
            code("ja"),
            "how are you doing today?\n",
        )];

        let formatted = template.render(&messages, true)?;
        let expected = "<bos><start_of_turn>user\nen->ja: how are you doing today?<end_of_turn>\n<start_of_turn>model\n";
        assert_eq!(formatted, expected);

        Ok(())
    }

    #[test]
    fn image_translation_prompt_format() -> Result<()> {
        let template = ChatTemplate::new(TRANSLATE_TEMPLATE, "<bos>", "<eos>");
        let messages = [ChatMessage::translate_image(
            code("cs"),
            code("de-DE"),
            "sample_image.png",
        )];

        let formatted = template.render(&messages, false)?;
        assert_eq!(
            formatted,
            "<bos><start_of_turn>user\n<start_of_image><end_of_turn>\n"
        );

        Ok(())
    }

    #[test]
    fn block_tags_do_not_leak_newlines() -> Result<()> {
        let template = ChatTemplate::new(
            "{% if add_generation_prompt %}\n    yes\n{% endif %}\n",
            "<bos>",
            "<eos>",
        );
        assert_eq!(template.render(&[], true)?, "    yes\n");
        Ok(())
    }

    #[test]
    fn python_string_methods_are_available() -> Result<()> {
        let template = ChatTemplate::new(
            "{{ messages[0]['content'][0]['text'].strip().upper() }}",
            "<bos>",
            "<eos>",
        );
        let messages = [ChatMessage::translate_text(code("en"), code("fr"), "  hello ")];
        assert_eq!(template.render(&messages, false)?, "HELLO");
        Ok(())
    }

    #[test]
    fn raise_exception_fails_rendering() {
        let template = ChatTemplate::new(
            "{% if messages | length != 2 %}{{ raise_exception('two messages required') }}{% endif %}",
            "<bos>",
            "<eos>",
        );
        let err = template.render(&[], false).unwrap_err();
        assert!(format!("{err:#}").contains("two messages required"));
    }

    #[test]
    fn with_source_keeps_special_tokens() -> Result<()> {
        let template = ChatTemplate::new("a", "<s>", "</s>");
        let swapped = template.with_source("{{ bos_token }}|{{ eos_token }}");
        assert_eq!(swapped.render(&[], false)?, "<s>|</s>");
        assert_eq!(swapped.source(), "{{ bos_token }}|{{ eos_token }}");
        Ok(())
    }
}
