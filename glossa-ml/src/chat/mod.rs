mod template;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use strum::{Display, EnumString};

pub use template::{ChatTemplate, read_template_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid language code `{0}`, expected something like `en`, `en-GB` or `zh-Hant`")]
pub struct InvalidLanguageCode(String);

/// A BCP 47 style language code such as `en`, `en-GB` or `zh_TW`.
///
/// Only the shape is checked; the value is forwarded as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for LanguageCode {
    type Err = InvalidLanguageCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut subtags = s.split(['-', '_']);
        let primary = subtags.next().unwrap_or_default();
        let primary_ok =
            (2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_alphabetic());
        let rest_ok = subtags.all(|tag| {
            (2..=8).contains(&tag.len()) && tag.chars().all(|c| c.is_ascii_alphanumeric())
        });

        if primary_ok && rest_ok {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidLanguageCode(s.to_string()))
        }
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One item of a structured message, shaped the way translation chat templates read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        source_lang_code: LanguageCode,
        target_lang_code: LanguageCode,
        text: String,
    },
    Image {
        source_lang_code: LanguageCode,
        target_lang_code: LanguageCode,
        image: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    /// A user turn asking for `text` to be translated.
    pub fn translate_text(
        source: LanguageCode,
        target: LanguageCode,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            ChatRole::User,
            vec![ContentPart::Text {
                source_lang_code: source,
                target_lang_code: target,
                text: text.into(),
            }],
        )
    }

    /// A user turn asking for the text in an attached image to be translated.
    ///
    /// `name` only labels the image inside the message, the pixels travel separately.
    pub fn translate_image(
        source: LanguageCode,
        target: LanguageCode,
        name: impl Into<String>,
    ) -> Self {
        Self::new(
            ChatRole::User,
            vec![ContentPart::Image {
                source_lang_code: source,
                target_lang_code: target,
                image: name.into(),
            }],
        )
    }

    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|part| matches!(part, ContentPart::Image { .. }))
            .count()
    }
}
