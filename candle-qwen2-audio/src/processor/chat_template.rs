//! Jinja chat templates, rendered with the same whitespace handling as
//! `tokenizer.apply_chat_template()`.

use std::path::Path;

use minijinja::{context, Environment};
use serde::Deserialize;

use crate::conversation::Conversation;
use crate::{Error, Result};

/// Template shipped with the Qwen2-Audio instruct checkpoints.
pub const QWEN2_AUDIO_TEMPLATE: &str = "{% set audio_count = namespace(value=0) %}\
{% for message in messages %}\
{% if loop.first and message['role'] != 'system' %}<|im_start|>system
You are a helpful assistant.<|im_end|>
{% endif %}<|im_start|>{{ message['role'] }}
{% if message['content'] is string %}{{ message['content'] }}<|im_end|>
{% else %}{% for content in message['content'] %}\
{% if 'audio' in content or 'audio_url' in content %}\
{% set audio_count.value = audio_count.value + 1 %}\
Audio {{ audio_count.value }}: <|audio_bos|><|AUDIO|><|audio_eos|>
{% elif 'text' in content %}{{ content['text'] }}{% endif %}{% endfor %}<|im_end|>
{% endif %}{% endfor %}\
{% if add_generation_prompt %}<|im_start|>assistant
{% endif %}";

/// `chat_template` is either a single template or a list of named ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TemplateField {
    Single(String),
    Multiple(Vec<NamedTemplate>),
}

#[derive(Debug, Clone, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    chat_template: Option<TemplateField>,
}

impl TemplateField {
    fn into_template(self) -> Option<String> {
        match self {
            Self::Single(t) => Some(t),
            Self::Multiple(templates) => templates
                .iter()
                .find(|t| t.name == "default")
                .or_else(|| templates.first())
                .map(|t| t.template.clone()),
        }
    }
}

fn template_from_file(path: &Path) -> Result<Option<String>> {
    let data = std::fs::read_to_string(path).map_err(Error::io(path))?;
    let file: TemplateFile = serde_json::from_str(&data).map_err(Error::json(path))?;
    Ok(file.chat_template.and_then(TemplateField::into_template))
}

pub struct ChatTemplate {
    env: Environment<'static>,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChatTemplate")
    }
}

impl ChatTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function("raise_exception", |msg: String| -> std::result::Result<String, _> {
            Err(minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                msg,
            ))
        });
        env.add_template_owned("chat".to_string(), template.into())?;
        Ok(Self { env })
    }

    pub fn qwen2_audio() -> Result<Self> {
        Self::new(QWEN2_AUDIO_TEMPLATE)
    }

    /// Picks the checkpoint's template: `chat_template.json` first, then the
    /// `chat_template` field of `tokenizer_config.json`, then the built-in one.
    pub fn from_files(
        chat_template: Option<&Path>,
        tokenizer_config: Option<&Path>,
    ) -> Result<Self> {
        for path in [chat_template, tokenizer_config].into_iter().flatten() {
            if let Some(template) = template_from_file(path)? {
                tracing::debug!(?path, "using checkpoint chat template");
                return Self::new(template);
            }
        }
        tracing::debug!("no chat template in the checkpoint, using the built-in one");
        Self::qwen2_audio()
    }

    pub fn apply(
        &self,
        conversation: &Conversation,
        add_generation_prompt: bool,
    ) -> Result<String> {
        let template = self.env.get_template("chat")?;
        let prompt = template.render(context! {
            messages => conversation,
            add_generation_prompt => add_generation_prompt,
        })?;
        Ok(prompt)
    }
}
