//! Role-tagged messages holding typed audio/text content, in the shape the
//! chat template expects.

use serde::Serialize;

use crate::audio::AudioSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Audio {
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
    },
    Text {
        text: String,
    },
}

impl ContentItem {
    pub fn audio(source: &AudioSource) -> Self {
        match source {
            AudioSource::Url(url) => Self::Audio {
                audio_url: Some(url.clone()),
                audio: None,
            },
            AudioSource::Path(path) => Self::Audio {
                audio_url: None,
                audio: Some(path.to_string_lossy().into_owned()),
            },
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The clip this item refers to, the URL taking precedence.
    pub fn audio_source(&self) -> Option<AudioSource> {
        match self {
            Self::Audio {
                audio_url: Some(url),
                ..
            } => Some(AudioSource::Url(url.clone())),
            Self::Audio {
                audio: Some(path), ..
            } => Some(AudioSource::Path(path.into())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    /// One user turn: the audio clip, then the prompt text when there is one.
    pub fn single_turn(audio: &AudioSource, prompt: Option<&str>) -> Self {
        let mut content = vec![ContentItem::audio(audio)];
        if let Some(prompt) = prompt {
            content.push(ContentItem::text(prompt));
        }
        Self {
            messages: vec![Message {
                role: Role::User,
                content,
            }],
        }
    }

    /// Audio clips referenced by the conversation, in order of appearance.
    pub fn audio_sources(&self) -> impl Iterator<Item = AudioSource> + '_ {
        self.messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(ContentItem::audio_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/glass-breaking-151256.mp3";

    #[test]
    fn prompt_follows_the_audio_item() -> anyhow::Result<()> {
        let conv = Conversation::single_turn(
            &AudioSource::Url(URL.to_string()),
            Some("What is happening in this audio clip?"),
        );
        assert_eq!(conv.messages.len(), 1);
        let message = &conv.messages[0];
        assert_eq!(message.role, Role::User);
        assert_eq!(message.content.len(), 2);
        assert_eq!(
            serde_json::to_value(&conv)?,
            serde_json::json!([{
                "role": "user",
                "content": [
                    {"type": "audio", "audio_url": URL},
                    {"type": "text", "text": "What is happening in this audio clip?"}
                ]
            }])
        );
        Ok(())
    }

    #[test]
    fn no_prompt_keeps_only_the_audio() {
        let conv = Conversation::single_turn(&AudioSource::Path("clip.wav".into()), None);
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(
            conv.messages[0].content,
            vec![ContentItem::Audio {
                audio_url: None,
                audio: Some("clip.wav".to_string()),
            }]
        );
        let sources: Vec<_> = conv.audio_sources().collect();
        assert_eq!(sources, vec![AudioSource::Path("clip.wav".into())]);
    }

    #[test]
    fn url_wins_over_path_in_one_item() {
        let item = ContentItem::Audio {
            audio_url: Some(URL.to_string()),
            audio: Some("clip.wav".to_string()),
        };
        assert_eq!(item.audio_source(), Some(AudioSource::Url(URL.to_string())));
        assert_eq!(ContentItem::text("hi").audio_source(), None);
    }
}
