use crate::chat::{Message, PART_IMAGE_URL, PART_TEXT};
use tiktoken_rs::CoreBPE;

/// Reply priming added once per conversation.
const REPLY_PRIMING_TOKENS: i64 = 3;
/// Flat cost of one low-detail image.
const LOW_DETAIL_IMAGE_TOKENS: i64 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gpt35Turbo,
    Gpt4,
    Gpt4o,
}

impl ModelFamily {
    /// Unknown ids are billed as `gpt-3.5-turbo`.
    pub fn resolve(model: &str) -> Self {
        match model {
            "gpt-3.5-turbo"
            | "gpt-3.5-turbo-0613"
            | "gpt-3.5-turbo-1106"
            | "gpt-3.5-turbo-16k-0613"
            | "gpt-3.5-turbo-16k"
            | "gpt-3.5-turbo-instruct" => Self::Gpt35Turbo,
            "gpt-4"
            | "gpt-4-0613"
            | "gpt-4-32k"
            | "gpt-4-1106-preview"
            | "gpt-4-vision-preview"
            | "gpt-4-32k-0613" => Self::Gpt4,
            m if m.starts_with("gpt-4o") => Self::Gpt4o,
            _ => Self::Gpt35Turbo,
        }
    }

    pub fn tokens_per_message(&self) -> i64 {
        match self {
            Self::Gpt35Turbo => 4,
            Self::Gpt4 | Self::Gpt4o => 3,
        }
    }

    pub fn tokens_per_name(&self) -> i64 {
        match self {
            Self::Gpt35Turbo => -1,
            Self::Gpt4 | Self::Gpt4o => 1,
        }
    }

    fn bpe(&self) -> &'static CoreBPE {
        match self {
            Self::Gpt35Turbo | Self::Gpt4 => tiktoken_rs::cl100k_base_singleton(),
            Self::Gpt4o => tiktoken_rs::o200k_base_singleton(),
        }
    }
}

/// Counts the prompt tokens `messages` cost under `model`'s encoding.
pub fn count_tokens(messages: &[Message], model: &str) -> i64 {
    let family = ModelFamily::resolve(model);
    let bpe = family.bpe();
    let encoded = |text: &str| -> i64 {
        if text.is_empty() {
            0
        } else {
            bpe.encode_ordinary(text).len() as i64
        }
    };

    let mut total = 0i64;
    for message in messages {
        total += family.tokens_per_message();
        total += encoded(&message.content);
        total += encoded(message.role.as_str());
        if let Some(name) = message.name.as_deref().filter(|n| !n.is_empty()) {
            total += encoded(name);
            total += family.tokens_per_name();
        }
        for part in &message.multipart_contents {
            match part.kind.as_str() {
                PART_TEXT => total += encoded(&part.text),
                PART_IMAGE_URL => total += LOW_DETAIL_IMAGE_TOKENS,
                _ => {}
            }
        }
    }
    total + REPLY_PRIMING_TOKENS
}

/// Counts the tokens of a bare completion text, without message overhead.
pub fn count_text_tokens(text: &str, model: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    ModelFamily::resolve(model).bpe().encode_ordinary(text).len() as i64
}
