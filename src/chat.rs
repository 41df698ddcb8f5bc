use crate::context::{reduce_context, reduce_context_up_to_window};
use crate::error::ChatError;
use crate::normalize::{fix_roles, purify};
use crate::provider::ChatProvider;
use crate::sink::InitRequest;
use crate::tokenizer::count_tokens;
use serde::{Deserialize, Serialize};

pub const PART_TEXT: &str = "text";
pub const PART_IMAGE_URL: &str = "image_url";
pub const PART_FILE_URL: &str = "file_url";

/// Detail tier applied to images that do not ask for one.
pub const DEFAULT_IMAGE_DETAIL: &str = "low";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "multipart_content",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub multipart_contents: Vec<MultipartContent>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            multipart_contents: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// True when nothing in the message would reach a provider: blank content
    /// and no non-empty text or image part.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
            && !self.multipart_contents.iter().any(|part| match part.kind.as_str() {
                PART_TEXT => !part.text.trim().is_empty(),
                PART_IMAGE_URL => part.image_url.as_ref().is_some_and(|img| !img.url.is_empty()),
                _ => false,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageUrl>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<FileUrl>,
}

impl MultipartContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PART_TEXT.to_string(),
            image_url: None,
            text: text.into(),
            file_url: None,
        }
    }

    pub fn image(url: impl Into<String>, detail: Option<&str>) -> Self {
        Self {
            kind: PART_IMAGE_URL.to_string(),
            image_url: Some(ImageUrl {
                url: url.into(),
                detail: detail.unwrap_or_default().to_string(),
            }),
            text: String::new(),
            file_url: None,
        }
    }

    pub fn file(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: PART_FILE_URL.to_string(),
            image_url: None,
            text: String::new(),
            file_url: Some(FileUrl {
                url: url.into(),
                name: name.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Either a remote URL or a base64 data URL.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// `low`, `high` or `auto`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUrl {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Reused by clients as the room id.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub n: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_model: Option<String>,

    #[serde(skip)]
    pub room_id: i64,
    #[serde(skip)]
    pub websocket: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Request {
    /// Resolves the model id, lifts the room id out of `n` and drops blank messages.
    pub fn init(mut self) -> Self {
        if let Some(temp) = self.temp_model.take().filter(|m| !m.trim().is_empty()) {
            self.model = temp;
        }

        let segments: Vec<&str> = self.model.split(':').collect();
        if segments.len() > 1 {
            self.model = segments[1..].join(":");
        }

        self.room_id = self.n;
        self.n = 0;

        self.messages.retain(|m| !m.is_blank());
        self
    }

    pub fn purification(mut self) -> Self {
        self.messages = purify(self.messages);
        self.messages.retain(|m| !m.is_blank());
        self
    }

    /// Fails fast when nothing but system prompts survived `init`.
    pub fn ensure_conversation(&self) -> Result<(), ChatError> {
        if self.messages.iter().all(Message::is_system) {
            return Err(ChatError::EmptyConversation);
        }
        Ok(())
    }

    /// Normalizes roles and trims history until it fits the model budget.
    ///
    /// Returns the rebuilt request together with the input token estimate,
    /// system prompts included.
    pub fn fix(
        mut self,
        provider: &dyn ChatProvider,
        max_context_messages: usize,
        max_input_tokens: i64,
    ) -> Result<(Self, i64), ChatError> {
        let messages = fix_roles(std::mem::take(&mut self.messages))?;
        let (system, rest): (Vec<Message>, Vec<Message>) =
            messages.into_iter().partition(Message::is_system);

        let system_tokens = if system.is_empty() {
            0
        } else {
            count_tokens(&system, &self.model)
        };
        let model_limit = provider.max_context_length(&self.model);
        let remaining = model_limit - system_tokens;
        if remaining <= 0 {
            return Err(ChatError::SystemPromptTooLarge {
                tokens: system_tokens,
                limit: model_limit,
            });
        }
        let budget = max_input_tokens.min(remaining);

        let (kept, kept_tokens) = reduce_context(
            reduce_context_up_to_window(rest, max_context_messages),
            &self.model,
            budget,
        )?;

        self.messages = system
            .into_iter()
            .chain(kept)
            .map(default_image_detail)
            .collect();
        // Reply priming is paid once for the whole prompt.
        let input_tokens = if system_tokens == 0 {
            kept_tokens
        } else {
            count_tokens(&self.messages, &self.model)
        };

        tracing::debug!(
            model = %self.model,
            system_tokens,
            kept_tokens,
            input_tokens,
            budget,
            messages = self.messages.len(),
            "context fixed"
        );

        Ok((self, input_tokens))
    }
}

fn default_image_detail(mut message: Message) -> Message {
    for part in &mut message.multipart_contents {
        if let Some(image) = part.image_url.as_mut()
            && !image.url.is_empty()
            && image.detail.is_empty()
        {
            image.detail = DEFAULT_IMAGE_DETAIL.to_string();
        }
    }
    message
}

impl InitRequest for Request {
    fn init(self) -> Self {
        Request::init(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub input_tokens: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub output_tokens: i64,
}

impl Response {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn from_error(err: &ChatError) -> Self {
        Self {
            error: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }
}
