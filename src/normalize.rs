use crate::chat::{
    FileUrl, ImageUrl, Message, MultipartContent, PART_FILE_URL, PART_IMAGE_URL, PART_TEXT, Role,
};
use crate::error::ChatError;

const CONTINUE_PROMPT: &str = "continue";
const LOG_PREVIEW_CHARS: usize = 20;

/// Drops multipart parts the providers cannot take (anything but text and images).
pub fn purify(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut message| {
            message
                .multipart_contents
                .retain(|part| part.kind == PART_TEXT || part.kind == PART_IMAGE_URL);
            message
        })
        .collect()
}

/// Forces strict user/assistant alternation ending on a user turn.
///
/// System messages are pulled out untouched and put back in front. Within a
/// run of same-role messages only the most recent one survives; the others
/// are discarded, not merged.
pub fn fix_roles(mut messages: Vec<Message>) -> Result<Vec<Message>, ChatError> {
    let Some(last) = messages.last() else {
        return Err(ChatError::EmptyConversation);
    };
    if last.role != Role::User {
        messages.push(Message::user(CONTINUE_PROMPT));
    }

    let (system, rest): (Vec<Message>, Vec<Message>) =
        messages.into_iter().partition(Message::is_system);

    let mut collapsed: Vec<Message> = Vec::with_capacity(rest.len());
    let mut last_role: Option<Role> = None;
    for message in rest.into_iter().rev() {
        if last_role == Some(message.role) {
            continue;
        }
        last_role = Some(message.role);
        collapsed.push(message);
    }

    // Even length means the oldest survivor is an assistant turn.
    if collapsed.len() % 2 == 0 {
        collapsed.pop();
    }
    collapsed.reverse();

    let mut fixed = system;
    fixed.extend(collapsed);
    Ok(fixed)
}

pub fn has_image(messages: &[Message]) -> bool {
    messages.iter().any(|message| {
        message
            .multipart_contents
            .iter()
            .any(|part| part.image_url.as_ref().is_some_and(|img| !img.url.is_empty()))
    })
}

/// First uploaded file attached to the message, if any.
pub fn uploaded_file(message: &Message) -> Option<&FileUrl> {
    message
        .multipart_contents
        .iter()
        .filter(|part| part.kind == PART_FILE_URL)
        .filter_map(|part| part.file_url.as_ref())
        .find(|file| !file.url.is_empty())
}

/// Copy of the conversation that is safe to put in a log line.
pub fn to_log_entry(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|message| Message {
            role: message.role,
            content: preview(&message.content),
            name: message.name.clone(),
            multipart_contents: message
                .multipart_contents
                .iter()
                .map(|part| MultipartContent {
                    kind: part.kind.clone(),
                    text: preview(&part.text),
                    image_url: part.image_url.as_ref().map(|img| ImageUrl {
                        url: preview(&img.url),
                        detail: img.detail.clone(),
                    }),
                    file_url: None,
                })
                .collect(),
        })
        .collect()
}

fn preview(text: &str) -> String {
    text.chars().take(LOG_PREVIEW_CHARS).collect()
}
