use crate::chat::Message;
use crate::error::ChatError;
use crate::tokenizer::count_tokens;

/// Keeps the `max_count` most recent messages; `0` disables the cap.
pub fn reduce_context_up_to_window(mut messages: Vec<Message>, max_count: usize) -> Vec<Message> {
    if max_count > 0 && messages.len() > max_count {
        messages.drain(..messages.len() - max_count);
    }
    messages
}

/// Evicts the oldest messages until the set fits `max_tokens`.
///
/// Returns the surviving messages and their token count. A lone message that
/// is still too large is an error; messages are never truncated.
pub fn reduce_context(
    messages: Vec<Message>,
    model: &str,
    max_tokens: i64,
) -> Result<(Vec<Message>, i64), ChatError> {
    let mut start = 0;
    loop {
        let window = &messages[start..];
        let tokens = count_tokens(window, model);
        if tokens <= max_tokens {
            let mut messages = messages;
            messages.drain(..start);
            return Ok((messages, tokens));
        }
        if window.len() <= 1 {
            tracing::debug!(model, tokens, max_tokens, "single message exceeds budget");
            return Err(ChatError::ContextExceedLimit);
        }
        start += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<Message> {
        vec![
            Message::user("one"),
            Message::assistant("two"),
            Message::user("three"),
            Message::assistant("four"),
            Message::user("five"),
        ]
    }

    #[test]
    fn window_keeps_most_recent() {
        let kept = reduce_context_up_to_window(history(), 2);
        assert_eq!(kept, vec![Message::assistant("four"), Message::user("five")]);
    }

    #[test]
    fn window_zero_is_unbounded() {
        assert_eq!(reduce_context_up_to_window(history(), 0).len(), 5);
        assert_eq!(reduce_context_up_to_window(history(), 10).len(), 5);
    }

    #[test]
    fn fitting_history_is_returned_with_exact_count() {
        let messages = history();
        let expected = count_tokens(&messages, "gpt-4");
        let (kept, tokens) = reduce_context(messages.clone(), "gpt-4", expected).expect("fits");
        assert_eq!(kept, messages);
        assert_eq!(tokens, expected);
    }

    #[test]
    fn trimming_only_removes_from_the_head() {
        let messages = history();
        let tail = messages[3..].to_vec();
        let budget = count_tokens(&tail, "gpt-4");
        let (kept, tokens) = reduce_context(messages, "gpt-4", budget).expect("fits");
        assert_eq!(kept, tail);
        assert_eq!(tokens, budget);
    }

    #[test]
    fn every_budget_yields_a_suffix() {
        let messages = history();
        let full = count_tokens(&messages, "gpt-3.5-turbo");
        for budget in 0..=full {
            match reduce_context(messages.clone(), "gpt-3.5-turbo", budget) {
                Ok((kept, tokens)) => {
                    assert!(kept.len() <= messages.len());
                    assert!(tokens <= budget);
                    assert!(messages.ends_with(&kept));
                }
                Err(err) => assert!(matches!(err, ChatError::ContextExceedLimit)),
            }
        }
    }

    #[test]
    fn single_oversized_message_fails() {
        let err = reduce_context(vec![Message::user("far too many words here")], "gpt-4", 3)
            .expect_err("must fail");
        assert!(matches!(err, ChatError::ContextExceedLimit));
    }
}
