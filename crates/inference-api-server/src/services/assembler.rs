use inference_engine::ChatCompletion;
use std::time::Duration;

use crate::models::chat::ChatCompletionResult;
use crate::services::metrics::round3;

/// Flattens an aggregate completion into the batch response body.
pub fn assemble(completion: ChatCompletion, elapsed: Duration) -> ChatCompletionResult {
    let usage = completion.usage;
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content);

    ChatCompletionResult {
        content,
        prompt_tokens: usage.as_ref().map(|u| u.prompt_tokens),
        completion_tokens: usage.as_ref().map(|u| u.completion_tokens),
        total_tokens: usage.as_ref().map(|u| u.total_tokens),
        time_taken_seconds: round3(elapsed.as_secs_f64()),
    }
}
