//! Input validation and sanitization.

use crate::config::InputConfig;
use crate::context::ContextMessage;
use crate::AdmissionError;

/// Check a question against the configured length bounds.
///
/// Length is counted in characters, not bytes, so multi-byte scripts are
/// not penalised.
///
/// # Errors
///
/// Returns [`AdmissionError::InvalidQuestion`] naming the violated bound.
pub fn validate_question(question: &str, limits: &InputConfig) -> Result<(), AdmissionError> {
    let len = question.chars().count();
    if len < limits.min_question_chars {
        return Err(AdmissionError::InvalidQuestion(format!(
            "question too short (min {} characters)",
            limits.min_question_chars
        )));
    }
    if len > limits.max_question_chars {
        return Err(AdmissionError::InvalidQuestion(format!(
            "question too long (max {} characters)",
            limits.max_question_chars
        )));
    }
    Ok(())
}

/// Strip control characters (except newline and tab) and trim whitespace.
pub fn sanitize_question(question: &str) -> String {
    question
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Keep only the most recent `max` context messages.
pub fn truncate_context(mut messages: Vec<ContextMessage>, max: usize) -> Vec<ContextMessage> {
    if messages.len() > max {
        messages.drain(..messages.len() - max);
    }
    messages
}
