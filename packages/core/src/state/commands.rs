// Слэш-команды в поле ввода
// Перехватываются до обычной отправки и уходят побочным каналом

use crate::protocol::validation::validate_rating;
use crate::utils::error::{ChatError, Result};

/// Статус проекта, при котором разрешена оценка
pub const COMPLETED_PROJECT_STATUS: &str = "completed";

/// Распознанная команда
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    /// `/rate N` или `/rating N`; аргумент ещё не проверен
    Rate { argument: Option<String> },
}

/// Что делать с введённым текстом
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposerInput {
    Message(String),
    Command(SlashCommand),
}

/// Разобрать ввод. Неизвестные слэш-команды считаются обычным текстом
pub fn parse_input(text: &str) -> ComposerInput {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return ComposerInput::Message(text.to_string());
    }

    let mut parts = trimmed.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    match name.as_str() {
        "/rate" | "/rating" => ComposerInput::Command(SlashCommand::Rate {
            argument: parts.next().map(str::to_string),
        }),
        _ => ComposerInput::Message(text.to_string()),
    }
}

/// Проверить оценку и статус проекта; ошибка превращается в уведомление
pub fn check_rating(argument: Option<&str>, project_status: Option<&str>) -> Result<u8> {
    let completed = project_status
        .map(|s| s.trim().eq_ignore_ascii_case(COMPLETED_PROJECT_STATUS))
        .unwrap_or(false);
    if !completed {
        return Err(ChatError::InvalidState(
            "Ratings are available once the project is completed".to_string(),
        ));
    }

    let rating = argument
        .and_then(|a| a.parse::<i64>().ok())
        .ok_or_else(|| ChatError::ValidationError("Usage: /rate <1-5>".to_string()))?;
    validate_rating(rating)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("hello"), ComposerInput::Message("hello".into()));
        assert_eq!(
            parse_input("  /Rate 5 "),
            ComposerInput::Command(SlashCommand::Rate { argument: Some("5".into()) })
        );
        assert_eq!(
            parse_input("/rating"),
            ComposerInput::Command(SlashCommand::Rate { argument: None })
        );
        assert_eq!(parse_input("/shrug"), ComposerInput::Message("/shrug".into()));
    }

    #[test]
    fn test_rating_requires_completed_project() {
        assert!(matches!(
            check_rating(Some("5"), Some("in_progress")),
            Err(ChatError::InvalidState(_))
        ));
        assert!(check_rating(Some("5"), None).is_err());
        assert_eq!(check_rating(Some("4"), Some("Completed")).unwrap(), 4);
    }

    #[test]
    fn test_rating_argument_checked() {
        assert!(check_rating(Some("9"), Some("completed")).is_err());
        assert!(check_rating(Some("abc"), Some("completed")).is_err());
        assert!(check_rating(None, Some("completed")).is_err());
    }
}
