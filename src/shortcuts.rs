//! Stdin command shortcuts.
//!
//! Each input line is one command. Keys come from the config and fall back to
//! the built-in defaults when left empty.

use crate::config::AppConfig;
use koma_core::SessionCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    Session(SessionCommand),
    ShowPage,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortcutError {
    Unknown(String),
    BadPage(String),
}

impl std::fmt::Display for ShortcutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShortcutError::Unknown(input) => write!(f, "unknown command `{input}`"),
            ShortcutError::BadPage(input) => write!(f, "not a page number: `{input}`"),
        }
    }
}

/// Map one input line to a shortcut. Blank lines map to `None`.
pub fn parse_line(config: &AppConfig, line: &str) -> Result<Option<Shortcut>, ShortcutError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let head = parts.next().unwrap_or_default().to_ascii_lowercase();
    let rest: Vec<&str> = parts.collect();

    if head.chars().all(|ch| ch.is_ascii_digit()) {
        return goto(&head).map(Some);
    }
    if shortcut_matches(&config.key_goto_page, "goto", &head) {
        let Some(target) = rest.first() else {
            return Err(ShortcutError::BadPage(String::new()));
        };
        return goto(target).map(Some);
    }

    let shortcut = if shortcut_matches(&config.key_next_page, "n", &head) {
        Shortcut::Session(SessionCommand::NextPage)
    } else if shortcut_matches(&config.key_prev_page, "p", &head) {
        Shortcut::Session(SessionCommand::PrevPage)
    } else if shortcut_matches(&config.key_toggle_analysis, "a", &head) {
        Shortcut::Session(SessionCommand::ToggleAnalysis)
    } else if shortcut_matches(&config.key_toggle_speech, "s", &head) {
        Shortcut::Session(SessionCommand::ToggleSpeech)
    } else if shortcut_matches(&config.key_retry_page, "r", &head) {
        Shortcut::Session(SessionCommand::RetryPage)
    } else if shortcut_matches(&config.key_show_page, "l", &head) {
        Shortcut::ShowPage
    } else if shortcut_matches(&config.key_quit, "q", &head) {
        Shortcut::Quit
    } else if head == "help" || head == "?" {
        Shortcut::Help
    } else {
        return Err(ShortcutError::Unknown(line.to_string()));
    };
    Ok(Some(shortcut))
}

pub fn help_text(config: &AppConfig) -> String {
    let key = |raw: &str, fallback: &str| normalize_shortcut_token(raw, fallback);
    format!(
        "{} next page | {} previous page | {} <n> go to page n | {} toggle analysis | \
         {} toggle speech | {} retry page | {} show page | {} quit",
        key(&config.key_next_page, "n"),
        key(&config.key_prev_page, "p"),
        key(&config.key_goto_page, "goto"),
        key(&config.key_toggle_analysis, "a"),
        key(&config.key_toggle_speech, "s"),
        key(&config.key_retry_page, "r"),
        key(&config.key_show_page, "l"),
        key(&config.key_quit, "q"),
    )
}

/// Pages are typed 1-based and stored 0-based.
fn goto(input: &str) -> Result<Shortcut, ShortcutError> {
    match input.parse::<usize>() {
        Ok(page) if page >= 1 => Ok(Shortcut::Session(SessionCommand::SetPage {
            page: page - 1,
        })),
        _ => Err(ShortcutError::BadPage(input.to_string())),
    }
}

fn shortcut_matches(raw: &str, fallback: &str, pressed: &str) -> bool {
    normalize_shortcut_token(raw, fallback) == pressed
}

fn normalize_shortcut_token(raw: &str, fallback: &str) -> String {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        fallback.to_string()
    } else {
        normalized
    }
}
