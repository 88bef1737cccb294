pub(crate) fn default_batch_size() -> usize {
    4
}

pub(crate) fn default_prefetch_delay_ms() -> u64 {
    500
}

pub(crate) fn default_row_tolerance() -> u16 {
    50
}

pub(crate) fn default_analysis_enabled() -> bool {
    true
}

pub(crate) fn default_speech_enabled() -> bool {
    false
}

pub(crate) fn default_analysis_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

pub(crate) fn default_analysis_model() -> String {
    "gemini-2.0-flash".to_string()
}

pub(crate) fn default_analysis_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

pub(crate) fn default_analysis_timeout_secs() -> u64 {
    120
}

pub(crate) fn default_max_image_dimension() -> u32 {
    1600
}

pub(crate) fn default_speech_command() -> String {
    "espeak-ng".to_string()
}

pub(crate) fn default_speech_args() -> Vec<String> {
    vec!["{text}".to_string()]
}

pub(crate) fn default_log_level() -> crate::config::LogLevel {
    crate::config::LogLevel::Debug
}

pub(crate) fn default_key_next_page() -> String {
    "n".to_string()
}

pub(crate) fn default_key_prev_page() -> String {
    "p".to_string()
}

pub(crate) fn default_key_goto_page() -> String {
    "goto".to_string()
}

pub(crate) fn default_key_toggle_analysis() -> String {
    "a".to_string()
}

pub(crate) fn default_key_toggle_speech() -> String {
    "s".to_string()
}

pub(crate) fn default_key_retry_page() -> String {
    "r".to_string()
}

pub(crate) fn default_key_show_page() -> String {
    "l".to_string()
}

pub(crate) fn default_key_quit() -> String {
    "q".to_string()
}
