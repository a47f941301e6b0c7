use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

pub use output_name::{render_output_name, OutputNameParts};
mod output_name;

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Unknown key '{0}' in pattern string")]
    UnknownKey(String),
    #[error("Invalid format '{fmt}' for key '{key}': {reason}")]
    BadFormat { key: String, fmt: String, reason: &'static str },
}

pub(super) trait PatternReplacer {
    fn get_replacement_value(&self, key: &str, fmt: Option<&str>) -> Result<Cow<'_, str>, PatternError>;

    fn render_pattern(&self, pattern: &str) -> Result<String, PatternError> {
        static SUB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^\}]+)\}").unwrap());
        let mut rendered = String::with_capacity(pattern.len());
        let mut last_match = 0;
        for caps in SUB_RE.captures_iter(pattern) {
            let Some(m) = caps.get(0) else { continue };
            let inner = &caps[1];
            rendered.push_str(&pattern[last_match..m.start()]);
            rendered.push_str(&self.do_pattern_replacement(inner)?);
            last_match = m.end();
        }
        rendered.push_str(&pattern[last_match..]);
        Ok(rendered)
    }

    fn do_pattern_replacement(&self, fmt_str: &str) -> Result<Cow<'_, str>, PatternError> {
        match fmt_str.split_once(':') {
            Some((key, fmt)) => self.get_replacement_value(key, Some(fmt)),
            None => self.get_replacement_value(fmt_str, None),
        }
    }
}
