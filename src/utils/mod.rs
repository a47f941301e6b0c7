use inquire::InquireError;

pub mod pattern_replacement;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Input required for '{0}' but the program is not running interactively; give it on the command line instead")]
    NotInteractive(String),
    #[error("Cancelled by user")]
    Cancelled,
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl PromptError {
    fn from_inquire(err: InquireError, what: &str) -> Self {
        match err {
            InquireError::OperationCanceled | InquireError::OperationInterrupted => Self::Cancelled,
            InquireError::IO(e) => Self::IoError(e),
            InquireError::NotTTY => Self::NotInteractive(what.to_string()),
            InquireError::InvalidConfiguration(e) => Self::Other(e),
            InquireError::Custom(e) => Self::Other(e.to_string()),
        }
    }
}

/// Return `given` if it is set, otherwise ask the user for `what`, suggesting `default`.
pub fn value_or_prompt(given: Option<String>, what: &str, default: Option<&str>) -> Result<String, PromptError> {
    if let Some(value) = given {
        return Ok(value);
    }

    let message = format!("{what}:");
    let mut text = inquire::Text::new(&message).with_validator(inquire::required!("a value is required"));
    if let Some(d) = default {
        text = text.with_default(d);
    }
    let value = text.prompt().map_err(|e| PromptError::from_inquire(e, what))?;
    Ok(value.trim().to_string())
}

/// Ask a yes/no question, answering "yes" without asking if `always_yes` is set.
pub fn confirm(message: &str, always_yes: bool) -> Result<bool, PromptError> {
    if always_yes {
        return Ok(true);
    }
    inquire::prompt_confirmation(message).map_err(|e| PromptError::from_inquire(e, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_given_value_skips_prompt() {
        let v = value_or_prompt(Some("tcb".to_string()), "Variable", Some("tc")).unwrap();
        assert_eq!(v, "tcb");
        assert!(confirm("Overwrite?", true).unwrap());
    }

    #[test]
    fn test_inquire_errors() {
        let e = PromptError::from_inquire(InquireError::NotTTY, "Variable");
        assert!(matches!(e, PromptError::NotInteractive(ref w) if w == "Variable"));
        assert!(matches!(PromptError::from_inquire(InquireError::OperationCanceled, "x"), PromptError::Cancelled));
    }
}
