use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: String,
    pub message: String,
}

impl EngineError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Internal-consistency faults are logged as CriticalError and always set
    /// the error halt cause, unlike ordinary handler errors.
    pub fn is_internal(&self) -> bool {
        self.code.starts_with("ENGINE_INTERNAL")
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn display_carries_code_and_message() {
        let error = EngineError::new("ENGINE_SECTION_NOT_FOUND", "Section [Main] not found.");
        assert_eq!(
            error.to_string(),
            "ENGINE_SECTION_NOT_FOUND: Section [Main] not found."
        );
        assert!(!error.is_internal());
    }

    #[test]
    fn internal_codes_are_detected() {
        let error = EngineError::new("ENGINE_INTERNAL_DISPATCH", "Unroutable command.");
        assert!(error.is_internal());
    }
}
