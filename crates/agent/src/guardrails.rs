use cbag_core::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, error: DomainError },
}

/// Checks applied to an inbound message before any model call is made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputPolicy {
    pub max_input_chars: usize,
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self { max_input_chars: 8_000 }
    }
}

impl InputPolicy {
    pub fn new(max_input_chars: usize) -> Self {
        Self { max_input_chars }
    }

    pub fn evaluate(&self, input: &str) -> GuardrailDecision {
        if input.trim().is_empty() {
            return GuardrailDecision::Deny { reason_code: "empty_input", error: DomainError::EmptyInput };
        }

        let actual = input.chars().count();
        if actual > self.max_input_chars {
            return GuardrailDecision::Deny {
                reason_code: "input_too_long",
                error: DomainError::InputTooLong { limit: self.max_input_chars, actual },
            };
        }

        GuardrailDecision::Allow
    }
}
