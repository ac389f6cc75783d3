//! Tool error shaping: every message passes through the credential
//! obfuscator before it reaches a transport.

use super::registry::ToolOutcome;
use crate::obfuscate::obfuscate;

pub(crate) fn error_outcome(message: impl Into<String>) -> ToolOutcome {
    ToolOutcome::Error {
        message: obfuscate(&message.into()),
    }
}
