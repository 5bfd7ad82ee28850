//! Parse errors for the validated string types in [`crate::types`].

use miette::SourceSpan;
use smol_str::SmolStr;

/// Error produced when a string fails validation as one of the identifier
/// types (DID, TID, NSID, record key).
///
/// `kind` names the identifier that was being parsed, `source` holds the
/// offending input.
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
#[error("invalid {kind} `{source}`: {reason}")]
#[diagnostic(help("identifiers follow the atproto string formats"))]
pub struct IdentError {
    /// Which identifier type was being parsed
    pub kind: SmolStr,
    /// The rejected input
    #[source_code]
    pub source: String,
    /// What went wrong
    #[source]
    #[diagnostic_source]
    pub reason: IdentErrorReason,
}

/// Specific reason an identifier was rejected
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum IdentErrorReason {
    /// Did not match the identifier's grammar
    #[error("does not match the expected format ({message})")]
    #[diagnostic(code(atrepo::ident::format))]
    Format {
        /// Location of the problem, if known
        #[label]
        span: Option<SourceSpan>,
        /// Short description of the expected format
        #[help]
        message: SmolStr,
    },

    /// Longer than the identifier permits
    #[error("too long (allowed: {max}, actual: {actual})")]
    #[diagnostic(code(atrepo::ident::length))]
    TooLong {
        /// Maximum length
        max: usize,
        /// Observed length
        actual: usize,
    },

    /// Shorter than the identifier permits
    #[error("too short (allowed: {min}, actual: {actual})")]
    #[diagnostic(code(atrepo::ident::length))]
    TooShort {
        /// Minimum length
        min: usize,
        /// Observed length
        actual: usize,
    },

    /// A value that is syntactically valid but explicitly reserved
    #[error("reserved value")]
    #[diagnostic(code(atrepo::ident::reserved))]
    Reserved,
}

impl IdentError {
    /// Input failed the format check
    pub fn format(kind: &'static str, source: &str, message: &'static str) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            source: source.to_string(),
            reason: IdentErrorReason::Format {
                span: None,
                message: SmolStr::new_static(message),
            },
        }
    }

    /// Input failed the format check at a known location
    pub fn format_at(
        kind: &'static str,
        source: &str,
        message: &'static str,
        span: (usize, usize),
    ) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            source: source.to_string(),
            reason: IdentErrorReason::Format {
                span: Some(span.into()),
                message: SmolStr::new_static(message),
            },
        }
    }

    /// Input exceeded the maximum length
    pub fn too_long(kind: &'static str, source: &str, max: usize) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            source: source.to_string(),
            reason: IdentErrorReason::TooLong {
                max,
                actual: source.len(),
            },
        }
    }

    /// Input was below the minimum length
    pub fn too_short(kind: &'static str, source: &str, min: usize) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            source: source.to_string(),
            reason: IdentErrorReason::TooShort {
                min,
                actual: source.len(),
            },
        }
    }

    /// Input is a reserved value
    pub fn reserved(kind: &'static str, source: &str) -> Self {
        Self {
            kind: SmolStr::new_static(kind),
            source: source.to_string(),
            reason: IdentErrorReason::Reserved,
        }
    }
}
