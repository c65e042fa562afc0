use crate::span::Span;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("Internal lowering error: {msg}")]
    Internal { msg: String, span: Span },

    #[error("Unsupported operation: {msg}")]
    Unsupported { msg: String, span: Span },

    #[error("Execution error: {msg}")]
    Exec { msg: String },
}

impl LowerError {
    pub fn internal(msg: impl Into<String>, span: Span) -> Self {
        Self::Internal { msg: msg.into(), span }
    }

    pub fn unsupported(msg: impl Into<String>, span: Span) -> Self {
        Self::Unsupported { msg: msg.into(), span }
    }

    pub fn exec(msg: impl Into<String>) -> Self {
        Self::Exec { msg: msg.into() }
    }
}

/// Render a LowerError with ariadne against the operation's rendered text.
pub fn render_error(rendered: &str, err: &LowerError) {
    use ariadne::{Label, Report, ReportKind, Source};

    match err {
        LowerError::Internal { msg, span } | LowerError::Unsupported { msg, span } => {
            let kind_str = match err {
                LowerError::Internal { .. } => "internal",
                LowerError::Unsupported { .. } => "unsupported",
                _ => unreachable!(),
            };
            Report::build(ReportKind::Error, (), span.start)
                .with_message(format!("{kind_str} lowering error"))
                .with_label(
                    Label::new(span.start..span.end)
                        .with_message(msg),
                )
                .finish()
                .eprint(Source::from(rendered))
                .unwrap();
        }
        LowerError::Exec { msg } => {
            eprintln!("error: {msg}");
        }
    }
}
