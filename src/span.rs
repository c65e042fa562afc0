use serde::{Serialize, Deserialize};

/// Byte-offset span into the rendered form of a bound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }
}

/// A value annotated with its span in the rendered operation text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }

    /// Spans are assigned when the operation is rendered; nodes start dummy.
    pub fn dummy(node: T) -> Self {
        Self { node, span: Span::dummy() }
    }
}
