use super::ast::Span;

/// A compilation error with source location.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub kind: ErrorKind,
    /// 1-based line, filled in once the source is known.
    pub line: usize,
    /// 1-based column, filled in once the source is known.
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Semantic,
}

impl CompileError {
    fn new(message: impl Into<String>, span: Span, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            span,
            kind,
            line: 0,
            column: 0,
        }
    }

    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::new(message, span, ErrorKind::Lexer)
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::new(message, span, ErrorKind::Parser)
    }

    pub fn semantic(message: impl Into<String>, span: Span) -> Self {
        Self::new(message, span, ErrorKind::Semantic)
    }

    /// Resolve `line`/`column` from the span against the source text.
    pub fn locate(mut self, source: &str) -> Self {
        let (line, column) = offset_to_line_col(source, self.span.start);
        self.line = line;
        self.column = column;
        self
    }

    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        let (line, col) = if self.line == 0 {
            offset_to_line_col(source, self.span.start)
        } else {
            (self.line, self.column)
        };
        format!(
            "[{}] line {}:{}: {}",
            match self.kind {
                ErrorKind::Lexer => "lexer",
                ErrorKind::Parser => "parser",
                ErrorKind::Semantic => "semantic",
            },
            line,
            col,
            self.message,
        )
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}:{}: {}", self.line, self.column, self.message)
        }
    }
}

impl std::error::Error for CompileError {}

pub(crate) fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
