//! POSIX shell quoting for commands that cross shell boundaries.
//!
//! Remote sessions nest three interpreters: the outer ssh argument is parsed
//! by the remote login shell, which runs a script, which in turn runs tmux with
//! its own argument list. Each boundary is built from a [`Word`] list and
//! rendered with [`render`], so every literal token is quoted exactly once per
//! boundary it crosses.

/// A single shell word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word {
    /// Literal text, single-quoted when rendered.
    Literal(String),
    /// A trusted shell expression (for example `"$d"/`), emitted verbatim.
    Expr(String),
    /// A trusted expression immediately followed by a quoted literal, with no
    /// separating space: `"$HOME"/'my dir'`.
    Joined(String, String),
}

impl Word {
    /// Literal word.
    pub fn lit(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    /// Verbatim shell expression.
    pub fn expr(text: impl Into<String>) -> Self {
        Self::Expr(text.into())
    }

    fn render(&self) -> String {
        match self {
            Self::Literal(text) => quote(text),
            Self::Expr(expr) => expr.clone(),
            Self::Joined(expr, text) if text.is_empty() => expr.clone(),
            Self::Joined(expr, text) => format!("{expr}{}", quote(text)),
        }
    }
}

/// Single-quotes `s` for a POSIX shell.
///
/// Embedded single quotes become `'\''`. The empty string becomes `''`.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Renders a word list as one shell command line.
pub fn render(words: &[Word]) -> String {
    words
        .iter()
        .map(Word::render)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes every token and joins them with spaces.
pub fn join<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| quote(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
