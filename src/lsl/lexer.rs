use tracing::debug;

use super::ast::Span;
use super::error::CompileError;
use super::types::Type;

/// Longest accepted identifier.
pub const MAX_NAME_LEN: usize = 255;
/// Longest accepted string literal body.
pub const MAX_STRING_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i32),
    Float(f64),
    String(String),
    Name(String),

    // Keywords
    Default,
    Do,
    Else,
    For,
    If,
    Jump,
    Return,
    State,
    While,

    // Type names
    IntegerTy,
    FloatTy,
    StringTy,
    KeyTy,
    ListTy,
    VectorTy,
    RotationTy,

    // Array extension keywords (after `XMROption arrays;`)
    ArrayTy,
    ObjectTy,
    ForEach,
    In,
    Is,
    Undef,

    // Delimiters
    ShlAssign,     // <<=
    ShrAssign,     // >>=
    Le,            // <=
    Ge,            // >=
    EqEq,          // ==
    Ne,            // !=
    PlusPlus,      // ++
    MinusMinus,    // --
    AndAnd,        // &&
    OrOr,          // ||
    PlusAssign,    // +=
    AndAssign,     // &=
    MinusAssign,   // -=
    StarAssign,    // *=
    SlashAssign,   // /=
    PercentAssign, // %=
    OrAssign,      // |=
    XorAssign,     // ^=
    Shl,           // <<
    Shr,           // >>
    Tilde,
    Bang,
    At,
    Percent,
    Caret,
    Amp,
    Star,
    LParen,
    RParen,
    Minus,
    Plus,
    Assign,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Colon,
    Lt,
    Gt,
    Comma,
    Dot,
    Question,
    Slash,
    Pipe,

    // Special
    Eof,
}

impl Token {
    /// The type named by a type keyword token.
    pub fn as_type(&self) -> Option<Type> {
        Some(match self {
            Token::IntegerTy => Type::Integer,
            Token::FloatTy => Type::Float,
            Token::StringTy => Type::String,
            Token::KeyTy => Type::Key,
            Token::ListTy => Type::List,
            Token::VectorTy => Type::Vector,
            Token::RotationTy => Type::Rotation,
            Token::ArrayTy => Type::Array,
            Token::ObjectTy => Type::Object,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
    pub line: usize,
    pub column: usize,
}

/// Mutable token sequence produced by the lexer.
#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    tokens: Vec<SpannedToken>,
    /// Whether `XMROption arrays;` was seen.
    pub arrays_enabled: bool,
}

impl TokenStream {
    pub fn push(&mut self, token: SpannedToken) {
        self.tokens.push(token);
    }

    /// The token `n` positions from the end (0 = last).
    pub fn nth_back(&self, n: usize) -> Option<&SpannedToken> {
        self.tokens.iter().rev().nth(n)
    }

    /// Remove the last `n` tokens.
    pub fn retract(&mut self, n: usize) {
        let keep = self.tokens.len().saturating_sub(n);
        self.tokens.truncate(keep);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpannedToken> {
        self.tokens.iter()
    }

    pub fn into_tokens(self) -> Vec<SpannedToken> {
        self.tokens
    }
}

/// Delimiters in match order: longer spellings first so `<<=` wins over `<<` and `<`.
const DELIMITERS: &[&str] = &[
    "<<=", ">>=", "<=", ">=", "==", "!=", "++", "--", "&&", "||", "+=", "&=", "-=", "*=", "/=",
    "%=", "|=", "^=", "<<", ">>", "~", "!", "@", "%", "^", "&", "*", "(", ")", "-", "+", "=",
    "{", "}", "[", "]", ";", ":", "<", ">", ",", ".", "?", "/", "|",
];

fn delimiter_token(text: &str) -> Option<Token> {
    Some(match text {
        "<<=" => Token::ShlAssign,
        ">>=" => Token::ShrAssign,
        "<=" => Token::Le,
        ">=" => Token::Ge,
        "==" => Token::EqEq,
        "!=" => Token::Ne,
        "++" => Token::PlusPlus,
        "--" => Token::MinusMinus,
        "&&" => Token::AndAnd,
        "||" => Token::OrOr,
        "+=" => Token::PlusAssign,
        "&=" => Token::AndAssign,
        "-=" => Token::MinusAssign,
        "*=" => Token::StarAssign,
        "/=" => Token::SlashAssign,
        "%=" => Token::PercentAssign,
        "|=" => Token::OrAssign,
        "^=" => Token::XorAssign,
        "<<" => Token::Shl,
        ">>" => Token::Shr,
        "~" => Token::Tilde,
        "!" => Token::Bang,
        "@" => Token::At,
        "%" => Token::Percent,
        "^" => Token::Caret,
        "&" => Token::Amp,
        "*" => Token::Star,
        "(" => Token::LParen,
        ")" => Token::RParen,
        "-" => Token::Minus,
        "+" => Token::Plus,
        "=" => Token::Assign,
        "{" => Token::LBrace,
        "}" => Token::RBrace,
        "[" => Token::LBracket,
        "]" => Token::RBracket,
        ";" => Token::Semicolon,
        ":" => Token::Colon,
        "<" => Token::Lt,
        ">" => Token::Gt,
        "," => Token::Comma,
        "." => Token::Dot,
        "?" => Token::Question,
        "/" => Token::Slash,
        "|" => Token::Pipe,
        _ => return None,
    })
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "default" => Token::Default,
        "do" => Token::Do,
        "else" => Token::Else,
        "float" => Token::FloatTy,
        "for" => Token::For,
        "if" => Token::If,
        "integer" => Token::IntegerTy,
        "jump" => Token::Jump,
        "key" => Token::KeyTy,
        "list" => Token::ListTy,
        "return" => Token::Return,
        "rotation" => Token::RotationTy,
        "state" => Token::State,
        "string" => Token::StringTy,
        "vector" => Token::VectorTy,
        "while" => Token::While,
        _ => return None,
    })
}

fn array_keyword(word: &str) -> Option<Token> {
    Some(match word {
        "array" => Token::ArrayTy,
        "foreach" => Token::ForEach,
        "in" => Token::In,
        "is" => Token::Is,
        "object" => Token::ObjectTy,
        "undef" => Token::Undef,
        _ => return None,
    })
}

pub fn lex(source: &str) -> Result<TokenStream, Vec<CompileError>> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    line_start: usize,
    tokens: TokenStream,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
            tokens: TokenStream::default(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<TokenStream, Vec<CompileError>> {
        while let Some(ch) = self.peek() {
            let start = self.pos;

            if ch == b'\n' {
                self.newline();
                continue;
            }
            if ch <= b' ' {
                self.pos += 1;
                continue;
            }
            if ch == b'/' && self.peek_at(1) == Some(b'/') {
                while self.peek().is_some_and(|c| c != b'\n') {
                    self.pos += 1;
                }
                continue;
            }
            if ch == b'/' && self.peek_at(1) == Some(b'*') {
                self.skip_block_comment(start);
                continue;
            }

            match ch {
                b'0'..=b'9' => self.lex_number(start),
                b'"' => self.lex_string(start),
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_name(start),
                b';' if self.at_arrays_pragma() => {
                    self.tokens.retract(2);
                    self.tokens.arrays_enabled = true;
                    self.pos += 1;
                    debug!(line = self.line, "array extension enabled");
                }
                _ => self.lex_delimiter(start),
            }
        }

        let eof = self.spanned(Token::Eof, self.pos, self.pos);
        self.tokens.push(eof);

        if self.errors.is_empty() {
            Ok(std::mem::take(&mut self.tokens))
        } else {
            for error in &self.errors {
                debug!(line = error.line, column = error.column, "lex error: {}", error.message);
            }
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn newline(&mut self) {
        self.pos += 1;
        self.line += 1;
        self.line_start = self.pos;
    }

    fn column_of(&self, offset: usize) -> usize {
        offset.saturating_sub(self.line_start) + 1
    }

    fn spanned(&self, token: Token, start: usize, end: usize) -> SpannedToken {
        SpannedToken {
            token,
            span: Span::new(start, end),
            line: self.line,
            column: self.column_of(start),
        }
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        let tok = self.spanned(token, start, end);
        self.tokens.push(tok);
    }

    fn error(&mut self, message: impl Into<String>, start: usize, end: usize) {
        let mut err = CompileError::lexer(message, Span::new(start, end));
        err.line = self.line;
        err.column = self.column_of(start);
        self.errors.push(err);
    }

    fn at_arrays_pragma(&self) -> bool {
        let is_name = |n: usize, want: &str| {
            self.tokens
                .nth_back(n)
                .is_some_and(|t| matches!(&t.token, Token::Name(name) if name == want))
        };
        is_name(0, "arrays") && is_name(1, "XMROption")
    }

    fn skip_block_comment(&mut self, start: usize) {
        self.pos += 2;
        loop {
            match self.peek() {
                None => {
                    self.error("unterminated comment", start, self.pos);
                    return;
                }
                Some(b'*') if self.peek_at(1) == Some(b'/') => {
                    self.pos += 2;
                    return;
                }
                Some(b'\n') => self.newline(),
                Some(_) => self.pos += 1,
            }
        }
    }

    fn lex_delimiter(&mut self, start: usize) {
        let rest = &self.bytes[start..];
        for delim in DELIMITERS {
            if rest.starts_with(delim.as_bytes()) {
                if let Some(token) = delimiter_token(delim) {
                    self.pos += delim.len();
                    self.push(token, start, self.pos);
                    return;
                }
            }
        }
        let ch = self.source[start..].chars().next().unwrap_or('?');
        self.pos += ch.len_utf8().max(1);
        self.error(format!("unknown character '{ch}'"), start, self.pos);
    }

    fn lex_name(&mut self, start: usize) {
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        if self.pos - start > MAX_NAME_LEN {
            self.error(format!("name too long, max {MAX_NAME_LEN}"), start, self.pos);
            return;
        }
        let word = &self.source[start..self.pos];
        let token = keyword(word)
            .or_else(|| {
                if self.tokens.arrays_enabled {
                    array_keyword(word)
                } else {
                    None
                }
            })
            .unwrap_or_else(|| Token::Name(word.to_string()));
        self.push(token, start, self.pos);
    }

    fn lex_string(&mut self, start: usize) {
        let mut backslash = false;
        let mut end = start + 1;
        let mut terminated = false;
        while let Some(&c) = self.bytes.get(end) {
            if c == b'\\' {
                backslash = !backslash;
            } else if c == b'\n' {
                self.error("string runs off end of line", start, end);
                break;
            } else {
                if !backslash && c == b'"' {
                    terminated = true;
                    break;
                }
                backslash = false;
            }
            end += 1;
        }
        if end >= self.bytes.len() && !terminated {
            self.error("unterminated string", start, end);
        }

        let body = &self.source[start + 1..end.min(self.source.len())];
        if body.len() > MAX_STRING_LEN {
            self.error(format!("string too long, max {MAX_STRING_LEN}"), start, end);
        } else {
            self.push(Token::String(unescape(body)), start, end + 1);
        }
        // The newline that cut a runaway string is left for the main loop.
        self.pos = if terminated { end + 1 } else { end };
    }

    /// Scan a numeric literal. Floats are built from an integer mantissa and a
    /// decimal exponent so literal rounding is independent of the platform parser.
    fn lex_number(&mut self, start: usize) {
        let mut mantissa: u64 = 0;
        let mut exponent: i32 = 0;
        let mut decimals = false;
        let mut is_float = false;
        let mut error = false;
        let mut j = start;

        while let Some(&c) = self.bytes.get(j) {
            match c {
                b'0'..=b'9' => {
                    let digit = u64::from(c - b'0');
                    match mantissa.checked_mul(10).and_then(|m| m.checked_add(digit)) {
                        Some(m) => {
                            mantissa = m;
                            if decimals {
                                exponent = exponent.saturating_sub(1);
                            }
                        }
                        None => {
                            if !decimals {
                                exponent = exponent.saturating_add(1);
                            }
                        }
                    }
                    j += 1;
                }
                b'.' => {
                    if decimals {
                        break;
                    }
                    decimals = true;
                    is_float = true;
                    j += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    j += 1;
                    let negative = self.bytes.get(j) == Some(&b'-');
                    if negative || self.bytes.get(j) == Some(&b'+') {
                        j += 1;
                    }
                    let mut value: i32 = 0;
                    let mut digits = false;
                    while let Some(&d) = self.bytes.get(j) {
                        if !d.is_ascii_digit() {
                            break;
                        }
                        match value.checked_mul(10).and_then(|v| v.checked_add(i32::from(d - b'0'))) {
                            Some(v) => value = v,
                            None => {
                                if !error {
                                    self.error("floating exponent overflow", start, j);
                                }
                                error = true;
                            }
                        }
                        digits = true;
                        j += 1;
                    }
                    if !digits {
                        self.error("bad or missing floating exponent", start, j);
                        self.pos = j;
                        return;
                    }
                    let adjusted = if negative {
                        exponent.checked_sub(value)
                    } else {
                        exponent.checked_add(value)
                    };
                    match adjusted {
                        Some(e) => exponent = e,
                        None => {
                            if !error {
                                self.error("floating exponent overflow", start, j);
                            }
                            error = true;
                        }
                    }
                    break;
                }
                _ => break,
            }
        }

        if !is_float {
            self.lex_integer(start);
            return;
        }

        self.pos = j;
        if error {
            return;
        }
        let value = scale_by_power_of_ten(mantissa, exponent);
        if value.is_finite() {
            self.push(Token::Float(value), start, j);
        } else {
            self.error("floating exponent overflow", start, j);
        }
    }

    fn lex_integer(&mut self, start: usize) {
        let mut value: i32 = 0;
        let mut error = false;
        while let Some(c) = self.peek().filter(u8::is_ascii_digit) {
            match value.checked_mul(10).and_then(|v| v.checked_add(i32::from(c - b'0'))) {
                Some(v) => value = v,
                None => {
                    if !error {
                        self.error("integer overflow", start, self.pos + 1);
                    }
                    error = true;
                }
            }
            self.pos += 1;
        }
        if !error {
            self.push(Token::Int(value), start, self.pos);
        }
    }
}

/// `mantissa × 10^exponent` by repeated squaring of the scale factor.
fn scale_by_power_of_ten(mantissa: u64, exponent: i32) -> f64 {
    let mut f = mantissa as f64;
    if exponent == 0 || mantissa == 0 {
        return f;
    }
    let mut f10 = 10.0_f64;
    let mut remaining = exponent.unsigned_abs();
    while remaining > 0 {
        if remaining & 1 != 0 {
            if exponent < 0 {
                f /= f10;
            } else {
                f *= f10;
            }
        }
        remaining /= 2;
        f10 *= f10;
    }
    f
}

fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<Token> {
        lex(s).unwrap().into_tokens().into_iter().map(|t| t.token).collect()
    }

    fn errors(s: &str) -> Vec<String> {
        lex(s).unwrap_err().into_iter().map(|e| e.message).collect()
    }

    #[test]
    fn float_with_exponent() {
        assert_eq!(tok("1.25e2"), vec![Token::Float(125.0), Token::Eof]);
    }

    #[test]
    fn one_tenth_is_nearest_double() {
        assert_eq!(tok("0.1"), vec![Token::Float(0.1), Token::Eof]);
    }

    #[test]
    fn negative_exponent_and_trailing_point() {
        assert_eq!(tok("25e-1 3."), vec![Token::Float(2.5), Token::Float(3.0), Token::Eof]);
    }

    #[test]
    fn exponent_overflow_is_error() {
        assert_eq!(errors("float f = 1e99999999;"), vec!["floating exponent overflow"]);
    }

    #[test]
    fn exponent_digits_overflow_is_error() {
        assert_eq!(errors("1.0e99999999999"), vec!["floating exponent overflow"]);
    }

    #[test]
    fn missing_exponent_is_error() {
        assert_eq!(errors("1.5e+;"), vec!["bad or missing floating exponent"]);
    }

    #[test]
    fn integer_overflow_is_error() {
        assert_eq!(errors("4294967295"), vec!["integer overflow"]);
        assert_eq!(tok("2147483647"), vec![Token::Int(i32::MAX), Token::Eof]);
    }

    #[test]
    fn long_mantissa_digits_shift_exponent() {
        // 21 significant digits overflow the u64 mantissa; the extra digit scales instead.
        let tokens = tok("123456789012345678901.0");
        let Token::Float(v) = tokens[0] else { panic!("expected float") };
        assert!((v - 1.234_567_890_123_456_8e20).abs() / v < 1e-15);
    }

    #[test]
    fn keywords_and_names() {
        assert_eq!(
            tok("default state integer x"),
            vec![
                Token::Default,
                Token::State,
                Token::IntegerTy,
                Token::Name("x".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn longest_delimiter_wins() {
        assert_eq!(
            tok("a <<= b << c < d"),
            vec![
                Token::Name("a".into()),
                Token::ShlAssign,
                Token::Name("b".into()),
                Token::Shl,
                Token::Name("c".into()),
                Token::Lt,
                Token::Name("d".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            tok("x // line\n/* block\n comment */ y"),
            vec![Token::Name("x".into()), Token::Name("y".into()), Token::Eof]
        );
    }

    #[test]
    fn positions_track_lines_and_columns() {
        let stream = lex("integer a;\n  float b;").unwrap();
        let float_tok = stream.iter().find(|t| t.token == Token::FloatTy).unwrap();
        assert_eq!((float_tok.line, float_tok.column), (2, 3));
    }

    #[test]
    fn string_escapes_do_not_terminate() {
        assert_eq!(
            tok(r#""say \"hi\"\n""#),
            vec![Token::String("say \"hi\"\n".into()), Token::Eof]
        );
    }

    #[test]
    fn runaway_string_reports_and_continues() {
        let errs = lex("string s = \"abc\ninteger 4294967295;").unwrap_err();
        let messages: Vec<_> = errs.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["string runs off end of line", "integer overflow"]);
        assert_eq!(errs[1].line, 2);
    }

    #[test]
    fn array_keywords_need_pragma() {
        assert_eq!(
            tok("array a;"),
            vec![Token::Name("array".into()), Token::Name("a".into()), Token::Semicolon, Token::Eof]
        );
        let stream = lex("XMROption arrays; array a;").unwrap();
        assert!(stream.arrays_enabled);
        let tokens: Vec<_> = stream.into_tokens().into_iter().map(|t| t.token).collect();
        assert_eq!(
            tokens,
            vec![Token::ArrayTy, Token::Name("a".into()), Token::Semicolon, Token::Eof]
        );
    }

    #[test]
    fn unknown_character_is_error_but_lexing_continues() {
        assert_eq!(errors("a $ b # c"), vec!["unknown character '$'", "unknown character '#'"]);
    }
}
