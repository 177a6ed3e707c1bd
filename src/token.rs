//! Module defining the lexer: character stream in, token stream out.

use crate::error_parsing::LexError;
use crate::{Identifier, ImmutableString};
use std::fmt;

/// A location (line number + character position) in the input script.
///
/// # Limitations
///
/// In order to keep footprint small, both line number and character position
/// have 16-bit resolution.  Advancing beyond the maximum is not an error but
/// has no effect.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy)]
pub struct Position {
    /// Line number - 0 = none
    line: u16,
    /// Character position - 0 = BOL
    pos: u16,
}

impl Position {
    /// A [`Position`] representing no position.
    pub const NONE: Self = Self { line: 0, pos: 0 };
    /// A [`Position`] representing the first position.
    pub const START: Self = Self { line: 1, pos: 0 };

    /// Create a new [`Position`].
    ///
    /// # Panics
    ///
    /// Panics if `line` is zero.
    #[inline(always)]
    #[must_use]
    pub fn new(line: u16, position: u16) -> Self {
        assert!(line != 0, "line cannot be zero");
        Self {
            line,
            pos: position,
        }
    }

    /// Get the line number (1-based), or [`None`] if there is no position.
    #[inline(always)]
    #[must_use]
    pub const fn line(self) -> Option<usize> {
        if self.is_none() {
            None
        } else {
            Some(self.line as usize)
        }
    }

    /// Get the character position (1-based), or [`None`] if at beginning of a line.
    #[inline(always)]
    #[must_use]
    pub const fn position(self) -> Option<usize> {
        if self.is_none() || self.pos == 0 {
            None
        } else {
            Some(self.pos as usize)
        }
    }

    /// Advance by one character position.
    #[inline(always)]
    pub(crate) fn advance(&mut self) {
        if self.pos < u16::MAX {
            self.pos += 1;
        }
    }

    /// Advance to the next line.
    #[inline(always)]
    pub(crate) fn new_line(&mut self) {
        if self.line < u16::MAX {
            self.line += 1;
            self.pos = 0;
        }
    }

    /// Is there no [`Position`]?
    #[inline(always)]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.line == 0 && self.pos == 0
    }
}

impl Default for Position {
    #[inline(always)]
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else {
            write!(f, "line {}, position {}", self.line, self.pos)
        }
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.pos)
    }
}

/// One piece of a dynamic (`"..."`) string: either literal text, or an
/// embedded `{...}` expression captured as raw source for the parser to
/// re-lex.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StringPart {
    /// Literal text with escapes already resolved.
    Text(Identifier),
    /// An embedded expression.
    Expr {
        /// The raw source text between the braces.
        source: String,
        /// Where the expression starts.
        pos: Position,
    },
}

/// A lexed token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// End of input.
    Eoi,
    /// `[`
    LeftBracket,
    /// `]`
    RightBracket,
    /// `(`
    LeftParen,
    /// `)`
    RightParen,
    /// `{`
    LeftBrace,
    /// `}`
    RightBrace,
    /// `,`
    Comma,
    /// `;`
    Semicolon,
    /// `:`
    Colon,
    /// `.`
    Dot,
    /// `|`
    Bar,
    /// An alphabetic name that has a declaration in scope.
    ///
    /// The lexer has no access to scopes, so it always produces the
    /// `Unknown` variants; the parser reclassifies when it cares.
    AlphaName(Identifier),
    /// A punctuation name that has a declaration in scope.
    PunctName(Identifier),
    /// An alphabetic name with no declaration in scope.
    UnknownAlphaName(Identifier),
    /// A punctuation name with no declaration in scope.
    UnknownPunctName(Identifier),
    /// A `Byte` literal (suffix `x`).
    Byte(u8),
    /// An `Integer16` literal (suffix `h`).
    Int16(i16),
    /// An `Integer32` literal (suffix `L`).
    Int32(i32),
    /// An `Integer64` literal (no suffix).
    Int64(i64),
    /// A `Float32` literal (suffix `f`).
    Float32(f32),
    /// A `Float64` literal.
    Float64(f64),
    /// A character (byte) literal.
    Char(u8),
    /// A Unicode scalar literal.
    Uni(char),
    /// A raw (`''...''`) string literal.
    RawString(ImmutableString),
    /// A dynamic (`"..."`) string literal, possibly with embedded expressions.
    DynString(Vec<StringPart>),
    /// `` ` ``
    Backtick,
    /// `@`
    At,
    /// `@@`
    DoubleAt,
    /// `##`
    DoubleHash,
    /// `#name` - a loanword such as `#syntax`.
    LoanWord(Identifier),
    /// A lexical error; the lexer has already advanced past it.
    LexError(LexError),
}

impl Token {
    /// The text of this token if it is any kind of name.
    #[inline]
    #[must_use]
    pub fn name_text(&self) -> Option<&str> {
        match self {
            Self::AlphaName(s)
            | Self::PunctName(s)
            | Self::UnknownAlphaName(s)
            | Self::UnknownPunctName(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Is this token an alphabetic name?
    #[inline]
    #[must_use]
    pub fn is_alpha_name(&self) -> bool {
        matches!(self, Self::AlphaName(_) | Self::UnknownAlphaName(_))
    }

    /// Is this token a punctuation name?
    #[inline]
    #[must_use]
    pub fn is_punct_name(&self) -> bool {
        matches!(self, Self::PunctName(_) | Self::UnknownPunctName(_))
    }

    /// Is this token a name with the given text?
    #[inline]
    #[must_use]
    pub fn is_name(&self, text: &str) -> bool {
        self.name_text() == Some(text)
    }

    /// A short human-readable description of this token for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Eoi => "end of input".to_string(),
            Self::LeftBracket => "'['".to_string(),
            Self::RightBracket => "']'".to_string(),
            Self::LeftParen => "'('".to_string(),
            Self::RightParen => "')'".to_string(),
            Self::LeftBrace => "'{'".to_string(),
            Self::RightBrace => "'}'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Semicolon => "';'".to_string(),
            Self::Colon => "':'".to_string(),
            Self::Dot => "'.'".to_string(),
            Self::Bar => "'|'".to_string(),
            Self::AlphaName(s)
            | Self::PunctName(s)
            | Self::UnknownAlphaName(s)
            | Self::UnknownPunctName(s) => format!("'{}'", s),
            Self::Byte(n) => format!("'{}x'", n),
            Self::Int16(n) => format!("'{}h'", n),
            Self::Int32(n) => format!("'{}L'", n),
            Self::Int64(n) => format!("'{}'", n),
            Self::Float32(n) => format!("'{}f'", n),
            Self::Float64(n) => format!("'{}'", n),
            Self::Char(c) => format!("character '{}'", *c as char),
            Self::Uni(c) => format!("character '{}'", c),
            Self::RawString(_) | Self::DynString(_) => "string".to_string(),
            Self::Backtick => "'`'".to_string(),
            Self::At => "'@'".to_string(),
            Self::DoubleAt => "'@@'".to_string(),
            Self::DoubleHash => "'##'".to_string(),
            Self::LoanWord(s) => format!("'#{}'", s),
            Self::LexError(err) => err.to_string(),
        }
    }
}

/// A token plus where it came from and how it sits on its line.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    /// The token itself.
    pub token: Token,
    /// The position of the token's first character.
    pub pos: Position,
    /// Was there a line break (or start of input) before this token?
    ///
    /// The parser consults this to decide whether a binary operator is
    /// allowed to continue the previous line's expression.
    pub first_on_line: bool,
}

/// A saved lexer state, for speculative parsing.
///
/// Restoring a snapshot rewinds the lexer exactly, including the one-token
/// pushback slot.
#[derive(Debug, Clone)]
pub struct LexerState {
    offset: usize,
    pos: Position,
    newline_pending: bool,
    pushback: Option<TokenData>,
}

/// The lexer: a character stream with a one-token pushback.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    src: &'a str,
    filename: ImmutableString,
    offset: usize,
    pos: Position,
    newline_pending: bool,
    pushback: Option<TokenData>,
}

const PUNCT_CHARS: &str = "+-*/<>=!&^~?%";

#[inline]
fn is_name_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == '$'
}

#[inline]
fn is_name_continue(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$' || ch == '\''
}

impl<'a> Lexer<'a> {
    /// Create a new [`Lexer`] over a source string.
    #[must_use]
    pub fn new(src: &'a str, filename: impl Into<ImmutableString>, start: Position) -> Self {
        Self {
            src,
            filename: filename.into(),
            offset: 0,
            pos: start,
            newline_pending: true,
            pushback: None,
        }
    }

    /// The name of the file being lexed.
    #[inline(always)]
    #[must_use]
    pub fn filename(&self) -> &ImmutableString {
        &self.filename
    }

    /// Save the current lexer state.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> LexerState {
        LexerState {
            offset: self.offset,
            pos: self.pos,
            newline_pending: self.newline_pending,
            pushback: self.pushback.clone(),
        }
    }

    /// Rewind to a previously saved state.
    #[inline]
    pub fn restore(&mut self, state: LexerState) {
        self.offset = state.offset;
        self.pos = state.pos;
        self.newline_pending = state.newline_pending;
        self.pushback = state.pushback;
    }

    /// Push one token back onto the stream.
    ///
    /// # Panics
    ///
    /// Panics if the pushback slot is already occupied.
    #[inline]
    pub fn unget(&mut self, token: TokenData) {
        assert!(self.pushback.is_none(), "token pushback slot is full");
        self.pushback = Some(token);
    }

    /// Get the next token without consuming it.
    #[inline]
    pub fn peek(&mut self) -> TokenData {
        let token = self.next_token();
        self.pushback = Some(token.clone());
        token
    }

    #[inline]
    fn peek_char(&self) -> Option<char> {
        self.src[self.offset..].chars().next()
    }

    #[inline]
    fn peek_char_at(&self, extra: usize) -> Option<char> {
        let mut chars = self.src[self.offset..].chars();
        for _ in 0..extra {
            chars.next()?;
        }
        chars.next()
    }

    #[inline]
    fn next_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.offset += ch.len_utf8();
        if ch == '\n' {
            self.pos.new_line();
            self.newline_pending = true;
        } else {
            self.pos.advance();
        }
        Some(ch)
    }

    /// Skip whitespace and comments, recording any line breaks.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek_char() {
                Some(ch) if ch.is_whitespace() => {
                    self.next_char();
                }
                Some('/') if self.peek_char_at(1) == Some('/') => {
                    while let Some(ch) = self.peek_char() {
                        if ch == '\n' {
                            break;
                        }
                        self.next_char();
                    }
                }
                Some('/') if self.peek_char_at(1) == Some('*') => {
                    self.next_char();
                    self.next_char();
                    loop {
                        match self.next_char() {
                            Some('*') if self.peek_char() == Some('/') => {
                                self.next_char();
                                break;
                            }
                            Some(_) => (),
                            None => break,
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Get the next token.
    pub fn next_token(&mut self) -> TokenData {
        if let Some(token) = self.pushback.take() {
            return token;
        }

        self.skip_trivia();

        let first_on_line = self.newline_pending;
        self.newline_pending = false;
        let pos = self.pos;

        let token = match self.peek_char() {
            None => Token::Eoi,
            Some(ch) => self.scan_token(ch),
        };

        TokenData {
            token,
            pos,
            first_on_line,
        }
    }

    fn scan_token(&mut self, ch: char) -> Token {
        match ch {
            '[' => {
                self.next_char();
                Token::LeftBracket
            }
            ']' => {
                self.next_char();
                Token::RightBracket
            }
            '(' => {
                self.next_char();
                Token::LeftParen
            }
            ')' => {
                self.next_char();
                Token::RightParen
            }
            '{' => {
                self.next_char();
                Token::LeftBrace
            }
            '}' => {
                self.next_char();
                Token::RightBrace
            }
            ',' => {
                self.next_char();
                Token::Comma
            }
            ';' => {
                self.next_char();
                Token::Semicolon
            }
            ':' => {
                self.next_char();
                Token::Colon
            }
            '|' => {
                self.next_char();
                Token::Bar
            }
            '`' => {
                self.next_char();
                Token::Backtick
            }
            '@' => {
                self.next_char();
                if self.peek_char() == Some('@') {
                    self.next_char();
                    Token::DoubleAt
                } else {
                    Token::At
                }
            }
            '#' => {
                self.next_char();
                match self.peek_char() {
                    Some('#') => {
                        self.next_char();
                        Token::DoubleHash
                    }
                    Some(next) if is_name_start(next) => {
                        let name = self.scan_name_text();
                        Token::LoanWord(name)
                    }
                    _ => Token::LexError(LexError::UnexpectedInput("#".to_string())),
                }
            }
            '.' => {
                self.next_char();
                if self.peek_char() == Some('.') {
                    let mut text = Identifier::new();
                    text.push('.');
                    while self.peek_char() == Some('.') {
                        self.next_char();
                        text.push('.');
                    }
                    Token::UnknownPunctName(text)
                } else {
                    Token::Dot
                }
            }
            '\'' => self.scan_quoted(),
            '"' => self.scan_dynamic_string(),
            _ if ch.is_ascii_digit() => self.scan_number(),
            _ if is_name_start(ch) => {
                let name = self.scan_name_text();
                Token::UnknownAlphaName(name)
            }
            _ if PUNCT_CHARS.contains(ch) => {
                let mut text = Identifier::new();
                while let Some(next) = self.peek_char() {
                    if PUNCT_CHARS.contains(next) {
                        self.next_char();
                        text.push(next);
                    } else {
                        break;
                    }
                }
                Token::UnknownPunctName(text)
            }
            _ => {
                self.next_char();
                Token::LexError(LexError::UnexpectedInput(ch.to_string()))
            }
        }
    }

    /// Scan an alphabetic name.  Interior `-` joins the name only when
    /// followed by a letter or `_`, so `get-line` is one name but `x-1`
    /// is a subtraction.
    fn scan_name_text(&mut self) -> Identifier {
        let mut text = Identifier::new();
        while let Some(ch) = self.peek_char() {
            if is_name_continue(ch) {
                self.next_char();
                text.push(ch);
            } else if ch == '-'
                && self
                    .peek_char_at(1)
                    .map_or(false, |next| next.is_alphabetic() || next == '_')
            {
                self.next_char();
                text.push('-');
            } else {
                break;
            }
        }
        text
    }

    fn scan_number(&mut self) -> Token {
        let start = self.offset;

        let (radix, mut digits) = if self.peek_char() == Some('0')
            && matches!(self.peek_char_at(1), Some('x' | 'o' | 'b'))
        {
            self.next_char();
            let radix = match self.next_char() {
                Some('x') => 16,
                Some('o') => 8,
                _ => 2,
            };
            (radix, String::new())
        } else {
            (10, String::new())
        };

        while let Some(ch) = self.peek_char() {
            if ch.is_digit(radix) || ch == '_' {
                self.next_char();
                if ch != '_' {
                    digits.push(ch);
                }
            } else {
                break;
            }
        }

        if digits.is_empty() {
            return Token::LexError(LexError::MalformedNumber(
                self.src[start..self.offset].to_string(),
            ));
        }

        // A decimal point followed by a digit makes this a real literal.
        if radix == 10
            && self.peek_char() == Some('.')
            && self.peek_char_at(1).map_or(false, |c| c.is_ascii_digit())
        {
            return self.scan_real(start, digits);
        }

        let value = match i128::from_str_radix(&digits, radix) {
            Ok(value) => value,
            Err(_) => {
                return Token::LexError(LexError::MalformedNumber(
                    self.src[start..self.offset].to_string(),
                ))
            }
        };

        // Optional width suffix.
        let suffix = match self.peek_char() {
            Some(ch @ ('x' | 'h' | 'L')) => {
                self.next_char();
                Some(ch)
            }
            _ => None,
        };

        let bad = || {
            Token::LexError(LexError::MalformedNumber(
                // Exclude any suffix; it has already been consumed.
                digits.clone(),
            ))
        };

        match suffix {
            Some('x') => u8::try_from(value).map_or_else(|_| bad(), Token::Byte),
            Some('h') => i16::try_from(value).map_or_else(|_| bad(), Token::Int16),
            Some('L') => i32::try_from(value).map_or_else(|_| bad(), Token::Int32),
            _ => i64::try_from(value).map_or_else(|_| bad(), Token::Int64),
        }
    }

    fn scan_real(&mut self, start: usize, mut digits: String) -> Token {
        self.next_char(); // the '.'
        digits.push('.');

        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == '_' {
                self.next_char();
                if ch != '_' {
                    digits.push(ch);
                }
            } else {
                break;
            }
        }

        if matches!(self.peek_char(), Some('e' | 'E')) {
            digits.push('e');
            self.next_char();
            if matches!(self.peek_char(), Some('+' | '-')) {
                digits.push(self.next_char().unwrap());
            }
            let mut any = false;
            while let Some(ch) = self.peek_char() {
                if ch.is_ascii_digit() {
                    self.next_char();
                    digits.push(ch);
                    any = true;
                } else {
                    break;
                }
            }
            if !any {
                return Token::LexError(LexError::MalformedNumber(
                    self.src[start..self.offset].to_string(),
                ));
            }
        }

        if self.peek_char() == Some('f') {
            self.next_char();
            match digits.parse::<f32>() {
                Ok(value) => Token::Float32(value),
                Err(_) => Token::LexError(LexError::MalformedNumber(digits)),
            }
        } else {
            match digits.parse::<f64>() {
                Ok(value) => Token::Float64(value),
                Err(_) => Token::LexError(LexError::MalformedNumber(digits)),
            }
        }
    }

    /// Scan `'x'` character literals and `''...''` raw strings.
    fn scan_quoted(&mut self) -> Token {
        let mut quotes = 0;
        while self.peek_char() == Some('\'') {
            self.next_char();
            quotes += 1;
        }

        if quotes == 1 {
            return self.scan_char_literal();
        }

        // A raw string: content runs until the same number of quotes.
        let mut text = String::new();
        let mut run = 0;
        loop {
            match self.next_char() {
                None => return Token::LexError(LexError::UnterminatedString),
                Some('\'') => {
                    run += 1;
                    if run == quotes {
                        return Token::RawString(text.into());
                    }
                }
                Some(ch) => {
                    for _ in 0..run {
                        text.push('\'');
                    }
                    run = 0;
                    text.push(ch);
                }
            }
        }
    }

    fn scan_char_literal(&mut self) -> Token {
        let (ch, was_uni_escape) = match self.next_char() {
            None => return Token::LexError(LexError::UnterminatedString),
            Some('\\') => match self.scan_escape() {
                Ok(escape) => escape,
                Err(err) => return Token::LexError(err),
            },
            Some('\'') => {
                return Token::LexError(LexError::MalformedChar("''".to_string()));
            }
            Some(ch) => (ch, false),
        };

        if self.next_char() != Some('\'') {
            return Token::LexError(LexError::MalformedChar(ch.to_string()));
        }

        if !was_uni_escape && (ch as u32) < 0x100 {
            Token::Char(ch as u8)
        } else {
            Token::Uni(ch)
        }
    }

    /// Scan the part of an escape sequence after the backslash.  The second
    /// element of the result is true for `\u` escapes, which always produce
    /// Unicode scalars rather than bytes.
    fn scan_escape(&mut self) -> Result<(char, bool), LexError> {
        let ch = self
            .next_char()
            .ok_or(LexError::UnterminatedString)?;
        let escape = match ch {
            'a' => '\x07',
            'b' => '\x08',
            'e' => '\x1B',
            'f' => '\x0C',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'v' => '\x0B',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            '{' => '{',
            '}' => '}',
            'x' => {
                let value = self.scan_hex_digits(2)?;
                return Ok((char::from(value as u8), false));
            }
            'u' => {
                let value = self.scan_hex_digits(4)?;
                let ch = char::from_u32(value)
                    .ok_or_else(|| LexError::MalformedEscapeSequence(format!("\\u{:04X}", value)))?;
                return Ok((ch, true));
            }
            other => {
                return Err(LexError::MalformedEscapeSequence(format!("\\{}", other)));
            }
        };
        Ok((escape, false))
    }

    fn scan_hex_digits(&mut self, count: usize) -> Result<u32, LexError> {
        let mut value = 0;
        for _ in 0..count {
            let ch = self.next_char().ok_or(LexError::UnterminatedString)?;
            let digit = ch
                .to_digit(16)
                .ok_or_else(|| LexError::MalformedEscapeSequence(ch.to_string()))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    /// Scan a `"..."` dynamic string, capturing embedded `{...}` expressions
    /// as raw sub-sources.
    fn scan_dynamic_string(&mut self) -> Token {
        self.next_char(); // the opening quote

        let mut parts = Vec::new();
        let mut text = Identifier::new();

        loop {
            match self.next_char() {
                None => return Token::LexError(LexError::UnterminatedString),
                Some('"') => break,
                Some('\\') => match self.scan_escape() {
                    Ok((ch, _)) => text.push(ch),
                    Err(err) => return Token::LexError(err),
                },
                Some('{') => {
                    if !text.is_empty() {
                        parts.push(StringPart::Text(std::mem::take(&mut text)));
                    }
                    let pos = self.pos;
                    match self.scan_embedded_expr() {
                        Ok(source) => parts.push(StringPart::Expr { source, pos }),
                        Err(err) => return Token::LexError(err),
                    }
                }
                Some(ch) => text.push(ch),
            }
        }

        if !text.is_empty() || parts.is_empty() {
            parts.push(StringPart::Text(text));
        }

        Token::DynString(parts)
    }

    /// Capture the raw source of an embedded expression, balancing braces
    /// and skipping over nested string literals.
    fn scan_embedded_expr(&mut self) -> Result<String, LexError> {
        let start = self.offset;
        let mut depth = 1;

        loop {
            match self.next_char() {
                None => return Err(LexError::UnbalancedBrace),
                Some('{') => depth += 1,
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        let end = self.offset - 1;
                        return Ok(self.src[start..end].to_string());
                    }
                }
                Some('"') => {
                    // Skip a nested dynamic string.
                    loop {
                        match self.next_char() {
                            None => return Err(LexError::UnterminatedString),
                            Some('\\') => {
                                self.next_char();
                            }
                            Some('"') => break,
                            Some(_) => (),
                        }
                    }
                }
                Some(_) => (),
            }
        }
    }
}
