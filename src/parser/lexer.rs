//! Lexer for opal source files
//!
//! The lexer tokenizes input into a stream of tokens that the parser
//! consumes. It is a pushdown automaton over three modes:
//! - Language: structural tokens, keywords, identifiers, literals
//! - Command: shell text captured verbatim, with quoting state
//! - Pattern: pattern-arm labels inside a pattern decorator's block
//!
//! Mode switching is keyed by a stack of brace frames. The decorator
//! registry decides whether a `@word` in shell text introduces a
//! decorator at all.
//!
//! The lexer never aborts: unknown input becomes Illegal tokens and the
//! caller decides whether to halt.

use std::collections::HashMap;

use crate::registry::{DecoratorKind, DecoratorRegistry};

/// Token types for the opal lexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    // End of input
    Eof,
    // Unrecognized input; value carries a description
    Illegal,

    // Separators
    Newline,

    // Structural
    At,       // @
    Colon,    // :
    Equals,   // =
    Comma,    // ,
    LParen,   // (
    RParen,   // )
    LBrace,   // {
    RBrace,   // }
    Asterisk, // *

    // Literals and names
    Identifier,
    Number,
    Duration,
    String,
    Boolean,

    // Shell-mode capture
    ShellText,

    // Comments
    Comment,

    // Reserved words
    Var,
    Watch,
    Stop,
    When,
    Try,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eof => "EOF",
            Self::Illegal => "ILLEGAL",
            Self::Newline => "NEWLINE",
            Self::At => "@",
            Self::Colon => ":",
            Self::Equals => "=",
            Self::Comma => ",",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::Asterisk => "*",
            Self::Identifier => "IDENTIFIER",
            Self::Number => "NUMBER",
            Self::Duration => "DURATION",
            Self::String => "STRING",
            Self::Boolean => "BOOLEAN",
            Self::ShellText => "SHELL_TEXT",
            Self::Comment => "COMMENT",
            Self::Var => "var",
            Self::Watch => "watch",
            Self::Stop => "stop",
            Self::When => "when",
            Self::Try => "try",
        }
    }
}

/// Quote variant of a String token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteKind {
    Double,
    Single,
    Backtick,
}

/// A token produced by the lexer
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub value: String,
    /// Byte offsets into the source
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
    /// For String tokens: quote variant
    pub quote: Option<QuoteKind>,
}

impl Token {
    pub fn new(
        token_type: TokenType,
        value: impl Into<String>,
        start: usize,
        end: usize,
        line: usize,
        column: usize,
    ) -> Self {
        Self {
            token_type,
            value: value.into(),
            start,
            end,
            line,
            column,
            quote: None,
        }
    }

    pub fn with_quote(mut self, quote: QuoteKind) -> Self {
        self.quote = Some(quote);
        self
    }
}

lazy_static::lazy_static! {
    /// Reserved words in language mode
    static ref RESERVED_WORDS: HashMap<&'static str, TokenType> = {
        let mut m = HashMap::new();
        m.insert("var", TokenType::Var);
        m.insert("watch", TokenType::Watch);
        m.insert("stop", TokenType::Stop);
        m.insert("when", TokenType::When);
        m.insert("try", TokenType::Try);
        m
    };
}

/// Identifier characters: [_A-Za-z][-_A-Za-z0-9]*
fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Duration units, longest first so `ms` wins over `m`.
const DURATION_UNITS: &[&str] = &["ns", "us", "ms", "s", "m", "h"];

/// Parsing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexMode {
    Language,
    Command,
    Pattern,
}

/// One open brace. Records the mode lexed inside it and the local shell
/// construct depths so `}` of `${...}` or brace expansion is never taken
/// for a block boundary.
#[derive(Debug, Clone, Copy)]
struct BraceFrame {
    mode: LexMode,
    shell_depth: usize,
    cmdsub_depth: usize,
}

/// Lexer over a UTF-8 source string.
pub struct Lexer<'r> {
    registry: &'r DecoratorRegistry,
    input: Vec<char>,
    pos: usize,
    /// Running byte offset matching `pos`
    offset: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    mode: LexMode,
    frames: Vec<BraceFrame>,
    /// Set while lexing a decorator that interrupts command text; cleared
    /// when the decorator completes and command capture resumes.
    interlude: bool,
    /// The decorator being lexed is pattern-kind; the next `{` opens a
    /// Pattern frame.
    pending_pattern: bool,
    /// The token just emitted was `@`; the next word is a decorator name
    /// and must not be keyword-mapped.
    after_at: bool,
    /// Next command capture keeps leading whitespace (resuming after an
    /// inline decorator) instead of skipping it (fresh body/arm start).
    resume_capture: bool,
    /// An `=` in a variable declaration was just emitted; the value may be
    /// a bare unquoted run (URLs, paths).
    pending_value_run: bool,
    in_var_group: bool,
    paren_depth: usize,
    /// Shell construct depths for captures outside any brace frame
    root_shell_depth: usize,
    root_cmdsub_depth: usize,
}

impl<'r> Lexer<'r> {
    pub fn new(input: &str, registry: &'r DecoratorRegistry) -> Self {
        Self {
            registry,
            input: input.chars().collect(),
            pos: 0,
            offset: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            mode: LexMode::Language,
            frames: Vec::new(),
            interlude: false,
            pending_pattern: false,
            after_at: false,
            resume_capture: false,
            pending_value_run: false,
            in_var_group: false,
            paren_depth: 0,
            root_shell_depth: 0,
            root_cmdsub_depth: 0,
        }
    }

    /// Tokenize the entire input. Terminated by an Eof token.
    pub fn tokenize(mut self) -> Vec<Token> {
        loop {
            match self.mode {
                LexMode::Language => {
                    self.skip_language_whitespace();
                    if self.pos >= self.input.len() {
                        break;
                    }
                    if let Some(token) = self.next_language_token() {
                        self.tokens.push(token);
                    }
                }
                LexMode::Command => {
                    if self.pos >= self.input.len() && !self.resume_capture {
                        break;
                    }
                    self.read_shell_text();
                    if self.pos >= self.input.len() && self.mode == LexMode::Command {
                        break;
                    }
                }
                LexMode::Pattern => {
                    self.skip_pattern_whitespace();
                    if self.pos >= self.input.len() {
                        break;
                    }
                    if let Some(token) = self.next_pattern_token() {
                        self.tokens.push(token);
                    }
                }
            }
        }

        self.tokens.push(Token::new(
            TokenType::Eof,
            "",
            self.offset,
            self.offset,
            self.line,
            self.column,
        ));
        self.tokens
    }

    // =========================================================================
    // Low-level scanning
    // =========================================================================

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.input.get(self.pos + ahead).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.current();
        if let Some(ch) = c {
            self.pos += 1;
            self.offset += ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        c
    }

    /// First non-space/tab character on the current line, if any.
    fn peek_nonspace_same_line(&self) -> Option<char> {
        let mut i = self.pos;
        while let Some(&c) = self.input.get(i) {
            match c {
                ' ' | '\t' | '\r' => i += 1,
                '\n' => return None,
                other => return Some(other),
            }
        }
        None
    }

    // =========================================================================
    // Language mode
    // =========================================================================

    fn skip_language_whitespace(&mut self) {
        while let Some(c) = self.current() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\\' if self.peek(1) == Some('\n') => {
                    // Line continuation
                    self.advance();
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn next_language_token(&mut self) -> Option<Token> {
        let start = self.offset;
        let start_line = self.line;
        let start_column = self.column;

        let c = self.current()?;

        // A word right after `@` is a decorator name, never a keyword.
        if self.after_at {
            self.after_at = false;
            if is_ident_start(c) {
                return Some(self.read_decorator_name(start, start_line, start_column));
            }
            // fall through: stray `@`
        }

        if self.pending_value_run {
            self.pending_value_run = false;
            if let Some(token) = self.read_value_run(start, start_line, start_column) {
                return Some(token);
            }
        }

        match c {
            '\n' => {
                self.advance();
                if self.frames.is_empty() && self.paren_depth == 0 {
                    Some(Token::new(
                        TokenType::Newline,
                        "\n",
                        start,
                        self.offset,
                        start_line,
                        start_column,
                    ))
                } else {
                    None
                }
            }
            '#' => Some(self.read_line_comment(start, start_line, start_column)),
            '/' if self.peek(1) == Some('*') => {
                Some(self.read_block_comment(start, start_line, start_column))
            }
            '@' => {
                self.advance();
                self.after_at = true;
                Some(Token::new(
                    TokenType::At,
                    "@",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            ':' => {
                self.advance();
                let token = Token::new(
                    TokenType::Colon,
                    ":",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                );
                if self.frames.is_empty() && self.paren_depth == 0 {
                    self.enter_command_body();
                }
                Some(token)
            }
            '=' => {
                self.advance();
                if self.paren_depth == 0 || self.in_var_group {
                    self.pending_value_run = true;
                }
                Some(Token::new(
                    TokenType::Equals,
                    "=",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            ',' => {
                self.advance();
                Some(Token::new(
                    TokenType::Comma,
                    ",",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            '(' => {
                self.advance();
                self.paren_depth += 1;
                Some(Token::new(
                    TokenType::LParen,
                    "(",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            ')' => {
                self.advance();
                self.paren_depth = self.paren_depth.saturating_sub(1);
                let token = Token::new(
                    TokenType::RParen,
                    ")",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                );
                if self.paren_depth == 0 {
                    if self.in_var_group {
                        self.in_var_group = false;
                    } else if self.interlude {
                        self.end_decorator(false);
                    }
                }
                Some(token)
            }
            '{' => {
                self.advance();
                let frame_mode = if self.pending_pattern {
                    LexMode::Pattern
                } else {
                    LexMode::Command
                };
                self.pending_pattern = false;
                self.interlude = false;
                self.frames.push(BraceFrame {
                    mode: frame_mode,
                    shell_depth: 0,
                    cmdsub_depth: 0,
                });
                self.mode = frame_mode;
                self.resume_capture = false;
                Some(Token::new(
                    TokenType::LBrace,
                    "{",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            '}' => {
                self.advance();
                self.pop_frame();
                Some(Token::new(
                    TokenType::RBrace,
                    "}",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            '*' => {
                self.advance();
                Some(Token::new(
                    TokenType::Asterisk,
                    "*",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            '"' => Some(self.read_string(QuoteKind::Double, start, start_line, start_column)),
            '\'' => Some(self.read_string(QuoteKind::Single, start, start_line, start_column)),
            '`' => Some(self.read_string(QuoteKind::Backtick, start, start_line, start_column)),
            c if c.is_ascii_digit() || (c == '-' && self.peek(1).map_or(false, |n| n.is_ascii_digit())) => {
                Some(self.read_number(start, start_line, start_column))
            }
            c if is_ident_start(c) => Some(self.read_word(start, start_line, start_column)),
            other => {
                self.advance();
                Some(Token::new(
                    TokenType::Illegal,
                    format!("unexpected character '{}'", other),
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
        }
    }

    /// After a command's `:` decide where the body is lexed. The body is
    /// shell text unless the next character opens a block, starts a
    /// decorator, or the line ends.
    fn enter_command_body(&mut self) {
        self.root_shell_depth = 0;
        self.root_cmdsub_depth = 0;
        match self.peek_nonspace_same_line() {
            None => {}
            Some('{') => {}
            Some('@') => {
                self.interlude = true;
            }
            Some('#') => {}
            Some(_) => {
                self.mode = LexMode::Command;
                self.resume_capture = false;
            }
        }
    }

    /// Decorator name right after `@`. Property access (`@env.HOME`) is
    /// folded into the identifier value.
    fn read_decorator_name(&mut self, start: usize, line: usize, column: usize) -> Token {
        let mut value = String::new();
        while let Some(c) = self.current() {
            if is_ident_char(c) {
                value.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.current() == Some('.') && self.peek(1).map_or(false, is_ident_start) {
            value.push('.');
            self.advance();
            while let Some(c) = self.current() {
                if is_ident_char(c) {
                    value.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let base = value.split('.').next().unwrap_or(&value);
        if self.interlude && self.registry.is_pattern(base) {
            self.pending_pattern = true;
        }
        // A block/pattern decorator may stop at a word boundary with no
        // argument list; command capture resumes right away.
        if self.interlude && !matches!(self.peek_nonspace_same_line(), Some('(') | Some('{')) {
            self.end_decorator(true);
        }

        Token::new(TokenType::Identifier, value, start, self.offset, line, column)
    }

    /// A decorator interrupting command text is complete; go back to
    /// Command mode unless a `{` opens its block. With nothing further on
    /// the line the capture restarts fresh on the next line.
    fn end_decorator(&mut self, bare: bool) {
        match self.peek_nonspace_same_line() {
            Some('{') => {}
            Some('(') if bare => {}
            Some(_) => {
                self.interlude = false;
                self.pending_pattern = false;
                self.mode = LexMode::Command;
                self.resume_capture = true;
            }
            None => {
                self.interlude = false;
                self.pending_pattern = false;
                self.mode = LexMode::Command;
                self.resume_capture = false;
            }
        }
    }

    fn pop_frame(&mut self) {
        self.frames.pop();
        if self.frames.is_empty() {
            self.mode = LexMode::Language;
        } else {
            self.mode = LexMode::Command;
            self.resume_capture = true;
        }
    }

    fn read_line_comment(&mut self, start: usize, line: usize, column: usize) -> Token {
        let mut value = String::new();
        while let Some(c) = self.current() {
            if c == '\n' {
                break;
            }
            value.push(c);
            self.advance();
        }
        Token::new(TokenType::Comment, value, start, self.offset, line, column)
    }

    /// Block comments `/* ... */` nest.
    fn read_block_comment(&mut self, start: usize, line: usize, column: usize) -> Token {
        let mut value = String::new();
        value.push(self.advance().unwrap_or('/'));
        value.push(self.advance().unwrap_or('*'));
        let mut depth = 1usize;
        while depth > 0 {
            match self.current() {
                None => {
                    return Token::new(
                        TokenType::Illegal,
                        "unterminated block comment",
                        start,
                        self.offset,
                        line,
                        column,
                    );
                }
                Some('/') if self.peek(1) == Some('*') => {
                    depth += 1;
                    value.push('/');
                    value.push('*');
                    self.advance();
                    self.advance();
                }
                Some('*') if self.peek(1) == Some('/') => {
                    depth -= 1;
                    value.push('*');
                    value.push('/');
                    self.advance();
                    self.advance();
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
        Token::new(TokenType::Comment, value, start, self.offset, line, column)
    }

    /// Quoted string with per-variant escape semantics.
    fn read_string(&mut self, quote: QuoteKind, start: usize, line: usize, column: usize) -> Token {
        let close = match quote {
            QuoteKind::Double => '"',
            QuoteKind::Single => '\'',
            QuoteKind::Backtick => '`',
        };
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            match self.current() {
                None => {
                    return Token::new(
                        TokenType::Illegal,
                        "unterminated string",
                        start,
                        self.offset,
                        line,
                        column,
                    );
                }
                Some(c) if c == close => {
                    self.advance();
                    return Token::new(TokenType::String, value, start, self.offset, line, column)
                        .with_quote(quote);
                }
                Some('\\') => {
                    self.advance();
                    match quote {
                        QuoteKind::Single => {
                            // Backslash is literal; only \' escapes the quote
                            match self.current() {
                                Some('\'') => {
                                    value.push('\'');
                                    self.advance();
                                }
                                _ => value.push('\\'),
                            }
                        }
                        QuoteKind::Double | QuoteKind::Backtick => {
                            let extended = quote == QuoteKind::Backtick;
                            match self.current() {
                                Some('n') => {
                                    value.push('\n');
                                    self.advance();
                                }
                                Some('t') => {
                                    value.push('\t');
                                    self.advance();
                                }
                                Some('r') => {
                                    value.push('\r');
                                    self.advance();
                                }
                                Some('\\') => {
                                    value.push('\\');
                                    self.advance();
                                }
                                Some(c) if c == close => {
                                    value.push(c);
                                    self.advance();
                                }
                                Some('b') if extended => {
                                    value.push('\u{0008}');
                                    self.advance();
                                }
                                Some('f') if extended => {
                                    value.push('\u{000C}');
                                    self.advance();
                                }
                                Some('v') if extended => {
                                    value.push('\u{000B}');
                                    self.advance();
                                }
                                Some('0') if extended => {
                                    value.push('\0');
                                    self.advance();
                                }
                                Some('x') if extended => {
                                    self.advance();
                                    value.push(self.read_hex_escape(2));
                                }
                                Some('u') if extended && self.peek(1) == Some('{') => {
                                    self.advance();
                                    self.advance();
                                    let mut hex = String::new();
                                    while let Some(h) = self.current() {
                                        if h == '}' {
                                            self.advance();
                                            break;
                                        }
                                        hex.push(h);
                                        self.advance();
                                    }
                                    let cp = u32::from_str_radix(&hex, 16).ok();
                                    value.push(cp.and_then(char::from_u32).unwrap_or('\u{FFFD}'));
                                }
                                Some(other) => {
                                    // Unknown escape: keep the backslash
                                    value.push('\\');
                                    value.push(other);
                                    self.advance();
                                }
                                None => value.push('\\'),
                            }
                        }
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    fn read_hex_escape(&mut self, digits: usize) -> char {
        let mut hex = String::new();
        for _ in 0..digits {
            match self.current() {
                Some(h) if h.is_ascii_hexdigit() => {
                    hex.push(h);
                    self.advance();
                }
                _ => break,
            }
        }
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .unwrap_or('\u{FFFD}')
    }

    /// Number or duration. A digit run followed by a unit at a word
    /// boundary is a Duration; `m` alone is minutes unless followed by
    /// `s` (milliseconds).
    fn read_number(&mut self, start: usize, line: usize, column: usize) -> Token {
        let mut value = String::new();
        if self.current() == Some('-') {
            value.push('-');
            self.advance();
        }
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                value.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.current() == Some('.') && self.peek(1).map_or(false, |c| c.is_ascii_digit()) {
            value.push('.');
            self.advance();
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    value.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }

        for unit in DURATION_UNITS {
            if self.lookahead_matches(unit) {
                // A letter after the unit means it was not a unit at all;
                // a digit starts the next component (5m30s).
                let boundary = self
                    .peek(unit.len())
                    .map_or(true, |c| !c.is_ascii_alphabetic() && c != '_');
                if boundary {
                    for _ in 0..unit.len() {
                        if let Some(c) = self.advance() {
                            value.push(c);
                        }
                    }
                    return Token::new(
                        TokenType::Duration,
                        value,
                        start,
                        self.offset,
                        line,
                        column,
                    );
                }
            }
        }

        Token::new(TokenType::Number, value, start, self.offset, line, column)
    }

    fn lookahead_matches(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek(i) == Some(c))
    }

    /// Identifier, keyword, or boolean.
    fn read_word(&mut self, start: usize, line: usize, column: usize) -> Token {
        let mut value = String::new();
        while let Some(c) = self.current() {
            if is_ident_char(c) {
                value.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if value == "true" || value == "false" {
            return Token::new(TokenType::Boolean, value, start, self.offset, line, column);
        }
        if let Some(&token_type) = RESERVED_WORDS.get(value.as_str()) {
            if token_type == TokenType::Var && self.peek_nonspace_same_line() == Some('(') {
                self.in_var_group = true;
            }
            return Token::new(token_type, value, start, self.offset, line, column);
        }
        Token::new(TokenType::Identifier, value, start, self.offset, line, column)
    }

    /// Bare unquoted value run after `=`: URLs, paths, and anything else
    /// that is not a recognized literal, up to the terminator. Returns
    /// None when normal lexing should proceed.
    fn read_value_run(&mut self, start: usize, line: usize, column: usize) -> Option<Token> {
        let c = self.current()?;
        if matches!(c, '"' | '\'' | '`' | '@' | '\n' | '#' | ',' | ')') {
            return None;
        }

        // Collect the run without consuming, then decide.
        let mut end = self.pos;
        while let Some(&ch) = self.input.get(end) {
            if ch == '\n' || ch == '#' {
                break;
            }
            if self.in_var_group && (ch == ',' || ch == ')') {
                break;
            }
            end += 1;
        }
        let mut run: String = self.input[self.pos..end].iter().collect();
        while run.ends_with(' ') || run.ends_with('\t') || run.ends_with('\r') {
            run.pop();
        }
        if run.is_empty() {
            return None;
        }
        if is_literal_run(&run) {
            return None;
        }

        for _ in 0..run.chars().count() {
            self.advance();
        }
        Some(Token::new(
            TokenType::String,
            run,
            start,
            self.offset,
            line,
            column,
        ))
    }

    // =========================================================================
    // Command mode
    // =========================================================================

    /// Accumulate shell text until a mode boundary: an unquoted `}` when a
    /// frame is open, an unquoted newline at top level, a decorator-shaped
    /// `@`, or a pattern-arm break.
    fn read_shell_text(&mut self) {
        let resume = self.resume_capture;
        self.resume_capture = false;

        if !resume {
            // Fresh capture: skip leading whitespace; inside frames blank
            // lines are separators too.
            loop {
                match self.current() {
                    Some(' ') | Some('\t') | Some('\r') => {
                        self.advance();
                    }
                    Some('\n') if !self.frames.is_empty() => {
                        if self.in_pattern_frame() && self.arm_break_ahead(self.pos + 1) {
                            self.advance();
                            self.mode = LexMode::Pattern;
                            return;
                        }
                        self.advance();
                    }
                    _ => break,
                }
            }
        }

        let start = self.offset;
        let start_line = self.line;
        let start_column = self.column;

        let (mut shell_depth, mut cmdsub_depth) = self.load_depths();
        let mut value = String::new();
        let mut in_single = false;
        let mut in_double = false;
        let mut in_backtick = false;

        macro_rules! save_and_emit {
            ($trim:expr, $next_mode:expr) => {{
                self.store_depths(shell_depth, cmdsub_depth);
                self.emit_shell_text(value, $trim, start, start_line, start_column);
                self.mode = $next_mode;
                return;
            }};
        }

        loop {
            let c = match self.current() {
                Some(c) => c,
                None => {
                    self.store_depths(shell_depth, cmdsub_depth);
                    self.emit_shell_text(value, true, start, start_line, start_column);
                    return;
                }
            };

            if in_single {
                if c == '\'' {
                    in_single = false;
                }
                value.push(c);
                self.advance();
                continue;
            }

            if in_double || in_backtick {
                match c {
                    '"' if in_double => {
                        in_double = false;
                        value.push(c);
                        self.advance();
                    }
                    '`' if in_backtick => {
                        in_backtick = false;
                        value.push(c);
                        self.advance();
                    }
                    '\\' if self.peek(1) == Some('\n') => {
                        self.consume_line_continuation();
                        if !value.ends_with(' ') && !value.ends_with('\t') {
                            value.push(' ');
                        }
                    }
                    '\\' => {
                        value.push('\\');
                        self.advance();
                        if let Some(next) = self.advance() {
                            value.push(next);
                        }
                    }
                    _ => {
                        value.push(c);
                        self.advance();
                    }
                }
                continue;
            }

            match c {
                '\'' => {
                    in_single = true;
                    value.push(c);
                    self.advance();
                }
                '"' => {
                    in_double = true;
                    value.push(c);
                    self.advance();
                }
                '`' => {
                    in_backtick = true;
                    value.push(c);
                    self.advance();
                }
                '\\' => {
                    if self.peek(1) == Some('\n') {
                        self.consume_line_continuation();
                        if !value.ends_with(' ') && !value.ends_with('\t') {
                            value.push(' ');
                        }
                    } else {
                        value.push('\\');
                        self.advance();
                        if let Some(next) = self.advance() {
                            value.push(next);
                        }
                    }
                }
                '$' => {
                    match self.peek(1) {
                        Some('{') => {
                            shell_depth += 1;
                            value.push('$');
                            value.push('{');
                            self.advance();
                            self.advance();
                        }
                        Some('(') => {
                            cmdsub_depth += 1;
                            value.push('$');
                            value.push('(');
                            self.advance();
                            self.advance();
                        }
                        _ => {
                            value.push(c);
                            self.advance();
                        }
                    }
                }
                '{' => {
                    shell_depth += 1;
                    value.push(c);
                    self.advance();
                }
                '}' => {
                    if shell_depth > 0 {
                        shell_depth -= 1;
                        value.push(c);
                        self.advance();
                    } else if cmdsub_depth > 0 {
                        value.push(c);
                        self.advance();
                    } else if !self.frames.is_empty() {
                        save_and_emit!(true, LexMode::Language);
                    } else {
                        value.push(c);
                        self.advance();
                    }
                }
                ')' => {
                    if cmdsub_depth > 0 {
                        cmdsub_depth -= 1;
                    }
                    value.push(c);
                    self.advance();
                }
                '\n' => {
                    if self.frames.is_empty() {
                        save_and_emit!(true, LexMode::Language);
                    } else if shell_depth > 0 || cmdsub_depth > 0 {
                        // Inside ${...} or $(...) the newline is content
                        value.push(c);
                        self.advance();
                    } else if self.in_pattern_frame() && self.arm_break_ahead(self.pos + 1) {
                        self.store_depths(shell_depth, cmdsub_depth);
                        self.emit_shell_text(value, true, start, start_line, start_column);
                        self.advance();
                        self.mode = LexMode::Pattern;
                        return;
                    } else {
                        // Statement separator inside braces: ends this
                        // capture without emitting a token of its own
                        self.store_depths(shell_depth, cmdsub_depth);
                        self.emit_shell_text(value, true, start, start_line, start_column);
                        self.advance();
                        self.resume_capture = false;
                        return;
                    }
                }
                ';' => {
                    if self.in_pattern_frame() && self.arm_break_ahead(self.pos + 1) {
                        self.store_depths(shell_depth, cmdsub_depth);
                        self.emit_shell_text(value, true, start, start_line, start_column);
                        self.advance();
                        self.mode = LexMode::Pattern;
                        return;
                    }
                    value.push(c);
                    self.advance();
                }
                '#' if shell_depth == 0
                    && cmdsub_depth == 0
                    && (value.is_empty() || value.ends_with(' ') || value.ends_with('\t')) => {
                    self.store_depths(shell_depth, cmdsub_depth);
                    self.emit_shell_text(value, true, start, start_line, start_column);
                    let cstart = self.offset;
                    let cline = self.line;
                    let ccol = self.column;
                    let comment = self.read_line_comment(cstart, cline, ccol);
                    self.tokens.push(comment);
                    self.resume_capture = false;
                    return;
                }
                '@' => {
                    if self.decorator_ahead() {
                        self.store_depths(shell_depth, cmdsub_depth);
                        self.emit_shell_text(value, false, start, start_line, start_column);
                        self.interlude = true;
                        self.mode = LexMode::Language;
                        return;
                    }
                    value.push(c);
                    self.advance();
                }
                _ => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    fn consume_line_continuation(&mut self) {
        self.advance(); // backslash
        self.advance(); // newline
        while matches!(self.current(), Some(' ') | Some('\t')) {
            self.advance();
        }
    }

    fn load_depths(&self) -> (usize, usize) {
        match self.frames.last() {
            Some(f) => (f.shell_depth, f.cmdsub_depth),
            None => (self.root_shell_depth, self.root_cmdsub_depth),
        }
    }

    fn store_depths(&mut self, shell_depth: usize, cmdsub_depth: usize) {
        match self.frames.last_mut() {
            Some(f) => {
                f.shell_depth = shell_depth;
                f.cmdsub_depth = cmdsub_depth;
            }
            None => {
                self.root_shell_depth = shell_depth;
                self.root_cmdsub_depth = cmdsub_depth;
            }
        }
    }

    fn in_pattern_frame(&self) -> bool {
        self.frames.last().map(|f| f.mode) == Some(LexMode::Pattern)
    }

    fn emit_shell_text(
        &mut self,
        mut value: String,
        trim_trailing: bool,
        start: usize,
        line: usize,
        column: usize,
    ) {
        if trim_trailing {
            while value.ends_with(' ') || value.ends_with('\t') || value.ends_with('\r') || value.ends_with('\n') {
                value.pop();
            }
        }
        if value.is_empty() {
            return;
        }
        // Blank-line separators between decorators carry no content
        if value.contains('\n') && value.trim().is_empty() {
            return;
        }
        self.tokens.push(Token::new(
            TokenType::ShellText,
            value,
            start,
            self.offset,
            line,
            column,
        ));
    }

    /// Decorator-shape test at an unquoted `@`, without consuming input:
    /// the preceding character is not an identifier character, an
    /// identifier follows, the identifier is registered, and the next
    /// non-whitespace character fits the decorator's kind.
    fn decorator_ahead(&self) -> bool {
        if self.pos > 0 {
            if let Some(&prev) = self.input.get(self.pos - 1) {
                if is_ident_char(prev) {
                    return false;
                }
            }
        }

        let mut i = self.pos + 1;
        match self.input.get(i) {
            Some(&c) if is_ident_start(c) => {}
            _ => return false,
        }
        let mut name = String::new();
        while let Some(&c) = self.input.get(i) {
            if is_ident_char(c) {
                name.push(c);
                i += 1;
            } else {
                break;
            }
        }

        let entry = match self.registry.lookup(&name) {
            Some(e) => e,
            None => return false,
        };

        while let Some(&c) = self.input.get(i) {
            if c == ' ' || c == '\t' {
                i += 1;
            } else {
                break;
            }
        }
        match entry.kind {
            DecoratorKind::Function => self.input.get(i) == Some(&'('),
            DecoratorKind::Block | DecoratorKind::Pattern => {
                matches!(self.input.get(i), None | Some('(') | Some('{'))
                    || self.input.get(i).map_or(true, |&c| !is_ident_char(c))
            }
        }
    }

    /// Peek from `from` for `<ident-or-*> :` which marks the next pattern
    /// arm after a separator.
    fn arm_break_ahead(&self, from: usize) -> bool {
        let mut i = from;
        while let Some(&c) = self.input.get(i) {
            if c == ' ' || c == '\t' || c == '\r' || c == '\n' {
                i += 1;
            } else {
                break;
            }
        }
        match self.input.get(i) {
            Some(&'*') => {
                i += 1;
            }
            Some(&c) if is_ident_start(c) => {
                while let Some(&c) = self.input.get(i) {
                    if is_ident_char(c) {
                        i += 1;
                    } else {
                        break;
                    }
                }
            }
            Some(&'}') => return true,
            _ => return false,
        }
        while let Some(&c) = self.input.get(i) {
            if c == ' ' || c == '\t' {
                i += 1;
            } else {
                break;
            }
        }
        self.input.get(i) == Some(&':')
    }

    // =========================================================================
    // Pattern mode
    // =========================================================================

    fn skip_pattern_whitespace(&mut self) {
        while let Some(c) = self.current() {
            match c {
                ' ' | '\t' | '\r' | '\n' | ';' => {
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn next_pattern_token(&mut self) -> Option<Token> {
        let start = self.offset;
        let start_line = self.line;
        let start_column = self.column;
        let c = self.current()?;

        match c {
            '}' => {
                self.advance();
                self.pop_frame();
                Some(Token::new(
                    TokenType::RBrace,
                    "}",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            '*' => {
                self.advance();
                Some(Token::new(
                    TokenType::Asterisk,
                    "*",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            ':' => {
                self.advance();
                self.mode = LexMode::Command;
                self.resume_capture = false;
                Some(Token::new(
                    TokenType::Colon,
                    ":",
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            '#' => Some(self.read_line_comment(start, start_line, start_column)),
            c if is_ident_start(c) => {
                let mut value = String::new();
                while let Some(ch) = self.current() {
                    if is_ident_char(ch) {
                        value.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(Token::new(
                    TokenType::Identifier,
                    value,
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
            other => {
                self.advance();
                Some(Token::new(
                    TokenType::Illegal,
                    format!("unexpected character '{}' in pattern block", other),
                    start,
                    self.offset,
                    start_line,
                    start_column,
                ))
            }
        }
    }
}

/// True when the run is a complete literal the normal scanner should
/// handle: a number, a duration, or a boolean.
fn is_literal_run(run: &str) -> bool {
    if run == "true" || run == "false" {
        return true;
    }
    let body = run.strip_prefix('-').unwrap_or(run);
    let digits: String = body.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
    if digits.is_empty() || digits.chars().filter(|c| *c == '.').count() > 1 {
        return false;
    }
    let rest = &body[digits.len()..];
    rest.is_empty() || DURATION_UNITS.contains(&rest)
}
