//! Recursive Descent Parser for opal source files
//!
//! The parser consumes tokens from the lexer and produces the AST.
//!
//! Grammar (simplified):
//!   program      ::= (var_decl | var_group | command_decl | NEWLINE | COMMENT)*
//!   var_decl     ::= "var" NAME "=" value_expr
//!   var_group    ::= "var" "(" (NAME "=" value_expr ","?)* ")"
//!   command_decl ::= ("watch" | "stop")? NAME ":" body
//!   body         ::= shell_line | "{" content* "}"
//!   content      ::= shell_content | block_decorator | pattern_decorator
//!   decorator    ::= "@" NAME ("(" arg ("," arg)* ")")?
//!   arg          ::= value_expr | NAME "=" value_expr

use crate::ast::types::{
    ArmPattern, Body, BlockDecorator, CommandDecl, CommandKind, Content, InlineDecorator,
    NamedArg, PatternArm, PatternDecorator, Position, Program, QuoteStyle, ShellContent,
    ShellPart, Span, ValueExpr, VarDecl,
};
use crate::parser::lexer::{Lexer, QuoteKind, Token, TokenType};
use crate::parser::types::{parse_duration, ParseException, MAX_INPUT_SIZE, MAX_PARSER_DEPTH, MAX_TOKENS};
use crate::registry::{DecoratorKind, DecoratorRegistry, DEFAULT_REGISTRY};

/// Parse a source string with the default decorator registry.
pub fn parse(input: &str) -> Result<Program, ParseException> {
    Parser::new(&DEFAULT_REGISTRY).parse(input)
}

/// Main parser struct
pub struct Parser<'r> {
    registry: &'r DecoratorRegistry,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'r> Parser<'r> {
    pub fn new(registry: &'r DecoratorRegistry) -> Self {
        Self {
            registry,
            tokens: Vec::new(),
            pos: 0,
            depth: 0,
        }
    }

    pub fn parse(&mut self, input: &str) -> Result<Program, ParseException> {
        if input.len() > MAX_INPUT_SIZE {
            return Err(ParseException::new("input too large", 1, 1));
        }
        let tokens = Lexer::new(input, self.registry).tokenize();
        if tokens.len() > MAX_TOKENS {
            return Err(ParseException::new("too many tokens", 1, 1));
        }
        self.parse_tokens(tokens)
    }

    pub fn parse_tokens(&mut self, tokens: Vec<Token>) -> Result<Program, ParseException> {
        self.tokens = tokens;
        if self.tokens.is_empty() {
            self.tokens.push(Token::new(TokenType::Eof, "", 0, 0, 1, 1));
        }
        self.pos = 0;
        self.depth = 0;

        let mut program = Program::default();

        loop {
            self.skip_trivia();
            let token = self.current().clone();
            match token.token_type {
                TokenType::Eof => break,
                TokenType::Illegal => {
                    return Err(ParseException::with_token(token.value.clone(), &token));
                }
                TokenType::Var => {
                    self.advance();
                    self.parse_var_decls(&mut program)?;
                }
                TokenType::Watch => {
                    self.advance();
                    if self.current().token_type == TokenType::Colon {
                        self.parse_command_into(&mut program, token, CommandKind::Regular)?;
                    } else {
                        let name = self.expect(TokenType::Identifier, "expected command name after 'watch'")?;
                        self.parse_command_into(&mut program, name, CommandKind::Watch)?;
                    }
                }
                TokenType::Stop => {
                    self.advance();
                    if self.current().token_type == TokenType::Colon {
                        self.parse_command_into(&mut program, token, CommandKind::Regular)?;
                    } else {
                        let name = self.expect(TokenType::Identifier, "expected command name after 'stop'")?;
                        self.parse_command_into(&mut program, name, CommandKind::Stop)?;
                    }
                }
                TokenType::Identifier | TokenType::When | TokenType::Try => {
                    self.advance();
                    self.parse_command_into(&mut program, token, CommandKind::Regular)?;
                }
                _ => {
                    return Err(ParseException::with_token(
                        format!("unexpected token '{}'", token.token_type.as_str()),
                        &token,
                    ));
                }
            }
        }

        Ok(program)
    }

    // =========================================================================
    // Token helpers
    // =========================================================================

    fn current(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| &self.tokens[self.tokens.len() - 1])
    }

    fn peek(&self, ahead: usize) -> &Token {
        self.tokens
            .get(self.pos + ahead)
            .unwrap_or_else(|| &self.tokens[self.tokens.len() - 1])
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token_type: TokenType, message: &str) -> Result<Token, ParseException> {
        let token = self.current().clone();
        if token.token_type != token_type {
            return Err(ParseException::with_token(
                format!("{}, found '{}'", message, token.token_type.as_str()),
                &token,
            ));
        }
        Ok(self.advance())
    }

    fn skip_trivia(&mut self) {
        while matches!(
            self.current().token_type,
            TokenType::Newline | TokenType::Comment
        ) {
            self.advance();
        }
    }

    fn skip_comments(&mut self) {
        while self.current().token_type == TokenType::Comment {
            self.advance();
        }
    }

    fn token_position(token: &Token) -> Position {
        Position {
            line: token.line,
            column: token.column,
            offset: token.start,
        }
    }

    fn span_from(start: &Token, end: &Token) -> Span {
        Span {
            start: Self::token_position(start),
            end: Position {
                line: end.line,
                column: end.column,
                offset: end.end,
            },
        }
    }

    fn check_depth(&self, token: &Token) -> Result<(), ParseException> {
        if self.depth > MAX_PARSER_DEPTH {
            return Err(ParseException::with_token("blocks nested too deeply", token));
        }
        Ok(())
    }

    // =========================================================================
    // Variable declarations
    // =========================================================================

    fn parse_var_decls(&mut self, program: &mut Program) -> Result<(), ParseException> {
        if self.current().token_type == TokenType::LParen {
            self.advance();
            loop {
                self.skip_comments();
                match self.current().token_type {
                    TokenType::RParen => {
                        self.advance();
                        break;
                    }
                    TokenType::Comma => {
                        self.advance();
                    }
                    TokenType::Identifier => {
                        let decl = self.parse_one_var()?;
                        program.vars.push(decl);
                    }
                    _ => {
                        let token = self.current().clone();
                        return Err(ParseException::with_token(
                            format!(
                                "expected variable name or ')' in var group, found '{}'",
                                token.token_type.as_str()
                            ),
                            &token,
                        ));
                    }
                }
            }
        } else {
            let decl = self.parse_one_var()?;
            program.vars.push(decl);
        }
        Ok(())
    }

    fn parse_one_var(&mut self) -> Result<VarDecl, ParseException> {
        let name_token = self.expect(TokenType::Identifier, "expected variable name")?;
        self.expect(TokenType::Equals, "expected '=' after variable name")?;
        let value = self.parse_value_expr(false)?;
        let end = self.tokens[self.pos.saturating_sub(1)].clone();
        Ok(VarDecl {
            name: name_token.value.clone(),
            value,
            span: Self::span_from(&name_token, &end),
        })
    }

    // =========================================================================
    // Value expressions and decorator arguments
    // =========================================================================

    /// Parse a literal or decorator call. When `in_args` is set the
    /// expression appears inside a function decorator's argument list,
    /// where nested non-Function decorators are a parse error.
    fn parse_value_expr(&mut self, in_args: bool) -> Result<ValueExpr, ParseException> {
        let token = self.current().clone();
        match token.token_type {
            TokenType::String => {
                self.advance();
                let quote = token.quote.map(|q| match q {
                    QuoteKind::Double => QuoteStyle::Double,
                    QuoteKind::Single => QuoteStyle::Single,
                    QuoteKind::Backtick => QuoteStyle::Backtick,
                });
                Ok(ValueExpr::Str {
                    value: token.value.clone(),
                    quote,
                })
            }
            TokenType::Number => {
                self.advance();
                let n: f64 = token.value.parse().map_err(|_| {
                    ParseException::with_token(format!("invalid number '{}'", token.value), &token)
                })?;
                Ok(ValueExpr::Number(n))
            }
            TokenType::Duration => {
                self.advance();
                let value = parse_duration(&token.value).ok_or_else(|| {
                    ParseException::with_token(
                        format!("invalid duration '{}'", token.value),
                        &token,
                    )
                })?;
                Ok(ValueExpr::Duration {
                    raw: token.value.clone(),
                    value,
                })
            }
            TokenType::Boolean => {
                self.advance();
                Ok(ValueExpr::Bool(token.value == "true"))
            }
            TokenType::Identifier if in_args => {
                // Bare identifier argument, e.g. @var(PORT)
                self.advance();
                Ok(ValueExpr::Str {
                    value: token.value.clone(),
                    quote: None,
                })
            }
            TokenType::At => {
                let (name, args, _span) = self.parse_decorator_call()?;
                if !self.registry.is_function(&name) {
                    return Err(ParseException::with_token(
                        format!(
                            "nested non-Function decorator @{} inside decorator arguments",
                            name
                        ),
                        &token,
                    ));
                }
                Ok(ValueExpr::DecoratorCall { name, args })
            }
            _ => Err(ParseException::with_token(
                format!(
                    "expected value expression, found '{}'",
                    token.token_type.as_str()
                ),
                &token,
            )),
        }
    }

    /// `@name`, `@name(args)`, or `@name.PROP` sugar. Returns the base
    /// name, the argument list, and the call span. Registry arity and
    /// ordering rules are applied here.
    fn parse_decorator_call(&mut self) -> Result<(String, Vec<NamedArg>, Span), ParseException> {
        let at = self.expect(TokenType::At, "expected '@'")?;
        let name_token = self.expect(TokenType::Identifier, "expected decorator name after '@'")?;

        let (base, property) = match name_token.value.split_once('.') {
            Some((base, prop)) => (base.to_string(), Some(prop.to_string())),
            None => (name_token.value.clone(), None),
        };

        if self.registry.lookup(&base).is_none() {
            return Err(ParseException::with_token(
                format!("unknown decorator @{}", base),
                &name_token,
            ));
        }

        let mut args: Vec<NamedArg> = Vec::new();
        if let Some(prop) = property {
            args.push(NamedArg::positional(ValueExpr::Str {
                value: prop,
                quote: None,
            }));
        }

        let mut end_token = name_token.clone();
        if self.current().token_type == TokenType::LParen {
            self.advance();
            let mut first = true;
            loop {
                match self.current().token_type {
                    TokenType::RParen => {
                        end_token = self.advance();
                        break;
                    }
                    TokenType::Eof => {
                        let token = self.current().clone();
                        return Err(ParseException::with_token(
                            format!("unterminated argument list for @{}", base),
                            &token,
                        ));
                    }
                    TokenType::Comma if !first => {
                        self.advance();
                        let arg = self.parse_arg()?;
                        args.push(arg);
                    }
                    _ if first => {
                        first = false;
                        let arg = self.parse_arg()?;
                        args.push(arg);
                    }
                    _ => {
                        let token = self.current().clone();
                        return Err(ParseException::with_token(
                            format!(
                                "expected ',' or ')' in @{} arguments, found '{}'",
                                base,
                                token.token_type.as_str()
                            ),
                            &token,
                        ));
                    }
                }
            }
        }

        self.registry
            .validate_args(&base, &args)
            .map_err(|e| ParseException::with_token(e.to_string(), &name_token))?;

        Ok((base, args, Self::span_from(&at, &end_token)))
    }

    fn parse_arg(&mut self) -> Result<NamedArg, ParseException> {
        if self.current().token_type == TokenType::Identifier
            && self.peek(1).token_type == TokenType::Equals
        {
            let name = self.advance();
            self.advance(); // '='
            let value = self.parse_value_expr(true)?;
            Ok(NamedArg::named(name.value, value))
        } else {
            let value = self.parse_value_expr(true)?;
            Ok(NamedArg::positional(value))
        }
    }

    // =========================================================================
    // Commands and bodies
    // =========================================================================

    fn parse_command_into(
        &mut self,
        program: &mut Program,
        name_token: Token,
        kind: CommandKind,
    ) -> Result<(), ParseException> {
        if program
            .commands
            .iter()
            .any(|c| c.name == name_token.value && c.kind == kind)
        {
            return Err(ParseException::with_token(
                format!("duplicate {} '{}'", kind.as_str(), name_token.value),
                &name_token,
            ));
        }

        self.expect(TokenType::Colon, "expected ':' after command name")?;
        let body = if self.current().token_type == TokenType::LBrace {
            self.parse_braced_body()?
        } else {
            self.parse_simple_body()?
        };
        let end = self.tokens[self.pos.saturating_sub(1)].clone();
        program.commands.push(CommandDecl {
            name: name_token.value.clone(),
            kind,
            body,
            span: Self::span_from(&name_token, &end),
        });
        Ok(())
    }

    /// Whitespace-only shell content (separators the lexer kept) carries
    /// nothing and is dropped.
    fn push_content(contents: &mut Vec<Content>, content: Content) {
        if let Content::Shell(shell) = &content {
            if shell.parts.is_empty() {
                return;
            }
        }
        contents.push(content);
    }

    /// Body of a simple `name: ...` command: content up to the end of the
    /// line.
    fn parse_simple_body(&mut self) -> Result<Body, ParseException> {
        let mut contents = Vec::new();
        loop {
            self.skip_comments();
            match self.current().token_type {
                TokenType::Newline | TokenType::Eof => break,
                _ => {
                    let content = self.parse_content()?;
                    Self::push_content(&mut contents, content);
                }
            }
        }
        Ok(Body::new(contents))
    }

    /// `{ ... }` body.
    fn parse_braced_body(&mut self) -> Result<Body, ParseException> {
        let open = self.expect(TokenType::LBrace, "expected '{'")?;
        self.depth += 1;
        self.check_depth(&open)?;

        let mut contents = Vec::new();
        loop {
            self.skip_comments();
            match self.current().token_type {
                TokenType::RBrace => {
                    self.advance();
                    break;
                }
                TokenType::Eof => {
                    self.depth -= 1;
                    return Err(ParseException::with_token("unclosed '{'", &open));
                }
                _ => {
                    let content = self.parse_content()?;
                    Self::push_content(&mut contents, content);
                }
            }
        }
        self.depth -= 1;
        Ok(Body::new(contents))
    }

    /// One content item: shell text (with fused inline decorators), a
    /// block decorator, or a pattern decorator.
    fn parse_content(&mut self) -> Result<Content, ParseException> {
        let token = self.current().clone();
        match token.token_type {
            TokenType::ShellText => Ok(Content::Shell(self.parse_shell_content()?)),
            TokenType::At => {
                let name_token = self.peek(1).clone();
                let base = name_token
                    .value
                    .split('.')
                    .next()
                    .unwrap_or(&name_token.value)
                    .to_string();
                match self.registry.lookup(&base).map(|e| e.kind) {
                    Some(DecoratorKind::Function) => {
                        Ok(Content::Shell(self.parse_shell_content()?))
                    }
                    Some(DecoratorKind::Block) => Ok(Content::Block(self.parse_block_decorator()?)),
                    Some(DecoratorKind::Pattern) => {
                        Ok(Content::Pattern(self.parse_pattern_decorator()?))
                    }
                    None => Err(ParseException::with_token(
                        format!("unknown decorator @{}", base),
                        &name_token,
                    )),
                }
            }
            TokenType::Illegal => Err(ParseException::with_token(token.value.clone(), &token)),
            _ => Err(ParseException::with_token(
                format!(
                    "unexpected token '{}' in command body",
                    token.token_type.as_str()
                ),
                &token,
            )),
        }
    }

    /// Consecutive shell text and inline function decorators fuse into a
    /// single ShellContent. Fusion requires byte adjacency: a gap in the
    /// source (a statement separator the lexer consumed) starts a new
    /// content item.
    fn parse_shell_content(&mut self) -> Result<ShellContent, ParseException> {
        let mut parts: Vec<ShellPart> = Vec::new();
        let mut prev_end: Option<usize> = None;
        loop {
            match self.current().token_type {
                TokenType::ShellText => {
                    if prev_end.is_some() && prev_end != Some(self.current().start) {
                        break;
                    }
                    let token = self.advance();
                    let text = if parts.is_empty() {
                        token.value.trim_start().to_string()
                    } else {
                        token.value.clone()
                    };
                    prev_end = Some(token.end);
                    if !text.is_empty() {
                        parts.push(ShellPart::Text(text));
                    }
                }
                TokenType::At => {
                    if prev_end.is_some() && prev_end != Some(self.current().start) {
                        break;
                    }
                    let name_token = self.peek(1);
                    let base = name_token
                        .value
                        .split('.')
                        .next()
                        .unwrap_or(&name_token.value);
                    if !self.registry.is_function(base) {
                        break;
                    }
                    let (name, args, span) = self.parse_decorator_call()?;
                    prev_end = Some(span.end.offset);
                    parts.push(ShellPart::Inline(InlineDecorator { name, args, span }));
                }
                _ => break,
            }
        }
        Ok(ShellContent { parts })
    }

    fn parse_block_decorator(&mut self) -> Result<BlockDecorator, ParseException> {
        let at = self.current().clone();
        let had_parens = self.peek(2).token_type == TokenType::LParen;
        if !had_parens && self.peek(2).token_type != TokenType::LBrace {
            let name = self.peek(1).value.clone();
            return Err(ParseException::with_token(
                format!("block decorator @{} used without braces", name),
                &at,
            ));
        }
        let (name, args, span) = self.parse_decorator_call()?;

        let entry = self
            .registry
            .lookup(&name)
            .ok_or_else(|| ParseException::with_token(format!("unknown decorator @{}", name), &at))?;

        let body = if self.current().token_type == TokenType::LBrace {
            self.parse_braced_body()?
        } else if entry.requires_explicit_block {
            return Err(ParseException::with_token(
                format!("block decorator @{} requires an explicit block", name),
                &at,
            ));
        } else {
            // Implicit body: the rest of the line
            let mut contents = Vec::new();
            if matches!(self.current().token_type, TokenType::ShellText | TokenType::At) {
                contents.push(self.parse_content()?);
            }
            if contents.is_empty() {
                return Err(ParseException::with_token(
                    format!("block decorator @{} has no body", name),
                    &at,
                ));
            }
            Body::new(contents)
        };

        Ok(BlockDecorator {
            name,
            args,
            body,
            span,
        })
    }

    fn parse_pattern_decorator(&mut self) -> Result<PatternDecorator, ParseException> {
        let at = self.current().clone();
        let (name, args, span) = self.parse_decorator_call()?;

        if self.current().token_type != TokenType::LBrace {
            return Err(ParseException::with_token(
                format!("pattern decorator @{} requires a block of arms", name),
                &at,
            ));
        }
        let open = self.advance();
        self.depth += 1;
        self.check_depth(&open)?;

        let mut arms: Vec<PatternArm> = Vec::new();
        loop {
            self.skip_comments();
            let token = self.current().clone();
            match token.token_type {
                TokenType::RBrace => {
                    self.advance();
                    break;
                }
                TokenType::Eof => {
                    self.depth -= 1;
                    return Err(ParseException::with_token("unclosed '{'", &open));
                }
                TokenType::Identifier | TokenType::Asterisk => {
                    let pattern = if token.token_type == TokenType::Asterisk {
                        ArmPattern::Wildcard
                    } else {
                        ArmPattern::Ident(token.value.clone())
                    };
                    self.advance();
                    self.expect(TokenType::Colon, "expected ':' after arm pattern")?;
                    let body = self.parse_arm_body()?;
                    arms.push(PatternArm { pattern, body });
                }
                _ => {
                    self.depth -= 1;
                    return Err(ParseException::with_token(
                        format!(
                            "expected arm pattern or '}}', found '{}'",
                            token.token_type.as_str()
                        ),
                        &token,
                    ));
                }
            }
        }
        self.depth -= 1;

        Ok(PatternDecorator {
            name,
            args,
            arms,
            span,
        })
    }

    /// An arm's body runs until the next arm label or the closing brace.
    fn parse_arm_body(&mut self) -> Result<Body, ParseException> {
        let mut contents = Vec::new();
        loop {
            self.skip_comments();
            match self.current().token_type {
                TokenType::RBrace | TokenType::Eof | TokenType::Asterisk => break,
                TokenType::Identifier if self.peek(1).token_type == TokenType::Colon => break,
                _ => {
                    let content = self.parse_content()?;
                    Self::push_content(&mut contents, content);
                }
            }
        }
        Ok(Body::new(contents))
    }
}
