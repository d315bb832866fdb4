//! AST node types for opal source files.
//!
//! A source file declares named variables and named commands. Command
//! bodies are shell text interleaved with decorators. Ownership is
//! strictly tree-shaped: block and pattern decorators own their child
//! bodies, no back-edges.

use std::fmt;
use std::time::Duration;

// =============================================================================
// BASE TYPES
// =============================================================================

/// Position information for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

/// Span in source code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// =============================================================================
// PROGRAM
// =============================================================================

/// Root node: a complete source file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub vars: Vec<VarDecl>,
    pub commands: Vec<CommandDecl>,
}

impl Program {
    /// Find a command by name and kind.
    pub fn command(&self, name: &str, kind: CommandKind) -> Option<&CommandDecl> {
        self.commands
            .iter()
            .find(|c| c.name == name && c.kind == kind)
    }

    /// Find a variable declaration by name.
    pub fn var(&self, name: &str) -> Option<&VarDecl> {
        self.vars.iter().find(|v| v.name == name)
    }
}

/// `var NAME = <expr>`
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub value: ValueExpr,
    pub span: Span,
}

/// Command flavor. Watch/stop commands pair with a regular command of the
/// same name to form a lifecycle pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Regular,
    Watch,
    Stop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "command",
            Self::Watch => "watch",
            Self::Stop => "stop",
        }
    }
}

/// `[watch|stop]? NAME ":" <body>`
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDecl {
    pub name: String,
    pub kind: CommandKind,
    pub body: Body,
    pub span: Span,
}

// =============================================================================
// COMMAND BODIES
// =============================================================================

/// A body is an ordered sequence of content items.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub contents: Vec<Content>,
}

impl Body {
    pub fn new(contents: Vec<Content>) -> Self {
        Self { contents }
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// One item in a body.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Shell(ShellContent),
    Block(BlockDecorator),
    Pattern(PatternDecorator),
}

/// A run of shell text with inline decorator references fused in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShellContent {
    pub parts: Vec<ShellPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShellPart {
    Text(String),
    Inline(InlineDecorator),
}

/// `@name(args)` embedded in shell text. Registry kind must be Function.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineDecorator {
    pub name: String,
    pub args: Vec<NamedArg>,
    pub span: Span,
}

/// `@name(args) { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDecorator {
    pub name: String,
    pub args: Vec<NamedArg>,
    pub body: Body,
    pub span: Span,
}

/// `@name(args) { pattern: body; ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct PatternDecorator {
    pub name: String,
    pub args: Vec<NamedArg>,
    pub arms: Vec<PatternArm>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternArm {
    pub pattern: ArmPattern,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmPattern {
    Ident(String),
    Wildcard,
}

impl fmt::Display for ArmPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => f.write_str(s),
            Self::Wildcard => f.write_str("*"),
        }
    }
}

// =============================================================================
// VALUE EXPRESSIONS
// =============================================================================

/// Quote style of a string literal. `None` on the enclosing `ValueExpr`
/// means the value came from a bare unquoted run (URLs, paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    Double,
    Single,
    Backtick,
}

/// The value side of a variable declaration or a decorator argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Str {
        value: String,
        quote: Option<QuoteStyle>,
    },
    Number(f64),
    Duration {
        raw: String,
        value: Duration,
    },
    Bool(bool),
    DecoratorCall {
        name: String,
        args: Vec<NamedArg>,
    },
}

impl ValueExpr {
    pub fn string(value: impl Into<String>, quote: Option<QuoteStyle>) -> Self {
        Self::Str {
            value: value.into(),
            quote,
        }
    }

    pub fn number(n: f64) -> Self {
        Self::Number(n)
    }

    pub fn duration(raw: impl Into<String>, value: Duration) -> Self {
        Self::Duration {
            raw: raw.into(),
            value,
        }
    }

    /// Render the literal as the string the shell would see. Decorator
    /// calls have no literal rendering and return None.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Str { value, .. } => Some(value.clone()),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(format!("{}", n))
                }
            }
            Self::Duration { raw, .. } => Some(raw.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::DecoratorCall { .. } => None,
        }
    }

    /// Canonical source form, used for expression identity in the vault
    /// and for re-serialization.
    pub fn raw(&self) -> String {
        match self {
            Self::Str { value, quote } => match quote {
                Some(QuoteStyle::Single) => format!("'{}'", value.replace('\'', "\\'")),
                Some(QuoteStyle::Backtick) => format!("`{}`", escape_double(value, '`')),
                Some(QuoteStyle::Double) => format!("\"{}\"", escape_double(value, '"')),
                None => value.clone(),
            },
            Self::Number(n) => format!("{}", n),
            Self::Duration { raw, .. } => raw.clone(),
            Self::Bool(b) => b.to_string(),
            Self::DecoratorCall { name, args } => {
                let rendered: Vec<String> = args.iter().map(|a| a.raw()).collect();
                format!("@{}({})", name, rendered.join(", "))
            }
        }
    }
}

/// One argument in a decorator call: positional or `name = value`.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedArg {
    pub name: Option<String>,
    pub value: ValueExpr,
}

impl NamedArg {
    pub fn positional(value: ValueExpr) -> Self {
        Self { name: None, value }
    }

    pub fn named(name: impl Into<String>, value: ValueExpr) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }

    pub fn raw(&self) -> String {
        match &self.name {
            Some(n) => format!("{} = {}", n, self.value.raw()),
            None => self.value.raw(),
        }
    }
}

fn escape_double(value: &str, quote: char) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

// =============================================================================
// CANONICAL SERIALIZATION
// =============================================================================

impl Program {
    /// Render the program back to source. Insignificant whitespace is
    /// normalized; re-parsing yields an equivalent tree.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for var in &self.vars {
            out.push_str(&format!("var {} = {}\n", var.name, var.value.raw()));
        }
        for command in &self.commands {
            let prefix = match command.kind {
                CommandKind::Regular => "",
                CommandKind::Watch => "watch ",
                CommandKind::Stop => "stop ",
            };
            out.push_str(&format!(
                "{}{}: {}\n",
                prefix,
                command.name,
                command.body.render()
            ));
        }
        out
    }
}

impl Body {
    fn render(&self) -> String {
        let rendered: Vec<String> = self.contents.iter().map(|c| c.render()).collect();
        match rendered.len() {
            0 => "{ }".to_string(),
            1 => rendered.into_iter().next().unwrap_or_default(),
            _ => format!("{{ {} }}", rendered.join("\n")),
        }
    }

    fn render_inner(&self) -> String {
        let rendered: Vec<String> = self.contents.iter().map(|c| c.render()).collect();
        rendered.join("\n")
    }
}

impl Content {
    fn render(&self) -> String {
        match self {
            Self::Shell(shell) => shell.render(),
            Self::Block(block) => {
                format!(
                    "@{}{} {{ {} }}",
                    block.name,
                    render_args(&block.args),
                    block.body.render_inner()
                )
            }
            Self::Pattern(pattern) => {
                let arms: Vec<String> = pattern
                    .arms
                    .iter()
                    .map(|arm| format!("{}: {}", arm.pattern, arm.body.render_inner()))
                    .collect();
                format!(
                    "@{}{} {{ {} }}",
                    pattern.name,
                    render_args(&pattern.args),
                    arms.join("; ")
                )
            }
        }
    }
}

impl ShellContent {
    fn render(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                ShellPart::Text(text) => out.push_str(text),
                ShellPart::Inline(inline) => {
                    out.push_str(&format!("@{}{}", inline.name, render_args(&inline.args)));
                }
            }
        }
        out
    }
}

fn render_args(args: &[NamedArg]) -> String {
    if args.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = args.iter().map(|a| a.raw()).collect();
    format!("({})", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lookup_by_kind() {
        let program = Program {
            vars: vec![],
            commands: vec![
                CommandDecl {
                    name: "server".to_string(),
                    kind: CommandKind::Regular,
                    body: Body::default(),
                    span: Span::default(),
                },
                CommandDecl {
                    name: "server".to_string(),
                    kind: CommandKind::Watch,
                    body: Body::default(),
                    span: Span::default(),
                },
            ],
        };
        assert!(program.command("server", CommandKind::Regular).is_some());
        assert!(program.command("server", CommandKind::Watch).is_some());
        assert!(program.command("server", CommandKind::Stop).is_none());
    }

    #[test]
    fn test_render_literals() {
        assert_eq!(ValueExpr::number(8080.0).render().unwrap(), "8080");
        assert_eq!(ValueExpr::number(1.5).render().unwrap(), "1.5");
        assert_eq!(ValueExpr::Bool(true).render().unwrap(), "true");
        assert_eq!(
            ValueExpr::duration("30s", Duration::from_secs(30)).render().unwrap(),
            "30s"
        );
        let call = ValueExpr::DecoratorCall {
            name: "env".to_string(),
            args: vec![],
        };
        assert!(call.render().is_none());
    }

    #[test]
    fn test_raw_decorator_call() {
        let call = ValueExpr::DecoratorCall {
            name: "env".to_string(),
            args: vec![NamedArg::positional(ValueExpr::string("HOME", None))],
        };
        assert_eq!(call.raw(), "@env(HOME)");
    }
}
