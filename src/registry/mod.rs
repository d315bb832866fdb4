//! Decorator Registry
//!
//! Catalog of known decorators. Each entry records the decorator's kind
//! (inline function, block, or pattern-match), its argument spec, and
//! whether a block form requires explicit braces. The registry is the
//! single source of truth the lexer consults to decide whether a `@word`
//! sequence introduces a decorator at all, and the parser consults to
//! validate kind and arity.
//!
//! The registry is populated at startup and read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::ast::types::NamedArg;

/// Classification of a decorator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoratorKind {
    /// Inline value decorator: `@var(PORT)`, `@env(HOME)`
    Function,
    /// Wraps a body: `@timeout(30s) { ... }`
    Block,
    /// Matches patterns against a value: `@when(ENV) { prod: ...; *: ... }`
    Pattern,
}

impl DecoratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Block => "block",
            Self::Pattern => "pattern",
        }
    }
}

impl fmt::Display for DecoratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter types a decorator argument may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Number,
    Duration,
    Identifier,
    Boolean,
    /// Any value expression, including nested function decorators.
    Expression,
}

/// Spec for one declared parameter.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub arg_type: ArgType,
    pub required: bool,
    pub default: Option<&'static str>,
}

impl ArgSpec {
    pub const fn required(name: &'static str, arg_type: ArgType) -> Self {
        Self {
            name,
            arg_type,
            required: true,
            default: None,
        }
    }

    pub const fn optional(name: &'static str, arg_type: ArgType, default: Option<&'static str>) -> Self {
        Self {
            name,
            arg_type,
            required: false,
            default,
        }
    }
}

/// One registered decorator.
#[derive(Debug, Clone)]
pub struct DecoratorEntry {
    pub name: &'static str,
    pub kind: DecoratorKind,
    pub args: Vec<ArgSpec>,
    /// Block decorators with this set are rejected without a `{ ... }` body.
    pub requires_explicit_block: bool,
}

/// Errors produced by argument validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown decorator @{0}")]
    UnknownDecorator(String),
    #[error("@{name} expects at least {min} argument(s), got {got}")]
    TooFewArgs { name: String, min: usize, got: usize },
    #[error("@{name} expects at most {max} argument(s), got {got}")]
    TooManyArgs { name: String, max: usize, got: usize },
    #[error("@{name}: positional argument after named argument")]
    PositionalAfterNamed { name: String },
    #[error("@{name}: unknown parameter '{param}'")]
    UnknownParam { name: String, param: String },
    #[error("@{name}: invalid parameter name '{param}'")]
    InvalidParamName { name: String, param: String },
}

lazy_static::lazy_static! {
    /// Parameter names are [_A-Za-z][-_A-Za-z0-9]*
    static ref PARAM_NAME: regex_lite::Regex =
        regex_lite::Regex::new(r"^[_A-Za-z][-_A-Za-z0-9]*$").unwrap();
}

/// Check a parameter (or decorator) name against the lexical rule.
pub fn is_valid_param_name(s: &str) -> bool {
    PARAM_NAME.is_match(s)
}

/// The registry itself: a read-only table after startup.
#[derive(Debug, Clone, Default)]
pub struct DecoratorRegistry {
    entries: HashMap<&'static str, DecoratorEntry>,
}

impl DecoratorRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Initialization-time registration. Later lookups never mutate.
    pub fn register(&mut self, entry: DecoratorEntry) {
        self.entries.insert(entry.name, entry);
    }

    pub fn lookup(&self, name: &str) -> Option<&DecoratorEntry> {
        self.entries.get(name)
    }

    pub fn is_function(&self, name: &str) -> bool {
        self.lookup(name).map(|e| e.kind) == Some(DecoratorKind::Function)
    }

    pub fn is_block(&self, name: &str) -> bool {
        self.lookup(name).map(|e| e.kind) == Some(DecoratorKind::Block)
    }

    pub fn is_pattern(&self, name: &str) -> bool {
        self.lookup(name).map(|e| e.kind) == Some(DecoratorKind::Pattern)
    }

    /// Validate an argument list against the decorator's spec: count against
    /// required/optional params, no positional after named, parameter names
    /// lexically valid and known.
    pub fn validate_args(&self, name: &str, args: &[NamedArg]) -> Result<(), RegistryError> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| RegistryError::UnknownDecorator(name.to_string()))?;

        let mut seen_named = false;
        for arg in args {
            match &arg.name {
                Some(param) => {
                    seen_named = true;
                    if !is_valid_param_name(param) {
                        return Err(RegistryError::InvalidParamName {
                            name: name.to_string(),
                            param: param.clone(),
                        });
                    }
                    if !entry.args.iter().any(|spec| spec.name == param) {
                        return Err(RegistryError::UnknownParam {
                            name: name.to_string(),
                            param: param.clone(),
                        });
                    }
                }
                None => {
                    if seen_named {
                        return Err(RegistryError::PositionalAfterNamed {
                            name: name.to_string(),
                        });
                    }
                }
            }
        }

        let min = entry.args.iter().filter(|spec| spec.required).count();
        let max = entry.args.len();
        if args.len() < min {
            return Err(RegistryError::TooFewArgs {
                name: name.to_string(),
                min,
                got: args.len(),
            });
        }
        if args.len() > max {
            return Err(RegistryError::TooManyArgs {
                name: name.to_string(),
                max,
                got: args.len(),
            });
        }

        Ok(())
    }
}

lazy_static::lazy_static! {
    /// The standard decorator set, registered before the first parse.
    pub static ref DEFAULT_REGISTRY: DecoratorRegistry = {
        let mut r = DecoratorRegistry::new();
        r.register(DecoratorEntry {
            name: "var",
            kind: DecoratorKind::Function,
            args: vec![ArgSpec::required("name", ArgType::Identifier)],
            requires_explicit_block: false,
        });
        r.register(DecoratorEntry {
            name: "env",
            kind: DecoratorKind::Function,
            args: vec![
                ArgSpec::required("name", ArgType::Identifier),
                ArgSpec::optional("default", ArgType::String, None),
            ],
            requires_explicit_block: false,
        });
        r.register(DecoratorEntry {
            name: "sh",
            kind: DecoratorKind::Function,
            args: vec![ArgSpec::required("command", ArgType::String)],
            requires_explicit_block: false,
        });
        r.register(DecoratorEntry {
            name: "parallel",
            kind: DecoratorKind::Block,
            args: vec![],
            requires_explicit_block: true,
        });
        r.register(DecoratorEntry {
            name: "timeout",
            kind: DecoratorKind::Block,
            args: vec![ArgSpec::required("duration", ArgType::Duration)],
            requires_explicit_block: false,
        });
        r.register(DecoratorEntry {
            name: "retry",
            kind: DecoratorKind::Block,
            args: vec![
                ArgSpec::required("attempts", ArgType::Number),
                ArgSpec::optional("delay", ArgType::Duration, Some("1s")),
            ],
            requires_explicit_block: false,
        });
        r.register(DecoratorEntry {
            name: "workdir",
            kind: DecoratorKind::Block,
            args: vec![ArgSpec::required("path", ArgType::String)],
            requires_explicit_block: false,
        });
        r.register(DecoratorEntry {
            name: "when",
            kind: DecoratorKind::Pattern,
            args: vec![ArgSpec::required("variable", ArgType::Identifier)],
            requires_explicit_block: true,
        });
        r.register(DecoratorEntry {
            name: "try",
            kind: DecoratorKind::Pattern,
            args: vec![],
            requires_explicit_block: true,
        });
        r
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{NamedArg, ValueExpr};

    fn positional(value: ValueExpr) -> NamedArg {
        NamedArg { name: None, value }
    }

    fn named(name: &str, value: ValueExpr) -> NamedArg {
        NamedArg {
            name: Some(name.to_string()),
            value,
        }
    }

    #[test]
    fn test_lookup_and_kinds() {
        assert!(DEFAULT_REGISTRY.is_function("var"));
        assert!(DEFAULT_REGISTRY.is_function("env"));
        assert!(DEFAULT_REGISTRY.is_block("timeout"));
        assert!(DEFAULT_REGISTRY.is_block("parallel"));
        assert!(DEFAULT_REGISTRY.is_pattern("when"));
        assert!(DEFAULT_REGISTRY.is_pattern("try"));
        assert!(DEFAULT_REGISTRY.lookup("nope").is_none());
        assert!(!DEFAULT_REGISTRY.is_block("var"));
    }

    #[test]
    fn test_parallel_requires_braces() {
        let entry = DEFAULT_REGISTRY.lookup("parallel").unwrap();
        assert!(entry.requires_explicit_block);
        let entry = DEFAULT_REGISTRY.lookup("timeout").unwrap();
        assert!(!entry.requires_explicit_block);
    }

    #[test]
    fn test_validate_arity() {
        let args = vec![positional(ValueExpr::number(30.0))];
        assert!(DEFAULT_REGISTRY.validate_args("retry", &args).is_ok());

        let err = DEFAULT_REGISTRY.validate_args("retry", &[]).unwrap_err();
        assert!(matches!(err, RegistryError::TooFewArgs { .. }));

        let args = vec![
            positional(ValueExpr::number(3.0)),
            positional(ValueExpr::duration("1s", std::time::Duration::from_secs(1))),
            positional(ValueExpr::number(9.0)),
        ];
        let err = DEFAULT_REGISTRY.validate_args("retry", &args).unwrap_err();
        assert!(matches!(err, RegistryError::TooManyArgs { .. }));
    }

    #[test]
    fn test_positional_after_named_rejected() {
        let args = vec![
            named("attempts", ValueExpr::number(3.0)),
            positional(ValueExpr::number(5.0)),
        ];
        let err = DEFAULT_REGISTRY.validate_args("retry", &args).unwrap_err();
        assert!(matches!(err, RegistryError::PositionalAfterNamed { .. }));
    }

    #[test]
    fn test_unknown_decorator() {
        let err = DEFAULT_REGISTRY.validate_args("bogus", &[]).unwrap_err();
        assert_eq!(err, RegistryError::UnknownDecorator("bogus".to_string()));
    }

    #[test]
    fn test_unknown_param() {
        let args = vec![named("tries", ValueExpr::number(3.0))];
        let err = DEFAULT_REGISTRY.validate_args("retry", &args).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownParam { .. }));
    }

    #[test]
    fn test_param_name_shape() {
        assert!(is_valid_param_name("_ok"));
        assert!(is_valid_param_name("max-delay"));
        assert!(is_valid_param_name("a1"));
        assert!(!is_valid_param_name("1a"));
        assert!(!is_valid_param_name("-bad"));
        assert!(!is_valid_param_name(""));
        assert!(!is_valid_param_name("has space"));
    }
}
