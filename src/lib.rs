//! opal - a build-and-run toolchain for a small command-definition language
//!
//! This library provides the front-end (lexer, parser, decorator
//! registry), the planner, and the secret vault with its streaming
//! output scrubber.

pub mod ast;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod vault;

pub use ast::types::*;
pub use parser::{parse, ParseException, Parser};
pub use planner::{Plan, PlanError, Planner};
pub use registry::{DecoratorKind, DecoratorRegistry, DEFAULT_REGISTRY};
pub use vault::{Scrubber, SecretProvider, SecretSet, SecretUse, Vault, VaultError};
