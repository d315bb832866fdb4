//! Abstract Syntax Tree (AST) Types for opal
//!
//! This module defines the complete AST structure for opal source files.
//! The design follows the command-definition grammar while being
//! Rust-idiomatic.
//!
//! Architecture:
//!   Input → Lexer → Parser → AST → Planner → Plan

pub mod types;
