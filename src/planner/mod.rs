//! Planner: walks a parsed program and drives the vault.
//!
//! Planning is two waves over the selected command. The scan pass
//! declares variables, tracks direct expressions, and records a use-site
//! for every reference at its canonical path. The resolve pass marks the
//! walked expressions touched and resolves what can be resolved at plan
//! time (literals and `@env` lookups). Finalization prunes everything
//! unreferenced or untouched and emits the authorization list.

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::ast::types::{CommandKind, Content, NamedArg, Program, ShellPart, ValueExpr};
use crate::registry::{DecoratorEntry, DecoratorRegistry};
use crate::vault::types::{SecretUse, VaultError};
use crate::vault::Vault;

/// Decorator name the planner assigns to plain shell execution; its one
/// parameter is the command text.
const SHELL_DECORATOR: &str = "shell";
const SHELL_PARAM: &str = "command";

#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("cannot resolve '{raw}': {reason}")]
    Unresolvable { raw: String, reason: String },
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// The emitted plan: the command it covers and the secret-use
/// authorization list for the executor.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub command: String,
    pub secret_uses: Vec<SecretUse>,
}

/// Mutable state threaded through the scan pass.
#[derive(Default)]
struct Walk {
    /// Expression ids in walk order
    order: Vec<String>,
    /// Tracked (non-variable) expressions by id
    tracked: IndexMap<String, ValueExpr>,
}

impl Walk {
    fn record(&mut self, expr_id: String) {
        if !self.order.contains(&expr_id) {
            self.order.push(expr_id);
        }
    }
}

pub struct Planner<'a> {
    program: &'a Program,
    registry: &'a DecoratorRegistry,
}

impl<'a> Planner<'a> {
    pub fn new(program: &'a Program, registry: &'a DecoratorRegistry) -> Self {
        Self { program, registry }
    }

    /// Build a plan for one regular command.
    pub fn plan(&self, command_name: &str, vault: &mut Vault) -> Result<Plan, PlanError> {
        let command = self
            .program
            .command(command_name, CommandKind::Regular)
            .ok_or_else(|| PlanError::UnknownCommand(command_name.to_string()))?;

        for var in &self.program.vars {
            vault.declare_variable(&var.name, &var.value.raw());
        }

        // Scan pass: record every use-site along the walk.
        let mut walk = Walk::default();
        for content in &command.body.contents {
            vault.enter_step();
            self.scan_content(content, vault, &mut walk)?;
        }

        // Resolve pass: everything walked is on the execution path.
        for expr_id in &walk.order {
            vault.mark_touched(expr_id);
        }
        for var in &self.program.vars {
            if !walk.order.iter().any(|id| id == &var.name) {
                continue;
            }
            let value = self.resolve_value(&var.value)?;
            vault.mark_resolved(&var.name, &value);
        }
        for (expr_id, expr) in &walk.tracked {
            match self.resolve_value(expr) {
                Ok(value) => vault.mark_resolved(expr_id, &value),
                // Execution-time expressions stay unresolved and drop out
                // of the authorization list.
                Err(PlanError::Unresolvable { raw, reason }) => {
                    debug!(%raw, %reason, "expression left unresolved");
                }
                Err(other) => return Err(other),
            }
        }

        vault.prune_unused();
        vault.prune_untouched();
        let secret_uses = vault.build_secret_uses();
        debug!(command = command_name, uses = secret_uses.len(), "plan built");

        Ok(Plan {
            command: command_name.to_string(),
            secret_uses,
        })
    }

    fn scan_content(
        &self,
        content: &Content,
        vault: &mut Vault,
        walk: &mut Walk,
    ) -> Result<(), PlanError> {
        match content {
            Content::Shell(shell) => {
                vault.enter_decorator(SHELL_DECORATOR);
                for part in &shell.parts {
                    if let ShellPart::Inline(inline) = part {
                        self.scan_call(&inline.name, &inline.args, SHELL_PARAM, vault, walk)?;
                    }
                }
                vault.exit_decorator();
            }
            Content::Block(block) => {
                vault.enter_decorator(&block.name);
                self.scan_args(&block.name, &block.args, vault, walk)?;
                for inner in &block.body.contents {
                    self.scan_content(inner, vault, walk)?;
                }
                vault.exit_decorator();
            }
            Content::Pattern(pattern) => {
                vault.enter_decorator(&pattern.name);
                self.scan_args(&pattern.name, &pattern.args, vault, walk)?;
                self.scan_selector(&pattern.name, &pattern.args, vault, walk)?;
                // All arms are recorded; the executor selects one later.
                for arm in &pattern.arms {
                    for inner in &arm.body.contents {
                        self.scan_content(inner, vault, walk)?;
                    }
                }
                vault.exit_decorator();
            }
        }
        Ok(())
    }

    /// A pattern decorator's selector (`@when(ENV)`) references the named
    /// variable so the executor may evaluate it through `access`.
    fn scan_selector(
        &self,
        decorator: &str,
        args: &[NamedArg],
        vault: &mut Vault,
        walk: &mut Walk,
    ) -> Result<(), PlanError> {
        let Some(selector) = first_positional_text(args) else {
            return Ok(());
        };
        if self.program.var(&selector).is_none() {
            return Ok(());
        }
        let param = positional_param(self.registry.lookup(decorator), 0);
        vault.record_reference(&selector, &param)?;
        walk.record(selector);
        Ok(())
    }

    /// Record a decorator call seen in shell text or argument position.
    /// `@var(NAME)` references the declared variable; anything else is
    /// tracked as a direct expression.
    fn scan_call(
        &self,
        name: &str,
        args: &[NamedArg],
        param: &str,
        vault: &mut Vault,
        walk: &mut Walk,
    ) -> Result<(), PlanError> {
        if name == "var" {
            let var_name = first_positional_text(args)
                .ok_or_else(|| PlanError::UnknownVariable(String::new()))?;
            if self.program.var(&var_name).is_none() {
                return Err(PlanError::UnknownVariable(var_name));
            }
            vault.record_reference(&var_name, param)?;
            walk.record(var_name);
            return Ok(());
        }

        let call = ValueExpr::DecoratorCall {
            name: name.to_string(),
            args: args.to_vec(),
        };
        let expr_id = vault.track_expression(&call.raw());
        vault.record_reference(&expr_id, param)?;
        walk.tracked.entry(expr_id.clone()).or_insert(call);
        walk.record(expr_id);

        // Nested function calls inside the arguments are expressions of
        // their own.
        for arg in args {
            if let ValueExpr::DecoratorCall { name, args } = &arg.value {
                self.scan_call(name, args, param, vault, walk)?;
            }
        }
        Ok(())
    }

    /// Decorator arguments that are themselves expressions get recorded
    /// under the parameter they fill.
    fn scan_args(
        &self,
        decorator: &str,
        args: &[NamedArg],
        vault: &mut Vault,
        walk: &mut Walk,
    ) -> Result<(), PlanError> {
        let entry = self.registry.lookup(decorator);
        let mut positional = 0usize;
        for arg in args {
            let param = match &arg.name {
                Some(name) => name.clone(),
                None => {
                    let name = positional_param(entry, positional);
                    positional += 1;
                    name
                }
            };
            if let ValueExpr::DecoratorCall { name, args } = &arg.value {
                self.scan_call(name, args, &param, vault, walk)?;
            }
        }
        Ok(())
    }

    /// Resolve a value expression at plan time. Literals render to their
    /// string form; `@env` reads the process environment; anything else
    /// stays unresolved.
    fn resolve_value(&self, expr: &ValueExpr) -> Result<String, PlanError> {
        if let Some(rendered) = expr.render() {
            return Ok(rendered);
        }
        let ValueExpr::DecoratorCall { name, args } = expr else {
            return Err(PlanError::Unresolvable {
                raw: expr.raw(),
                reason: "not a literal".to_string(),
            });
        };
        match name.as_str() {
            "env" => {
                let var = first_positional_text(args).ok_or_else(|| PlanError::Unresolvable {
                    raw: expr.raw(),
                    reason: "missing environment variable name".to_string(),
                })?;
                match std::env::var(&var) {
                    Ok(value) => Ok(value),
                    Err(_) => match second_positional_text(args) {
                        Some(default) => Ok(default),
                        None => Err(PlanError::Unresolvable {
                            raw: expr.raw(),
                            reason: format!("environment variable '{}' is not set", var),
                        }),
                    },
                }
            }
            "var" => {
                let var_name =
                    first_positional_text(args).ok_or_else(|| PlanError::Unresolvable {
                        raw: expr.raw(),
                        reason: "missing variable name".to_string(),
                    })?;
                let decl = self
                    .program
                    .var(&var_name)
                    .ok_or_else(|| PlanError::UnknownVariable(var_name))?;
                self.resolve_value(&decl.value)
            }
            other => Err(PlanError::Unresolvable {
                raw: expr.raw(),
                reason: format!("@{} resolves at execution time", other),
            }),
        }
    }
}

fn first_positional_text(args: &[NamedArg]) -> Option<String> {
    args.iter()
        .filter(|a| a.name.is_none())
        .map(|a| a.value.render())
        .next()
        .flatten()
}

fn second_positional_text(args: &[NamedArg]) -> Option<String> {
    args.iter()
        .filter(|a| a.name.is_none())
        .nth(1)
        .and_then(|a| a.value.render())
}

fn positional_param(entry: Option<&DecoratorEntry>, index: usize) -> String {
    entry
        .and_then(|e| e.args.get(index))
        .map(|spec| spec.name.to_string())
        .unwrap_or_else(|| format!("arg{}", index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::registry::DEFAULT_REGISTRY;

    fn plan_for(src: &str, command: &str) -> (Plan, Vault) {
        let program = parse(src).unwrap();
        let planner = Planner::new(&program, &DEFAULT_REGISTRY);
        let mut vault = Vault::new();
        let plan = planner.plan(command, &mut vault).unwrap();
        (plan, vault)
    }

    #[test]
    fn test_plan_simple_command() {
        let (plan, _) = plan_for("var PORT = 8080\nserve: echo @var(PORT)", "serve");
        assert_eq!(plan.command, "serve");
        assert_eq!(plan.secret_uses.len(), 1);
        assert_eq!(
            plan.secret_uses[0].site,
            "root/step-1/@shell[0]/params/command"
        );
        assert!(plan.secret_uses[0].display_id.starts_with("opal:v:"));
    }

    #[test]
    fn test_plan_unused_variable_pruned() {
        let (plan, _) = plan_for(
            "var PORT = 8080\nvar UNUSED = 1\nserve: echo @var(PORT)",
            "serve",
        );
        assert_eq!(plan.secret_uses.len(), 1);
    }

    #[test]
    fn test_plan_block_decorator_path() {
        let (plan, _) = plan_for(
            "var T = secret\nbuild: @retry(3) { echo @var(T) }",
            "build",
        );
        assert_eq!(plan.secret_uses.len(), 1);
        assert_eq!(
            plan.secret_uses[0].site,
            "root/step-1/@retry[0]/@shell[0]/params/command"
        );
    }

    #[test]
    fn test_plan_steps_are_siblings() {
        let (plan, _) = plan_for(
            "var A = 1\nvar B = 2\ngo: {\n  echo @var(A)\n  echo @var(B)\n}",
            "go",
        );
        let sites: Vec<&str> = plan.secret_uses.iter().map(|u| u.site.as_str()).collect();
        assert_eq!(
            sites,
            vec![
                "root/step-1/@shell[0]/params/command",
                "root/step-2/@shell[0]/params/command",
            ]
        );
    }

    #[test]
    fn test_plan_pattern_selector_and_arms() {
        let (plan, _) = plan_for(
            "var ENV = prod\nvar A = x\ndeploy: @when(ENV) { prod: run @var(A); *: echo skip }",
            "deploy",
        );
        let sites: Vec<&str> = plan.secret_uses.iter().map(|u| u.site.as_str()).collect();
        assert!(sites.contains(&"root/step-1/@when[0]/params/variable"));
        assert!(sites.contains(&"root/step-1/@when[0]/@shell[0]/params/command"));
    }

    #[test]
    fn test_plan_env_expression() {
        std::env::set_var("OPAL_PLAN_TEST_TOKEN", "tok-123");
        let (plan, vault) = plan_for("fetch: curl -H @env(OPAL_PLAN_TEST_TOKEN)", "fetch");
        assert_eq!(plan.secret_uses.len(), 1);
        let set = vault.secret_set();
        assert!(!set.is_empty());
        std::env::remove_var("OPAL_PLAN_TEST_TOKEN");
    }

    #[test]
    fn test_plan_env_default() {
        let (plan, _) = plan_for(
            "fetch: curl @env(OPAL_PLAN_TEST_MISSING, fallback)",
            "fetch",
        );
        assert_eq!(plan.secret_uses.len(), 1);
    }

    #[test]
    fn test_plan_unknown_command() {
        let program = parse("a: echo hi").unwrap();
        let planner = Planner::new(&program, &DEFAULT_REGISTRY);
        let mut vault = Vault::new();
        let err = planner.plan("missing", &mut vault).unwrap_err();
        assert!(matches!(err, PlanError::UnknownCommand(_)));
    }

    #[test]
    fn test_plan_unknown_variable() {
        let program = parse("a: echo @var(NOPE)").unwrap();
        let planner = Planner::new(&program, &DEFAULT_REGISTRY);
        let mut vault = Vault::new();
        let err = planner.plan("a", &mut vault).unwrap_err();
        assert!(matches!(err, PlanError::UnknownVariable(_)));
    }

    #[test]
    fn test_plan_scrubs_resolved_values() {
        use crate::vault::Scrubber;
        use std::sync::Arc;

        let (_, vault) = plan_for("var KEY = hunter2-secret\ngo: echo @var(KEY)", "go");
        let set = Arc::new(vault.secret_set());
        let mut sink: Vec<u8> = Vec::new();
        {
            let scrubber = Scrubber::new(&mut sink, set);
            scrubber.write(b"value is hunter2-secret here\n").unwrap();
            scrubber.flush().unwrap();
        }
        let out = String::from_utf8(sink).unwrap();
        assert!(!out.contains("hunter2-secret"));
        assert!(out.contains("opal:v:"));
    }

    #[test]
    fn test_plan_with_key_emits_site_ids() {
        let program = parse("var T = x\ngo: echo @var(T)").unwrap();
        let planner = Planner::new(&program, &DEFAULT_REGISTRY);
        let mut vault = Vault::with_plan_key(&[5u8; 32]);
        let plan = planner.plan("go", &mut vault).unwrap();
        assert_eq!(plan.secret_uses.len(), 1);
        assert!(!plan.secret_uses[0].site_id.is_empty());
    }
}
