//! The vault proper: wave-resolved expression store with site-based
//! access control.
//!
//! Expressions are created during the planner's scan pass, references are
//! appended as the walk records use-sites, and resolution marks values
//! plus the transport they were resolved in. `access` is the single gate
//! that hands out secret values, after three checks in order: resolution,
//! transport boundary, site authorization.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::vault::path::PathStack;
use crate::vault::scrubber::SecretSet;
use crate::vault::types::{hex_lower, Expression, SecretUse, SiteRef, VaultError};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TRANSPORT: &str = "local";

/// Single-planning-session secret store. Not persisted, not safe for
/// concurrent mutation; the planner owns it for the session.
pub struct Vault {
    plan_key: Option<Vec<u8>>,
    expressions: IndexMap<String, Expression>,
    references: IndexMap<String, Vec<SiteRef>>,
    touched: HashSet<String>,
    /// Transport each expression was resolved in. Set exactly once, at
    /// resolution time, never mutated afterwards.
    expr_transport: HashMap<String, String>,
    path: PathStack,
    transports: Vec<String>,
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

impl Vault {
    /// Test-mode vault: site ids are empty strings and authorization
    /// matches on the rendered site path instead.
    pub fn new() -> Self {
        Self {
            plan_key: None,
            expressions: IndexMap::new(),
            references: IndexMap::new(),
            touched: HashSet::new(),
            expr_transport: HashMap::new(),
            path: PathStack::new(),
            transports: Vec::new(),
        }
    }

    /// Production vault. `key` should be at least 32 random bytes drawn
    /// fresh for the plan.
    pub fn with_plan_key(key: &[u8]) -> Self {
        let mut vault = Self::new();
        vault.plan_key = Some(key.to_vec());
        vault
    }

    // =========================================================================
    // Path and transport tracking
    // =========================================================================

    pub fn enter_step(&mut self) -> usize {
        self.path.enter_step()
    }

    pub fn enter_decorator(&mut self, name: &str) -> usize {
        self.path.enter_decorator(name)
    }

    pub fn exit_decorator(&mut self) {
        self.path.exit_decorator();
    }

    pub fn build_site_path(&self, param_name: &str) -> String {
        self.path.render(param_name)
    }

    pub fn enter_transport(&mut self, scope: &str) {
        self.transports.push(scope.to_string());
    }

    pub fn exit_transport(&mut self) {
        self.transports.pop();
    }

    pub fn current_transport(&self) -> &str {
        self.transports
            .last()
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_TRANSPORT)
    }

    // =========================================================================
    // Expression lifecycle
    // =========================================================================

    /// Store a declared variable's expression under the variable name.
    pub fn declare_variable(&mut self, name: &str, raw: &str) -> String {
        let expr_id = name.to_string();
        if !self.expressions.contains_key(&expr_id) {
            let display_id = display_id_for(&expr_id);
            self.expressions.insert(
                expr_id.clone(),
                Expression {
                    raw: raw.to_string(),
                    value: None,
                    display_id,
                    resolved: false,
                },
            );
        }
        expr_id
    }

    /// Track a direct decorator-call expression. The id is derived from
    /// the current transport and the raw text, so the same expression in
    /// different transports yields distinct ids. Idempotent.
    pub fn track_expression(&mut self, raw: &str) -> String {
        let transport = self.current_transport().to_string();
        let digest = Sha256::digest(format!("{}:{}", transport, raw).as_bytes());
        let expr_id = format!("{}:{}", transport, hex_lower(&digest[..8]));
        if !self.expressions.contains_key(&expr_id) {
            let display_id = display_id_for(&expr_id);
            self.expressions.insert(
                expr_id.clone(),
                Expression {
                    raw: raw.to_string(),
                    value: None,
                    display_id,
                    resolved: false,
                },
            );
        }
        expr_id
    }

    /// Record a use-site for the expression at the current path. The
    /// transport constraint is enforced later, at access time, once the
    /// expression has been resolved.
    pub fn record_reference(&mut self, expr_id: &str, param_name: &str) -> Result<(), VaultError> {
        if !self.expressions.contains_key(expr_id) {
            return Err(VaultError::Unresolved {
                expr_id: expr_id.to_string(),
            });
        }
        let site = self.path.render(param_name);
        let site_id = self.site_id(&site);
        let refs = self.references.entry(expr_id.to_string()).or_default();
        let site_ref = SiteRef {
            site,
            site_id,
            param_name: param_name.to_string(),
        };
        if !refs.contains(&site_ref) {
            refs.push(site_ref);
        }
        Ok(())
    }

    pub fn mark_touched(&mut self, expr_id: &str) {
        self.touched.insert(expr_id.to_string());
    }

    pub fn is_touched(&self, expr_id: &str) -> bool {
        self.touched.contains(expr_id)
    }

    pub fn expression(&self, expr_id: &str) -> Option<&Expression> {
        self.expressions.get(expr_id)
    }

    /// Set the expression's value and capture the current transport.
    /// Capture must happen here, not at first access: a local secret
    /// first touched inside an `@ssh` block must not be labeled as
    /// SSH-origin.
    ///
    /// Panics when the expression is missing or already resolved; both
    /// are planner bugs.
    pub fn mark_resolved(&mut self, expr_id: &str, value: &str) {
        let transport = self.current_transport().to_string();
        let expression = self
            .expressions
            .get_mut(expr_id)
            .unwrap_or_else(|| panic!("mark_resolved: unknown expression '{}'", expr_id));
        if expression.resolved {
            panic!("mark_resolved: expression '{}' resolved twice", expr_id);
        }
        expression.value = Some(value.to_string());
        expression.resolved = true;
        self.expr_transport.insert(expr_id.to_string(), transport);
        debug!(expr_id, "expression resolved");
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Hand out a secret value after the two-check authorization:
    /// transport boundary first, then site authority for the current
    /// path. Fails `Unresolved` for unknown or unresolved expressions.
    pub fn access(&self, expr_id: &str, param_name: &str) -> Result<String, VaultError> {
        let expression = match self.expressions.get(expr_id) {
            Some(e) if e.resolved => e,
            _ => {
                return Err(VaultError::Unresolved {
                    expr_id: expr_id.to_string(),
                })
            }
        };

        // The transport entry is written by mark_resolved; a resolved
        // expression without one is a programmer error.
        let resolved_in = self
            .expr_transport
            .get(expr_id)
            .unwrap_or_else(|| panic!("access: no transport recorded for '{}'", expr_id));
        let current = self.current_transport();
        if resolved_in != current {
            return Err(VaultError::TransportBoundary {
                expr_id: expr_id.to_string(),
                resolved_in: resolved_in.clone(),
                current: current.to_string(),
            });
        }

        let site = self.path.render(param_name);
        let authorized = match &self.plan_key {
            Some(_) => {
                let site_id = self.site_id(&site);
                self.references.get(expr_id).map_or(false, |refs| {
                    refs.iter().any(|r| {
                        r.site_id.as_bytes().ct_eq(site_id.as_bytes()).unwrap_u8() == 1
                    })
                })
            }
            // Test mode has no HMAC; match the rendered site path so an
            // unrecorded site still fails closed.
            None => self
                .references
                .get(expr_id)
                .map_or(false, |refs| refs.iter().any(|r| r.site == site)),
        };
        if !authorized {
            return Err(VaultError::NoAuthority {
                expr_id: expr_id.to_string(),
                site,
            });
        }

        match &expression.value {
            Some(value) => Ok(value.clone()),
            None => Err(VaultError::Unresolved {
                expr_id: expr_id.to_string(),
            }),
        }
    }

    // =========================================================================
    // Pruning and plan output
    // =========================================================================

    /// Drop expressions with no recorded references.
    pub fn prune_unused(&mut self) {
        let unused: Vec<String> = self
            .expressions
            .keys()
            .filter(|id| self.references.get(*id).map_or(true, |r| r.is_empty()))
            .cloned()
            .collect();
        for id in unused {
            debug!(expr_id = %id, "pruning unreferenced expression");
            self.remove_expression(&id);
        }
    }

    /// Drop expressions not on the realized execution path.
    pub fn prune_untouched(&mut self) {
        let untouched: Vec<String> = self
            .expressions
            .keys()
            .filter(|id| !self.touched.contains(*id))
            .cloned()
            .collect();
        for id in untouched {
            debug!(expr_id = %id, "pruning untouched expression");
            self.remove_expression(&id);
        }
    }

    fn remove_expression(&mut self, expr_id: &str) {
        self.expressions.shift_remove(expr_id);
        self.references.shift_remove(expr_id);
        self.touched.remove(expr_id);
        self.expr_transport.remove(expr_id);
    }

    /// The authorization list handed to the executor: one entry per
    /// (expression, site) pair, restricted to expressions that are
    /// resolved, referenced, and touched.
    pub fn build_secret_uses(&self) -> Vec<SecretUse> {
        let mut uses = Vec::new();
        for (expr_id, expression) in &self.expressions {
            if !expression.resolved || !self.touched.contains(expr_id) {
                continue;
            }
            let Some(refs) = self.references.get(expr_id) else {
                continue;
            };
            for site_ref in refs {
                uses.push(SecretUse {
                    display_id: expression.display_id.clone(),
                    site_id: site_ref.site_id.clone(),
                    site: site_ref.site.clone(),
                });
            }
        }
        uses
    }

    /// Secret patterns for the output scrubber: the values of every
    /// resolved, referenced, touched expression, with encoding variants,
    /// mapped to the expression's display id.
    pub fn secret_set(&self) -> SecretSet {
        let mut set = SecretSet::new();
        for (expr_id, expression) in &self.expressions {
            if !expression.resolved || !self.touched.contains(expr_id) {
                continue;
            }
            if self.references.get(expr_id).map_or(true, |r| r.is_empty()) {
                continue;
            }
            if let Some(value) = &expression.value {
                if !value.is_empty() {
                    set.insert_with_variants(value.as_bytes(), &expression.display_id);
                }
            }
        }
        set
    }

    fn site_id(&self, site: &str) -> String {
        match &self.plan_key {
            None => String::new(),
            Some(key) => {
                // HMAC accepts keys of any length
                let mut mac = HmacSha256::new_from_slice(key)
                    .unwrap_or_else(|_| panic!("plan key rejected by HMAC"));
                mac.update(site.as_bytes());
                let tag = mac.finalize().into_bytes();
                URL_SAFE_NO_PAD.encode(&tag[..16])
            }
        }
    }
}

fn display_id_for(expr_id: &str) -> String {
    let digest = Sha256::digest(expr_id.as_bytes());
    format!("opal:v:{}", hex_lower(&digest[..4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared_and_recorded(vault: &mut Vault) {
        vault.declare_variable("API_KEY", "@env(API_KEY)");
        vault.enter_step();
        vault.enter_decorator("shell");
        vault.record_reference("API_KEY", "command").unwrap();
    }

    #[test]
    fn test_access_happy_path() {
        let mut vault = Vault::new();
        declared_and_recorded(&mut vault);
        vault.mark_resolved("API_KEY", "v");
        assert_eq!(vault.access("API_KEY", "command").unwrap(), "v");
    }

    #[test]
    fn test_access_unresolved() {
        let mut vault = Vault::new();
        declared_and_recorded(&mut vault);
        let err = vault.access("API_KEY", "command").unwrap_err();
        assert_eq!(
            err,
            VaultError::Unresolved {
                expr_id: "API_KEY".to_string()
            }
        );
    }

    #[test]
    fn test_access_unknown_expression() {
        let vault = Vault::new();
        assert!(matches!(
            vault.access("NOPE", "command"),
            Err(VaultError::Unresolved { .. })
        ));
    }

    #[test]
    fn test_access_unrecorded_site_fails() {
        let mut vault = Vault::new();
        declared_and_recorded(&mut vault);
        vault.mark_resolved("API_KEY", "v");
        // Different param at the same path: not recorded
        let err = vault.access("API_KEY", "other").unwrap_err();
        assert!(matches!(err, VaultError::NoAuthority { .. }));
        // Different path: not recorded
        let mut vault2 = Vault::new();
        vault2.declare_variable("API_KEY", "@env(API_KEY)");
        vault2.enter_step();
        vault2.enter_decorator("shell");
        vault2.record_reference("API_KEY", "command").unwrap();
        vault2.mark_resolved("API_KEY", "v");
        vault2.enter_decorator("retry");
        let err = vault2.access("API_KEY", "command").unwrap_err();
        assert!(matches!(err, VaultError::NoAuthority { .. }));
    }

    #[test]
    fn test_transport_boundary() {
        let mut vault = Vault::new();
        declared_and_recorded(&mut vault);
        vault.mark_resolved("API_KEY", "v");
        vault.enter_transport("ssh:x");
        let err = vault.access("API_KEY", "command").unwrap_err();
        assert_eq!(
            err,
            VaultError::TransportBoundary {
                expr_id: "API_KEY".to_string(),
                resolved_in: "local".to_string(),
                current: "ssh:x".to_string(),
            }
        );
        vault.exit_transport();
        assert_eq!(vault.access("API_KEY", "command").unwrap(), "v");
    }

    #[test]
    fn test_no_lazy_transport_capture() {
        // Resolve locally, then reference and access inside ssh. The
        // transport recorded at resolution wins, so access still fails.
        let mut vault = Vault::new();
        vault.declare_variable("API_KEY", "@env(API_KEY)");
        vault.mark_resolved("API_KEY", "v");
        vault.enter_transport("ssh:x");
        vault.enter_step();
        vault.enter_decorator("shell");
        vault.record_reference("API_KEY", "command").unwrap();
        let err = vault.access("API_KEY", "command").unwrap_err();
        assert!(matches!(err, VaultError::TransportBoundary { .. }));
    }

    #[test]
    fn test_track_expression_idempotent_and_transport_scoped() {
        let mut vault = Vault::new();
        let a = vault.track_expression("@env.HOME");
        let b = vault.track_expression("@env.HOME");
        assert_eq!(a, b);
        assert!(a.starts_with("local:"));

        vault.enter_transport("ssh:web");
        let c = vault.track_expression("@env.HOME");
        assert_ne!(a, c);
        assert!(c.starts_with("ssh:web:"));
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn test_double_resolve_panics() {
        let mut vault = Vault::new();
        vault.declare_variable("A", "x");
        vault.mark_resolved("A", "1");
        vault.mark_resolved("A", "2");
    }

    #[test]
    #[should_panic(expected = "unknown expression")]
    fn test_resolve_unknown_panics() {
        let mut vault = Vault::new();
        vault.mark_resolved("A", "1");
    }

    #[test]
    fn test_site_id_stable_per_key() {
        let key = [7u8; 32];
        let mut a = Vault::with_plan_key(&key);
        let mut b = Vault::with_plan_key(&key);
        a.declare_variable("T", "x");
        b.declare_variable("T", "x");
        a.enter_step();
        b.enter_step();
        a.record_reference("T", "command").unwrap();
        b.record_reference("T", "command").unwrap();
        let ua = a.build_secret_uses();
        let ub = b.build_secret_uses();
        // Not resolved/touched yet: no uses emitted
        assert!(ua.is_empty() && ub.is_empty());

        a.mark_resolved("T", "v");
        b.mark_resolved("T", "v");
        a.mark_touched("T");
        b.mark_touched("T");
        let ua = a.build_secret_uses();
        let ub = b.build_secret_uses();
        assert_eq!(ua, ub);
        assert!(!ua[0].site_id.is_empty());

        let mut c = Vault::with_plan_key(&[9u8; 32]);
        c.declare_variable("T", "x");
        c.enter_step();
        c.record_reference("T", "command").unwrap();
        c.mark_resolved("T", "v");
        c.mark_touched("T");
        let uc = c.build_secret_uses();
        assert_ne!(ua[0].site_id, uc[0].site_id);
    }

    #[test]
    fn test_access_with_plan_key() {
        let mut vault = Vault::with_plan_key(&[3u8; 32]);
        declared_and_recorded(&mut vault);
        vault.mark_resolved("API_KEY", "v");
        assert_eq!(vault.access("API_KEY", "command").unwrap(), "v");
        assert!(matches!(
            vault.access("API_KEY", "other"),
            Err(VaultError::NoAuthority { .. })
        ));
    }

    #[test]
    fn test_prune_unused() {
        let mut vault = Vault::new();
        vault.declare_variable("USED", "a");
        vault.declare_variable("UNUSED", "b");
        vault.enter_step();
        vault.record_reference("USED", "command").unwrap();
        vault.prune_unused();
        assert!(vault.record_reference("UNUSED", "x").is_err());
        assert!(vault.record_reference("USED", "command").is_ok());
    }

    #[test]
    fn test_prune_untouched() {
        let mut vault = Vault::new();
        vault.declare_variable("HOT", "a");
        vault.declare_variable("COLD", "b");
        vault.enter_step();
        vault.record_reference("HOT", "command").unwrap();
        vault.record_reference("COLD", "command").unwrap();
        vault.mark_resolved("HOT", "1");
        vault.mark_resolved("COLD", "2");
        vault.mark_touched("HOT");
        assert!(vault.is_touched("HOT"));
        assert!(!vault.is_touched("COLD"));
        vault.prune_untouched();
        assert!(vault.expression("COLD").is_none());
        assert_eq!(vault.expression("HOT").unwrap().raw, "a");
        let uses = vault.build_secret_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].site, "root/step-1/params/command");
    }

    #[test]
    fn test_build_secret_uses_end_to_end() {
        let mut vault = Vault::new();
        vault.declare_variable("T", "@env.T");
        vault.enter_step();
        vault.enter_decorator("shell");
        vault.record_reference("T", "command").unwrap();
        vault.mark_resolved("T", "tok");
        vault.mark_touched("T");
        let uses = vault.build_secret_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].site, "root/step-1/@shell[0]/params/command");
        assert!(uses[0].display_id.starts_with("opal:v:"));
        // Test mode: no plan key, so site ids are empty
        assert_eq!(uses[0].site_id, "");
    }

    #[test]
    fn test_record_reference_unknown_expression() {
        let mut vault = Vault::new();
        assert!(vault.record_reference("NOPE", "command").is_err());
    }
}
