//! Vault entities and error types.

use serde::Serialize;
use thiserror::Error;

/// A secret-producing expression: a declared variable, a direct value
/// decorator call, or a nested composition. One entry per unique
/// expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    /// Canonical source form of the expression
    pub raw: String,
    /// Resolved value; None until `mark_resolved`
    pub value: Option<String>,
    /// Public identifier, doubles as the scrub placeholder
    pub display_id: String,
    pub resolved: bool,
}

/// One recorded use-site for an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRef {
    /// Canonical DAG path, human-readable
    pub site: String,
    /// HMAC-based unforgeable identifier; empty without a plan key
    pub site_id: String,
    pub param_name: String,
}

/// Authorization entry in the emitted plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretUse {
    pub display_id: String,
    pub site_id: String,
    pub site: String,
}

/// Authorization and lifecycle errors surfaced to the planner. Invariant
/// violations (double resolve, missing transport entry) are programmer
/// errors and panic instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("expression '{expr_id}' is not resolved")]
    Unresolved { expr_id: String },
    #[error("no authority for expression '{expr_id}' at site '{site}'")]
    NoAuthority { expr_id: String, site: String },
    #[error(
        "transport boundary: expression '{expr_id}' was resolved in '{resolved_in}' and cannot be accessed from '{current}'"
    )]
    TransportBoundary {
        expr_id: String,
        resolved_in: String,
        current: String,
    },
}

/// Lowercase hex of a byte slice.
pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Uppercase hex of a byte slice.
pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(hex_lower(&[0x00, 0xff, 0x3a]), "00ff3a");
        assert_eq!(hex_upper(&[0x00, 0xff, 0x3a]), "00FF3A");
    }

    #[test]
    fn test_secret_use_wire_shape() {
        let use_ = SecretUse {
            display_id: "opal:v:3fa9c1d2".to_string(),
            site_id: "abc".to_string(),
            site: "root/step-1/@shell[0]/params/command".to_string(),
        };
        let json = serde_json::to_value(&use_).unwrap();
        assert_eq!(json["display_id"], "opal:v:3fa9c1d2");
        assert_eq!(json["site_id"], "abc");
        assert_eq!(json["site"], "root/step-1/@shell[0]/params/command");
    }
}
