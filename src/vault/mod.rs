//! Secret Vault with site-based access control
//!
//! The vault tracks every secret-producing expression a plan touches, the
//! canonical DAG path of every use-site, and enforces unforgeable site
//! authorization (HMAC) plus transport-boundary isolation. The paired
//! streaming scrubber redacts secret material before bytes reach the
//! terminal.

pub mod path;
pub mod scrubber;
pub mod types;
#[allow(clippy::module_inception)]
pub mod vault;

pub use path::{PathSegment, PathStack};
pub use scrubber::{LockdownGuard, Scrubber, SecretProvider, SecretSet};
pub use types::{Expression, SecretUse, SiteRef, VaultError};
pub use vault::Vault;
