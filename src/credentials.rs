//! Access-credential checks against an external directory.
//!
//! Every decrypted frame carries a credential and is validated here, not
//! only at handshake time.

use std::collections::HashSet;

pub trait CredentialDirectory: Send + Sync {
    fn is_valid(&self, credential: &str) -> bool;
}

/// Fixed credential set from configuration. With `require_credentials`
/// off, everything passes.
pub struct StaticCredentials {
    keys: HashSet<String>,
    require: bool,
}

impl StaticCredentials {
    pub fn new(keys: impl IntoIterator<Item = String>, require: bool) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            require,
        }
    }
}

impl CredentialDirectory for StaticCredentials {
    fn is_valid(&self, credential: &str) -> bool {
        if !self.require {
            return true;
        }
        !credential.is_empty() && self.keys.contains(credential)
    }
}
