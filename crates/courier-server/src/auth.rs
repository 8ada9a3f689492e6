//! Client token validation.
//!
//! Identity is established by an external validator; the node only needs
//! the user behind a token. The static table from `[auth]` is the default.

use crate::config::AuthConfig;
use std::collections::HashMap;

/// Identity attached to an accepted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub user_id: String,
}

/// Maps a connect token to an identity.
pub trait TokenValidator: Send + Sync {
    /// `None` if the token is not accepted.
    fn validate(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    Identity {
                        client_id: entry.client_id.clone(),
                        user_id: entry.user_id.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenEntry;

    #[test]
    fn test_static_tokens() {
        let tokens = StaticTokens::from_config(&AuthConfig {
            tokens: vec![TokenEntry {
                token: "t1".into(),
                client_id: "web".into(),
                user_id: "u1".into(),
            }],
        });

        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.validate("t1").unwrap().user_id, "u1");
        assert!(tokens.validate("t2").is_none());
        assert!(tokens.validate("").is_none());
    }
}
