//! Pending HTTP-01 challenges, shared between the solver and the redirect listener

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token to key-authorization map.
///
/// Cloning is cheap and every clone sees the same entries, so the solver
/// registers tokens on one clone while the redirect listener answers from
/// another.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Key authorization for `token`, if one is pending
    pub fn get_response(&self, token: &str) -> Option<String> {
        let response = self.challenges.get(token).map(|v| v.value().clone());
        trace!(token = %token, found = response.is_some(), "ACME challenge lookup");
        response
    }

    /// Token part of a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }

    /// Start a registration scope whose tokens are removed when it drops
    pub fn registration(&self) -> ChallengeRegistration {
        ChallengeRegistration {
            manager: self.clone(),
            tokens: Vec::new(),
        }
    }
}

/// Tokens registered during one order.
///
/// Dropping it unregisters every token it added, on success, failure,
/// timeout or cancellation alike.
#[derive(Debug)]
pub struct ChallengeRegistration {
    manager: ChallengeManager,
    tokens: Vec<String>,
}

impl ChallengeRegistration {
    pub fn add(&mut self, token: &str, key_authorization: &str) {
        self.manager.add_challenge(token, key_authorization);
        self.tokens.push(token.to_string());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Drop for ChallengeRegistration {
    fn drop(&mut self) {
        for token in self.tokens.drain(..) {
            self.manager.remove_challenge(&token);
        }
    }
}
