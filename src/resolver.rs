/// Command resolver boundary
///
/// Maps a recognized utterance to exactly one reply utterance. The remote
/// transport is external; the static table resolver backs the console binary.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

/// Resolver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Command service unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Command failed: {0}")]
    Failed(String),
}

/// Single request/response channel, no built-in retry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandResolver: Send + Sync {
    async fn resolve(&self, request: &str) -> Result<String, ResolverError>;
}

/// Resolver backed by a fixed utterance → reply table
#[derive(Debug, Clone, Default)]
pub struct StaticCommandResolver {
    replies: HashMap<String, String>,
}

impl StaticCommandResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: &BTreeMap<String, String>) -> Self {
        let mut resolver = Self::new();
        for (command, reply) in table {
            resolver.add(command, reply);
        }
        resolver
    }

    pub fn add(&mut self, command: &str, reply: &str) {
        self.replies.insert(normalize(command), reply.to_string());
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

#[async_trait]
impl CommandResolver for StaticCommandResolver {
    async fn resolve(&self, request: &str) -> Result<String, ResolverError> {
        let key = normalize(request);
        debug!("Resolving command '{}'", key);

        self.replies
            .get(&key)
            .cloned()
            .ok_or(ResolverError::UnknownCommand(key))
    }
}

/// Lowercase, single-spaced form used as table key
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_lookup() {
        let mut resolver = StaticCommandResolver::new();
        resolver.add("turn on lights", "lights on");

        assert_eq!(resolver.resolve("turn on lights").await.unwrap(), "lights on");
        assert_eq!(resolver.resolve("  Turn  ON lights ").await.unwrap(), "lights on");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let resolver = StaticCommandResolver::new();
        let err = resolver.resolve("dance").await.unwrap_err();
        assert_eq!(err, ResolverError::UnknownCommand("dance".to_string()));
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_from_table() {
        let mut table = BTreeMap::new();
        table.insert("Hello".to_string(), "hello human".to_string());
        table.insert("stop".to_string(), "stopping".to_string());

        let resolver = StaticCommandResolver::from_table(&table);
        assert_eq!(resolver.len(), 2);
    }
}
