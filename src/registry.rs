//! Handler registry
//!
//! A concurrent mapping from destination patterns (regular expressions) to
//! user-supplied handlers. Lookups take a shared lock and return the first
//! entry whose compiled pattern matches the destination; mutations take an
//! exclusive lock. Entries are keyed by the original pattern string so a
//! handler can be removed by the exact pattern it was registered under.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;

use crate::errors::RegistryError;
use crate::wrp::Message;

// ----------------------------------------------------------------------------
// Downstream Handler Trait
// ----------------------------------------------------------------------------

/// Implemented by the user so that they may deal with received messages how
/// they please.
///
/// Handlers run on pipeline worker tasks; the agent imposes no timeout around
/// them, so a handler that never returns occupies a worker slot until the
/// client closes.
#[async_trait]
pub trait DownstreamHandler: Send + Sync {
    /// Handle one inbound message. A returned message is sent back upstream.
    async fn handle_message(&self, message: Message) -> Option<Message>;

    /// Called exactly once when the registry shuts down.
    async fn close(&self);
}

/// A destination pattern paired with the handler that should receive matching
/// messages.
pub struct HandlerConfig {
    pub pattern: String,
    pub handler: Arc<dyn DownstreamHandler>,
}

struct HandlerEntry {
    pattern: Regex,
    handler: Arc<dyn DownstreamHandler>,
}

// ----------------------------------------------------------------------------
// Handler Registry
// ----------------------------------------------------------------------------

/// Registry of destination patterns to handlers, shared between the client
/// owner and the routing stage. Mutations take effect for the next lookup.
#[derive(Clone)]
pub struct HandlerRegistry {
    store: Arc<RwLock<HashMap<String, HandlerEntry>>>,
}

impl HandlerRegistry {
    /// Build a registry from the initial handler set.
    ///
    /// The constructor is permissive: entries whose pattern fails to compile
    /// are skipped and reported in the returned error list while the valid
    /// entries still populate the registry.
    pub fn new(configs: Vec<HandlerConfig>) -> (Self, Vec<RegistryError>) {
        let mut store = HashMap::new();
        let mut errors = Vec::new();
        for config in configs {
            match Regex::new(&config.pattern) {
                Ok(pattern) => {
                    store.insert(
                        config.pattern,
                        HandlerEntry {
                            pattern,
                            handler: config.handler,
                        },
                    );
                }
                Err(source) => errors.push(RegistryError::BadPattern {
                    pattern: config.pattern,
                    source,
                }),
            }
        }
        (
            Self {
                store: Arc::new(RwLock::new(store)),
            },
            errors,
        )
    }

    /// Register a handler for a destination pattern, replacing any handler
    /// already registered under the same pattern string.
    pub async fn add(
        &self,
        pattern: &str,
        handler: Arc<dyn DownstreamHandler>,
    ) -> Result<(), RegistryError> {
        let compiled = Regex::new(pattern).map_err(|source| RegistryError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.store.write().await.insert(
            pattern.to_string(),
            HandlerEntry {
                pattern: compiled,
                handler,
            },
        );
        Ok(())
    }

    /// Remove the handler registered under the exact pattern string, if any.
    pub async fn remove(&self, pattern: &str) {
        self.store.write().await.remove(pattern);
    }

    /// Find a handler whose pattern matches the destination.
    ///
    /// When several patterns match, which handler is returned is unspecified;
    /// callers that care should register non-overlapping patterns.
    pub async fn get_handler(
        &self,
        destination: &str,
    ) -> Result<Arc<dyn DownstreamHandler>, RegistryError> {
        let store = self.store.read().await;
        for entry in store.values() {
            if entry.pattern.is_match(destination) {
                return Ok(Arc::clone(&entry.handler));
            }
        }
        Err(RegistryError::NoDownstreamHandler)
    }

    /// Run every handler's close hook and empty the registry.
    pub async fn close(&self) {
        let mut store = self.store.write().await;
        for (_, entry) in store.drain() {
            entry.handler.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.store.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl DownstreamHandler for CountingHandler {
        async fn handle_message(&self, _message: Message) -> Option<Message> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            None
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(pattern: &str, handler: Arc<CountingHandler>) -> HandlerConfig {
        HandlerConfig {
            pattern: pattern.to_string(),
            handler,
        }
    }

    #[tokio::test]
    async fn lookup_returns_a_matching_handler() {
        let handler = Arc::new(CountingHandler::default());
        let (registry, errors) = HandlerRegistry::new(vec![config("/bar", handler)]);
        assert!(errors.is_empty());

        assert!(registry.get_handler("/bar").await.is_ok());
        assert!(registry.get_handler("/bar/baz").await.is_ok());
    }

    #[tokio::test]
    async fn lookup_without_a_match_reports_no_downstream_handler() {
        let handler = Arc::new(CountingHandler::default());
        let (registry, _) = HandlerRegistry::new(vec![config("/foo", handler)]);

        assert!(matches!(
            registry.get_handler("/bar").await,
            Err(RegistryError::NoDownstreamHandler)
        ));
    }

    #[tokio::test]
    async fn bad_patterns_are_reported_but_do_not_poison_the_registry() {
        let good = Arc::new(CountingHandler::default());
        let bad = Arc::new(CountingHandler::default());
        let (registry, errors) =
            HandlerRegistry::new(vec![config("/good", good), config("*(broken", bad)]);

        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], RegistryError::BadPattern { .. }));
        assert_eq!(registry.len().await, 1);
        assert!(registry.get_handler("/good").await.is_ok());
    }

    #[tokio::test]
    async fn add_replaces_by_pattern_string_and_remove_deletes() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let (registry, _) = HandlerRegistry::new(Vec::new());

        registry
            .add("/dev", first)
            .await
            .expect("pattern should compile");
        registry
            .add("/dev", second)
            .await
            .expect("pattern should compile");
        assert_eq!(registry.len().await, 1);

        registry.remove("/dev").await;
        assert_eq!(registry.len().await, 0);
        assert!(registry.get_handler("/dev").await.is_err());
    }

    #[tokio::test]
    async fn add_rejects_an_invalid_pattern() {
        let handler = Arc::new(CountingHandler::default());
        let (registry, _) = HandlerRegistry::new(Vec::new());
        assert!(registry.add("*(broken", handler).await.is_err());
    }

    #[tokio::test]
    async fn close_runs_each_close_hook_once_and_empties_the_map() {
        let foo = Arc::new(CountingHandler::default());
        let bar = Arc::new(CountingHandler::default());
        let (registry, _) = HandlerRegistry::new(vec![
            config("/foo", Arc::clone(&foo)),
            config("/bar", Arc::clone(&bar)),
        ]);

        registry.close().await;
        registry.close().await;

        assert_eq!(foo.closed.load(Ordering::SeqCst), 1);
        assert_eq!(bar.closed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 0);
    }
}
