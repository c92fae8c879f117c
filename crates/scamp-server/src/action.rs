//! Action handlers and the name → handler table.

use futures_util::future::BoxFuture;
use scamp_core::{Request, Session};
use std::collections::HashMap;
use std::sync::Arc;

/// A registered handler. It receives the request and the session it arrived
/// on, and is expected to send exactly one reply through the session.
pub type ServiceAction =
    Arc<dyn for<'a> Fn(Request, &'a mut Session) -> BoxFuture<'a, ()> + Send + Sync>;

/// Handlers keyed by action name.
#[derive(Clone, Default)]
pub struct ActionTable {
    actions: HashMap<String, ServiceAction>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler, returning the one it replaced.
    pub fn insert(&mut self, name: impl Into<String>, action: ServiceAction) -> Option<ServiceAction> {
        self.actions.insert(name.into(), action)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceAction> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Box a handler closure into a [`ServiceAction`].
pub fn action<F>(f: F) -> ServiceAction
where
    F: for<'a> Fn(Request, &'a mut Session) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}
