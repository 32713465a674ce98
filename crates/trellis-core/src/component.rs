//! Component capability traits and the in-memory library.
//!
//! Concrete integrations (directory services, license management, chat
//! tools, cloud IAM) live outside the engine and register here. The action
//! executor is the only consumer. Libraries are constructed by the caller
//! and injected into each scheduler -- there is no process-wide registry.
//!
//! Traits return boxed futures so the registry can hold `dyn Component`.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use trellis_types::capability::{ComponentCategory, ComponentDescriptor};

use crate::auth::AuthManager;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by component execution.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// The component rejected its inputs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Credential assembly failed.
    #[error("auth error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// The underlying call failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// One invocation of a component.
pub struct ComponentCall<'a> {
    /// The step's resolved input map.
    pub inputs: &'a Map<String, Value>,
    /// The action step's `params` payload, passed through unresolved.
    pub config: &'a Value,
    /// Credentials for whatever external system the component talks to.
    pub auth: &'a dyn AuthManager,
}

/// An external action a step can invoke.
pub trait Component: Send + Sync {
    /// Self-description: id, category, and I/O schemas.
    fn descriptor(&self) -> &ComponentDescriptor;

    /// Execute the component with resolved inputs.
    fn execute<'a>(&'a self, call: ComponentCall<'a>) -> BoxFuture<'a, Result<Value, ComponentError>>;
}

// ---------------------------------------------------------------------------
// ComponentLibrary trait
// ---------------------------------------------------------------------------

/// Lookup and registration surface for components.
pub trait ComponentLibrary: Send + Sync {
    /// The component registered under `component_id`, if any.
    fn get(&self, component_id: &str) -> Option<Arc<dyn Component>>;

    /// Register a component under its descriptor id, replacing any previous
    /// registration.
    fn register(&self, component: Arc<dyn Component>);

    /// Descriptors of every registered component.
    fn descriptors(&self) -> Vec<ComponentDescriptor>;
}

// ---------------------------------------------------------------------------
// InMemoryComponentLibrary
// ---------------------------------------------------------------------------

/// DashMap-backed [`ComponentLibrary`], safe for concurrent use by multiple
/// in-flight steps.
pub struct InMemoryComponentLibrary {
    components: DashMap<String, Arc<dyn Component>>,
}

impl InMemoryComponentLibrary {
    pub fn new() -> Self {
        Self {
            components: DashMap::new(),
        }
    }
}

impl Default for InMemoryComponentLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentLibrary for InMemoryComponentLibrary {
    fn get(&self, component_id: &str) -> Option<Arc<dyn Component>> {
        self.components.get(component_id).map(|c| Arc::clone(&c))
    }

    fn register(&self, component: Arc<dyn Component>) {
        let id = component.descriptor().id.clone();
        tracing::debug!(component_id = id.as_str(), "registering component");
        self.components.insert(id, component);
    }

    fn descriptors(&self) -> Vec<ComponentDescriptor> {
        self.components
            .iter()
            .map(|entry| entry.descriptor().clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FnComponent
// ---------------------------------------------------------------------------

/// A component built from a plain closure.
///
/// Handy for embedding small host-side actions and for tests; real
/// integrations implement [`Component`] directly.
pub struct FnComponent<F> {
    descriptor: ComponentDescriptor,
    body: F,
}

impl<F> FnComponent<F>
where
    F: Fn(&Map<String, Value>, &Value) -> Result<Value, ComponentError> + Send + Sync,
{
    pub fn new(id: impl Into<String>, category: ComponentCategory, body: F) -> Self {
        Self {
            descriptor: ComponentDescriptor {
                id: id.into(),
                category,
                description: String::new(),
                input_schema: schemars::json_schema!({"type": "object"}),
                output_schema: schemars::json_schema!(true),
            },
            body,
        }
    }
}

impl<F> Component for FnComponent<F>
where
    F: Fn(&Map<String, Value>, &Value) -> Result<Value, ComponentError> + Send + Sync,
{
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn execute<'a>(&'a self, call: ComponentCall<'a>) -> BoxFuture<'a, Result<Value, ComponentError>> {
        Box::pin(async move { (self.body)(call.inputs, call.config) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthManager;
    use serde_json::json;

    fn echo_component() -> Arc<dyn Component> {
        Arc::new(FnComponent::new(
            "test.echo",
            ComponentCategory::Data,
            |inputs, _config| Ok(Value::Object(inputs.clone())),
        ))
    }

    #[test]
    fn register_and_get() {
        let library = InMemoryComponentLibrary::new();
        library.register(echo_component());

        assert!(library.get("test.echo").is_some());
        assert!(library.get("test.missing").is_none());
        assert_eq!(library.descriptors().len(), 1);
        assert_eq!(library.descriptors()[0].id, "test.echo");
    }

    #[test]
    fn register_replaces_existing() {
        let library = InMemoryComponentLibrary::new();
        library.register(echo_component());
        library.register(Arc::new(FnComponent::new(
            "test.echo",
            ComponentCategory::Identity,
            |_, _| Ok(json!("replaced")),
        )));
        assert_eq!(library.descriptors().len(), 1);
        assert_eq!(
            library.get("test.echo").unwrap().descriptor().category,
            ComponentCategory::Identity
        );
    }

    #[tokio::test]
    async fn fn_component_executes() {
        let component = echo_component();
        let auth = StaticAuthManager::new();
        let inputs = Map::from_iter([("user".to_string(), json!("jdoe"))]);
        let config = json!({});

        let result = component
            .execute(ComponentCall {
                inputs: &inputs,
                config: &config,
                auth: &auth,
            })
            .await
            .unwrap();
        assert_eq!(result["user"], json!("jdoe"));
    }
}
