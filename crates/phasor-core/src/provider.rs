//! Capability providers: the seam between the orchestrator and the outside
//! world.
//!
//! A provider exposes named actions the orchestrator invokes on behalf of a
//! phase. The trait is dyn-compatible so heterogeneous providers can share a
//! registry; async methods return boxed futures by hand instead of using
//! `async fn` in the trait.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use phasor_types::error::ProviderError;
use phasor_types::workflow::ClassifiedTask;
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Everything a provider gets to see about the invocation it is serving.
///
/// `prior_results` carries the accumulated outputs of phases that completed
/// before this one, keyed by phase ID.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub phase_id: String,
    pub task_description: String,
    pub prior_results: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Boxed future type returned by provider methods.
pub type BoxedResult<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// A capability the orchestrator can invoke during phase execution.
pub trait CapabilityProvider: Send + Sync {
    /// Stable identifier referenced by workflow definitions.
    fn id(&self) -> &str;

    /// Whether the provider can currently serve invocations.
    fn is_available(&self) -> bool {
        true
    }

    /// Run one action. The returned value is merged into the phase output.
    fn invoke(&self, action_id: &str, ctx: InvocationContext) -> BoxedResult<'_, Value>;

    /// Capture provider state for a checkpoint. Providers without
    /// revertible state return `Value::Null`.
    fn snapshot(&self) -> BoxedResult<'_, Value> {
        Box::pin(async { Ok(Value::Null) })
    }

    /// Restore provider state from a checkpoint snapshot.
    fn revert(&self, _snapshot: &Value) -> BoxedResult<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl std::fmt::Debug for dyn CapabilityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityProvider")
            .field("id", &self.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Availability probe
// ---------------------------------------------------------------------------

/// Read-only availability view used by the matcher and prerequisite check.
pub trait AvailabilityProbe: Send + Sync {
    fn is_capability_available(&self, provider_id: &str) -> bool;
    fn is_service_available(&self, service_id: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of capability providers and connected external services.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CapabilityProvider>>,
    services: HashSet<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own ID. Re-registering replaces the
    /// previous entry.
    pub fn register(&mut self, provider: Arc<dyn CapabilityProvider>) {
        let id = provider.id().to_string();
        tracing::debug!(provider = id.as_str(), "registering capability provider");
        self.providers.insert(id, provider);
    }

    /// Mark an external service as connected.
    pub fn register_service(&mut self, service_id: impl Into<String>) {
        self.services.insert(service_id.into());
    }

    /// Look up a provider, requiring it to be registered *and* available.
    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn CapabilityProvider>, ProviderError> {
        match self.providers.get(provider_id) {
            Some(p) if p.is_available() => Ok(Arc::clone(p)),
            Some(_) => Err(ProviderError::Unavailable(format!(
                "provider '{provider_id}' is registered but not available"
            ))),
            None => Err(ProviderError::Unavailable(format!(
                "no provider registered with ID '{provider_id}'"
            ))),
        }
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

impl AvailabilityProbe for ProviderRegistry {
    fn is_capability_available(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .is_some_and(|p| p.is_available())
    }

    fn is_service_available(&self, service_id: &str) -> bool {
        self.services.contains(service_id)
    }
}

// ---------------------------------------------------------------------------
// Task classification
// ---------------------------------------------------------------------------

/// Turns a free-form task description into the structured form the matcher
/// scores against. Implementations live outside core.
pub trait TaskClassifier: Send + Sync {
    fn classify<'a>(
        &'a self,
        description: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ClassifiedTask, ProviderError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoProvider {
        id: String,
        available: AtomicBool,
    }

    impl EchoProvider {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                available: AtomicBool::new(true),
            }
        }
    }

    impl CapabilityProvider for EchoProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn invoke(&self, action_id: &str, ctx: InvocationContext) -> BoxedResult<'_, Value> {
            let action = action_id.to_string();
            Box::pin(async move {
                Ok(serde_json::json!({
                    "action": action,
                    "phase": ctx.phase_id,
                }))
            })
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            run_id: Uuid::now_v7(),
            workflow_name: "wf".to_string(),
            phase_id: "build".to_string(),
            task_description: "build the thing".to_string(),
            prior_results: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn registered_provider_invokes() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EchoProvider::new("echo")));

        let provider = registry.get("echo").unwrap();
        let out = provider.invoke("say", ctx()).await.unwrap();
        assert_eq!(out["action"], "say");
        assert_eq!(out["phase"], "build");
    }

    #[test]
    fn unknown_provider_is_unavailable() {
        let registry = ProviderRegistry::new();
        let err = registry.get("ghost").unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn registered_but_down_provider_is_unavailable() {
        let provider = Arc::new(EchoProvider::new("flaky"));
        provider.available.store(false, Ordering::SeqCst);

        let mut registry = ProviderRegistry::new();
        registry.register(provider);

        assert!(registry.get("flaky").is_err());
        assert!(!registry.is_capability_available("flaky"));
    }

    #[test]
    fn service_availability_tracks_registration() {
        let mut registry = ProviderRegistry::new();
        assert!(!registry.is_service_available("issue-tracker"));
        registry.register_service("issue-tracker");
        assert!(registry.is_service_available("issue-tracker"));
    }

    #[tokio::test]
    async fn default_snapshot_is_null_and_revert_is_noop() {
        let provider = EchoProvider::new("echo");
        assert_eq!(provider.snapshot().await.unwrap(), Value::Null);
        provider.revert(&Value::Null).await.unwrap();
    }
}
