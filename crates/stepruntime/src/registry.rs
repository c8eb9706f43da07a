use crate::error::RegistryError;
use crate::http_trigger::Authorizer;
use crate::loader::StepSource;
use crate::manifest::parse_descriptor;
use stepcore::{Flow, HandlerRef, HttpMethod, StepDefinition, StepError, StepHandler, StepTrigger};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Factory key that out-of-process steps resolve to.
pub const PROCESS_FACTORY: &str = "process";

/// Factory trait for creating step handlers
pub trait HandlerFactory: Send + Sync {
    /// Create the handler instance bound to one step definition
    fn create(&self, step: &StepDefinition) -> Result<Arc<dyn StepHandler>, StepError>;

    /// Name manifests refer to (`builtin:<name>`), or [`PROCESS_FACTORY`]
    fn name(&self) -> &str;

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::default()
    }
}

/// Metadata about a handler type
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub description: String,
    pub category: String,
}

impl Default for HandlerMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of available handler implementations and named authorizers
pub struct HandlerRegistry {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
    authorizers: HashMap<String, Arc<dyn Authorizer>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            authorizers: HashMap::new(),
        }
    }

    /// Register a handler factory
    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) {
        let name = factory.name().to_string();
        tracing::info!("Registering handler type: {}", name);
        self.factories.insert(name, factory);
    }

    pub fn register_authorizer(&mut self, name: impl Into<String>, authorizer: Arc<dyn Authorizer>) {
        self.authorizers.insert(name.into(), authorizer);
    }

    pub fn authorizer(&self, name: &str) -> Option<Arc<dyn Authorizer>> {
        self.authorizers.get(name).cloned()
    }

    /// Create the handler for a step; `None` when the step declares none.
    pub fn create_handler(
        &self,
        step: &StepDefinition,
    ) -> Result<Option<Arc<dyn StepHandler>>, RegistryError> {
        let key = match &step.handler {
            None => return Ok(None),
            Some(HandlerRef::Builtin(name)) => name.as_str(),
            Some(HandlerRef::File(_)) => PROCESS_FACTORY,
        };

        let factory = self.factories.get(key).ok_or_else(|| RegistryError::UnknownHandler {
            step_id: step.id.clone(),
            factory: key.to_string(),
        })?;

        factory
            .create(step)
            .map(Some)
            .map_err(|e| RegistryError::HandlerCreation {
                step_id: step.id.clone(),
                message: e.to_string(),
            })
    }

    /// Get all registered handler types
    pub fn list_handler_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get metadata for a handler type
    pub fn get_metadata(&self, name: &str) -> Option<HandlerMetadata> {
        self.factories.get(name).map(|f| f.metadata())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Externally routable identity of an API step: method plus path shape.
///
/// Parameter names do not matter: `/orders/:id` and `/orders/:orderId` collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub method: HttpMethod,
    pub shape: String,
}

impl RouteKey {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            shape: normalize_route(path),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.shape)
    }
}

pub fn normalize_route(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| if s.starts_with(':') { ":" } else { s })
        .collect();
    format!("/{}", segments.join("/"))
}

/// Match a request path against a declared route path, capturing `:name` segments.
pub fn match_path(route: &str, path: &str) -> Option<BTreeMap<String, String>> {
    let expected: Vec<&str> = route.split('/').filter(|s| !s.is_empty()).collect();
    let actual: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if expected.len() != actual.len() {
        return None;
    }

    let mut params = BTreeMap::new();
    for (want, got) in expected.iter().zip(actual) {
        match want.strip_prefix(':') {
            Some(name) => {
                params.insert(name.to_string(), got.to_string());
            }
            None if *want == got => {}
            None => return None,
        }
    }
    Some(params)
}

/// One flag per segment, `true` for a literal. Compares lexicographically.
fn route_specificity(route: &str) -> Vec<bool> {
    route
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| !s.starts_with(':'))
        .collect()
}

/// Immutable set of loaded step definitions plus the flow index.
///
/// Built once per load; a reload builds a new one and swaps it in whole.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Arc<StepDefinition>>,
    index: HashMap<String, usize>,
    routes: BTreeMap<RouteKey, String>,
    flows: BTreeMap<String, Flow>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Discover, parse and register steps. Broken units are skipped and returned.
    pub fn load(source: &dyn StepSource, roots: &[PathBuf]) -> (Self, Vec<RegistryError>) {
        let mut skipped = Vec::new();
        let mut definitions = Vec::new();

        for unit in source.discover(roots) {
            match unit.and_then(|raw| parse_descriptor(&raw)) {
                Ok(definition) => definitions.push(definition),
                Err(e) => {
                    tracing::warn!(unit = %e.unit(), error = %e, "Skipping step");
                    skipped.push(e);
                }
            }
        }

        let (registry, rejected) = Self::build(definitions);
        skipped.extend(rejected);
        (registry, skipped)
    }

    /// Register definitions in order; later conflicting ones are rejected.
    pub fn build(definitions: Vec<StepDefinition>) -> (Self, Vec<RegistryError>) {
        let mut registry = Self::empty();
        let mut rejected = Vec::new();

        for definition in definitions {
            if let Err(e) = registry.insert(definition) {
                tracing::warn!(unit = %e.unit(), error = %e, "Rejecting step registration");
                rejected.push(e);
            }
        }

        (registry, rejected)
    }

    fn insert(&mut self, definition: StepDefinition) -> Result<(), RegistryError> {
        if let Some(&existing) = self.index.get(&definition.id) {
            return Err(RegistryError::DuplicateStep {
                step_id: definition.id,
                existing: self.steps[existing].source.clone(),
            });
        }

        if let StepTrigger::Api { method, path, .. } = &definition.trigger {
            let key = RouteKey::new(*method, path);
            if let Some(existing) = self.routes.get(&key) {
                return Err(RegistryError::RouteConflict {
                    step_id: definition.id,
                    route: key.to_string(),
                    existing: existing.clone(),
                });
            }
            self.routes.insert(key, definition.id.clone());
        }

        for flow in &definition.flows {
            self.flows
                .entry(flow.clone())
                .or_insert_with(|| Flow {
                    name: flow.clone(),
                    steps: Vec::new(),
                })
                .steps
                .push(definition.id.clone());
        }

        tracing::debug!(step_id = %definition.id, trigger = definition.trigger.label(), "Registered step");
        self.index.insert(definition.id.clone(), self.steps.len());
        self.steps.push(Arc::new(definition));
        Ok(())
    }

    pub fn steps(&self) -> &[Arc<StepDefinition>] {
        &self.steps
    }

    pub fn get(&self, step_id: &str) -> Option<&Arc<StepDefinition>> {
        self.index.get(step_id).map(|&i| &self.steps[i])
    }

    pub fn schedules(&self) -> impl Iterator<Item = &Arc<StepDefinition>> {
        self.steps
            .iter()
            .filter(|s| matches!(s.trigger, StepTrigger::Schedule { .. }))
    }

    pub fn api_steps(&self) -> impl Iterator<Item = &Arc<StepDefinition>> {
        self.steps
            .iter()
            .filter(|s| matches!(s.trigger, StepTrigger::Api { .. }))
    }

    pub fn routes(&self) -> &BTreeMap<RouteKey, String> {
        &self.routes
    }

    /// API step serving `method path`, with the captured path parameters.
    ///
    /// When several routes match, the one with literal segments earliest wins:
    /// `/orders/list` beats `/orders/:id` regardless of load order.
    pub fn route(&self, method: HttpMethod, path: &str) -> Option<(&Arc<StepDefinition>, BTreeMap<String, String>)> {
        self.api_steps()
            .filter_map(|step| match &step.trigger {
                StepTrigger::Api { method: m, path: route, .. } if *m == method => {
                    match_path(route, path).map(|params| (route_specificity(route), step, params))
                }
                _ => None,
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, step, params)| (step, params))
    }

    pub fn flows(&self) -> &BTreeMap<String, Flow> {
        &self.flows
    }

    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.get(name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticStepSource;

    fn load(source: StaticStepSource) -> (StepRegistry, Vec<RegistryError>) {
        StepRegistry::load(&source, &[])
    }

    #[test]
    fn duplicate_route_keeps_first_registration() {
        let source = StaticStepSource::new()
            .with_unit("a", "/x", r#"{"path": "/orders/:id", "method": "GET", "handler": "builtin:log"}"#)
            .with_unit("b", "/x", r#"{"path": "/orders/:orderId/", "method": "get", "handler": "builtin:log"}"#)
            .with_unit("c", "/x", r#"{"path": "/orders/:id", "method": "DELETE", "handler": "builtin:log"}"#);

        let (registry, skipped) = load(source);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_some());
        assert_eq!(
            skipped,
            vec![RegistryError::RouteConflict {
                step_id: "b".into(),
                route: "GET /orders/:".into(),
                existing: "a".into(),
            }]
        );
    }

    #[test]
    fn routes_capture_path_params() {
        let (registry, _) = load(
            StaticStepSource::new()
                .with_unit("list", "/x", r#"{"path": "/orders", "method": "GET", "handler": "builtin:log"}"#)
                .with_unit("one", "/x", r#"{"path": "/orders/:id", "method": "GET", "handler": "builtin:log"}"#),
        );

        let (step, params) = registry.route(HttpMethod::Get, "/orders/42/").unwrap();
        assert_eq!(step.id, "one");
        assert_eq!(params.get("id").map(String::as_str), Some("42"));

        assert_eq!(registry.route(HttpMethod::Get, "/orders").unwrap().0.id, "list");
        assert!(registry.route(HttpMethod::Post, "/orders").is_none());
        assert!(registry.route(HttpMethod::Get, "/orders/42/items").is_none());
    }

    #[test]
    fn literal_segments_win_over_params_in_any_load_order() {
        let (registry, skipped) = load(
            StaticStepSource::new()
                .with_unit("by-id", "/x", r#"{"path": "/orders/:id", "method": "GET", "handler": "builtin:log"}"#)
                .with_unit("listing", "/x", r#"{"path": "/orders/list", "method": "GET", "handler": "builtin:log"}"#)
                .with_unit("items", "/x", r#"{"path": "/orders/:id/items", "method": "GET", "handler": "builtin:log"}"#)
                .with_unit("first-items", "/x", r#"{"path": "/orders/first/:part", "method": "GET", "handler": "builtin:log"}"#),
        );
        assert!(skipped.is_empty());

        assert_eq!(registry.route(HttpMethod::Get, "/orders/list").unwrap().0.id, "listing");
        assert_eq!(registry.route(HttpMethod::Get, "/orders/7").unwrap().0.id, "by-id");
        assert_eq!(registry.route(HttpMethod::Get, "/orders/7/items").unwrap().0.id, "items");
        assert_eq!(registry.route(HttpMethod::Get, "/orders/first/items").unwrap().0.id, "first-items");
    }

    #[test]
    fn malformed_units_are_skipped_not_fatal() {
        let source = StaticStepSource::new()
            .with_unit("good", "/x", r#"{"subscribes": ["a.*"], "handler": "builtin:log", "flows": ["f"]}"#)
            .with_unit("broken", "/x", "{")
            .with_unit("incomplete", "/x", r#"{"subscribes": ["a.*"]}"#);

        let (registry, skipped) = load(source);

        assert_eq!(registry.len(), 1);
        assert_eq!(skipped.len(), 2);
        assert_eq!(registry.flow("f").unwrap().steps, vec!["good".to_string()]);
    }

    #[test]
    fn handler_registry_reports_unknown_factory() {
        let (registry, _) = load(StaticStepSource::new().with_unit(
            "a",
            "/x",
            r#"{"subscribes": ["a"], "handler": "builtin:nope"}"#,
        ));
        let handlers = HandlerRegistry::new();

        let err = handlers.create_handler(registry.get("a").unwrap()).err().unwrap();
        assert_eq!(
            err,
            RegistryError::UnknownHandler {
                step_id: "a".into(),
                factory: "nope".into()
            }
        );
    }
}
