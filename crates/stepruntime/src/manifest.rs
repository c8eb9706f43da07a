use crate::error::RegistryError;
use crate::loader::RawStepDescriptor;
use serde::Deserialize;
use stepcore::{AuthSpec, ExecutionKind, HandlerRef, HttpMethod, StepDefinition, StepTrigger};
use std::path::Path;

pub const BUILTIN_PREFIX: &str = "builtin:";

/// On-disk shape of a `*.step.json` file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepManifest {
    name: Option<String>,
    description: Option<String>,
    subscribes: Option<Vec<String>>,
    path: Option<String>,
    method: Option<String>,
    interval: Option<String>,
    event_type: Option<String>,
    handler: Option<String>,
    runtime: Option<String>,
    #[serde(default)]
    emits: Vec<String>,
    #[serde(default)]
    flows: Vec<String>,
    #[serde(default)]
    config: serde_json::Value,
    auth: Option<AuthSpec>,
}

/// Parse and validate one discovered unit.
pub fn parse_descriptor(raw: &RawStepDescriptor) -> Result<StepDefinition, RegistryError> {
    let step_id = raw.id.clone();
    let manifest: StepManifest =
        serde_json::from_str(&raw.contents).map_err(|e| RegistryError::Malformed {
            step_id: step_id.clone(),
            message: e.to_string(),
        })?;

    let invalid = |message: String| RegistryError::Invalid {
        step_id: step_id.clone(),
        message,
    };
    let missing = |field: &'static str| RegistryError::MissingField {
        step_id: step_id.clone(),
        field,
    };

    let shapes = [
        manifest.subscribes.is_some(),
        manifest.path.is_some() || manifest.method.is_some(),
        manifest.interval.is_some(),
    ];
    match shapes.iter().filter(|present| **present).count() {
        0 => {
            return Err(invalid(
                "declares no trigger (expected `subscribes`, `path`+`method` or `interval`)".into(),
            ))
        }
        1 => {}
        _ => return Err(invalid("declares more than one trigger".into())),
    }

    let trigger = if let Some(subscribes) = &manifest.subscribes {
        if subscribes.is_empty() {
            return Err(invalid("`subscribes` is empty".into()));
        }
        if subscribes.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("`subscribes` contains an empty pattern".into()));
        }
        if manifest.handler.is_none() {
            return Err(missing("handler"));
        }
        StepTrigger::Event {
            subscribes: subscribes.clone(),
        }
    } else if let Some(interval) = &manifest.interval {
        let event_type = manifest
            .event_type
            .clone()
            .or_else(|| manifest.emits.first().cloned())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| missing("eventType"))?;
        StepTrigger::Schedule {
            interval: interval.clone(),
            event_type,
        }
    } else {
        let path = manifest.path.clone().ok_or_else(|| missing("path"))?;
        let method = manifest.method.as_deref().ok_or_else(|| missing("method"))?;
        let method: HttpMethod = method.parse().map_err(invalid)?;
        if !path.starts_with('/') {
            return Err(invalid(format!("path '{}' must start with '/'", path)));
        }
        if manifest.handler.is_none() {
            return Err(missing("handler"));
        }
        let event_type = manifest
            .event_type
            .clone()
            .unwrap_or_else(|| default_api_event_type(method, &path));
        StepTrigger::Api {
            method,
            path,
            event_type,
            auth: manifest.auth.clone(),
        }
    };

    if manifest.auth.is_some() && !matches!(trigger, StepTrigger::Api { .. }) {
        return Err(invalid("`auth` is only valid on API steps".into()));
    }

    let (handler, execution, language_runtime) = match manifest.handler.as_deref() {
        None => (None, ExecutionKind::InProcess, None),
        Some(reference) => {
            if let Some(name) = reference.strip_prefix(BUILTIN_PREFIX) {
                if name.is_empty() {
                    return Err(invalid("builtin handler name is empty".into()));
                }
                (
                    Some(HandlerRef::Builtin(name.to_string())),
                    ExecutionKind::InProcess,
                    None,
                )
            } else {
                let file = raw.base_dir.join(reference);
                if !file.is_file() {
                    return Err(invalid(format!("handler file {} not found", file.display())));
                }
                let runtime = manifest
                    .runtime
                    .clone()
                    .or_else(|| infer_runtime(&file))
                    .ok_or_else(|| {
                        invalid(format!(
                            "cannot infer runtime for {}; set `runtime`",
                            file.display()
                        ))
                    })?;
                (
                    Some(HandlerRef::File(file)),
                    ExecutionKind::OutOfProcess,
                    Some(runtime),
                )
            }
        }
    };

    let config = if manifest.config.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        manifest.config
    };

    Ok(StepDefinition {
        id: step_id,
        name: manifest.name,
        description: manifest.description,
        source: raw.manifest_path.clone(),
        trigger,
        emits: manifest.emits.into_iter().collect(),
        flows: manifest.flows.into_iter().collect(),
        handler,
        execution,
        language_runtime,
        config,
    })
}

/// `POST /orders/:id` -> `api.post.orders.id`
pub fn default_api_event_type(method: HttpMethod, path: &str) -> String {
    let mut parts = vec!["api".to_string(), method.as_str().to_ascii_lowercase()];
    parts.extend(
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_start_matches(':').to_string()),
    );
    parts.join(".")
}

/// Language runtime implied by a handler's file extension.
pub fn infer_runtime(file: &Path) -> Option<String> {
    let runtime = match file.extension()?.to_str()? {
        "py" => "python",
        "js" | "mjs" | "cjs" => "node",
        "rb" => "ruby",
        "sh" => "sh",
        _ => return None,
    };
    Some(runtime.to_string())
}
