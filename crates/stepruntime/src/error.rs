use std::path::PathBuf;
use thiserror::Error;

/// Problems with individual step units. Never fatal to a whole load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("cannot read step source {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("step '{step_id}': malformed manifest: {message}")]
    Malformed { step_id: String, message: String },

    #[error("step '{step_id}': missing required field '{field}'")]
    MissingField { step_id: String, field: &'static str },

    #[error("step '{step_id}': {message}")]
    Invalid { step_id: String, message: String },

    #[error("step '{step_id}': route {route} already registered by '{existing}'")]
    RouteConflict {
        step_id: String,
        route: String,
        existing: String,
    },

    #[error("step '{step_id}': id already registered from {existing}")]
    DuplicateStep { step_id: String, existing: PathBuf },

    #[error("step '{step_id}': no handler factory '{factory}'")]
    UnknownHandler { step_id: String, factory: String },

    #[error("step '{step_id}': handler could not be created: {message}")]
    HandlerCreation { step_id: String, message: String },
}

impl RegistryError {
    /// Step id (or source path) the problem is attributed to.
    pub fn unit(&self) -> String {
        match self {
            RegistryError::Unreadable { path, .. } => path.display().to_string(),
            RegistryError::Malformed { step_id, .. }
            | RegistryError::MissingField { step_id, .. }
            | RegistryError::Invalid { step_id, .. }
            | RegistryError::RouteConflict { step_id, .. }
            | RegistryError::DuplicateStep { step_id, .. }
            | RegistryError::UnknownHandler { step_id, .. }
            | RegistryError::HandlerCreation { step_id, .. } => step_id.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] crate::scheduler::ScheduleError),

    #[error("Step error: {0}")]
    Step(#[from] stepcore::StepError),

    #[error("Runtime is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
