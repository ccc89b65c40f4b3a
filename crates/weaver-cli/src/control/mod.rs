//! Multi-workflow control plane: registry, supervisor, event bus and the
//! local API server.

pub mod api;
pub mod events;
pub mod plane;
pub mod provider;
pub mod registry;
pub mod supervisor;

pub use api::{ApiServer, CreateWorkflowRequest, StaticTemplates, TemplateInfo, TemplateSource, WorkflowCreator};
pub use events::ControlEvent;
pub use plane::{ControlPlane, ControlPlaneConfig, ControlPlaneError};
pub use provider::AgentProvider;
pub use registry::{InMemoryRegistry, Registry, RegistryError, SqliteRegistry, WorkflowRecord, project_key};
pub use supervisor::{Supervisor, SupervisorError, WorkflowRuntime};
