//! Data Model
//!
//! The entities the plan execution core manipulates. Everything here is
//! serde-serializable; persistence lives in `storage`.

pub mod context;
pub mod convo;
pub mod plan;
pub mod request;
pub mod result;
pub mod settings;
pub mod subtask;

pub use context::{Context, ContextType};
pub use convo::{
    ConvoMessage, ConvoMessageDescription, ConvoMessageFlags, ConvoSummary, CurrentStage,
    PlanningPhase, ReplyType, TellStage, ROLE_ASSISTANT, ROLE_USER,
};
pub use plan::{Branch, Plan, PlanStatus};
pub use request::{BuildMode, TellRequest};
pub use result::{PlanBuild, PlanFileResult, Replacement};
pub use settings::{ModelPack, ModelRoleConfig, PlanSettings};
pub use subtask::Subtask;
