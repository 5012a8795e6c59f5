pub mod config;
pub mod error;
pub mod mesh;
pub mod plan;
pub mod tensor;

pub use config::PipelineConfig;
pub use error::{Result, TypesError};
pub use mesh::{LogicalMesh, VirtualMesh};
pub use plan::{PipelinePlan, StagePlan, TaskSlot};
pub use tensor::Tensor;
