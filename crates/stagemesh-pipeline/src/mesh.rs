//! Physical meshes and their lazy, memoized creation.
//!
//! Launching a mesh can be expensive, so [`MeshFactory`] creates each one on
//! first request and hands out the same handle afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use stagemesh_types::{LogicalMesh, VirtualMesh};
use tracing::info;

use crate::error::{PipelineError, Result};

// ── Contracts ─────────────────────────────────────────────────────────────────

/// A materialized device group able to run compiled stages.
pub trait PhysicalMesh: Send + Sync {
    fn num_devices(&self) -> usize;

    /// Topology the compiler should assume unless told otherwise.
    fn default_logical_mesh(&self) -> LogicalMesh;
}

/// Turns a virtual mesh into a physical one.
pub trait MeshProvisioner: Send + Sync {
    fn launch(&self, index: usize, mesh: &VirtualMesh) -> Result<Arc<dyn PhysicalMesh>>;
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Memoizing wrapper around a [`MeshProvisioner`], keyed by mesh index.
///
/// Repeated calls for the same index return the same handle without calling
/// the provisioner again.
pub struct MeshFactory {
    provisioner: Arc<dyn MeshProvisioner>,
    launched: Mutex<HashMap<usize, Arc<dyn PhysicalMesh>>>,
}

impl MeshFactory {
    pub fn new(provisioner: Arc<dyn MeshProvisioner>) -> Self {
        Self {
            provisioner,
            launched: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_launch(&self, index: usize, mesh: &VirtualMesh) -> Result<Arc<dyn PhysicalMesh>> {
        let mut launched = self.table()?;

        if let Some(existing) = launched.get(&index) {
            return Ok(Arc::clone(existing));
        }

        info!(mesh = index, devices = mesh.num_devices(), "launching physical mesh");
        let physical = self.provisioner.launch(index, mesh)?;
        launched.insert(index, Arc::clone(&physical));
        Ok(physical)
    }

    pub fn num_launched(&self) -> Result<usize> {
        Ok(self.table()?.len())
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<usize, Arc<dyn PhysicalMesh>>>> {
        self.launched
            .lock()
            .map_err(|_| PipelineError::Mesh("mesh table lock poisoned".into()))
    }
}

// ── Local (host) meshes ───────────────────────────────────────────────────────

/// Mesh that runs stages on the host. Used by the interpreter backend.
#[derive(Debug, Clone)]
pub struct LocalMesh {
    pub index: usize,
    pub virtual_mesh: VirtualMesh,
}

impl PhysicalMesh for LocalMesh {
    fn num_devices(&self) -> usize {
        self.virtual_mesh.num_devices()
    }

    fn default_logical_mesh(&self) -> LogicalMesh {
        self.virtual_mesh.default_logical_mesh()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProvisioner;

impl MeshProvisioner for LocalProvisioner {
    fn launch(&self, index: usize, mesh: &VirtualMesh) -> Result<Arc<dyn PhysicalMesh>> {
        if mesh.num_devices() == 0 {
            return Err(PipelineError::Mesh(format!("mesh {index} has no devices")));
        }
        Ok(Arc::new(LocalMesh {
            index,
            virtual_mesh: mesh.clone(),
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
