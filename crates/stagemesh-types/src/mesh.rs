// Device-mesh descriptors. A virtual mesh names devices; a physical mesh
// (owned by the pipeline crate's provisioner) is what executes stages.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

// ── Logical Mesh ──────────────────────────────────────────────────────────────

/// 2-D view of a device group used by the stage compiler for sharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalMesh {
    pub shape: [usize; 2],
}

impl LogicalMesh {
    pub fn num_devices(&self) -> usize {
        self.shape[0] * self.shape[1]
    }
}

// ── Virtual Mesh ──────────────────────────────────────────────────────────────

/// A rectangular group of devices: `device_ids[h]` lists the devices on host
/// `host_ids[h]`. Every host contributes the same number of devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMesh {
    pub host_ids: Vec<u32>,
    pub device_ids: Vec<Vec<u32>>,
}

impl VirtualMesh {
    /// `num_hosts` hosts, each with devices `0..devices_per_host`.
    pub fn new(num_hosts: u32, devices_per_host: u32) -> Self {
        Self {
            host_ids: (0..num_hosts).collect(),
            device_ids: (0..num_hosts).map(|_| (0..devices_per_host).collect()).collect(),
        }
    }

    pub fn num_hosts(&self) -> usize {
        self.host_ids.len()
    }

    pub fn num_devices_per_host(&self) -> usize {
        self.device_ids.first().map_or(0, Vec::len)
    }

    pub fn num_devices(&self) -> usize {
        self.device_ids.iter().map(Vec::len).sum()
    }

    pub fn default_logical_mesh(&self) -> LogicalMesh {
        LogicalMesh {
            shape: [self.num_hosts(), self.num_devices_per_host()],
        }
    }

    /// Cut the mesh into `parts` disjoint sub-meshes of equal size.
    ///
    /// Hosts are divided first; a single host is divided by devices.
    pub fn split(&self, parts: usize) -> Result<Vec<VirtualMesh>> {
        if parts == 0 {
            return Err(TypesError::Mesh("cannot split a mesh into 0 parts".into()));
        }
        let hosts = self.num_hosts();

        if hosts > 0 && hosts % parts == 0 {
            let per = hosts / parts;
            return Ok((0..parts)
                .map(|p| VirtualMesh {
                    host_ids: self.host_ids[p * per..(p + 1) * per].to_vec(),
                    device_ids: self.device_ids[p * per..(p + 1) * per].to_vec(),
                })
                .collect());
        }

        let devices = self.num_devices_per_host();
        if hosts == 1 && devices > 0 && devices % parts == 0 {
            let per = devices / parts;
            return Ok((0..parts)
                .map(|p| VirtualMesh {
                    host_ids: self.host_ids.clone(),
                    device_ids: vec![self.device_ids[0][p * per..(p + 1) * per].to_vec()],
                })
                .collect());
        }

        Err(TypesError::Mesh(format!(
            "cannot split {hosts} host(s) x {devices} device(s) into {parts} equal meshes"
        )))
    }
}
