//! Uploaded meshes and the draw call each one needs.

use ash::vk;
use hashbrown::HashSet;
use parking_lot::Mutex;
use prism_core::Registry;
use prism_gpu::{GpuAllocator, GpuBuffer, GpuContext, ResourceUploader};
use std::sync::Arc;

use crate::assets::{draw_count, MeshData, MeshIndices};
use crate::error::{RenderError, Result};

/// How a mesh is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    Indexed {
        index_count: u32,
        index_type: vk::IndexType,
    },
    NonIndexed {
        vertex_count: u32,
    },
}

impl DrawCall {
    /// Pick indexed drawing only when there are indices to draw.
    pub fn select(vertex_count: u32, indices: Option<(u32, vk::IndexType)>) -> Self {
        match indices {
            Some((index_count, index_type)) if index_count > 0 => Self::Indexed {
                index_count,
                index_type,
            },
            _ => Self::NonIndexed { vertex_count },
        }
    }
}

/// Device-local vertex buffer and optional index buffer.
pub struct MeshBuffer {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: Option<GpuBuffer>,
    pub vertex_count: u32,
    pub index_count: u32,
    pub index_type: vk::IndexType,
}

impl MeshBuffer {
    pub fn draw_call(&self) -> DrawCall {
        let indices = self
            .index_buffer
            .as_ref()
            .map(|_| (self.index_count, self.index_type));
        DrawCall::select(self.vertex_count, indices)
    }

    /// Bind buffers and record the draw.
    ///
    /// # Safety
    /// `cmd` must be recording inside a render pass with a bound pipeline.
    pub unsafe fn record_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
        match (self.draw_call(), self.index_buffer.as_ref()) {
            (
                DrawCall::Indexed {
                    index_count,
                    index_type,
                },
                Some(index_buffer),
            ) => {
                device.cmd_bind_index_buffer(cmd, index_buffer.buffer, 0, index_type);
                device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
            }
            (_, _) => device.cmd_draw(cmd, self.vertex_count, 1, 0, 0),
        }
    }

    fn destroy(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.destroy_buffer(&mut self.vertex_buffer)?;
        if let Some(index_buffer) = self.index_buffer.as_mut() {
            allocator.destroy_buffer(index_buffer)?;
        }
        Ok(())
    }
}

fn index_type(indices: &MeshIndices) -> vk::IndexType {
    match indices {
        MeshIndices::U16(_) => vk::IndexType::UINT16,
        MeshIndices::U32(_) => vk::IndexType::UINT32,
    }
}

/// Meshes keyed by name, in load order.
#[derive(Default)]
pub struct MeshStore {
    meshes: Registry<String, MeshBuffer>,
    warned_unindexed: Mutex<HashSet<String>>,
}

impl MeshStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload `data` under `name`. Returns `false` if the name is taken, in
    /// which case nothing is uploaded.
    pub fn upload(
        &self,
        ctx: &GpuContext,
        uploader: &mut ResourceUploader,
        name: &str,
        data: &MeshData,
    ) -> Result<bool> {
        if self.meshes.contains_key(name) {
            return Ok(false);
        }
        if data.vertices.is_empty() {
            return Err(RenderError::InvalidState(format!("mesh {name} has no vertices")));
        }
        let too_large = |reason: String| RenderError::MeshLoadError {
            path: name.into(),
            reason,
        };
        let vertex_count = draw_count(data.vertices.len(), "vertices").map_err(too_large)?;
        let index_total = match data.indices.as_ref() {
            Some(indices) => draw_count(indices.len(), "indices").map_err(too_large)?,
            None => 0,
        };

        let mut vertex_buffer = uploader.upload_buffer(
            ctx,
            bytemuck::cast_slice(&data.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &format!("{name} vertices"),
        )?;

        let (index_buffer, index_count, index_type) = match data.indices.as_ref() {
            Some(indices) if !indices.is_empty() => {
                let uploaded = uploader.upload_buffer(
                    ctx,
                    indices.as_bytes(),
                    vk::BufferUsageFlags::INDEX_BUFFER,
                    &format!("{name} indices"),
                );
                match uploaded {
                    Ok(buffer) => (Some(buffer), index_total, index_type(indices)),
                    Err(e) => {
                        ctx.allocator().lock().destroy_buffer(&mut vertex_buffer)?;
                        return Err(e.into());
                    }
                }
            }
            _ => (None, 0, vk::IndexType::UINT32),
        };

        let mesh = MeshBuffer {
            vertex_buffer,
            index_buffer,
            vertex_count,
            index_count,
            index_type,
        };
        tracing::info!(
            "Loaded mesh {name}: {} vertices, {} indices",
            mesh.vertex_count,
            mesh.index_count
        );

        let mesh = Arc::new(mesh);
        if self.meshes.insert(name.to_string(), Arc::clone(&mesh)) {
            return Ok(true);
        }
        // Another insert of the same name won.
        if let Ok(mut mesh) = Arc::try_unwrap(mesh) {
            mesh.destroy(&mut ctx.allocator().lock())?;
        }
        Ok(false)
    }

    pub fn get(&self, name: &str) -> Option<Arc<MeshBuffer>> {
        self.meshes.get(name)
    }

    /// Meshes in load order.
    pub fn entries(&self) -> Vec<(String, Arc<MeshBuffer>)> {
        self.meshes.entries()
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Record the draw for `name`, warning once if it has no indices.
    ///
    /// # Safety
    /// Same as [`MeshBuffer::record_draw`].
    pub unsafe fn record_draw(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        name: &str,
        mesh: &MeshBuffer,
    ) {
        if matches!(mesh.draw_call(), DrawCall::NonIndexed { .. }) {
            self.warn_unindexed_once(name);
        }
        mesh.record_draw(device, cmd);
    }

    /// Returns `true` the first time it is called for `name`.
    fn warn_unindexed_once(&self, name: &str) -> bool {
        let first = self.warned_unindexed.lock().insert(name.to_string());
        if first {
            tracing::warn!("Mesh {name} has no index buffer, drawing vertices directly");
        }
        first
    }

    /// Destroy every mesh. Meshes still referenced elsewhere are skipped.
    pub fn destroy_all(&self, allocator: &mut GpuAllocator) -> Result<()> {
        for (name, mesh) in self.meshes.drain() {
            match Arc::try_unwrap(mesh) {
                Ok(mut mesh) => mesh.destroy(allocator)?,
                Err(_) => tracing::warn!("Mesh {name} still referenced at shutdown"),
            }
        }
        self.warned_unindexed.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_vertices_without_indices_draw_directly() {
        assert_eq!(
            DrawCall::select(3, None),
            DrawCall::NonIndexed { vertex_count: 3 }
        );
    }

    #[test]
    fn empty_index_list_draws_directly() {
        assert_eq!(
            DrawCall::select(3, Some((0, vk::IndexType::UINT16))),
            DrawCall::NonIndexed { vertex_count: 3 }
        );
    }

    #[test]
    fn indices_select_indexed_draw() {
        assert_eq!(
            DrawCall::select(4, Some((6, vk::IndexType::UINT16))),
            DrawCall::Indexed {
                index_count: 6,
                index_type: vk::IndexType::UINT16
            }
        );
    }

    #[test]
    fn index_width_matches_storage() {
        assert_eq!(index_type(&MeshIndices::U16(vec![0])), vk::IndexType::UINT16);
        assert_eq!(index_type(&MeshIndices::U32(vec![0])), vk::IndexType::UINT32);
    }

    #[test]
    fn unindexed_warning_fires_once_per_mesh() {
        let store = MeshStore::new();
        assert!(store.warn_unindexed_once("triangle"));
        assert!(!store.warn_unindexed_once("triangle"));
        assert!(store.warn_unindexed_once("quad"));
    }
}
