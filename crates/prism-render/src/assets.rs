//! Asset decoding: images, glTF meshes and SPIR-V shaders.
//!
//! Everything here runs on the CPU and produces plain data for the stores
//! to upload.

use std::path::Path;

use crate::error::{RenderError, Result};
use crate::vertex::Vertex;

/// Registry name of an asset file: its file name.
pub fn asset_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// RGBA8 pixels of a decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode an image file into tightly packed RGBA8.
pub fn decode_image(path: &Path) -> Result<DecodedImage> {
    if !path.exists() {
        return Err(RenderError::AssetNotFound(path.to_path_buf()));
    }

    let image = image::open(path).map_err(|e| RenderError::ImageLoadError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();

    if width == 0 || height == 0 {
        return Err(RenderError::ImageLoadError {
            path: path.to_path_buf(),
            reason: "image has no pixels".to_string(),
        });
    }

    Ok(DecodedImage {
        pixels: rgba.into_raw(),
        width,
        height,
    })
}

/// Index data with its storage width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshIndices {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl MeshIndices {
    /// Store `indices` as 16-bit when every value fits.
    pub fn compact(indices: Vec<u32>) -> Self {
        if indices.iter().all(|&i| i <= u32::from(u16::MAX)) {
            Self::U16(indices.into_iter().map(|i| i as u16).collect())
        } else {
            Self::U32(indices)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::U16(indices) => indices.len(),
            Self::U32(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per index: 2 or 4.
    pub fn stride(&self) -> usize {
        match self {
            Self::U16(_) => 2,
            Self::U32(_) => 4,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::U16(indices) => bytemuck::cast_slice(indices),
            Self::U32(indices) => bytemuck::cast_slice(indices),
        }
    }
}

/// Vertices and optional indices of one mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Option<MeshIndices>,
}

/// One primitive before merging.
#[derive(Debug, Clone, Default)]
struct Primitive {
    vertices: Vec<Vertex>,
    indices: Option<Vec<u32>>,
}

/// `len` as the `u32` a draw call takes.
pub(crate) fn draw_count(len: usize, what: &str) -> std::result::Result<u32, String> {
    u32::try_from(len).map_err(|_| format!("{len} {what} do not fit a 32-bit draw"))
}

/// Concatenate primitives into one vertex and index list.
///
/// Indices are offset by the number of vertices before each primitive. If
/// any primitive is indexed, unindexed ones get sequential indices so the
/// whole mesh can be drawn with one indexed draw. Fails when the merged
/// mesh has more vertices than a `u32` index can address.
fn merge_primitives(primitives: Vec<Primitive>) -> std::result::Result<MeshData, String> {
    let any_indexed = primitives.iter().any(|p| p.indices.is_some());
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    for primitive in primitives {
        let base = draw_count(vertices.len(), "vertices")?;
        draw_count(vertices.len() + primitive.vertices.len(), "vertices")?;
        if any_indexed {
            match primitive.indices {
                Some(local) => {
                    for i in local {
                        let index = i
                            .checked_add(base)
                            .ok_or_else(|| format!("index {i} overflows at vertex {base}"))?;
                        indices.push(index);
                    }
                }
                None => {
                    let count = draw_count(primitive.vertices.len(), "vertices")?;
                    indices.extend(base..base + count);
                }
            }
        }
        vertices.extend(primitive.vertices);
    }

    let indices = (any_indexed && !indices.is_empty()).then(|| MeshIndices::compact(indices));
    Ok(MeshData { vertices, indices })
}

/// Load every triangle primitive of a glTF file into one mesh.
///
/// Colors default to white and texture coordinates to zero when the file
/// has none. Positions are required.
pub fn load_gltf(path: &Path) -> Result<MeshData> {
    if !path.exists() {
        return Err(RenderError::AssetNotFound(path.to_path_buf()));
    }

    let mesh_error = |reason: String| RenderError::MeshLoadError {
        path: path.to_path_buf(),
        reason,
    };

    let (document, buffers, _images) = gltf::import(path).map_err(|e| mesh_error(e.to_string()))?;

    let mut primitives = Vec::new();
    for mesh in document.meshes() {
        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                tracing::warn!(
                    "Skipping non-triangle primitive in mesh {:?} of {}",
                    mesh.name(),
                    path.display()
                );
                continue;
            }

            let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));

            let positions: Vec<[f32; 3]> = reader
                .read_positions()
                .ok_or_else(|| mesh_error("primitive without positions".to_string()))?
                .collect();
            let colors: Vec<[f32; 3]> = reader
                .read_colors(0)
                .map_or_else(|| vec![[1.0; 3]; positions.len()], |c| c.into_rgb_f32().collect());
            let uvs: Vec<[f32; 2]> = reader
                .read_tex_coords(0)
                .map_or_else(|| vec![[0.0; 2]; positions.len()], |t| t.into_f32().collect());

            let vertices = positions
                .iter()
                .enumerate()
                .map(|(i, &position)| {
                    Vertex::new(
                        position,
                        colors.get(i).copied().unwrap_or([1.0; 3]),
                        uvs.get(i).copied().unwrap_or([0.0; 2]),
                    )
                })
                .collect();
            let indices = reader
                .read_indices()
                .map(|indices| indices.into_u32().collect());

            primitives.push(Primitive { vertices, indices });
        }
    }

    let data = merge_primitives(primitives).map_err(mesh_error)?;
    if data.vertices.is_empty() {
        return Err(mesh_error("no triangle geometry".to_string()));
    }
    Ok(data)
}

/// Reinterpret SPIR-V bytes as words.
///
/// The byte length must be a multiple of 4; the copy into a `Vec<u32>`
/// satisfies the word alignment Vulkan requires.
pub fn spirv_words(path: &Path, bytes: &[u8]) -> Result<Vec<u32>> {
    let shader_error = |reason: String| RenderError::ShaderLoadError {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(shader_error(format!(
            "{} bytes is not a whole number of SPIR-V words",
            bytes.len()
        )));
    }

    ash::util::read_spv(&mut std::io::Cursor::new(bytes)).map_err(|e| shader_error(e.to_string()))
}

/// Read a compiled SPIR-V shader.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RenderError::AssetNotFound(path.to_path_buf()),
        _ => RenderError::ShaderLoadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    })?;
    spirv_words(path, &bytes)
}
