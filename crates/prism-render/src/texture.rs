//! Uploaded textures and the samplers they share.

use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use prism_core::Registry;
use prism_gpu::{DescriptorWrite, GpuContext, GpuImage, ResourceUploader};
use std::sync::Arc;

use crate::assets::DecodedImage;
use crate::error::Result;

/// Name of the 1×1 white texture used when nothing else is loaded.
pub const FALLBACK_TEXTURE: &str = "fallback-white";

/// Filtering and addressing of a sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    /// Maximum anisotropy, `None` to disable.
    pub anisotropy: Option<f32>,
}

impl SamplerSettings {
    /// Linear filtering, repeat addressing, and the device's anisotropy.
    pub fn linear_repeat(anisotropy: Option<f32>) -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy,
        }
    }

    fn key(&self) -> SamplerKey {
        SamplerKey {
            filter: self.filter.as_raw(),
            address_mode: self.address_mode.as_raw(),
            anisotropy: self.anisotropy.map(f32::to_bits),
        }
    }

    /// Create info for a single-mip sampler with these settings.
    pub fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.filter)
            .min_filter(self.filter)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(self.anisotropy.is_some())
            .max_anisotropy(self.anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SamplerKey {
    filter: i32,
    address_mode: i32,
    anisotropy: Option<u32>,
}

/// A sampled image in shader-read-only layout.
pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
}

impl Texture {
    /// Combined image sampler write for a descriptor.
    pub fn descriptor_write(&self) -> DescriptorWrite {
        DescriptorWrite::combined_image_sampler(self.image.view, self.sampler)
    }
}

/// Texture a model binds: the one with the same index, else the first.
pub fn texture_index_for_model(model_index: usize, texture_count: usize) -> Option<usize> {
    match texture_count {
        0 => None,
        n if model_index < n => Some(model_index),
        _ => Some(0),
    }
}

/// Textures keyed by name, in load order, plus a sampler cache.
#[derive(Default)]
pub struct TextureStore {
    textures: Registry<String, Texture>,
    samplers: Mutex<HashMap<SamplerKey, vk::Sampler>>,
}

impl TextureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sampler for `settings`, created on first use.
    pub fn sampler(&self, ctx: &GpuContext, settings: SamplerSettings) -> Result<vk::Sampler> {
        let mut samplers = self.samplers.lock();
        if let Some(&sampler) = samplers.get(&settings.key()) {
            return Ok(sampler);
        }

        let sampler = unsafe {
            ctx.device()
                .create_sampler(&settings.create_info(), None)
                .map_err(prism_gpu::GpuError::from)?
        };
        samplers.insert(settings.key(), sampler);
        tracing::debug!("Created sampler {settings:?}");
        Ok(sampler)
    }

    /// Upload a decoded image under `name`. Returns `false` if the name is
    /// already taken.
    pub fn upload(
        &self,
        ctx: &GpuContext,
        uploader: &mut ResourceUploader,
        name: &str,
        image: &DecodedImage,
    ) -> Result<bool> {
        if self.textures.contains_key(name) {
            return Ok(false);
        }

        let settings = SamplerSettings::linear_repeat(ctx.sampler_anisotropy());
        let sampler = self.sampler(ctx, settings)?;

        let gpu_image = uploader.upload_rgba8_image(
            ctx,
            &image.pixels,
            vk::Extent2D {
                width: image.width,
                height: image.height,
            },
            vk::Format::R8G8B8A8_UNORM,
            name,
        )?;

        tracing::info!("Loaded texture {name}: {}x{}", image.width, image.height);

        let texture = Arc::new(Texture {
            image: gpu_image,
            sampler,
        });
        if self.textures.insert(name.to_string(), Arc::clone(&texture)) {
            return Ok(true);
        }
        if let Ok(mut texture) = Arc::try_unwrap(texture) {
            ctx.allocator().lock().destroy_image(&mut texture.image)?;
        }
        Ok(false)
    }

    /// Make sure at least one texture exists by adding a 1×1 white one.
    pub fn ensure_fallback(&self, ctx: &GpuContext, uploader: &mut ResourceUploader) -> Result<()> {
        if !self.textures.is_empty() {
            return Ok(());
        }
        let white = DecodedImage {
            pixels: vec![0xff; 4],
            width: 1,
            height: 1,
        };
        self.upload(ctx, uploader, FALLBACK_TEXTURE, &white)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Texture>> {
        self.textures.get(name)
    }

    /// Textures in load order.
    pub fn values(&self) -> Vec<Arc<Texture>> {
        self.textures.values()
    }

    /// Texture bound by the model at `model_index`.
    pub fn for_model(&self, model_index: usize) -> Option<Arc<Texture>> {
        let textures = self.textures.values();
        texture_index_for_model(model_index, textures.len()).map(|i| Arc::clone(&textures[i]))
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Destroy every texture and sampler.
    pub fn destroy_all(&self, ctx: &GpuContext) -> Result<()> {
        {
            let mut allocator = ctx.allocator().lock();
            for (name, texture) in self.textures.drain() {
                match Arc::try_unwrap(texture) {
                    Ok(mut texture) => allocator.destroy_image(&mut texture.image)?,
                    Err(_) => tracing::warn!("Texture {name} still referenced at shutdown"),
                }
            }
        }

        for (_, sampler) in self.samplers.lock().drain() {
            unsafe { ctx.device().destroy_sampler(sampler, None) };
        }
        Ok(())
    }
}
