//! GPU integration tests against a headless context.
//!
//! Each test returns early when no Vulkan loader or device is present.

use ash::vk;
use prism_core::RuntimeOptions;
use prism_gpu::{
    DescriptorWrite, GpuContext, GpuContextBuilder, LayoutBinding, MemoryLocality,
    ResourceDescriptor, ResourceUploader,
};

fn headless_context() -> Option<GpuContext> {
    let options = RuntimeOptions {
        hide_gpu_stats: true,
        ..RuntimeOptions::default()
    };
    match GpuContextBuilder::new().options(options).build_headless() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping: no Vulkan device available ({e})");
            None
        }
    }
}

#[test]
fn allocator_round_trip_restores_stats() {
    let Some(ctx) = headless_context() else {
        return;
    };
    let mut allocator = ctx.allocator().lock();
    let before = allocator.snapshot_stats();

    let mut buffer = allocator
        .create_buffer(
            4096,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocality::HostVisibleCoherent,
            "round trip buffer",
        )
        .unwrap();
    let mut image = allocator
        .create_image(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D {
                width: 64,
                height: 64,
            },
            vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            "round trip image",
        )
        .unwrap();

    assert!(buffer.mapped_ptr().is_some());
    let during = allocator.snapshot_stats();
    assert_eq!(during.allocation_count, before.allocation_count + 2);
    assert!(during.used_bytes > before.used_bytes);

    allocator.destroy_buffer(&mut buffer).unwrap();
    allocator.destroy_image(&mut image).unwrap();
    // Destroying twice is harmless.
    allocator.destroy_buffer(&mut buffer).unwrap();
    allocator.destroy_image(&mut image).unwrap();

    let after = allocator.snapshot_stats();
    assert_eq!(after.used_bytes, before.used_bytes);
    assert_eq!(after.allocation_count, before.allocation_count);
}

#[test]
fn texture_upload_ends_shader_readable() {
    let Some(ctx) = headless_context() else {
        return;
    };
    let mut uploader = ResourceUploader::new(&ctx).unwrap();

    let extent = vk::Extent2D {
        width: 256,
        height: 256,
    };
    let pixels: Vec<u8> = (0..256 * 256)
        .flat_map(|i: u32| [(i % 256) as u8, (i / 256) as u8, 0x80, 0xff])
        .collect();

    let mut image = uploader
        .upload_rgba8_image(&ctx, &pixels, extent, vk::Format::R8G8B8A8_UNORM, "checker")
        .unwrap();

    assert_eq!(uploader.last_staging_size(), 262_144);
    assert_eq!(image.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(image.extent, extent);

    ctx.allocator().lock().destroy_image(&mut image).unwrap();
    unsafe { uploader.destroy(ctx.device()) };
}

#[test]
fn buffer_upload_allocates_device_local_copy() {
    let Some(ctx) = headless_context() else {
        return;
    };
    let mut uploader = ResourceUploader::new(&ctx).unwrap();

    let data: Vec<u8> = (0..=255).collect();
    let mut buffer = uploader
        .upload_buffer(&ctx, &data, vk::BufferUsageFlags::VERTEX_BUFFER, "bytes")
        .unwrap();

    assert_eq!(buffer.size, 256);
    assert_eq!(uploader.last_staging_size(), 256);

    ctx.allocator().lock().destroy_buffer(&mut buffer).unwrap();
    unsafe { uploader.destroy(ctx.device()) };
}

#[test]
fn descriptor_finalize_writes_every_binding_of_every_set() {
    let Some(ctx) = headless_context() else {
        return;
    };
    let device = ctx.device();
    const SETS: u32 = 3;

    let mut uniforms: Vec<_> = (0..SETS)
        .map(|i| {
            ctx.allocator()
                .lock()
                .create_buffer(
                    64,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocality::HostVisibleCoherent,
                    &format!("uniforms {i}"),
                )
                .unwrap()
        })
        .collect();

    let mut uploader = ResourceUploader::new(&ctx).unwrap();
    let mut texture = uploader
        .upload_rgba8_image(
            &ctx,
            &[0xff; 4],
            vk::Extent2D {
                width: 1,
                height: 1,
            },
            vk::Format::R8G8B8A8_UNORM,
            "white",
        )
        .unwrap();
    let sampler = unsafe {
        device
            .create_sampler(&vk::SamplerCreateInfo::default(), None)
            .unwrap()
    };

    let mut descriptor = ResourceDescriptor::new("test");
    descriptor
        .add_layout_binding(LayoutBinding::uniform_buffer(vk::ShaderStageFlags::VERTEX))
        .add_layout_binding(LayoutBinding::combined_image_sampler(
            vk::ShaderStageFlags::FRAGMENT,
        ))
        .add_descriptor_write(DescriptorWrite::per_set_uniform_buffers(
            uniforms.iter().map(|b| (b.buffer, b.size)),
        ))
        .add_descriptor_write(DescriptorWrite::combined_image_sampler(
            texture.view,
            sampler,
        ));

    unsafe { descriptor.finalize(device, SETS).unwrap() };

    assert_eq!(descriptor.sets().len(), SETS as usize);
    assert_eq!(descriptor.written_count(), (SETS * 2) as usize);
    assert!(descriptor.set(SETS - 1).is_some());
    assert!(descriptor.set(SETS).is_none());

    // Rebuild with the bindings kept, as a swapchain reset does.
    unsafe {
        descriptor.destroy(device, true);
        assert_eq!(descriptor.bindings().len(), 2);
        descriptor
            .add_descriptor_write(DescriptorWrite::per_set_uniform_buffers(
                uniforms.iter().map(|b| (b.buffer, b.size)),
            ))
            .add_descriptor_write(DescriptorWrite::combined_image_sampler(
                texture.view,
                sampler,
            ));
        descriptor.finalize(device, SETS).unwrap();
    }
    assert_eq!(descriptor.written_count(), (SETS * 2) as usize);

    unsafe {
        descriptor.destroy(device, false);
        device.destroy_sampler(sampler, None);
        uploader.destroy(device);
    }
    let mut allocator = ctx.allocator().lock();
    allocator.destroy_image(&mut texture).unwrap();
    for buffer in &mut uniforms {
        allocator.destroy_buffer(buffer).unwrap();
    }
}
