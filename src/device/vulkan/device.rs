//! The ash-backed `RenderDevice` implementation.

use std::collections::HashMap;
use std::sync::Arc;

use ash::extensions::khr::{Surface, Swapchain};
use ash::vk::{self, Handle};

use crate::device::traits::{
    AcquireOutcome, BufferHandle, BufferUsage, CommandHandle, CopyRegion, DeviceLimits, Extent,
    FenceHandle, FrameSync, MemoryHandle, MemoryProfile, MemoryRequirements, MeshRef,
    PresentOutcome, RenderDevice, SemaphoreHandle, TargetHandle,
};
use crate::error::{RenderError, RenderResult};
use crate::sync::mutex::Mutex;

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const DESCRIPTOR_POOL_SETS: u32 = 256;

fn backend(err: vk::Result) -> RenderError {
    RenderError::Backend(format!("vulkan: {err}"))
}

/// Externally created Vulkan objects the backend borrows for its lifetime.
/// The caller keeps ownership and destroys them after the backend is
/// dropped.
pub struct VulkanContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub surface: vk::SurfaceKHR,
    pub pipeline_layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
}

struct ChainState {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
}

enum TargetData {
    Color {
        view: vk::ImageView,
        framebuffer: vk::Framebuffer,
    },
    Depth {
        image: vk::Image,
        memory: vk::DeviceMemory,
        view: vk::ImageView,
    },
}

#[derive(Default)]
struct Registries {
    /// Persistent CPU mappings of host-visible memory, unmapped on free.
    mapped: HashMap<u64, *mut u8>,
    targets: HashMap<u64, TargetData>,
    next_target: u64,
    /// The live depth view, attached to every color framebuffer.
    depth_view: Option<vk::ImageView>,
}

/// `RenderDevice` over a real Vulkan device.
pub struct VulkanDevice {
    ctx: VulkanContext,
    surface_loader: Surface,
    swapchain_loader: Swapchain,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    surface_format: vk::SurfaceFormatKHR,
    render_pass: vk::RenderPass,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    pipeline: Mutex<vk::Pipeline>,
    chain: Mutex<ChainState>,
    registries: Mutex<Registries>,
}

// Raw mapped pointers in the registries are only dereferenced under the
// registries mutex.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

impl VulkanDevice {
    /// Build the backend: pick a surface format, create the render pass,
    /// the pools and the initial swapchain.
    pub fn new(ctx: VulkanContext) -> RenderResult<Arc<Self>> {
        let surface_loader = Surface::new(&ctx.entry, &ctx.instance);
        let swapchain_loader = Swapchain::new(&ctx.instance, &ctx.device);

        let memory_properties = unsafe {
            ctx.instance
                .get_physical_device_memory_properties(ctx.physical_device)
        };
        let properties = unsafe {
            ctx.instance
                .get_physical_device_properties(ctx.physical_device)
        };
        let limits = DeviceLimits {
            min_uniform_alignment: properties.limits.min_uniform_buffer_offset_alignment.max(1),
            memory_type_count: memory_properties.memory_type_count,
        };

        let surface_format = pick_surface_format(&surface_loader, &ctx)?;
        let render_pass = create_render_pass(&ctx.device, surface_format.format)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.queue_family);
        let command_pool = unsafe {
            ctx.device
                .create_command_pool(&pool_info, None)
                .map_err(backend)?
        };

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: DESCRIPTOR_POOL_SETS,
        }];
        let descriptor_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(DESCRIPTOR_POOL_SETS)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe {
            ctx.device
                .create_descriptor_pool(&descriptor_info, None)
                .map_err(backend)?
        };

        let chain = create_swapchain(
            &swapchain_loader,
            &surface_loader,
            &ctx,
            surface_format,
            vk::SwapchainKHR::null(),
        )?;

        Ok(Arc::new(Self {
            ctx,
            surface_loader,
            swapchain_loader,
            memory_properties,
            limits,
            surface_format,
            render_pass,
            command_pool,
            descriptor_pool,
            pipeline: Mutex::new(vk::Pipeline::null()),
            chain: Mutex::new(chain),
            registries: Mutex::new(Registries::default()),
        }))
    }

    /// The render pass the caller's pipeline must be compatible with.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Install the externally built graphics pipeline. Must happen before
    /// the first frame.
    pub fn install_pipeline(&self, pipeline: vk::Pipeline) {
        *self.pipeline.lock() = pipeline;
    }

    fn memory_type_flags(&self, memory_type: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties.memory_types[memory_type as usize].property_flags
    }

    fn mapped_ptr(&self, memory: MemoryHandle) -> RenderResult<*mut u8> {
        let mut registries = self.registries.lock();
        if let Some(&ptr) = registries.mapped.get(&memory.0) {
            return Ok(ptr);
        }
        let ptr = unsafe {
            self.ctx
                .device
                .map_memory(
                    vk::DeviceMemory::from_raw(memory.0),
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(backend)?
        } as *mut u8;
        registries.mapped.insert(memory.0, ptr);
        Ok(ptr)
    }
}

fn pick_surface_format(
    loader: &Surface,
    ctx: &VulkanContext,
) -> RenderResult<vk::SurfaceFormatKHR> {
    let formats = unsafe {
        loader
            .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
            .map_err(backend)?
    };
    Ok(formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .ok_or_else(|| RenderError::Backend("vulkan: surface reports no formats".into()))?)
}

fn create_render_pass(device: &ash::Device, format: vk::Format) -> RenderResult<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: DEPTH_FORMAT,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
    ];
    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = [vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref)
        .depth_stencil_attachment(&depth_ref)
        .build()];
    let dependency = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    }];
    let info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpass)
        .dependencies(&dependency);
    unsafe { device.create_render_pass(&info, None).map_err(backend) }
}

fn create_swapchain(
    loader: &Swapchain,
    surface_loader: &Surface,
    ctx: &VulkanContext,
    format: vk::SurfaceFormatKHR,
    old: vk::SwapchainKHR,
) -> RenderResult<ChainState> {
    let caps = unsafe {
        surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
            .map_err(backend)?
    };

    let extent = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: 1280u32.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: 720u32.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    };

    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        image_count = image_count.min(caps.max_image_count);
    }

    let info = vk::SwapchainCreateInfoKHR::builder()
        .surface(ctx.surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(vk::PresentModeKHR::FIFO)
        .clipped(true)
        .old_swapchain(old);

    let swapchain = unsafe { loader.create_swapchain(&info, None).map_err(backend)? };
    if old != vk::SwapchainKHR::null() {
        unsafe { loader.destroy_swapchain(old, None) };
    }
    let images = unsafe { loader.get_swapchain_images(swapchain).map_err(backend)? };

    Ok(ChainState {
        swapchain,
        images,
        extent,
    })
}

impl RenderDevice for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn find_memory_type(&self, type_bits: u32, profile: MemoryProfile) -> Option<u32> {
        let required = match profile {
            MemoryProfile::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            // Coherent keeps the publish write path free of atom-size
            // bookkeeping.
            MemoryProfile::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        (0..self.memory_properties.memory_type_count).find(|&index| {
            type_bits & (1 << index) != 0 && self.memory_type_flags(index).contains(required)
        })
    }

    fn is_host_visible(&self, memory_type: u32) -> bool {
        self.memory_type_flags(memory_type)
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn allocate_memory(&self, memory_type: u32, size: u64) -> RenderResult<MemoryHandle> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);
        let memory = unsafe {
            self.ctx.device.allocate_memory(&info, None).map_err(|err| match err {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    RenderError::ResourceExhausted { requested: size }
                }
                other => backend(other),
            })?
        };
        Ok(MemoryHandle(memory.as_raw()))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        let mut registries = self.registries.lock();
        let raw = vk::DeviceMemory::from_raw(memory.0);
        if registries.mapped.remove(&memory.0).is_some() {
            unsafe { self.ctx.device.unmap_memory(raw) };
        }
        unsafe { self.ctx.device.free_memory(raw, None) };
    }

    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let ptr = self.mapped_ptr(memory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_memory(&self, memory: MemoryHandle, offset: u64, out: &mut [u8]) -> RenderResult<()> {
        let ptr = self.mapped_ptr(memory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn flush_memory(&self, _memory: MemoryHandle, _offset: u64, _size: u64) -> RenderResult<()> {
        // Host-visible selection requires HOST_COHERENT, so writes are
        // visible without an explicit flush.
        Ok(())
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> RenderResult<BufferHandle> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::from_raw(usage.bits))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.ctx.device.create_buffer(&info, None).map_err(backend)? };
        Ok(BufferHandle(buffer.as_raw()))
    }

    fn buffer_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        let requirements = unsafe {
            self.ctx
                .device
                .get_buffer_memory_requirements(vk::Buffer::from_raw(buffer.0))
        };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> RenderResult<()> {
        unsafe {
            self.ctx
                .device
                .bind_buffer_memory(
                    vk::Buffer::from_raw(buffer.0),
                    vk::DeviceMemory::from_raw(memory.0),
                    offset,
                )
                .map_err(backend)
        }
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        unsafe {
            self.ctx
                .device
                .destroy_buffer(vk::Buffer::from_raw(buffer.0), None)
        };
    }

    fn create_binding_table(&self, buffer: BufferHandle, range: u64) -> RenderResult<TableHandle> {
        let layouts = [self.ctx.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let set = unsafe {
            self.ctx
                .device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(backend)?[0]
        };

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(buffer.0),
            offset: 0,
            range,
        }];
        let write = [vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build()];
        unsafe { self.ctx.device.update_descriptor_sets(&write, &[]) };
        Ok(TableHandle(set.as_raw()))
    }

    fn destroy_binding_table(&self, table: TableHandle) {
        let sets = [vk::DescriptorSet::from_raw(table.0)];
        unsafe {
            let _ = self
                .ctx
                .device
                .free_descriptor_sets(self.descriptor_pool, &sets);
        }
    }

    fn create_frame_sync(&self) -> RenderResult<FrameSync> {
        let device = &self.ctx.device;
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let command_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe {
            let acquired = device
                .create_semaphore(&semaphore_info, None)
                .map_err(backend)?;
            let finished = device
                .create_semaphore(&semaphore_info, None)
                .map_err(backend)?;
            let fence = device.create_fence(&fence_info, None).map_err(backend)?;
            let commands = device
                .allocate_command_buffers(&command_info)
                .map_err(backend)?[0];
            Ok(FrameSync {
                acquired: SemaphoreHandle(acquired.as_raw()),
                finished: SemaphoreHandle(finished.as_raw()),
                fence: FenceHandle(fence.as_raw()),
                commands: CommandHandle(commands.as_raw()),
            })
        }
    }

    fn destroy_frame_sync(&self, sync: &FrameSync) {
        let device = &self.ctx.device;
        unsafe {
            device.destroy_semaphore(vk::Semaphore::from_raw(sync.acquired.0), None);
            device.destroy_semaphore(vk::Semaphore::from_raw(sync.finished.0), None);
            device.destroy_fence(vk::Fence::from_raw(sync.fence.0), None);
            device.free_command_buffers(
                self.command_pool,
                &[vk::CommandBuffer::from_raw(sync.commands.0)],
            );
        }
    }

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> RenderResult<()> {
        let fences = [vk::Fence::from_raw(fence.0)];
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&fences, true, timeout_ns)
                .map_err(|err| match err {
                    vk::Result::TIMEOUT => RenderError::SyncTimeout {
                        waited_ns: timeout_ns,
                    },
                    other => backend(other),
                })
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RenderResult<()> {
        let fences = [vk::Fence::from_raw(fence.0)];
        unsafe { self.ctx.device.reset_fences(&fences).map_err(backend) }
    }

    fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.ctx.device.device_wait_idle().map_err(backend) }
    }

    fn begin_commands(&self, commands: CommandHandle) -> RenderResult<()> {
        let buffer = vk::CommandBuffer::from_raw(commands.0);
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.ctx
                .device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
                .map_err(backend)?;
            self.ctx
                .device
                .begin_command_buffer(buffer, &info)
                .map_err(backend)
        }
    }

    fn end_commands(&self, commands: CommandHandle) -> RenderResult<()> {
        unsafe {
            self.ctx
                .device
                .end_command_buffer(vk::CommandBuffer::from_raw(commands.0))
                .map_err(backend)
        }
    }

    fn cmd_copy_buffer(
        &self,
        commands: CommandHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    ) {
        let copies: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            })
            .collect();
        unsafe {
            self.ctx.device.cmd_copy_buffer(
                vk::CommandBuffer::from_raw(commands.0),
                vk::Buffer::from_raw(src.0),
                vk::Buffer::from_raw(dst.0),
                &copies,
            );
        }
    }

    fn cmd_begin_pass(&self, commands: CommandHandle, target: TargetHandle, extent: Extent) {
        let registries = self.registries.lock();
        let framebuffer = match registries.targets.get(&target.0) {
            Some(TargetData::Color { framebuffer, .. }) => *framebuffer,
            _ => {
                debug_assert!(false, "begin pass on a non-color target");
                log::error!("vulkan: begin pass on unknown target {}", target.0);
                return;
            }
        };
        drop(registries);

        let clears = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(&clears);

        let buffer = vk::CommandBuffer::from_raw(commands.0);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.ctx
                .device
                .cmd_begin_render_pass(buffer, &info, vk::SubpassContents::INLINE);
            self.ctx.device.cmd_set_viewport(buffer, 0, &[viewport]);
            self.ctx.device.cmd_set_scissor(buffer, 0, &[area]);
        }
    }

    fn cmd_bind_pipeline(&self, commands: CommandHandle) {
        let pipeline = *self.pipeline.lock();
        if pipeline == vk::Pipeline::null() {
            debug_assert!(false, "no pipeline installed");
            log::error!("vulkan: bind with no pipeline installed");
            return;
        }
        unsafe {
            self.ctx.device.cmd_bind_pipeline(
                vk::CommandBuffer::from_raw(commands.0),
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
    }

    fn cmd_bind_table(&self, commands: CommandHandle, table: TableHandle) {
        let sets = [vk::DescriptorSet::from_raw(table.0)];
        unsafe {
            self.ctx.device.cmd_bind_descriptor_sets(
                vk::CommandBuffer::from_raw(commands.0),
                vk::PipelineBindPoint::GRAPHICS,
                self.ctx.pipeline_layout,
                0,
                &sets,
                &[],
            );
        }
    }

    fn cmd_push_slot(&self, commands: CommandHandle, slot: u32) {
        unsafe {
            self.ctx.device.cmd_push_constants(
                vk::CommandBuffer::from_raw(commands.0),
                self.ctx.pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                &slot.to_ne_bytes(),
            );
        }
    }

    fn cmd_draw(&self, commands: CommandHandle, mesh: &MeshRef) {
        let buffer = vk::CommandBuffer::from_raw(commands.0);
        unsafe {
            self.ctx.device.cmd_bind_vertex_buffers(
                buffer,
                0,
                &[vk::Buffer::from_raw(mesh.vertex.0)],
                &[0],
            );
            self.ctx.device.cmd_bind_index_buffer(
                buffer,
                vk::Buffer::from_raw(mesh.index.0),
                0,
                vk::IndexType::UINT32,
            );
            self.ctx
                .device
                .cmd_draw_indexed(buffer, mesh.index_count, 1, 0, 0, 0);
        }
    }

    fn cmd_end_pass(&self, commands: CommandHandle) {
        unsafe {
            self.ctx
                .device
                .cmd_end_render_pass(vk::CommandBuffer::from_raw(commands.0));
        }
    }

    fn surface_extent(&self) -> Extent {
        let chain = self.chain.lock();
        Extent {
            width: chain.extent.width,
            height: chain.extent.height,
        }
    }

    fn image_count(&self) -> u32 {
        self.chain.lock().images.len() as u32
    }

    fn recreate_surface(&self) -> RenderResult<(u32, Extent)> {
        let mut chain = self.chain.lock();
        let new_chain = create_swapchain(
            &self.swapchain_loader,
            &self.surface_loader,
            &self.ctx,
            self.surface_format,
            chain.swapchain,
        )?;
        *chain = new_chain;
        Ok((
            chain.images.len() as u32,
            Extent {
                width: chain.extent.width,
                height: chain.extent.height,
            },
        ))
    }

    fn create_render_target(&self, image_index: u32, extent: Extent) -> RenderResult<TargetHandle> {
        let image = {
            let chain = self.chain.lock();
            *chain
                .images
                .get(image_index as usize)
                .ok_or(RenderError::ContractViolation("image index out of range"))?
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.surface_format.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            self.ctx
                .device
                .create_image_view(&view_info, None)
                .map_err(backend)?
        };

        let mut registries = self.registries.lock();
        let depth_view = registries.depth_view.ok_or(RenderError::ContractViolation(
            "render target created before depth target",
        ))?;

        let attachments = [view, depth_view];
        let fb_info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = match unsafe { self.ctx.device.create_framebuffer(&fb_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                unsafe { self.ctx.device.destroy_image_view(view, None) };
                return Err(backend(err));
            }
        };

        let handle = registries.next_target;
        registries.next_target += 1;
        registries
            .targets
            .insert(handle, TargetData::Color { view, framebuffer });
        Ok(TargetHandle(handle))
    }

    fn create_depth_target(&self, extent: Extent) -> RenderResult<TargetHandle> {
        let device = &self.ctx.device;
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&image_info, None).map_err(backend)? };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = self
            .find_memory_type(requirements.memory_type_bits, MemoryProfile::DeviceLocal)
            .ok_or(RenderError::NoCompatibleMemory {
                type_bits: requirements.memory_type_bits,
            })?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(backend(err));
            }
        };
        unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .map_err(backend)?
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { device.create_image_view(&view_info, None).map_err(backend)? };

        let mut registries = self.registries.lock();
        registries.depth_view = Some(view);
        let handle = registries.next_target;
        registries.next_target += 1;
        registries
            .targets
            .insert(handle, TargetData::Depth { image, memory, view });
        Ok(TargetHandle(handle))
    }

    fn destroy_render_target(&self, target: TargetHandle) {
        let mut registries = self.registries.lock();
        let Some(data) = registries.targets.remove(&target.0) else {
            log::error!("vulkan: destroy of unknown target {}", target.0);
            return;
        };
        let device = &self.ctx.device;
        match data {
            TargetData::Color { view, framebuffer } => unsafe {
                device.destroy_framebuffer(framebuffer, None);
                device.destroy_image_view(view, None);
            },
            TargetData::Depth {
                image,
                memory,
                view,
            } => {
                if registries.depth_view == Some(view) {
                    registries.depth_view = None;
                }
                unsafe {
                    device.destroy_image_view(view, None);
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
            }
        }
    }

    fn acquire_image(&self, acquired: SemaphoreHandle) -> RenderResult<AcquireOutcome> {
        let swapchain = self.chain.lock().swapchain;
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                u64::MAX,
                vk::Semaphore::from_raw(acquired.0),
                vk::Fence::null(),
            )
        };
        match result {
            // A suboptimal acquire has already consumed the image and will
            // signal the semaphore, so the frame must still be rendered and
            // presented; the present side reports Stale and the rebuild
            // runs at the top of the next frame.
            Ok((image_index, _suboptimal)) => Ok(AcquireOutcome::Ready { image_index }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(err) => Err(backend(err)),
        }
    }

    fn submit(
        &self,
        commands: CommandHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> RenderResult<()> {
        let wait_semaphores = [vk::Semaphore::from_raw(wait.0)];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [vk::CommandBuffer::from_raw(commands.0)];
        let signal_semaphores = [vk::Semaphore::from_raw(signal.0)];
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.queue, &[info], vk::Fence::from_raw(fence.0))
                .map_err(backend)
        }
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> RenderResult<PresentOutcome> {
        let swapchain = self.chain.lock().swapchain;
        let wait_semaphores = [vk::Semaphore::from_raw(wait.0)];
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let result = unsafe { self.swapchain_loader.queue_present(self.ctx.queue, &info) };
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(err) => Err(backend(err)),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            let _ = device.device_wait_idle();
        }

        let registries = self.registries.lock();
        if !registries.targets.is_empty() {
            log::warn!(
                "vulkan: dropped with {} live targets",
                registries.targets.len()
            );
        }
        for (&raw, _) in registries.mapped.iter() {
            unsafe { device.unmap_memory(vk::DeviceMemory::from_raw(raw)) };
        }
        drop(registries);

        let swapchain = self.chain.lock().swapchain;
        unsafe {
            self.swapchain_loader.destroy_swapchain(swapchain, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_render_pass(self.render_pass, None);
        }
        // Instance, device, surface, queue and layouts are externally
        // owned; the caller destroys them after this drop.
    }
}
