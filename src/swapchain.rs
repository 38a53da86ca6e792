/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Swapchain capture: export state per swapchain, frame rings per queue,
 * and the copy submitted on every captured present */
use crate::capture;
use crate::exporter::{export_image, ExportRequest, ExportedImage};
use crate::formats::{export_format, vulkan_to_drm, DRM_FORMAT_ARGB8888};
use crate::layer::{DeviceData, QUEUES, SWAPCHAINS};
use crate::objects::DispatchKey;
use crate::protocol::AllocHints;
use crate::tag;
use crate::util::lock;
use ash::vk;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};

/** Presents waiting on more semaphores than this are not chained through
 * the capture submission */
pub const MAX_PRESENT_SWAP_SEMAPHORE_COUNT: usize = 32;

/** Longest wait for a frame slot's previous submission, in nanoseconds */
pub const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapState {
    /** No export exists */
    #[default]
    Idle,
    /** Exported and announced, nothing copied yet */
    Ready,
    /** At least one copy was submitted */
    Capturing,
}

#[derive(Default)]
pub struct SwapCapture {
    pub state: SwapState,
    pub export: Option<ExportedImage>,
    /** The swapchain format has no DRM equivalent and is blitted */
    pub needs_blit: bool,
    /** Hints with which exporting last failed */
    pub failed_hints: Option<AllocHints>,
}

impl SwapCapture {
    /** Should an export be attempted with these hints? */
    pub fn may_init(&self, hints: AllocHints) -> bool {
        self.export.is_none() && self.failed_hints != Some(hints)
    }
}

pub struct SwapchainData {
    pub device: DispatchKey,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    /** Window id of the surface the swapchain presents to, or 0 */
    pub winid: u32,
    pub capture: Mutex<SwapCapture>,
}

impl SwapchainData {
    pub fn new(
        device: DispatchKey,
        handle: vk::SwapchainKHR,
        images: Vec<vk::Image>,
        info: &vk::SwapchainCreateInfoKHR<'_>,
        winid: u32,
    ) -> SwapchainData {
        SwapchainData {
            device,
            handle,
            images,
            extent: info.image_extent,
            format: info.image_format,
            color_space: info.image_color_space,
            winid,
            capture: Mutex::new(SwapCapture::default()),
        }
    }

    /** Minimized windows can have 0x0 or 1x1 swapchains */
    pub fn valid_extent(&self) -> bool {
        self.extent.width > 0
            && self.extent.height > 0
            && (self.extent.width > 1 || self.extent.height > 1)
    }
}

#[derive(Default)]
struct Frame {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    /** Submitted, and the fence has not been seen signalled */
    busy: bool,
}

/** Command buffers, fences and semaphores reused round-robin */
#[derive(Default)]
pub struct FrameRing {
    frames: Vec<Frame>,
    next: usize,
}

pub struct QueueData {
    pub device: DispatchKey,
    pub queue: vk::Queue,
    pub family: u32,
    pub supports_transfer: bool,
    pub supports_graphics: bool,
    ring: Mutex<FrameRing>,
}

impl QueueData {
    pub fn new(
        device: DispatchKey,
        queue: vk::Queue,
        family: u32,
        flags: vk::QueueFlags,
    ) -> QueueData {
        QueueData {
            device,
            queue,
            family,
            supports_transfer: flags.intersects(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            ),
            supports_graphics: flags.contains(vk::QueueFlags::GRAPHICS),
            ring: Mutex::new(FrameRing::default()),
        }
    }

    /** Wait for and destroy all frame objects of this queue */
    pub fn destroy_frames(&self, dev: &DeviceData) {
        lock(&self.ring).destroy(dev);
    }
}

/** Wait for a fence, at most FENCE_TIMEOUT_NS */
fn wait_fence(dev: &DeviceData, fence: vk::Fence) -> Result<(), vk::Result> {
    unsafe { dev.device().wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS) }
}

unsafe fn init_frame(dev: &DeviceData, family: u32, f: &mut Frame) -> Result<(), String> {
    let device = dev.device();
    let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(family);
    f.pool = device
        .create_command_pool(&pool_info, None)
        .map_err(|x| tag!("Failed to create command pool: {:?}", x))?;

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(f.pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmds = device
        .allocate_command_buffers(&alloc_info)
        .map_err(|x| tag!("Failed to allocate command buffer: {:?}", x))?;
    f.cmd = cmds
        .first()
        .copied()
        .ok_or_else(|| tag!("No command buffer allocated"))?;
    dev.set_loader_data(f.cmd)?;

    f.fence = device
        .create_fence(&vk::FenceCreateInfo::default(), None)
        .map_err(|x| tag!("Failed to create fence: {:?}", x))?;
    f.semaphore = device
        .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        .map_err(|x| tag!("Failed to create semaphore: {:?}", x))?;
    Ok(())
}

impl FrameRing {
    /** Make sure there are at least `count` frames */
    fn ensure(&mut self, dev: &DeviceData, family: u32, count: usize) -> Result<(), String> {
        if self.frames.len() >= count {
            return Ok(());
        }
        self.destroy(dev);
        for _ in 0..count {
            self.frames.push(Frame::default());
            let Some(f) = self.frames.last_mut() else {
                break;
            };
            if let Err(e) = unsafe { init_frame(dev, family, f) } {
                self.destroy(dev);
                return Err(e);
            }
        }
        debug!("Created {} capture frames for queue family {}", count, family);
        Ok(())
    }

    /** Wait until no frame is in flight */
    fn wait_idle(&mut self, dev: &DeviceData) {
        for f in self.frames.iter_mut().filter(|f| f.busy) {
            match wait_fence(dev, f.fence) {
                Ok(()) => (),
                Err(vk::Result::ERROR_DEVICE_LOST) => dev.invalidate(),
                Err(x) => warn!("Waiting for capture frame failed: {:?}", x),
            }
            f.busy = false;
        }
    }

    fn destroy(&mut self, dev: &DeviceData) {
        self.wait_idle(dev);
        let device = dev.device();
        for f in self.frames.drain(..) {
            unsafe {
                device.destroy_fence(f.fence, None);
                device.destroy_semaphore(f.semaphore, None);
                /* frees the command buffer too */
                device.destroy_command_pool(f.pool, None);
            }
        }
        self.next = 0;
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/** Barriers before the copy: backbuffer to transfer source, export image
 * acquired from the external owner as transfer destination */
pub fn acquire_barriers(
    backbuffer: vk::Image,
    export: vk::Image,
    family: u32,
) -> [vk::ImageMemoryBarrier<'static>; 2] {
    [
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(backbuffer)
            .subresource_range(color_range()),
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
            .dst_queue_family_index(family)
            .image(export)
            .subresource_range(color_range()),
    ]
}

/** Barriers after the copy, undoing `acquire_barriers` */
pub fn release_barriers(
    backbuffer: vk::Image,
    export: vk::Image,
    family: u32,
) -> [vk::ImageMemoryBarrier<'static>; 2] {
    [
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(backbuffer)
            .subresource_range(color_range()),
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(family)
            .dst_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
            .image(export)
            .subresource_range(color_range()),
    ]
}

fn copy_region(extent: vk::Extent2D) -> vk::ImageCopy {
    vk::ImageCopy {
        src_subresource: color_layers(),
        src_offset: vk::Offset3D::default(),
        dst_subresource: color_layers(),
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

fn blit_region(extent: vk::Extent2D) -> vk::ImageBlit {
    let corner = vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    };
    vk::ImageBlit {
        src_subresource: color_layers(),
        src_offsets: [vk::Offset3D::default(), corner],
        dst_subresource: color_layers(),
        dst_offsets: [vk::Offset3D::default(), corner],
    }
}

fn init_export(
    dev: &DeviceData,
    swap: &SwapchainData,
    hints: AllocHints,
    consumer_uuid: [u8; 16],
) -> Result<(ExportedImage, bool), String> {
    let (format, needs_blit) = export_format(swap.format);
    if needs_blit {
        debug!(
            "Swapchain format {:?} has no DRM equivalent, blitting to {:?}",
            swap.format, format
        );
    }
    let req = ExportRequest {
        width: swap.extent.width,
        height: swap.extent.height,
        format,
        fourcc: vulkan_to_drm(format).unwrap_or(DRM_FORMAT_ARGB8888),
        hints,
        consumer_uuid,
        opaque_fd: false,
    };
    Ok((export_image(dev.export()?, &req)?, needs_blit))
}

/** Drop the export of `swap`, once no copy into it is in flight */
pub fn free_export(dev: &DeviceData, swap: &SwapchainData) {
    let mut sc = lock(&swap.capture);
    if sc.export.is_some() {
        for q in QUEUES.filter(|q| q.device == dev.key) {
            lock(&q.ring).wait_idle(dev);
        }
        sc.export = None;
        info!("Capture stopped");
    }
    sc.state = SwapState::Idle;
}

/** Record and submit the copy of `image_index` into the export.
 *
 * Returns the semaphore the present must wait on instead of `waits`, if
 * the submission took them over. */
fn capture_frame(
    dev: &DeviceData,
    queue: &QueueData,
    swap: &SwapchainData,
    sc: &mut SwapCapture,
    image_index: u32,
    waits: &[vk::Semaphore],
) -> Result<Option<vk::Semaphore>, String> {
    let Some(ref export) = sc.export else {
        return Ok(None);
    };
    if !queue.supports_transfer || (sc.needs_blit && !queue.supports_graphics) {
        return Ok(None);
    }
    let Some(&backbuffer) = swap.images.get(image_index as usize) else {
        return Err(tag!("Image index {} out of range", image_index));
    };

    let mut ring = lock(&queue.ring);
    ring.ensure(dev, queue.family, swap.images.len())?;
    let idx = ring.next;
    ring.next = (idx + 1) % ring.frames.len().max(1);
    let Some(frame) = ring.frames.get_mut(idx) else {
        return Err(tag!("Empty frame ring"));
    };

    if frame.busy {
        match wait_fence(dev, frame.fence) {
            Ok(()) => frame.busy = false,
            Err(vk::Result::TIMEOUT) => {
                warn!("Previous capture still running after 1s, skipping frame");
                return Ok(None);
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                dev.invalidate();
                return Err(tag!("Device lost while waiting for capture"));
            }
            Err(x) => return Err(tag!("Failed to wait for capture fence: {:?}", x)),
        }
    }

    let device = dev.device();
    let chain = waits.len() <= MAX_PRESENT_SWAP_SEMAPHORE_COUNT;
    unsafe {
        device
            .reset_fences(&[frame.fence])
            .map_err(|x| tag!("Failed to reset fence: {:?}", x))?;
        device
            .reset_command_pool(frame.pool, vk::CommandPoolResetFlags::empty())
            .map_err(|x| tag!("Failed to reset command pool: {:?}", x))?;
        let begin =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(frame.cmd, &begin)
            .map_err(|x| tag!("Failed to begin command buffer: {:?}", x))?;

        device.cmd_pipeline_barrier(
            frame.cmd,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &acquire_barriers(backbuffer, export.image, queue.family),
        );
        if sc.needs_blit {
            device.cmd_blit_image(
                frame.cmd,
                backbuffer,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                export.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit_region(swap.extent)],
                vk::Filter::NEAREST,
            );
        } else {
            device.cmd_copy_image(
                frame.cmd,
                backbuffer,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                export.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region(swap.extent)],
            );
        }
        device.cmd_pipeline_barrier(
            frame.cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &release_barriers(backbuffer, export.image, queue.family),
        );
        device
            .end_command_buffer(frame.cmd)
            .map_err(|x| tag!("Failed to end command buffer: {:?}", x))?;

        let stages = [vk::PipelineStageFlags::TRANSFER; MAX_PRESENT_SWAP_SEMAPHORE_COUNT];
        let cmds = [frame.cmd];
        let signal = [frame.semaphore];
        let mut submit = vk::SubmitInfo::default().command_buffers(&cmds);
        if chain {
            submit = submit
                .wait_semaphores(waits)
                .wait_dst_stage_mask(&stages[..waits.len()])
                .signal_semaphores(&signal);
        }
        match device.queue_submit(queue.queue, &[submit], frame.fence) {
            Ok(()) => (),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                dev.invalidate();
                return Err(tag!("Device lost on capture submit"));
            }
            Err(x) => return Err(tag!("Failed to submit capture: {:?}", x)),
        }
    }
    frame.busy = true;
    if sc.state != SwapState::Capturing {
        debug!("First frame copied for swapchain {:?}", swap.handle);
        sc.state = SwapState::Capturing;
    }
    Ok(if chain { Some(frame.semaphore) } else { None })
}

/** Capture work for one present on `queue` of `swap`, the first swapchain
 * in the present. Returns a semaphore replacing the present's waits. */
pub fn on_present(
    dev: &DeviceData,
    queue: &QueueData,
    swap: &Arc<SwapchainData>,
    image_index: u32,
    waits: &[vk::Semaphore],
) -> Option<vk::Semaphore> {
    let mut client = capture::global();
    client.update_socket();
    let mut cur = lock(&dev.cur_swap);

    if client.should_stop() {
        if let Some(c) = cur.take() {
            free_export(dev, &c);
        }
        client.stop();
    } else if !client.ready() {
        /* stopped through another device */
        if let Some(c) = cur.take() {
            free_export(dev, &c);
        }
    }

    if client.should_init() && cur.is_none() && dev.valid() {
        let hints = client.hints();
        let mut sc = lock(&swap.capture);
        if sc.may_init(hints) && swap.valid_extent() {
            match init_export(dev, swap, hints, client.device_uuid()) {
                Ok((export, needs_blit)) => {
                    let td = export.texture_data(
                        swap.winid,
                        false,
                        swap.color_space.as_raw() as u32,
                    );
                    let sent = client.init_texture(&td, &export.plane_fds());
                    match sent {
                        Ok(()) => {
                            sc.export = Some(export);
                            sc.needs_blit = needs_blit;
                            sc.state = SwapState::Ready;
                            sc.failed_hints = None;
                            *cur = Some(swap.clone());
                            info!(
                                "Vulkan capture started: {}x{} {:?}",
                                swap.extent.width, swap.extent.height, swap.format
                            );
                        }
                        Err(e) => warn!("Failed to announce export: {}", e),
                    }
                }
                Err(e) => {
                    error!("Failed to export swapchain image with {:?}: {}", hints, e);
                    sc.failed_hints = Some(hints);
                }
            }
        }
    }

    if !client.ready() {
        return None;
    }
    let cur_handle = cur.as_ref().map(|c| c.handle)?;
    if cur_handle != swap.handle {
        /* switch to the swapchain now being presented */
        if let Some(c) = cur.take() {
            free_export(dev, &c);
        }
        client.stop();
        return None;
    }

    let mut sc = lock(&swap.capture);
    match capture_frame(dev, queue, swap, &mut sc, image_index, waits) {
        Ok(s) => s,
        Err(e) => {
            warn!("Capture failed: {}", e);
            None
        }
    }
}

/** Forget capture state tied to a swapchain that is being destroyed */
pub fn on_destroy_swapchain(dev: &DeviceData, swap: &SwapchainData) {
    let mut client = capture::global();
    let mut cur = lock(&dev.cur_swap);
    if cur.as_ref().map(|c| c.handle) == Some(swap.handle) {
        if let Some(c) = cur.take() {
            free_export(dev, &c);
        }
        client.stop();
    }
}

/** Release everything the capture holds on a device about to be destroyed */
pub fn on_destroy_device(dev: &DeviceData) {
    {
        let mut client = capture::global();
        let mut cur = lock(&dev.cur_swap);
        if let Some(c) = cur.take() {
            free_export(dev, &c);
            client.stop();
        }
    }
    for q in QUEUES.remove_where(|q| q.device == dev.key) {
        q.destroy_frames(dev);
    }
    for swap in SWAPCHAINS.remove_where(|s| s.device == dev.key) {
        lock(&swap.capture).export = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn queue_capabilities() {
        let key = DispatchKey::from_raw(1);
        let q = QueueData::new(key, vk::Queue::null(), 0, vk::QueueFlags::GRAPHICS);
        assert!(q.supports_transfer && q.supports_graphics);
        let q = QueueData::new(key, vk::Queue::null(), 1, vk::QueueFlags::COMPUTE);
        assert!(q.supports_transfer && !q.supports_graphics);
        let q = QueueData::new(key, vk::Queue::null(), 2, vk::QueueFlags::TRANSFER);
        assert!(q.supports_transfer && !q.supports_graphics);
        let q = QueueData::new(key, vk::Queue::null(), 3, vk::QueueFlags::SPARSE_BINDING);
        assert!(!q.supports_transfer);
    }

    #[test]
    fn failed_hints_block_retry() {
        let mut sc = SwapCapture::default();
        let hints = AllocHints::default();
        assert_eq!(sc.state, SwapState::Idle);
        assert!(sc.may_init(hints));
        sc.failed_hints = Some(hints);
        assert!(!sc.may_init(hints));
        let weaker = AllocHints {
            no_modifiers: true,
            ..hints
        };
        assert!(sc.may_init(weaker));
    }

    #[test]
    fn swapchain_extent() {
        let mut info = vk::SwapchainCreateInfoKHR::default()
            .image_extent(vk::Extent2D {
                width: 1920,
                height: 1080,
            })
            .image_format(vk::Format::B8G8R8A8_UNORM);
        let key = DispatchKey::from_raw(1);
        let s = SwapchainData::new(key, vk::SwapchainKHR::from_raw(5), vec![], &info, 9);
        assert!(s.valid_extent());
        assert_eq!(s.winid, 9);
        for (w, h) in [(0, 0), (1, 1), (0, 100)] {
            info.image_extent = vk::Extent2D {
                width: w,
                height: h,
            };
            let s = SwapchainData::new(key, vk::SwapchainKHR::from_raw(5), vec![], &info, 0);
            assert!(!s.valid_extent());
        }
    }

    #[test]
    fn capture_barriers() {
        let bb = vk::Image::from_raw(1);
        let ex = vk::Image::from_raw(2);
        let [src, dst] = acquire_barriers(bb, ex, 3);
        assert_eq!(src.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(src.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(dst.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(dst.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(dst.src_queue_family_index, vk::QUEUE_FAMILY_EXTERNAL);
        assert_eq!(dst.dst_queue_family_index, 3);
        assert_eq!(dst.image, ex);

        let [src2, dst2] = release_barriers(bb, ex, 3);
        assert_eq!(src2.old_layout, src.new_layout);
        assert_eq!(src2.new_layout, src.old_layout);
        assert_eq!(dst2.new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(dst2.src_queue_family_index, 3);
        assert_eq!(dst2.dst_queue_family_index, vk::QUEUE_FAMILY_EXTERNAL);
    }

    #[test]
    fn copy_regions_cover_image() {
        let e = vk::Extent2D {
            width: 640,
            height: 360,
        };
        let c = copy_region(e);
        assert_eq!((c.extent.width, c.extent.height, c.extent.depth), (640, 360, 1));
        let b = blit_region(e);
        let corner = |o: vk::Offset3D| (o.x, o.y, o.z);
        assert_eq!(corner(b.src_offsets[0]), (0, 0, 0));
        assert_eq!(corner(b.src_offsets[1]), (640, 360, 1));
        assert_eq!(corner(b.dst_offsets[1]), (640, 360, 1));
    }
}
