//! Persistently mapped geometry streams.
//!
//! Vertex attributes live in one host-visible buffer split into four
//! contiguous regions (positions, colors, texcoord 0, texcoord 1), indices
//! in a second buffer. Each region is fronted by a bump cursor that resets
//! once per frame; running out of room mid-frame is an error, not a flush.

use ash::vk;

use crate::context::RenderContext;
use crate::error::{GfxError, GfxResult};

/// Bytes per vertex across all four attribute streams (16 + 4 + 8 + 8).
const VERTEX_STRIDE_TOTAL: vk::DeviceSize = 36;
const INDEX_STRIDE: vk::DeviceSize = 4;

/// Bump-cursor view over a span of persistently mapped memory.
pub(crate) struct MappedArena {
    base: *mut u8,
    capacity: vk::DeviceSize,
    used: vk::DeviceSize,
    label: &'static str,
}

impl MappedArena {
    /// # Safety
    ///
    /// `base` must point to at least `capacity` writable bytes that stay
    /// mapped for the arena's lifetime, and no other writer may touch them.
    pub(crate) unsafe fn new(base: *mut u8, capacity: vk::DeviceSize, label: &'static str) -> Self {
        Self { base, capacity, used: 0, label }
    }

    /// Append `items` and return the byte offset they were written at.
    pub(crate) fn push<T: Copy>(&mut self, items: &[T]) -> GfxResult<vk::DeviceSize> {
        let needed = (items.len() as u64)
            .checked_mul(std::mem::size_of::<T>() as u64)
            .ok_or(GfxError::StreamOverflow {
                stream: self.label,
                needed: u64::MAX,
                remaining: self.capacity - self.used,
                capacity: self.capacity,
            })?;
        let remaining = self.capacity - self.used;
        if needed > remaining {
            return Err(GfxError::StreamOverflow {
                stream: self.label,
                needed,
                remaining,
                capacity: self.capacity,
            });
        }
        let offset = self.used;
        unsafe {
            std::ptr::copy_nonoverlapping(
                items.as_ptr() as *const u8,
                self.base.add(offset as usize),
                needed as usize,
            );
        }
        self.used += needed;
        Ok(offset)
    }

    pub(crate) fn reset(&mut self) {
        self.used = 0;
    }
}

/// Byte offsets of the four attribute regions within the vertex buffer.
fn vertex_region_offsets(max_vertices: vk::DeviceSize) -> [vk::DeviceSize; 4] {
    let positions = 0;
    let colors = positions + 16 * max_vertices;
    let tc0 = colors + 4 * max_vertices;
    let tc1 = tc0 + 8 * max_vertices;
    [positions, colors, tc0, tc1]
}

struct HostBuffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    ptr: *mut u8,
}

impl HostBuffer {
    fn new(ctx: &RenderContext, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> GfxResult<Self> {
        let device = ctx.device();
        unsafe {
            let info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = device
                .create_buffer(&info, None)
                .map_err(|e| GfxError::api("create_buffer", e))?;
            let req = device.get_buffer_memory_requirements(buffer);
            let mem_type = ctx.find_memory_type(
                req.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let alloc = vk::MemoryAllocateInfo::builder()
                .allocation_size(req.size)
                .memory_type_index(mem_type);
            let memory = device
                .allocate_memory(&alloc, None)
                .map_err(|e| GfxError::api("allocate_memory", e))?;
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(|e| GfxError::api("bind_buffer_memory", e))?;
            let ptr = device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                .map_err(|e| GfxError::api("map_memory", e))? as *mut u8;
            Ok(Self { device: device.clone(), buffer, memory, ptr })
        }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.unmap_memory(self.memory);
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Where one draw's vertex data landed. Offsets are absolute byte offsets
/// into the vertex buffer, indexed by binding.
#[derive(Clone, Copy, Debug)]
pub struct VertexSlot {
    pub offsets: [vk::DeviceSize; 4],
    pub stream_count: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct IndexSlot {
    pub offset: vk::DeviceSize,
    pub count: u32,
}

pub struct GeometryStreams {
    vertex: HostBuffer,
    index: HostBuffer,
    positions: MappedArena,
    colors: MappedArena,
    tc0: MappedArena,
    tc1: MappedArena,
    indices: MappedArena,
    region_offsets: [vk::DeviceSize; 4],
}

impl GeometryStreams {
    pub fn new(ctx: &RenderContext, max_vertices: u32, max_indices: u32) -> GfxResult<Self> {
        let v = vk::DeviceSize::from(max_vertices);
        let vertex = HostBuffer::new(ctx, VERTEX_STRIDE_TOTAL * v, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index = HostBuffer::new(
            ctx,
            INDEX_STRIDE * vk::DeviceSize::from(max_indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        let region_offsets = vertex_region_offsets(v);
        // The arenas partition the vertex mapping; ranges do not overlap.
        let (positions, colors, tc0, tc1, indices) = unsafe {
            (
                MappedArena::new(vertex.ptr.add(region_offsets[0] as usize), 16 * v, "positions"),
                MappedArena::new(vertex.ptr.add(region_offsets[1] as usize), 4 * v, "colors"),
                MappedArena::new(vertex.ptr.add(region_offsets[2] as usize), 8 * v, "tc0"),
                MappedArena::new(vertex.ptr.add(region_offsets[3] as usize), 8 * v, "tc1"),
                MappedArena::new(index.ptr, INDEX_STRIDE * vk::DeviceSize::from(max_indices), "indices"),
            )
        };
        Ok(Self { vertex, index, positions, colors, tc0, tc1, indices, region_offsets })
    }

    /// Append one draw's attributes. The slices must be equal-length; `tc1`
    /// is only consumed when present and the returned slot carries three or
    /// four streams accordingly.
    pub fn append_vertices(
        &mut self,
        positions: &[[f32; 4]],
        colors: &[[u8; 4]],
        tc0: &[[f32; 2]],
        tc1: Option<&[[f32; 2]]>,
    ) -> GfxResult<VertexSlot> {
        debug_assert_eq!(positions.len(), colors.len());
        debug_assert_eq!(positions.len(), tc0.len());
        let mut offsets = [0; 4];
        offsets[0] = self.region_offsets[0] + self.positions.push(positions)?;
        offsets[1] = self.region_offsets[1] + self.colors.push(colors)?;
        offsets[2] = self.region_offsets[2] + self.tc0.push(tc0)?;
        let stream_count = match tc1 {
            Some(tc1) => {
                debug_assert_eq!(positions.len(), tc1.len());
                offsets[3] = self.region_offsets[3] + self.tc1.push(tc1)?;
                4
            }
            None => 3,
        };
        Ok(VertexSlot { offsets, stream_count })
    }

    pub fn append_indices(&mut self, indices: &[u32]) -> GfxResult<IndexSlot> {
        let offset = self.indices.push(indices)?;
        Ok(IndexSlot { offset, count: indices.len() as u32 })
    }

    /// Rewind all stream cursors. Called at the top of each frame; data from
    /// the previous frame must no longer be referenced by the device.
    pub fn reset(&mut self) {
        self.positions.reset();
        self.colors.reset();
        self.tc0.reset();
        self.tc1.reset();
        self.indices.reset();
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex.buffer
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.index.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_arena(backing: &mut Vec<u8>) -> MappedArena {
        unsafe { MappedArena::new(backing.as_mut_ptr(), backing.len() as u64, "test") }
    }

    #[test]
    fn push_advances_and_writes() {
        let mut backing = vec![0u8; 64];
        let mut arena = heap_arena(&mut backing);
        let a = arena.push(&[1u32, 2, 3]).unwrap();
        let b = arena.push(&[0xAABBCCDDu32]).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 12);
        drop(arena);
        assert_eq!(&backing[0..4], &1u32.to_ne_bytes());
        assert_eq!(&backing[12..16], &0xAABBCCDDu32.to_ne_bytes());
    }

    #[test]
    fn empty_push_is_free() {
        let mut backing = vec![0u8; 8];
        let mut arena = heap_arena(&mut backing);
        let off = arena.push::<u32>(&[]).unwrap();
        assert_eq!(off, 0);
        // The cursor has not moved.
        assert_eq!(arena.push(&[7u8]).unwrap(), 0);
    }

    #[test]
    fn overflow_reports_exact_shortfall() {
        let mut backing = vec![0u8; 10];
        let mut arena = heap_arena(&mut backing);
        arena.push(&[0u32, 0]).unwrap();
        let err = arena.push(&[0u32]).unwrap_err();
        match err {
            GfxError::StreamOverflow { stream, needed, remaining, capacity } => {
                assert_eq!(stream, "test");
                assert_eq!(needed, 4);
                assert_eq!(remaining, 2);
                assert_eq!(capacity, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Failed push leaves the cursor where it was.
        assert_eq!(arena.push(&[0u16]).unwrap(), 8);
    }

    #[test]
    fn reset_rewinds_to_zero() {
        let mut backing = vec![0u8; 16];
        let mut arena = heap_arena(&mut backing);
        assert_eq!(arena.push(&[[1.0f32, 2.0]]).unwrap(), 0);
        assert_eq!(arena.push(&[[3.0f32, 4.0]]).unwrap(), 8);
        arena.reset();
        assert_eq!(arena.push(&[[5.0f32, 6.0]]).unwrap(), 0);
    }

    #[test]
    fn regions_partition_the_vertex_buffer() {
        let offsets = vertex_region_offsets(1000);
        assert_eq!(offsets, [0, 16_000, 20_000, 28_000]);
        assert_eq!(VERTEX_STRIDE_TOTAL * 1000, 36_000);
    }
}
