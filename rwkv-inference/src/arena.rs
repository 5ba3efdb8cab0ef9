//! Activation memory for one graph, sized by a measuring pass.
//!
//! A graph is built twice. The first build runs against a measuring arena that
//! hands out offsets without backing memory; the resulting [`ArenaPlan`] sizes the
//! real arena, and the second build allocates the same sequence of offsets from it.

use crate::error::{Error, ErrorFlags, Result};
use crate::utils::align_up;

/// Every allocation starts on a 64-byte boundary.
pub(crate) const ALIGN_FLOATS: usize = 16;
/// Headroom added on top of the measured size.
const SAFETY_MARGIN_FLOATS: usize = 1024;

/// Capacity descriptor produced by a measuring build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaPlan {
    /// Number of graph nodes, views included.
    pub node_count: usize,
    /// Floats handed out, alignment padding included.
    pub used_floats: usize,
    /// Floats lost to alignment.
    pub padding_floats: usize,
    /// Bytes of node bookkeeping kept outside the arena.
    pub overhead_bytes: usize,
}

impl ArenaPlan {
    pub fn capacity_floats(&self) -> usize {
        self.used_floats + SAFETY_MARGIN_FLOATS
    }

    pub fn total_bytes(&self) -> usize {
        self.capacity_floats() * size_of::<f32>() + self.overhead_bytes
    }
}

#[derive(Debug)]
pub(crate) struct Arena {
    data: Option<Vec<f32>>,
    capacity: usize,
    used: usize,
    padding: usize,
}

impl Arena {
    /// An arena without memory that accepts any allocation.
    pub fn measuring() -> Self {
        Self { data: None, capacity: usize::MAX, used: 0, padding: 0 }
    }

    pub fn with_plan(plan: &ArenaPlan) -> Result<Self> {
        let capacity = plan.capacity_floats();
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|e| {
            Error::new(ErrorFlags::ALLOC, format!("Failed to allocate {} bytes of graph memory: {e}", capacity * 4))
        })?;
        data.resize(capacity, 0.0);
        Ok(Self { data: Some(data), capacity, used: 0, padding: 0 })
    }

    pub fn is_measuring(&self) -> bool {
        self.data.is_none()
    }

    /// Reserves `len` floats and returns their offset.
    pub fn alloc(&mut self, len: usize) -> Result<usize> {
        let offset = align_up(self.used, ALIGN_FLOATS);
        let end = offset.checked_add(len).filter(|&end| end <= self.capacity).ok_or_else(|| {
            Error::new(
                ErrorFlags::ALLOC,
                format!("Graph arena exhausted: need {len} floats at offset {offset}, capacity {}", self.capacity),
            )
        })?;

        self.padding += offset - self.used;
        self.used = end;
        Ok(offset)
    }

    pub fn plan(&self, node_count: usize, node_bytes: usize) -> ArenaPlan {
        ArenaPlan { node_count, used_floats: self.used, padding_floats: self.padding, overhead_bytes: node_count * node_bytes }
    }

    pub fn data(&self) -> &[f32] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}
