//! Cluster-unique identifier blocks

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FlowgridError, FlowgridResult};

/// Contiguous range `[start, start + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBlock {
    pub start: u64,
    pub size: u64,
}

impl IdBlock {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last id; saturates for the final block of the id space
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn contains(&self, id: u64) -> bool {
        id >= self.start && id < self.end()
    }

    pub fn overlaps(&self, other: &IdBlock) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Source of cluster-unique id blocks
#[async_trait]
pub trait IdBlockAllocator: Send + Sync {
    async fn allocate_unique_id_block(&self) -> FlowgridResult<IdBlock>;
}

/// Hands out consecutive ids, fetching a fresh block when one runs dry
///
/// Id 0 stands for "unassigned" and is never handed out.
pub struct IdGenerator<T> {
    allocator: Arc<dyn IdBlockAllocator>,
    current: Mutex<Option<(IdBlock, u64)>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: From<u64>> IdGenerator<T> {
    pub fn new(allocator: Arc<dyn IdBlockAllocator>) -> Self {
        Self {
            allocator,
            current: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    pub async fn next_id(&self) -> FlowgridResult<T> {
        let mut current = self.current.lock().await;
        loop {
            if let Some((block, next)) = current.as_mut() {
                if *next < block.end() {
                    let id = *next;
                    *next += 1;
                    return Ok(T::from(id));
                }
            }

            let block = self.allocator.allocate_unique_id_block().await?;
            if block.size == 0 {
                return Err(FlowgridError::internal("allocator returned an empty id block"));
            }
            debug!("Allocated id block [{:#x}, {:#x})", block.start, block.end());
            *current = Some((block, block.start.max(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::types::FlowId;

    struct SmallBlocks {
        next: AtomicU64,
    }

    #[async_trait]
    impl IdBlockAllocator for SmallBlocks {
        async fn allocate_unique_id_block(&self) -> FlowgridResult<IdBlock> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(IdBlock::new(n * 3, 3))
        }
    }

    #[test]
    fn test_block_overlap() {
        let a = IdBlock::new(0, 10);
        let b = IdBlock::new(10, 10);
        let c = IdBlock::new(5, 10);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(a.contains(9));
        assert!(!a.contains(10));
    }

    #[tokio::test]
    async fn test_generator_rolls_over_blocks() {
        let generator: IdGenerator<FlowId> = IdGenerator::new(Arc::new(SmallBlocks {
            next: AtomicU64::new(1),
        }));
        let mut ids = Vec::new();
        for _ in 0..7 {
            ids.push(generator.next_id().await.unwrap().value());
        }
        assert_eq!(ids, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_generator_never_hands_out_zero() {
        let generator: IdGenerator<FlowId> = IdGenerator::new(Arc::new(SmallBlocks {
            next: AtomicU64::new(0),
        }));
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(generator.next_id().await.unwrap().value());
        }
        assert_eq!(ids, vec![1, 2, 3, 4]);

        // A block holding only id 0 is skipped
        struct ZeroBlock(AtomicU64);

        #[async_trait]
        impl IdBlockAllocator for ZeroBlock {
            async fn allocate_unique_id_block(&self) -> FlowgridResult<IdBlock> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                Ok(IdBlock::new(n, 1))
            }
        }
        let generator: IdGenerator<FlowId> = IdGenerator::new(Arc::new(ZeroBlock(AtomicU64::new(0))));
        assert_eq!(generator.next_id().await.unwrap().value(), 1);
    }
}
