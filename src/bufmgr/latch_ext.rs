use crate::error;
use crate::latch::{ExclusiveGuard, HybridLatch, OptimisticGuard};

use super::BufferFrame;

/// Frame-latch helpers that stamp the page dirty (by bumping its LSN) as part
/// of acquiring write access.
pub trait BfLatchExt {
    fn exclusive_bf(&self) -> ExclusiveGuard<'_, BufferFrame>;
}

pub trait BfOptimisticGuardExt<'a, T: ?Sized> {
    fn to_exclusive_bf(self) -> error::Result<ExclusiveGuard<'a, T, BufferFrame>>;
}

impl BfLatchExt for HybridLatch<BufferFrame> {
    #[inline]
    fn exclusive_bf(&self) -> ExclusiveGuard<'_, BufferFrame> {
        let mut guard = self.exclusive();
        guard.page.lsn += 1;
        guard
    }
}

impl<'a, T: ?Sized> BfOptimisticGuardExt<'a, T> for OptimisticGuard<'a, T, BufferFrame> {
    #[inline]
    fn to_exclusive_bf(self) -> error::Result<ExclusiveGuard<'a, T, BufferFrame>> {
        self.to_exclusive().map(|mut g| {
            g.as_unmapped_mut().page.lsn += 1;
            g
        })
    }
}
