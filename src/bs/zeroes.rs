use std::sync::Arc;

use async_trait::async_trait;

use crate::bs::{BsDev, BsError, ExtIoOpts};

/// A back device whose every block reads as zero. The plain variant has an
/// effectively infinite block count; the cluster-backed variant mirrors the
/// store's reserved zero cluster so that even memory-domain reads can be
/// served by delegating to real data.
pub struct ZeroesBsDev {
    blocklen: u32,
    blockcnt: u64,
    zero_cluster: Option<Arc<Vec<u8>>>,
}

impl ZeroesBsDev {
    pub fn new() -> Self {
        Self {
            blocklen: 512,
            blockcnt: u64::MAX,
            zero_cluster: None,
        }
    }

    /// zeroes device backed by a store's reserved zero cluster
    pub fn cluster_backed(io_unit_size: u32, cluster: Arc<Vec<u8>>) -> Self {
        let blockcnt = cluster.len() as u64 / io_unit_size as u64;
        Self {
            blocklen: io_unit_size,
            blockcnt,
            zero_cluster: Some(cluster),
        }
    }
}

impl Default for ZeroesBsDev {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl BsDev for ZeroesBsDev {
    fn blocklen(&self) -> u32 {
        self.blocklen
    }

    fn blockcnt(&self) -> u64 {
        self.blockcnt
    }

    async fn read(
        &self,
        buf: &mut [u8],
        _lba: u64,
        _lba_count: u32,
    ) -> Result<(), BsError> {
        buf.fill(0);
        Ok(())
    }

    async fn readv(
        &self,
        iovs: &mut [&mut [u8]],
        _lba: u64,
        _lba_count: u32,
    ) -> Result<(), BsError> {
        for iov in iovs.iter_mut() {
            iov.fill(0);
        }
        Ok(())
    }

    async fn readv_ext(
        &self,
        iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
        opts: &ExtIoOpts,
    ) -> Result<(), BsError> {
        match (&opts.memory_domain, &self.zero_cluster) {
            (Some(_), Some(cluster)) => {
                // Serve from the reserved zero cluster, as a device read at
                // the zero cluster's address would.
                for iov in iovs.iter_mut() {
                    let n = iov.len().min(cluster.len());
                    iov[.. n].copy_from_slice(&cluster[.. n]);
                    iov[n ..].fill(0);
                }
                Ok(())
            }
            (Some(_), None) => Err(BsError::ExtOptsUnsupported {
                source: nix::errno::Errno::ENOTSUP,
            }),
            (None, _) => self.readv(iovs, lba, lba_count).await,
        }
    }

    fn is_zeroes(&self, _lba: u64, _lba_count: u64) -> bool {
        true
    }
}
