use async_trait::async_trait;
use nix::errno::Errno;

use crate::{
    bdev::{claim_bdev_shared, ClaimGuard},
    bs::{BsDev, BsError},
    core::{Bdev, CoreError, DescriptorGuard},
};

/// A blobstore back-device on top of a registered bdev. In read-write mode
/// it is the base device a store lives on, optionally holding the
/// module-exclusive claim; in read-only mode it holds a shared claim and
/// rejects the write family like every other read-only variant.
pub struct BdevBsDev {
    bdev: Bdev,
    desc: DescriptorGuard,
    read_write: bool,
    exclusive_claim: bool,
    _shared_claim: Option<ClaimGuard>,
}

impl BdevBsDev {
    /// Open the named (or uuid-identified) bdev as a blobstore device.
    pub fn create(
        name: &str,
        read_write: bool,
        claim_module: Option<&'static str>,
    ) -> Result<BdevBsDev, CoreError> {
        let bdev = Bdev::lookup_by_name(name)
            .or_else(|| Bdev::lookup_by_uuid_str(name))
            .ok_or_else(|| CoreError::BdevNotFound {
                name: name.to_string(),
            })?;

        let desc = bdev.open(read_write)?;

        let (exclusive_claim, shared_claim) = if read_write {
            if let Some(module) = claim_module {
                bdev.claim(module)?;
                (true, None)
            } else {
                (false, None)
            }
        } else {
            (false, Some(claim_bdev_shared(&bdev)?))
        };

        Ok(BdevBsDev {
            bdev,
            desc,
            read_write,
            exclusive_claim,
            _shared_claim: shared_claim,
        })
    }

    pub fn bdev(&self) -> Bdev {
        self.bdev.clone()
    }

    fn map_read_err(e: CoreError, lba: u64, lba_count: u64) -> BsError {
        BsError::ReadError {
            source: e.errno(),
            lba,
            lba_count,
        }
    }
}

impl Drop for BdevBsDev {
    fn drop(&mut self) {
        if self.exclusive_claim {
            self.bdev.release_claim();
        }
    }
}

#[async_trait(?Send)]
impl BsDev for BdevBsDev {
    fn blocklen(&self) -> u32 {
        self.bdev.block_len()
    }

    fn blockcnt(&self) -> u64 {
        self.bdev.num_blocks()
    }

    async fn read(
        &self,
        buf: &mut [u8],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        let ch = self.desc.get_io_channel().map_err(|e| {
            Self::map_read_err(e, lba, lba_count as u64)
        })?;
        ch.read_blocks(buf, lba, lba_count as u64)
            .await
            .map_err(|e| Self::map_read_err(e, lba, lba_count as u64))
    }

    async fn readv(
        &self,
        iovs: &mut [&mut [u8]],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        let ch = self.desc.get_io_channel().map_err(|e| {
            Self::map_read_err(e, lba, lba_count as u64)
        })?;
        ch.readv_blocks(iovs, lba, lba_count as u64)
            .await
            .map_err(|e| Self::map_read_err(e, lba, lba_count as u64))
    }

    async fn write(
        &self,
        buf: &[u8],
        lba: u64,
        lba_count: u32,
    ) -> Result<(), BsError> {
        if !self.read_write {
            return Err(BsError::WriteProtected {
                source: Errno::EPERM,
            });
        }
        let ch = self.desc.get_io_channel().map_err(|_| {
            BsError::WriteProtected {
                source: Errno::EIO,
            }
        })?;
        ch.write_blocks(buf, lba, lba_count as u64).await.map_err(|e| {
            BsError::ReadError {
                source: e.errno(),
                lba,
                lba_count: lba_count as u64,
            }
        })
    }

    async fn write_zeroes(
        &self,
        lba: u64,
        lba_count: u64,
    ) -> Result<(), BsError> {
        if !self.read_write {
            return Err(BsError::WriteProtected {
                source: Errno::EPERM,
            });
        }
        let zeroes = vec![0u8; (lba_count * self.blocklen() as u64) as usize];
        self.write(&zeroes, lba, lba_count as u32).await
    }

    async fn unmap(&self, lba: u64, lba_count: u64) -> Result<(), BsError> {
        self.write_zeroes(lba, lba_count).await
    }

    fn identity(&self) -> Option<String> {
        Some(self.bdev.uuid_as_string())
    }
}
