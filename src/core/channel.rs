use crate::core::{Bdev, CoreError, Cores};

/// An I/O channel on a block device, bound to the core it was obtained on.
/// Channels are reference counted per (device, core) pair so that teardown
/// can verify that every core has dropped its channels.
pub struct IoChannel {
    bdev: Bdev,
    core: u32,
}

impl IoChannel {
    pub(crate) fn get(bdev: &Bdev) -> IoChannel {
        let core = Cores::current();
        bdev.channel_get(core);
        IoChannel {
            bdev: bdev.clone(),
            core,
        }
    }

    /// the core this channel was created on
    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn get_device(&self) -> Bdev {
        self.bdev.clone()
    }

    /// read `num_blocks` starting at `offset_blocks` into `buf`
    pub async fn read_blocks(
        &self,
        buf: &mut [u8],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        self.bdev.read_blocks_at(buf, offset_blocks, num_blocks).await
    }

    /// scatter read into the list of buffers
    pub async fn readv_blocks(
        &self,
        iovs: &mut [&mut [u8]],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        let mut lba = offset_blocks;
        let mut left = num_blocks;
        let block_len = self.bdev.block_len() as u64;

        for iov in iovs.iter_mut() {
            let blocks = (iov.len() as u64 / block_len).min(left);
            if blocks == 0 {
                break;
            }
            let bytes = (blocks * block_len) as usize;
            self.bdev
                .read_blocks_at(&mut iov[.. bytes], lba, blocks)
                .await?;
            lba += blocks;
            left -= blocks;
        }
        Ok(())
    }

    /// write `num_blocks` starting at `offset_blocks` from `buf`
    pub async fn write_blocks(
        &self,
        buf: &[u8],
        offset_blocks: u64,
        num_blocks: u64,
    ) -> Result<(), CoreError> {
        self.bdev.write_blocks_at(buf, offset_blocks, num_blocks).await
    }
}

impl Clone for IoChannel {
    fn clone(&self) -> Self {
        self.bdev.channel_get(self.core);
        IoChannel {
            bdev: self.bdev.clone(),
            core: self.core,
        }
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        self.bdev.channel_put(self.core);
    }
}
