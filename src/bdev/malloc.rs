use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::{Bdev, BdevOps, BdevParams, CoreError, IoType};

/// An in-memory block device. Storage grows on first write, so the device
/// can be resized by bumping its block count alone.
struct MallocOps {
    data: Mutex<Vec<u8>>,
    block_len: u32,
}

#[async_trait(?Send)]
impl BdevOps for MallocOps {
    async fn read_blocks(
        &self,
        buf: &mut [u8],
        offset_blocks: u64,
        _num_blocks: u64,
    ) -> Result<(), CoreError> {
        let data = self.data.lock();
        let start = (offset_blocks * self.block_len as u64) as usize;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = data.get(start + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    async fn write_blocks(
        &self,
        buf: &[u8],
        offset_blocks: u64,
        _num_blocks: u64,
    ) -> Result<(), CoreError> {
        let mut data = self.data.lock();
        let start = (offset_blocks * self.block_len as u64) as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start .. end].copy_from_slice(buf);
        Ok(())
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(
            io_type,
            IoType::Read | IoType::Write | IoType::Unmap | IoType::WriteZeroes
        )
    }
}

/// Create and register an in-memory bdev.
pub fn create_malloc_bdev(
    name: &str,
    uuid: Option<&str>,
    num_blocks: u64,
    block_len: u32,
) -> Result<Bdev, CoreError> {
    let uuid = match uuid {
        Some(u) => Uuid::parse_str(u).map_err(|_| CoreError::InvalidParams {
            name: name.to_string(),
            msg: format!("invalid uuid '{}'", u),
        })?,
        None => Uuid::new_v4(),
    };

    Bdev::register(
        BdevParams {
            name: name.to_string(),
            uuid,
            product_name: "Malloc disk".to_string(),
            module: "malloc",
            block_len,
            num_blocks,
        },
        Box::new(MallocOps {
            data: Mutex::new(Vec::new()),
            block_len,
        }),
    )
}
