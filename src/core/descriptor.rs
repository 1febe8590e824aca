use std::fmt::{Debug, Formatter};

use crate::core::{Bdev, CoreError, IoChannel};

/// A guard over an open bdev descriptor. The descriptor is closed when the
/// guard is dropped.
pub struct DescriptorGuard {
    bdev: Bdev,
    read_write: bool,
}

impl DescriptorGuard {
    pub(crate) fn new(bdev: Bdev, read_write: bool) -> Self {
        Self {
            bdev,
            read_write,
        }
    }

    /// the device this descriptor belongs to
    pub fn get_device(&self) -> Bdev {
        self.bdev.clone()
    }

    pub fn device_name(&self) -> String {
        self.bdev.name().to_string()
    }

    pub fn is_read_write(&self) -> bool {
        self.read_write
    }

    /// obtain an io channel on the current core
    pub fn get_io_channel(&self) -> Result<IoChannel, CoreError> {
        Ok(IoChannel::get(&self.bdev))
    }
}

impl Drop for DescriptorGuard {
    fn drop(&mut self) {
        self.bdev.close_descriptor();
    }
}

impl Debug for DescriptorGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Descriptor {} ({})",
            self.bdev.name(),
            if self.read_write { "rw" } else { "ro" }
        )
    }
}
