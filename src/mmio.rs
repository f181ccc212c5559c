// DisplayPort link training tools
//
// Copyright (C) 2023, Intel Corporation

//! Register access of a real display controller.
//!
//! The controller registers are mapped from the PCI BAR 0 resource file in `sysfs`. This needs
//! root privileges and nothing else (such as the kernel graphics driver) should be touching the
//! same port at the same time.

use std::ffi::c_void;
use std::fmt::{self, Display};
use std::fs::OpenOptions;
use std::io::{self, Error, ErrorKind};
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use log::{debug, warn};
use nix::sys::mman::{self, MapFlags, ProtFlags};

use crate::access::RegisterAccess;
use crate::util;

const PCI_VENDOR_INTEL: u16 = 0x8086;
const PCI_CLASS_DISPLAY: u32 = 0x03;

/// Memory-mapped registers of one display controller.
pub struct Mmio {
    path: PathBuf,
    base: *mut c_void,
    len: usize,
}

impl Mmio {
    /// Maps PCI resource file at `path` (for example `/sys/bus/pci/devices/0000:00:02.0/resource0`).
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len() as usize;
        let size = NonZeroUsize::new(len).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("{} is empty", path.display()),
            )
        })?;

        // SAFETY: Mapping a device resource shared, nothing else in this process aliases it.
        let base = unsafe {
            mman::mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }?;

        debug!("mapped {} bytes of {}", len, path.display());

        Ok(Self { path, base, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn register(&self, offset: u32) -> Option<*mut u32> {
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 > self.len {
            return None;
        }
        // SAFETY: Checked above that the register is within the mapping.
        Some(unsafe { self.base.cast::<u8>().add(offset).cast::<u32>() })
    }
}

impl RegisterAccess for Mmio {
    fn read(&mut self, offset: u32) -> u32 {
        match self.register(offset) {
            // SAFETY: Aligned and within the mapping.
            Some(reg) => unsafe { ptr::read_volatile(reg) },
            None => {
                warn!("read of register {:#x} outside of {}", offset, self.path.display());
                !0
            }
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        match self.register(offset) {
            // SAFETY: Aligned and within the mapping.
            Some(reg) => unsafe { ptr::write_volatile(reg, value) },
            None => warn!("write of register {:#x} outside of {}", offset, self.path.display()),
        }
    }
}

impl Drop for Mmio {
    fn drop(&mut self) {
        // SAFETY: Unmapping what was mapped in open().
        if let Err(err) = unsafe { mman::munmap(self.base, self.len) } {
            warn!("failed to unmap {}: {}", self.path.display(), err);
        }
    }
}

/// Display controller found on the PCI bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayController {
    name: String,
    device: u16,
    syspath: PathBuf,
}

impl DisplayController {
    /// PCI name of the controller such as `0000:00:02.0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PCI device ID.
    pub fn device(&self) -> u16 {
        self.device
    }

    pub fn sysfs_path(&self) -> &Path {
        &self.syspath
    }

    /// Maps registers of the controller.
    pub fn mmio(&self) -> io::Result<Mmio> {
        Mmio::open(self.syspath.join("resource0"))
    }

    fn parse(udev: udev::Device) -> Option<Self> {
        let attr = |name: &str| -> Option<u32> {
            util::parse_hex(udev.attribute_value(name)?.to_str()?)
        };

        if attr("vendor")? != u32::from(PCI_VENDOR_INTEL) {
            return None;
        }
        if attr("class")? >> 16 != PCI_CLASS_DISPLAY {
            return None;
        }

        Some(Self {
            name: String::from(udev.sysname().to_str()?),
            device: attr("device")? as u16,
            syspath: udev.syspath().to_path_buf(),
        })
    }
}

impl Display for DisplayController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:04x}:{:04x}]", self.name, PCI_VENDOR_INTEL, self.device)
    }
}

/// Returns Intel display controllers of the system.
///
/// Returns [`ErrorKind::NotFound`] if there are none.
pub fn find_display_controllers() -> io::Result<Vec<DisplayController>> {
    let mut enumerator = udev::Enumerator::new()?;

    enumerator.match_subsystem("pci")?;

    let controllers: Vec<_> = enumerator
        .scan_devices()?
        .filter_map(DisplayController::parse)
        .collect();

    if controllers.is_empty() {
        return Err(Error::new(
            ErrorKind::NotFound,
            "no Intel display controller found",
        ));
    }

    Ok(controllers)
}
