//! com-on-air character-device port.
//!
//! Control requests are ioctls on the device fd; frames are fixed-size
//! non-blocking reads from the same fd. Request codes and mode values mirror
//! the driver's `com_on_air_user.h`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::rfpi::Rfpi;

use super::{DeviceControl, DeviceError, DeviceMode, FrameSource};

const COA_IOCTL_MODE: libc::c_ulong = 0xd000;
const COA_IOCTL_CHAN: libc::c_ulong = 0xd004;
const COA_IOCTL_SETRFPI: libc::c_ulong = 0xd008;

const COA_MODE_IDLE: u16 = 0x0000;
const COA_MODE_SNIFF: u16 = 0x0300;
const COA_SUBMODE_SNIFF_SCANFP: u16 = 0x0001;
const COA_SUBMODE_SNIFF_SCANPP: u16 = 0x0002;
const COA_SUBMODE_SNIFF_SYNC: u16 = 0x0003;

/// Handle on the com-on-air sniffer device (default `/dev/coa`).
pub struct CoaDevice {
    file: File,
}

impl CoaDevice {
    /// Open the device read/write and non-blocking. The fd is polled by the
    /// event loop, so reads must never block.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        tracing::info!("opened sniffer device {:?}", path);
        Ok(Self { file })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: *const T) -> io::Result<()> {
        // SAFETY: arg points at a live value of the type the driver expects
        // for this request code, and the fd is owned by self.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl DeviceControl for CoaDevice {
    fn set_mode(&mut self, mode: DeviceMode) -> Result<(), DeviceError> {
        let val: u16 = match mode {
            DeviceMode::Idle => COA_MODE_IDLE,
            DeviceMode::ScanBases => COA_MODE_SNIFF | COA_SUBMODE_SNIFF_SCANFP,
            DeviceMode::ScanCalls => COA_MODE_SNIFF | COA_SUBMODE_SNIFF_SCANPP,
            DeviceMode::Sync => COA_MODE_SNIFF | COA_SUBMODE_SNIFF_SYNC,
        };
        self.ioctl(COA_IOCTL_MODE, &val).map_err(DeviceError::SetMode)
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), DeviceError> {
        let val: u32 = channel.into();
        self.ioctl(COA_IOCTL_CHAN, &val).map_err(DeviceError::SetChannel)
    }

    fn set_rfpi(&mut self, rfpi: &Rfpi) -> Result<(), DeviceError> {
        self.ioctl(COA_IOCTL_SETRFPI, rfpi.as_bytes().as_ptr())
            .map_err(DeviceError::SetRfpi)
    }
}

impl FrameSource for CoaDevice {
    fn try_read_frame(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        // The driver delivers whole frames per read; a short read means the
        // next frame is not complete yet and we treat the drain as done.
        match self.file.read(buf) {
            Ok(n) if n == buf.len() => Ok(true),
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}
