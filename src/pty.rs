//! Pseudo-terminal allocation and process attachment. The heavy lifting
//! (openpty, setsid, controlling terminal, stdio wiring) is delegated to
//! `pty_process`; this module owns sizing and the failure paths.

use pty_process::{OwnedWritePty, Pts, Pty, Size};
use tokio::process::Child;

use crate::{
    error::ServerError,
    wire::{PtyRequest, WindowChange},
};

/// Terminal dimensions in cells and pixels. Zero dimensions are legal;
/// the pty is simply allocated with a zero winsize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl PtySize {
    fn clamp(value: u32) -> u16 {
        value.try_into().unwrap_or(u16::MAX)
    }
}

impl From<&PtyRequest> for PtySize {
    fn from(msg: &PtyRequest) -> Self {
        PtySize {
            rows: Self::clamp(msg.row_height),
            cols: Self::clamp(msg.col_width),
            pixel_width: Self::clamp(msg.pix_width),
            pixel_height: Self::clamp(msg.pix_height),
        }
    }
}

impl From<&WindowChange> for PtySize {
    fn from(msg: &WindowChange) -> Self {
        PtySize {
            rows: Self::clamp(msg.row_height),
            cols: Self::clamp(msg.col_width),
            pixel_width: Self::clamp(msg.pix_width),
            pixel_height: Self::clamp(msg.pix_height),
        }
    }
}

impl From<PtySize> for Size {
    fn from(size: PtySize) -> Size {
        Size::new_with_pixel(size.rows, size.cols, size.pixel_width, size.pixel_height)
    }
}

/// The master side handles that can apply a winsize.
pub trait ResizablePty {
    fn apply_size(&self, size: PtySize) -> Result<(), ServerError>;
}

impl ResizablePty for Pty {
    fn apply_size(&self, size: PtySize) -> Result<(), ServerError> {
        self.resize(size.into())
            .map_err(|error| ServerError::Resource(error.to_string()))
    }
}

impl ResizablePty for OwnedWritePty {
    fn apply_size(&self, size: PtySize) -> Result<(), ServerError> {
        self.resize(size.into())
            .map_err(|error| ServerError::Resource(error.to_string()))
    }
}

/// Allocate a pty pair. Both sides close on drop, so every failure path
/// after this releases them.
pub fn open() -> Result<(Pty, Pts), ServerError> {
    pty_process::open().map_err(|error| ServerError::Resource(error.to_string()))
}

pub fn set_size(pty: &impl ResizablePty, size: PtySize) -> Result<(), ServerError> {
    pty.apply_size(size)
}

/// Allocate a pty, apply the initial size, and launch `command` with the
/// slave as its controlling terminal and stdio. The child is put in a new
/// session by the underlying spawn.
pub fn spawn_with_pty(
    command: &mut pty_process::Command,
    size: PtySize,
) -> Result<(Pty, Child), ServerError> {
    let (pty, pts) = open()?;
    set_size(&pty, size)?;
    let child = command
        .spawn_borrowed(&pts)
        .map_err(|error| ServerError::Resource(error.to_string()))?;
    Ok((pty, child))
}
