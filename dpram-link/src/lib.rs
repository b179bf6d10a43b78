#![cfg_attr(not(test), no_std)]
#![doc = "Boot transfer and IPC layout for DPRAM-attached modem coprocessors."]
#![doc = ""]
#![doc = "Drives the boot-time firmware exchange over the shared dual-ported RAM"]
#![doc = "window and pins the steady-state IPC map that replaces it once the CP"]
#![doc = "runs. Hardware access (mailbox registers, the data-ready line, delays)"]
#![doc = "comes in through traits, so the crate runs on any platform that can"]
#![doc = "map the window."]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod boot;
pub mod ipc;
pub mod mailbox;
pub mod region;

// The types a platform port actually touches.
pub use boot::{BootError, BootSequencer, DumpFrame, Phase};
pub use ipc::{ChannelId, ChannelRing, IpcView};
pub use mailbox::{CommandInbox, InitEndSignal, IrqLine, Mailbox};
pub use region::{OutOfBounds, SharedRegion, SpeedClass};
