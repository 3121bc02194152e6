//! Inter-task channels.
//!
//! `embassy-sync` bounded MPMC channels bridge the console, comm and
//! protocol threads without heap allocation.  All sends are `try_send`:
//! a full channel drops the message and logs, nobody ever blocks on it.
//!
//! ```text
//! ┌──────────┐  AppCommand      ┌──────────────┐  BackendRequest  ┌────────────────┐
//! │ console  │────────────────▶│ comm thread  │────────────────▶│ protocol task  │
//! │ (UI)     │                  │ (AppService) │                  │ (BackendBridge)│
//! └──────────┘                  └──────────────┘                  └────────────────┘
//! ```

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::app::commands::AppCommand;
use crate::app::ports::BackendRequest;

/// Channel depth for operator commands.
const CMD_DEPTH: usize = 4;

/// Channel depth for outward backend requests.
const BACKEND_DEPTH: usize = 16;

pub type CommandChannel = Channel<CriticalSectionRawMutex, AppCommand, CMD_DEPTH>;
pub type BackendChannel = Channel<CriticalSectionRawMutex, BackendRequest, BACKEND_DEPTH>;

/// Console → comm thread.
pub static COMMANDS: CommandChannel = Channel::new();

/// Comm thread → protocol task.
pub static BACKEND_REQUESTS: BackendChannel = Channel::new();
