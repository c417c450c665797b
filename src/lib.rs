//! RISC-V Advanced Interrupt Architecture (AIA) subsystem.
//!
//! This crate models the interrupt-routing core shared by the APLIC
//! (wired/MSI source router), the IMSIC (per-hart MSI receiver) and the
//! AIA management layer that unifies both behind one interrupt-control
//! API. The host platform supplies MMIO base addresses, a software ISR
//! registry and the hart-id query; everything else (source configuration,
//! delivery-mode selection, claim/complete handshakes, statistics) lives
//! here.
//!
//! Engines are constructed once at bring-up and shared by reference:
//!
//! ```ignore
//! let aplic = unsafe { Aplic::new(aplic_cfg)? };
//! let imsic = unsafe { Imsic::new(imsic_cfg) };
//! imsic.init()?;
//! aplic.init(Some(&imsic))?;
//! let aia = AiaManager::new(Some(&aplic), Some(&imsic), aia_cfg)?;
//! let dispatcher = SharedDispatcher::new(Some(&aplic), Some(&imsic), &isr_table, hart_id);
//! ```

#![cfg_attr(not(test), no_std)]

pub mod aia;
pub mod aplic;
pub mod dispatch;
pub mod imsic;
pub mod isr;
pub mod regs;
pub mod sync;

// Re-export commonly used types
pub use aia::{AiaCaps, AiaConfig, AiaManager, AiaStats};
pub use aplic::{Aplic, AplicConfig, IrqStats, TriggerType};
pub use dispatch::SharedDispatcher;
pub use imsic::{DeliveryMode, Imsic, ImsicConfig, ImsicStats};
pub use isr::{HandlerResolver, IsrEntry, IsrTable};

/// Common error type for the AIA subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Out-of-range IRQ, EID, hart, threshold, trigger type or priority
    InvalidArgument,
    /// No engine was discovered at bring-up
    NoDevice,
    /// The engine exists but has not completed bring-up
    NotReady,
    /// Operation is valid in general but meaningless in the current mode
    Unsupported,
    /// A hardware handshake failed verification
    Io,
}

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;
