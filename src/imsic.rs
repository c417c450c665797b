//! Incoming MSI controller (IMSIC) engine.
//!
//! Per-hart receiver of message-signaled interrupts. Owns the two-word
//! enable and pending masks for external interrupt identities 0..=63,
//! the delivery-mode selection and the threshold filter, plus interrupt
//! statistics by delivery category. EID 0 is reserved by convention as
//! "none pending" and is never a valid interrupt identity.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::isr::HandlerResolver;
use crate::regs::{self, MemAddr};
use crate::sync::SpinLock;
use crate::{Error, Result};

/// Delivery control register
const IMSIC_EIDELIVERY: usize = 0x70;

/// Pending words: EIDs 0-31 and 32-63
const IMSIC_EIP0: usize = 0x80;
const IMSIC_EIP1: usize = 0x100;

/// Enable words: EIDs 0-31 and 32-63
const IMSIC_EIE0: usize = 0xc0;
const IMSIC_EIE1: usize = 0x140;

const IMSIC_EIDELIVERY_HARTID_SHIFT: u32 = 16;
const IMSIC_EIDELIVERY_GUESTID_SHIFT: u32 = 8;

/// Highest external interrupt identity this engine addresses
pub const IMSIC_MAX_EID: u32 = 63;

/// Interrupt delivery modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeliveryMode {
    /// Interrupts disabled
    Off = 0,
    /// MSI mode
    Msi = 1,
    /// ID mode
    Id = 2,
    /// Virtual mode
    Virtual = 3,
}

impl DeliveryMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(DeliveryMode::Off),
            1 => Some(DeliveryMode::Msi),
            2 => Some(DeliveryMode::Id),
            3 => Some(DeliveryMode::Virtual),
            _ => None,
        }
    }
}

/// IMSIC configuration supplied by the platform at bring-up
#[derive(Debug, Clone, Copy)]
pub struct ImsicConfig {
    /// Base address of the register window
    pub base: MemAddr,
    /// Hart this instance delivers to
    pub hart_id: u32,
    /// Guest index, 0 unless virtualization is modeled
    pub guest_id: u32,
    /// Highest usable priority value for the threshold filter
    pub max_prio: u32,
    /// Byte-swap register accesses
    pub big_endian: bool,
}

/// Interrupt statistics by delivery category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImsicStats {
    pub total_interrupts: u32,
    pub msi_interrupts: u32,
    pub id_interrupts: u32,
    pub virtual_interrupts: u32,
    /// Interrupts dispatched below the threshold (statistics only, the
    /// threshold does not gate delivery)
    pub threshold_rejected: u32,
}

struct ImsicState {
    eie_mask: [u32; 2],
    eip_pending: [u32; 2],
    threshold: u32,
    delivery_mode: DeliveryMode,
    stats: ImsicStats,
}

/// IMSIC engine, one physical instance per process
pub struct Imsic {
    base: MemAddr,
    hart_id: u32,
    guest_id: u32,
    max_prio: u32,
    big_endian: bool,
    ready: AtomicBool,
    inner: SpinLock<ImsicState>,
}

impl Imsic {
    /// Create an engine over the register window at `config.base`.
    ///
    /// # Safety
    /// `config.base` must point to a mapped IMSIC register window that
    /// stays valid for the lifetime of the engine.
    pub unsafe fn new(config: ImsicConfig) -> Self {
        Self {
            base: config.base,
            hart_id: config.hart_id,
            guest_id: config.guest_id,
            max_prio: config.max_prio,
            big_endian: config.big_endian,
            ready: AtomicBool::new(false),
            inner: SpinLock::new(ImsicState {
                eie_mask: [0; 2],
                eip_pending: [0; 2],
                threshold: 0,
                delivery_mode: DeliveryMode::Off,
                stats: ImsicStats::default(),
            }),
        }
    }

    /// Bring the engine up: clear all masks, select MSI delivery and
    /// accept every priority. Failures of the two configuration steps
    /// are logged and tolerated; the software state still holds.
    pub fn init(&self) -> Result<()> {
        info!(
            "imsic: initializing, base={:#x}, hart_id={}",
            self.base, self.hart_id
        );

        {
            let mut inner = self.inner.lock();
            inner.eie_mask = [0; 2];
            inner.eip_pending = [0; 2];
            inner.threshold = 0;
            inner.delivery_mode = DeliveryMode::Off;
            inner.stats = ImsicStats::default();
        }

        if self.set_delivery_mode(DeliveryMode::Msi).is_err() {
            warn!("imsic: failed to select MSI delivery, keeping software state");
        }
        if self.set_threshold(0).is_err() {
            warn!("imsic: failed to reset threshold, keeping software state");
        }

        self.ready.store(true, Ordering::Release);
        info!("imsic: initialization complete");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Base address of the register window; the APLIC consumes this
    /// when programming its MSI address configuration.
    pub fn base(&self) -> MemAddr {
        self.base
    }

    pub fn hart_id(&self) -> u32 {
        self.hart_id
    }

    pub fn guest_id(&self) -> u32 {
        self.guest_id
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // Window validity is the constructor's precondition.
        let value = unsafe { regs::read32(self.base + offset) };
        if self.big_endian {
            value.swap_bytes()
        } else {
            value
        }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        let value = if self.big_endian {
            value.swap_bytes()
        } else {
            value
        };
        unsafe { regs::write32(self.base + offset, value) };
    }

    fn eie_offset(eid: u32) -> usize {
        if eid < 32 {
            IMSIC_EIE0
        } else {
            IMSIC_EIE1
        }
    }

    fn eip_offset(eid: u32) -> usize {
        if eid < 32 {
            IMSIC_EIP0
        } else {
            IMSIC_EIP1
        }
    }

    /// Enable an EID. Out-of-range identities are silently ignored.
    pub fn irq_enable(&self, eid: u32) {
        if eid > IMSIC_MAX_EID {
            return;
        }
        let word = (eid / 32) as usize;
        let mut inner = self.inner.lock();
        inner.eie_mask[word] |= 1 << (eid % 32);
        self.write_reg(Self::eie_offset(eid), inner.eie_mask[word]);
    }

    /// Disable an EID. Out-of-range identities are silently ignored.
    pub fn irq_disable(&self, eid: u32) {
        if eid > IMSIC_MAX_EID {
            return;
        }
        let word = (eid / 32) as usize;
        let mut inner = self.inner.lock();
        inner.eie_mask[word] &= !(1 << (eid % 32));
        self.write_reg(Self::eie_offset(eid), inner.eie_mask[word]);
    }

    pub fn irq_is_enabled(&self, eid: u32) -> Result<bool> {
        if eid > IMSIC_MAX_EID {
            return Err(Error::InvalidArgument);
        }
        let inner = self.inner.lock();
        Ok(inner.eie_mask[(eid / 32) as usize] & (1 << (eid % 32)) != 0)
    }

    /// Mark an EID pending, mirroring the hardware register.
    /// Out-of-range identities are silently ignored.
    pub fn irq_set_pending(&self, eid: u32) {
        if eid > IMSIC_MAX_EID {
            return;
        }
        let word = (eid / 32) as usize;
        let mut inner = self.inner.lock();
        inner.eip_pending[word] |= 1 << (eid % 32);
        self.write_reg(Self::eip_offset(eid), inner.eip_pending[word]);
    }

    /// Clear an EID's pending state. Out-of-range identities are
    /// silently ignored.
    pub fn irq_clear_pending(&self, eid: u32) {
        if eid > IMSIC_MAX_EID {
            return;
        }
        let word = (eid / 32) as usize;
        let mut inner = self.inner.lock();
        inner.eip_pending[word] &= !(1 << (eid % 32));
        self.write_reg(Self::eip_offset(eid), inner.eip_pending[word]);
    }

    /// Select the delivery mode and program the delivery control
    /// register with the encoded hart/guest/mode value.
    pub fn set_delivery_mode(&self, mode: DeliveryMode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.delivery_mode = mode;

        let value = (self.hart_id << IMSIC_EIDELIVERY_HARTID_SHIFT)
            | (self.guest_id << IMSIC_EIDELIVERY_GUESTID_SHIFT)
            | mode as u32;
        self.write_reg(IMSIC_EIDELIVERY, value);

        debug!("imsic: delivery control set to {:#010x}", value);
        Ok(())
    }

    pub fn get_delivery_mode(&self) -> DeliveryMode {
        self.inner.lock().delivery_mode
    }

    /// Set the threshold filter. EIDs below the threshold are counted
    /// as rejected by the dispatch statistics.
    ///
    /// The threshold register lives behind the indirect CSR window on
    /// real hardware, so only the software state is updated here.
    pub fn set_threshold(&self, value: u32) -> Result<()> {
        if value > self.max_prio {
            return Err(Error::InvalidArgument);
        }
        self.inner.lock().threshold = value;
        debug!("imsic: threshold set to {}", value);
        Ok(())
    }

    pub fn get_threshold(&self) -> u32 {
        self.inner.lock().threshold
    }

    /// Read both hardware pending words (EIDs 0-31, 32-63).
    pub fn pending_words(&self) -> [u32; 2] {
        [self.read_reg(IMSIC_EIP0), self.read_reg(IMSIC_EIP1)]
    }

    /// Snapshot of the enable mask words.
    pub fn enabled_words(&self) -> [u32; 2] {
        self.inner.lock().eie_mask
    }

    /// Service one ready EID on behalf of the shared dispatcher.
    ///
    /// Disabled identities are ignored. `Off` delivery is a logic
    /// error: logged, not fatal, nothing is dispatched. Otherwise the
    /// registered handler runs (outside any engine lock), the category
    /// counters advance, pending is cleared, and an EID below the
    /// current threshold additionally bumps `threshold_rejected`. The
    /// threshold is checked after the handler has already run; it is a
    /// statistics-only filter, not a delivery gate.
    ///
    /// A missing handler is logged and the pending bit is still
    /// cleared, unlike the APLIC path which leaves the claim
    /// outstanding.
    pub fn dispatch_one(&self, eid: u32, resolver: &dyn HandlerResolver) {
        if eid > IMSIC_MAX_EID {
            return;
        }

        let (mode, threshold, enabled) = {
            let inner = self.inner.lock();
            (
                inner.delivery_mode,
                inner.threshold,
                inner.eie_mask[(eid / 32) as usize] & (1 << (eid % 32)) != 0,
            )
        };

        if !enabled {
            return;
        }
        if mode == DeliveryMode::Off {
            warn!("imsic: EID {} ready while delivery is off", eid);
            return;
        }

        match resolver.resolve(eid) {
            Some(entry) => {
                (entry.isr)(eid, entry.arg);
                debug!("imsic: handled EID {}", eid);

                let mut inner = self.inner.lock();
                inner.stats.total_interrupts += 1;
                match mode {
                    DeliveryMode::Msi => inner.stats.msi_interrupts += 1,
                    DeliveryMode::Id => inner.stats.id_interrupts += 1,
                    DeliveryMode::Virtual => inner.stats.virtual_interrupts += 1,
                    DeliveryMode::Off => {}
                }
                if eid < threshold {
                    inner.stats.threshold_rejected += 1;
                }
            }
            None => {
                warn!("imsic: no handler registered for EID {}", eid);
            }
        }

        self.irq_clear_pending(eid);
    }

    /// The IMSIC only receives MSIs; origination belongs to the APLIC.
    pub fn send_msi(&self, _target_hart: u32, _target_guest: u32, _eid: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Locked snapshot of the category counters.
    pub fn get_stats(&self) -> ImsicStats {
        self.inner.lock().stats
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = ImsicStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isr::IsrTable;
    use core::sync::atomic::AtomicU32;
    use test_case::test_case;

    // Register window backed by plain RAM, large enough for every
    // offset the engine touches (up to EIE1 at 0x140).
    fn window() -> Vec<u32> {
        vec![0u32; 0x80]
    }

    fn engine(window: &mut [u32]) -> Imsic {
        let imsic = unsafe {
            Imsic::new(ImsicConfig {
                base: window.as_mut_ptr() as MemAddr,
                hart_id: 0,
                guest_id: 0,
                max_prio: 7,
                big_endian: false,
            })
        };
        imsic.init().unwrap();
        imsic
    }

    #[test_case(0)]
    #[test_case(5)]
    #[test_case(31)]
    #[test_case(32)]
    #[test_case(63)]
    fn test_enable_roundtrip(eid: u32) {
        let mut mem = window();
        let imsic = engine(&mut mem);

        imsic.irq_enable(eid);
        assert!(imsic.irq_is_enabled(eid).unwrap());

        imsic.irq_disable(eid);
        assert!(!imsic.irq_is_enabled(eid).unwrap());
    }

    #[test]
    fn test_enable_writes_hardware_word() {
        let mut mem = window();
        let imsic = engine(&mut mem);

        imsic.irq_enable(3);
        imsic.irq_enable(40);
        assert_eq!(mem[IMSIC_EIE0 / 4], 1 << 3);
        assert_eq!(mem[IMSIC_EIE1 / 4], 1 << 8);
    }

    #[test]
    fn test_out_of_range_silently_ignored() {
        let mut mem = window();
        let imsic = engine(&mut mem);

        imsic.irq_enable(64);
        imsic.irq_set_pending(64);
        imsic.irq_disable(1000);
        assert_eq!(imsic.enabled_words(), [0, 0]);
        assert_eq!(imsic.pending_words(), [0, 0]);
        assert_eq!(imsic.irq_is_enabled(64), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_pending_words() {
        let mut mem = window();
        let imsic = engine(&mut mem);

        imsic.irq_set_pending(1);
        imsic.irq_set_pending(33);
        assert_eq!(imsic.pending_words(), [1 << 1, 1 << 1]);

        imsic.irq_clear_pending(1);
        assert_eq!(imsic.pending_words(), [0, 1 << 1]);
    }

    #[test]
    fn test_delivery_mode_encoding() {
        let mut mem = window();
        let imsic = unsafe {
            Imsic::new(ImsicConfig {
                base: mem.as_mut_ptr() as MemAddr,
                hart_id: 2,
                guest_id: 1,
                max_prio: 7,
                big_endian: false,
            })
        };
        imsic.init().unwrap();

        imsic.set_delivery_mode(DeliveryMode::Id).unwrap();
        assert_eq!(imsic.get_delivery_mode(), DeliveryMode::Id);
        assert_eq!(mem[IMSIC_EIDELIVERY / 4], (2 << 16) | (1 << 8) | 2);
    }

    #[test]
    fn test_init_selects_msi() {
        let mut mem = window();
        let imsic = engine(&mut mem);
        assert_eq!(imsic.get_delivery_mode(), DeliveryMode::Msi);
        assert_eq!(imsic.get_threshold(), 0);
        assert!(imsic.is_ready());
    }

    #[test_case(0, true)]
    #[test_case(7, true)]
    #[test_case(8, false)]
    fn test_threshold_bounds(value: u32, ok: bool) {
        let mut mem = window();
        let imsic = engine(&mut mem);
        imsic.set_threshold(3).unwrap();

        let result = imsic.set_threshold(value);
        if ok {
            assert!(result.is_ok());
            assert_eq!(imsic.get_threshold(), value);
        } else {
            assert_eq!(result, Err(Error::InvalidArgument));
            assert_eq!(imsic.get_threshold(), 3);
        }
    }

    #[test]
    fn test_dispatch_below_threshold_still_delivers() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn count_isr(_eid: u32, _arg: usize) {
            CALLS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        }

        let mut mem = window();
        let imsic = engine(&mut mem);
        let table: IsrTable<64> = IsrTable::new();
        table.register(1, count_isr, 0).unwrap();
        table.register(5, count_isr, 0).unwrap();

        imsic.set_threshold(2).unwrap();
        imsic.irq_enable(1);
        imsic.irq_enable(5);

        // EID 1 is below the threshold: the handler still runs, the
        // rejection is only counted.
        imsic.irq_set_pending(1);
        imsic.dispatch_one(1, &table);
        assert_eq!(CALLS.load(core::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(imsic.get_stats().threshold_rejected, 1);
        assert_eq!(imsic.pending_words()[0] & (1 << 1), 0);

        // EID 5 is at/above the threshold: no rejection counted.
        imsic.irq_set_pending(5);
        imsic.dispatch_one(5, &table);
        assert_eq!(CALLS.load(core::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(imsic.get_stats().threshold_rejected, 1);

        let stats = imsic.get_stats();
        assert_eq!(stats.total_interrupts, 2);
        assert_eq!(stats.msi_interrupts, 2);
    }

    #[test]
    fn test_dispatch_disabled_is_noop() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn count_isr(_eid: u32, _arg: usize) {
            CALLS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        }

        let mut mem = window();
        let imsic = engine(&mut mem);
        let table: IsrTable<64> = IsrTable::new();
        table.register(4, count_isr, 0).unwrap();

        imsic.irq_set_pending(4);
        imsic.dispatch_one(4, &table);
        assert_eq!(CALLS.load(core::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(imsic.get_stats().total_interrupts, 0);
        // Not serviced: pending stays set.
        assert_eq!(imsic.pending_words()[0], 1 << 4);
    }

    #[test]
    fn test_dispatch_delivery_off_rejected() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn count_isr(_eid: u32, _arg: usize) {
            CALLS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        }

        let mut mem = window();
        let imsic = engine(&mut mem);
        let table: IsrTable<64> = IsrTable::new();
        table.register(4, count_isr, 0).unwrap();

        imsic.set_delivery_mode(DeliveryMode::Off).unwrap();
        imsic.irq_enable(4);
        imsic.irq_set_pending(4);
        imsic.dispatch_one(4, &table);
        assert_eq!(CALLS.load(core::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(imsic.get_stats().total_interrupts, 0);
    }

    #[test]
    fn test_dispatch_handler_miss_clears_pending() {
        let mut mem = window();
        let imsic = engine(&mut mem);
        let table: IsrTable<64> = IsrTable::new();

        imsic.irq_enable(9);
        imsic.irq_set_pending(9);
        imsic.dispatch_one(9, &table);

        // MSI sources are cleared even without a handler.
        assert_eq!(imsic.pending_words()[0] & (1 << 9), 0);
        assert_eq!(imsic.get_stats().total_interrupts, 0);
    }

    #[test]
    fn test_stats_reset() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn count_isr(_eid: u32, _arg: usize) {
            CALLS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        }

        let mut mem = window();
        let imsic = engine(&mut mem);
        let table: IsrTable<64> = IsrTable::new();
        table.register(2, count_isr, 0).unwrap();

        imsic.irq_enable(2);
        imsic.irq_set_pending(2);
        imsic.dispatch_one(2, &table);
        assert_ne!(imsic.get_stats(), ImsicStats::default());

        imsic.reset_stats();
        assert_eq!(imsic.get_stats(), ImsicStats::default());
    }

    #[test]
    fn test_send_msi_unsupported() {
        let mut mem = window();
        let imsic = engine(&mut mem);
        assert_eq!(imsic.send_msi(0, 0, 5), Err(Error::Unsupported));
    }

    #[test]
    fn test_big_endian_access() {
        let mut mem = window();
        let imsic = unsafe {
            Imsic::new(ImsicConfig {
                base: mem.as_mut_ptr() as MemAddr,
                hart_id: 0,
                guest_id: 0,
                max_prio: 7,
                big_endian: true,
            })
        };
        imsic.init().unwrap();

        imsic.irq_enable(0);
        assert_eq!(mem[IMSIC_EIE0 / 4], 1u32.swap_bytes());
        assert!(imsic.irq_is_enabled(0).unwrap());
    }
}
