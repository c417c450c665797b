//! Advanced platform-level interrupt controller (APLIC) engine.
//!
//! Owns per-source configuration (trigger mode, priority, affinity,
//! target hart/guest), the domain configuration, the per-hart interrupt
//! delivery controller (IDC) used for claim/complete in Direct mode, and
//! the MSI source/target encoding plus statistics. The delivery mode is
//! negotiated once at bring-up: MSI when a ready IMSIC companion is
//! supplied, Direct otherwise, with MSI configuration failures falling
//! back to Direct.

use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::imsic::{Imsic, IMSIC_MAX_EID};
use crate::regs::{self, MemAddr};
use crate::sync::SpinLock;
use crate::{Error, Result};

/* Register offsets, AIA specification compliant */
const APLIC_DOMAINCFG: usize = 0x0000;
const APLIC_SOURCECFG_BASE: usize = 0x0004;
const APLIC_TARGET_BASE: usize = 0x3000;
const APLIC_SETIP_BASE: usize = 0x1c00;
const APLIC_SETIE_BASE: usize = 0x1e00;
const APLIC_CLRIE_BASE: usize = 0x1f00;
const APLIC_XMSICFGADDR: usize = 0x1bc0;
const APLIC_XMSICFGADDRH: usize = 0x1bc4;

/* MSI mode uses the by-number enable registers */
const APLIC_SETIENUM: usize = 0x1e00;
const APLIC_CLRIENUM: usize = 0x1f00;

/* IDC block: one 32-byte frame per hart */
const APLIC_IDC_BASE: usize = 0x4000;
const APLIC_IDC_SIZE: usize = 32;
const APLIC_IDC_IDELIVERY: usize = 0x00;
const APLIC_IDC_ITHRESHOLD: usize = 0x08;
const APLIC_IDC_CLAIMI: usize = 0x1c;

const APLIC_IDC_TOPI_ID_SHIFT: u32 = 16;
const APLIC_IDC_TOPI_ID_MASK: u32 = 0x3ff;

const APLIC_IDC_DELIVERY_ENABLE: u32 = 1;
const APLIC_IDC_THRESHOLD_ACCEPT_ALL: u32 = 0;

/* TARGET register fields */
const APLIC_TARGET_HART_IDX_MASK: u32 = 0x3fff;
const APLIC_TARGET_GUEST_IDX_SHIFT: u32 = 14;
const APLIC_TARGET_GUEST_IDX_MASK: u32 = 0x3f;
const APLIC_TARGET_EIID_SHIFT: u32 = 20;
const APLIC_TARGET_EIID_MASK: u32 = 0xff;
const APLIC_TARGET_IE_SHIFT: u32 = 31;

/* SOURCECFG fields: source mode, delegate bit, child index */
const APLIC_SOURCECFG_SM_MASK: u32 = 0x7;
const APLIC_SOURCECFG_D: u32 = 1 << 10;
const APLIC_SOURCECFG_CHILD_SHIFT: u32 = 11;

/* Priority shadow byte inside SOURCECFG, written by set_priority */
const APLIC_SOURCECFG_PRIO_SHIFT: u32 = 8;
const APLIC_SOURCECFG_PRIO_MASK: u32 = 0xff;

const APLIC_DEFAULT_PRIORITY: u32 = 7;
const APLIC_MAX_PRIORITY: u32 = 255;
const APLIC_MAX_GUEST_IDX: u32 = 0x3f;

/// Most sources an APLIC domain can carry
pub const APLIC_MAX_SOURCES: usize = 1024;
/// Most harts an APLIC domain can deliver to
pub const APLIC_MAX_HARTS: usize = 32;

bitflags! {
    /// Domain configuration register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DomainCfg: u32 {
        /// Big-endian register access
        const BE = 1 << 0;
        /// Delivery mode: MSI when set, Direct when clear
        const DM = 1 << 2;
        /// Global interrupt enable
        const IE = 1 << 8;
    }
}

/// Source trigger modes, encoded as the SOURCECFG source-mode field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TriggerType {
    Inactive = 0,
    Detached = 1,
    EdgeRising = 4,
    EdgeFalling = 5,
    LevelHigh = 6,
    LevelLow = 7,
    Msi = 8,
}

impl TriggerType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(TriggerType::Inactive),
            1 => Some(TriggerType::Detached),
            4 => Some(TriggerType::EdgeRising),
            5 => Some(TriggerType::EdgeFalling),
            6 => Some(TriggerType::LevelHigh),
            7 => Some(TriggerType::LevelLow),
            8 => Some(TriggerType::Msi),
            _ => None,
        }
    }

    /// Modes a caller may program through `irq_set_trigger_type`
    fn is_wired(self) -> bool {
        matches!(
            self,
            TriggerType::EdgeRising
                | TriggerType::EdgeFalling
                | TriggerType::LevelHigh
                | TriggerType::LevelLow
        )
    }
}

/// APLIC configuration supplied by the platform at bring-up
#[derive(Debug, Clone, Copy)]
pub struct AplicConfig {
    /// Base address of the register window
    pub base: MemAddr,
    /// Number of interrupt sources, index 0 included but reserved
    pub nr_irqs: u32,
    /// Number of harts with an IDC frame
    pub nr_harts: u32,
}

/// Per-source bookkeeping mirror
#[derive(Debug, Clone, Copy)]
struct IrqInfo {
    count: u32,
    last_hart: u32,
    affinity_mask: u32,
    trigger_type: TriggerType,
    priority: u8,
    enabled: bool,
}

impl IrqInfo {
    fn new(affinity_mask: u32) -> Self {
        Self {
            count: 0,
            last_hart: 0,
            affinity_mask,
            trigger_type: TriggerType::LevelHigh,
            priority: APLIC_DEFAULT_PRIORITY as u8,
            enabled: false,
        }
    }
}

/// Snapshot of one source's state and delivery statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqStats {
    pub count: u32,
    pub last_hart: u32,
    pub affinity_mask: u32,
    pub trigger_type: TriggerType,
    pub priority: u8,
    pub enabled: bool,
}

/// MSI address configuration derived from the IMSIC window
#[derive(Debug, Clone, Copy, Default)]
struct MsiCfg {
    base_ppn: u32,
    /// Guest index bits
    lhxs: u32,
    /// Hart index bits
    lhxw: u32,
    /// Group index bits
    hhxw: u32,
    /// Group index shift
    hhxs: u32,
}

struct AplicState {
    irq_info: heapless::Vec<IrqInfo, APLIC_MAX_SOURCES>,
    hart_thresholds: heapless::Vec<u32, APLIC_MAX_HARTS>,
    total_interrupts: u32,
    msi_interrupts_sent: u32,
    direct_interrupts: u32,
    msi_base_eid: u32,
    msicfg: MsiCfg,
}

/// APLIC engine, one physical instance per process
pub struct Aplic {
    base: MemAddr,
    nr_irqs: u32,
    nr_harts: u32,
    msi_mode: AtomicBool,
    ready: AtomicBool,
    inner: SpinLock<AplicState>,
}

impl Aplic {
    /// Create an engine over the register window at `config.base`.
    ///
    /// # Safety
    /// `config.base` must point to a mapped APLIC register window
    /// (sourcecfg/target/enable arrays plus one IDC frame per hart)
    /// that stays valid for the lifetime of the engine.
    pub unsafe fn new(config: AplicConfig) -> Result<Self> {
        if config.base == 0 {
            return Err(Error::InvalidArgument);
        }
        if config.nr_irqs == 0 || config.nr_irqs as usize > APLIC_MAX_SOURCES {
            return Err(Error::InvalidArgument);
        }
        if config.nr_harts == 0 || config.nr_harts as usize > APLIC_MAX_HARTS {
            return Err(Error::InvalidArgument);
        }

        let affinity = Self::full_hart_mask(config.nr_harts);
        let mut irq_info = heapless::Vec::new();
        irq_info
            .resize(config.nr_irqs as usize, IrqInfo::new(affinity))
            .map_err(|_| Error::InvalidArgument)?;
        let mut hart_thresholds = heapless::Vec::new();
        hart_thresholds
            .resize(config.nr_harts as usize, 0)
            .map_err(|_| Error::InvalidArgument)?;

        Ok(Self {
            base: config.base,
            nr_irqs: config.nr_irqs,
            nr_harts: config.nr_harts,
            msi_mode: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            inner: SpinLock::new(AplicState {
                irq_info,
                hart_thresholds,
                total_interrupts: 0,
                msi_interrupts_sent: 0,
                direct_interrupts: 0,
                msi_base_eid: 0,
                msicfg: MsiCfg::default(),
            }),
        })
    }

    /// Bring the engine up. The mode is negotiated here and never
    /// changes afterwards: MSI when a ready IMSIC companion is given,
    /// Direct otherwise. The domain configuration is written last,
    /// after all source and target state is programmed, and verified
    /// by read-back.
    pub fn init(&self, imsic: Option<&Imsic>) -> Result<()> {
        info!(
            "aplic: initializing, base={:#x}, sources={}, harts={}",
            self.base, self.nr_irqs, self.nr_harts
        );

        self.reset_state();
        self.quiesce_hardware();

        let msi_mode = match imsic.filter(|i| i.is_ready()) {
            Some(companion) => match self.configure_msi_mode(companion) {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        "aplic: MSI configuration failed ({:?}), falling back to Direct mode",
                        err
                    );
                    self.configure_direct_mode();
                    false
                }
            },
            None => {
                info!("aplic: no IMSIC companion, using Direct mode");
                self.configure_direct_mode();
                false
            }
        };

        self.configure_domain(msi_mode)?;
        self.ready.store(true, Ordering::Release);
        info!(
            "aplic: initialization complete, mode: {}",
            if msi_mode { "MSI" } else { "Direct" }
        );
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_msi_mode_enabled(&self) -> bool {
        self.msi_mode.load(Ordering::Acquire)
    }

    fn full_hart_mask(nr_harts: u32) -> u32 {
        if nr_harts >= 32 {
            u32::MAX
        } else {
            (1 << nr_harts) - 1
        }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // Window validity is the constructor's precondition.
        unsafe { regs::read32(self.base + offset) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { regs::write32(self.base + offset, value) };
    }

    fn sourcecfg_offset(irq: u32) -> usize {
        APLIC_SOURCECFG_BASE + ((irq - 1) as usize * 4)
    }

    fn target_offset(irq: u32) -> usize {
        APLIC_TARGET_BASE + ((irq - 1) as usize * 4)
    }

    fn idc_offset(hart: u32) -> usize {
        APLIC_IDC_BASE + hart as usize * APLIC_IDC_SIZE
    }

    fn irq_word_offset(irq: u32) -> usize {
        (irq / 32) as usize * 4
    }

    fn reset_state(&self) {
        let affinity = Self::full_hart_mask(self.nr_harts);
        let mut inner = self.inner.lock();
        for info in inner.irq_info.iter_mut() {
            *info = IrqInfo::new(affinity);
        }
        for threshold in inner.hart_thresholds.iter_mut() {
            *threshold = 0;
        }
        inner.total_interrupts = 0;
        inner.msi_interrupts_sent = 0;
        inner.direct_interrupts = 0;
        inner.msi_base_eid = 0;
        inner.msicfg = MsiCfg::default();
    }

    /// Mask every source, deactivate every source configuration and
    /// clear the domain configuration before mode selection.
    fn quiesce_hardware(&self) {
        let mut irq = 0;
        while irq <= self.nr_irqs {
            self.write_reg(APLIC_CLRIE_BASE + Self::irq_word_offset(irq), u32::MAX);
            irq += 32;
        }
        for irq in 1..self.nr_irqs {
            self.write_reg(Self::sourcecfg_offset(irq), TriggerType::Inactive as u32);
            self.write_reg(Self::target_offset(irq), APLIC_DEFAULT_PRIORITY);
        }
        self.write_reg(APLIC_DOMAINCFG, 0);
    }

    fn configure_msi_mode(&self, imsic: &Imsic) -> Result<()> {
        info!("aplic: configuring MSI mode");

        let imsic_base = imsic.base();
        if imsic_base == 0 {
            return Err(Error::NoDevice);
        }

        let msicfg = MsiCfg {
            base_ppn: (imsic_base >> 12) as u32,
            lhxs: 0,
            lhxw: 0,
            hhxw: 0,
            hhxs: 0,
        };

        let addrh = (msicfg.lhxw & 0xf)
            | ((msicfg.hhxw & 0xf) << 4)
            | ((msicfg.lhxs & 0xf) << 8)
            | ((msicfg.hhxs & 0xf) << 12);
        self.write_reg(APLIC_XMSICFGADDR, msicfg.base_ppn);
        self.write_reg(APLIC_XMSICFGADDRH, addrh);

        {
            let mut inner = self.inner.lock();
            inner.msicfg = msicfg;
            inner.msi_base_eid = 0;
        }
        self.msi_mode.store(true, Ordering::Release);

        info!(
            "aplic: MSI address registers configured, base_ppn={:#x}",
            msicfg.base_ppn
        );
        Ok(())
    }

    fn configure_direct_mode(&self) {
        info!("aplic: configuring Direct mode");

        for hart in 0..self.nr_harts {
            let idc = Self::idc_offset(hart);
            self.write_reg(idc + APLIC_IDC_IDELIVERY, APLIC_IDC_DELIVERY_ENABLE);
            self.write_reg(idc + APLIC_IDC_ITHRESHOLD, APLIC_IDC_THRESHOLD_ACCEPT_ALL);
        }

        for irq in 1..self.nr_irqs {
            self.write_reg(Self::sourcecfg_offset(irq), TriggerType::LevelHigh as u32);
            let target = (APLIC_DEFAULT_PRIORITY << APLIC_TARGET_EIID_SHIFT)
                | (1 << APLIC_TARGET_IE_SHIFT);
            self.write_reg(Self::target_offset(irq), target);
        }

        self.msi_mode.store(false, Ordering::Release);
    }

    /// Written last per the AIA bring-up ordering, then verified by
    /// read-back. A mismatch is a hardware handshake failure.
    fn configure_domain(&self, msi_mode: bool) -> Result<()> {
        let mut cfg = DomainCfg::IE;
        if msi_mode {
            cfg |= DomainCfg::DM;
        }
        self.write_reg(APLIC_DOMAINCFG, cfg.bits());

        let readback = DomainCfg::from_bits_truncate(self.read_reg(APLIC_DOMAINCFG));
        if !readback.contains(DomainCfg::IE) {
            warn!("aplic: failed to enable the interrupt domain");
            return Err(Error::Io);
        }
        if msi_mode != readback.contains(DomainCfg::DM) {
            warn!("aplic: delivery mode bit did not stick");
            return Err(Error::Io);
        }
        Ok(())
    }

    /// Enable a source via the mode-appropriate register. Out-of-range
    /// sources are silently ignored.
    pub fn irq_enable(&self, irq: u32) {
        if irq == 0 || irq >= self.nr_irqs {
            return;
        }
        let mut inner = self.inner.lock();
        if self.is_msi_mode_enabled() {
            self.write_reg(APLIC_SETIENUM, irq);
        } else {
            let offset = APLIC_SETIE_BASE + Self::irq_word_offset(irq);
            let current = self.read_reg(offset);
            self.write_reg(offset, current | (1 << (irq % 32)));
        }
        inner.irq_info[irq as usize].enabled = true;
    }

    /// Disable a source. Out-of-range sources are silently ignored.
    pub fn irq_disable(&self, irq: u32) {
        if irq == 0 || irq >= self.nr_irqs {
            return;
        }
        let mut inner = self.inner.lock();
        if self.is_msi_mode_enabled() {
            self.write_reg(APLIC_CLRIENUM, irq);
        } else {
            let offset = APLIC_CLRIE_BASE + Self::irq_word_offset(irq);
            let current = self.read_reg(offset);
            self.write_reg(offset, current | (1 << (irq % 32)));
        }
        inner.irq_info[irq as usize].enabled = false;
    }

    /// In Direct mode this reads back the SETIE register. The MSI
    /// enable registers are write-only, so MSI mode answers `true`
    /// unconditionally: a source is assumed enabled once set.
    pub fn irq_is_enabled(&self, irq: u32) -> bool {
        if self.is_msi_mode_enabled() {
            return true;
        }
        if irq >= self.nr_irqs {
            return false;
        }
        let setie = self.read_reg(APLIC_SETIE_BASE + Self::irq_word_offset(irq));
        setie & (1 << (irq % 32)) != 0
    }

    /// Program the priority byte of the source configuration. The
    /// value is truncated to 8 bits; no other validation.
    pub fn set_priority(&self, irq: u32, priority: u32) {
        if irq == 0 || irq >= self.nr_irqs {
            return;
        }
        let mut inner = self.inner.lock();
        let offset = Self::sourcecfg_offset(irq);
        let mut cfg = self.read_reg(offset);
        cfg &= !(APLIC_SOURCECFG_PRIO_MASK << APLIC_SOURCECFG_PRIO_SHIFT);
        cfg |= (priority & APLIC_SOURCECFG_PRIO_MASK) << APLIC_SOURCECFG_PRIO_SHIFT;
        self.write_reg(offset, cfg);
        inner.irq_info[irq as usize].priority = priority as u8;
    }

    /// Record the affinity hint and, only if the source is still
    /// Inactive, activate it with its recorded trigger type. Changing
    /// affinity on an active source does not re-trigger mode changes.
    pub fn irq_set_affinity(&self, irq: u32, hart_mask: u32) -> Result<()> {
        if irq == 0 || irq >= self.nr_irqs {
            return Err(Error::InvalidArgument);
        }
        let target_hart = hart_mask.trailing_zeros();
        if target_hart >= self.nr_harts {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        let offset = Self::sourcecfg_offset(irq);
        let cfg = self.read_reg(offset);
        inner.irq_info[irq as usize].affinity_mask = hart_mask;

        if cfg & APLIC_SOURCECFG_SM_MASK == TriggerType::Inactive as u32 {
            let trigger = inner.irq_info[irq as usize].trigger_type;
            self.write_reg(
                offset,
                (cfg & !APLIC_SOURCECFG_SM_MASK) | trigger as u32,
            );
        }
        drop(inner);

        debug!(
            "aplic: IRQ {} affinity set to {:#x} (target hart {})",
            irq, hart_mask, target_hart
        );
        Ok(())
    }

    pub fn irq_set_trigger_type(&self, irq: u32, trigger: TriggerType) -> Result<()> {
        if irq == 0 || irq >= self.nr_irqs {
            return Err(Error::InvalidArgument);
        }
        if !trigger.is_wired() {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        let offset = Self::sourcecfg_offset(irq);
        let cfg = self.read_reg(offset);
        self.write_reg(offset, (cfg & !APLIC_SOURCECFG_SM_MASK) | trigger as u32);
        inner.irq_info[irq as usize].trigger_type = trigger;
        Ok(())
    }

    pub fn irq_get_trigger_type(&self, irq: u32) -> Result<TriggerType> {
        if irq == 0 || irq >= self.nr_irqs {
            return Err(Error::InvalidArgument);
        }
        let raw = self.read_reg(Self::sourcecfg_offset(irq)) & APLIC_SOURCECFG_SM_MASK;
        TriggerType::from_raw(raw).ok_or(Error::Io)
    }

    /// Program a hart's IDC threshold. Sources deliver only when their
    /// priority is strictly above the threshold.
    pub fn hart_set_threshold(&self, hart: u32, threshold: u32) -> Result<()> {
        if hart >= self.nr_harts || threshold > APLIC_MAX_PRIORITY {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        self.write_reg(Self::idc_offset(hart) + APLIC_IDC_ITHRESHOLD, threshold);
        inner.hart_thresholds[hart as usize] = threshold;
        debug!("aplic: hart {} threshold set to {}", hart, threshold);
        Ok(())
    }

    pub fn hart_get_threshold(&self, hart: u32) -> u32 {
        if hart >= self.nr_harts {
            return 0;
        }
        self.inner.lock().hart_thresholds[hart as usize]
    }

    /// Mark a source pending and run the routing decision: the enabled
    /// check, the priority-vs-threshold filter of the target hart's
    /// IDC, then dispatch accounting by mode (the MSI send path in MSI
    /// mode, the direct counter otherwise). Out-of-range sources are
    /// silently ignored.
    pub fn irq_set_pending(&self, irq: u32) {
        if irq == 0 || irq >= self.nr_irqs {
            return;
        }
        let offset = APLIC_SETIP_BASE + Self::irq_word_offset(irq);
        let current = self.read_reg(offset);
        self.write_reg(offset, current | (1 << (irq % 32)));

        if !self.irq_is_enabled(irq) {
            debug!("aplic: IRQ {} not enabled, skipping routing", irq);
            return;
        }

        let (deliverable, target_hart) = {
            let inner = self.inner.lock();
            let info = &inner.irq_info[irq as usize];
            let mut target = info.affinity_mask.trailing_zeros();
            if target >= self.nr_harts {
                target = 0;
            }
            let threshold = inner.hart_thresholds[target as usize];
            (u32::from(info.priority) > threshold, target)
        };
        if !deliverable {
            debug!(
                "aplic: IRQ {} at or below hart {} threshold, not delivered",
                irq, target_hart
            );
            return;
        }

        if self.is_msi_mode_enabled() {
            if let Err(err) = self.send_msi(target_hart, 0, irq) {
                debug!("aplic: MSI send for IRQ {} failed: {:?}", irq, err);
            }
        } else {
            self.inner.lock().direct_interrupts += 1;
            debug!("aplic: IRQ {} pending for Direct delivery", irq);
        }
    }

    /// Direct mode: read the claim register of a hart's IDC. Returns
    /// the claimed source, or `None` when nothing is pending.
    pub fn claim_next(&self, hart: u32) -> Option<u32> {
        if hart >= self.nr_harts {
            return None;
        }
        let claim = self.read_reg(Self::idc_offset(hart) + APLIC_IDC_CLAIMI);
        let irq = (claim >> APLIC_IDC_TOPI_ID_SHIFT) & APLIC_IDC_TOPI_ID_MASK;
        if irq == 0 {
            None
        } else {
            Some(irq)
        }
    }

    /// Direct mode: complete a previously claimed source.
    pub fn complete(&self, hart: u32, irq: u32) {
        if hart >= self.nr_harts {
            return;
        }
        self.write_reg(Self::idc_offset(hart) + APLIC_IDC_CLAIMI, irq);
    }

    /// Delivery bookkeeping for the shared dispatcher after a handler
    /// ran for a claimed source.
    pub(crate) fn record_direct_dispatch(&self, hart: u32, irq: u32) {
        if irq == 0 || irq >= self.nr_irqs {
            return;
        }
        let mut inner = self.inner.lock();
        inner.direct_interrupts += 1;
        inner.total_interrupts += 1;
        let info = &mut inner.irq_info[irq as usize];
        info.count += 1;
        info.last_hart = hart;
    }

    /// Send an MSI for `irq` towards a hart/guest pair. The interrupt
    /// number doubles as the IMSIC event identity and must fit in the
    /// EID space.
    pub fn send_msi(&self, target_hart: u32, target_guest: u32, irq: u32) -> Result<()> {
        if !self.is_msi_mode_enabled() {
            warn!("aplic: MSI mode not enabled, cannot send MSI");
            return Err(Error::Unsupported);
        }
        if target_hart >= self.nr_harts {
            return Err(Error::InvalidArgument);
        }
        let eid = irq;
        if eid > IMSIC_MAX_EID {
            return Err(Error::InvalidArgument);
        }

        if irq >= 1 && irq < self.nr_irqs {
            let target = (target_hart & APLIC_TARGET_HART_IDX_MASK)
                | ((target_guest & APLIC_TARGET_GUEST_IDX_MASK) << APLIC_TARGET_GUEST_IDX_SHIFT)
                | ((eid & APLIC_TARGET_EIID_MASK) << APLIC_TARGET_EIID_SHIFT)
                | (1 << APLIC_TARGET_IE_SHIFT);
            self.write_reg(Self::target_offset(irq), target);
        }

        self.inner.lock().msi_interrupts_sent += 1;
        debug!(
            "aplic: MSI sent, EID {} to hart {} (guest {})",
            eid, target_hart, target_guest
        );
        Ok(())
    }

    /// Route a source through the MSI delegation path: the delegate bit
    /// and child index go into SOURCECFG, the hart/guest routing into
    /// the TARGET register.
    pub fn configure_source_msi(
        &self,
        irq: u32,
        target_hart: u32,
        target_guest: u32,
    ) -> Result<()> {
        if !self.is_msi_mode_enabled() {
            return Err(Error::Unsupported);
        }
        if irq == 0
            || irq >= self.nr_irqs
            || target_hart >= self.nr_harts
            || target_guest > APLIC_MAX_GUEST_IDX
        {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        let eid = inner.msi_base_eid + irq;
        let sourcecfg = (eid << APLIC_SOURCECFG_CHILD_SHIFT)
            | APLIC_SOURCECFG_D
            | TriggerType::Inactive as u32;
        self.write_reg(Self::sourcecfg_offset(irq), sourcecfg);

        let target = (target_hart & APLIC_TARGET_HART_IDX_MASK)
            | ((target_guest & APLIC_TARGET_GUEST_IDX_MASK) << APLIC_TARGET_GUEST_IDX_SHIFT)
            | (APLIC_DEFAULT_PRIORITY << APLIC_TARGET_EIID_SHIFT)
            | (1 << APLIC_TARGET_IE_SHIFT);
        self.write_reg(Self::target_offset(irq), target);
        drop(inner);

        debug!(
            "aplic: IRQ {} routed as MSI to hart {}, guest {} (EID {})",
            irq, target_hart, target_guest, eid
        );
        Ok(())
    }

    /// Locked snapshot of one source's state and counters.
    pub fn get_irq_stats(&self, irq: u32) -> Result<IrqStats> {
        if irq == 0 || irq >= self.nr_irqs {
            return Err(Error::InvalidArgument);
        }
        let inner = self.inner.lock();
        let info = &inner.irq_info[irq as usize];
        Ok(IrqStats {
            count: info.count,
            last_hart: info.last_hart,
            affinity_mask: info.affinity_mask,
            trigger_type: info.trigger_type,
            priority: info.priority,
            enabled: info.enabled,
        })
    }

    pub fn get_total_interrupts(&self) -> u32 {
        self.inner.lock().total_interrupts
    }

    pub fn get_msi_interrupts_sent(&self) -> u32 {
        self.inner.lock().msi_interrupts_sent
    }

    pub fn get_direct_interrupts(&self) -> u32 {
        self.inner.lock().direct_interrupts
    }

    /// Zero every per-source counter and the aggregate totals.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        for info in inner.irq_info.iter_mut() {
            info.count = 0;
            info.last_hart = 0;
        }
        inner.total_interrupts = 0;
        inner.msi_interrupts_sent = 0;
        inner.direct_interrupts = 0;
    }
}
