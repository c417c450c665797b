//! AIA management layer.
//!
//! Holds non-owning references to the APLIC and IMSIC engines, decides
//! once at bring-up whether the system runs with MSI delivery, Direct
//! delivery or an IMSIC-only fallback, and exposes one unified
//! interrupt-control API that routes each call to the right engine.
//!
//! Routing policy for every unified operation: the IMSIC when MSI mode
//! is enabled and the IMSIC is ready, otherwise the APLIC when ready,
//! otherwise the IMSIC as a last resort.

use log::{debug, info, warn};

use crate::aplic::{Aplic, APLIC_MAX_HARTS};
use crate::imsic::Imsic;
use crate::sync::SpinLock;
use crate::{Error, Result};

/// Platform limits supplied at bring-up
#[derive(Debug, Clone, Copy)]
pub struct AiaConfig {
    pub max_harts: u32,
    pub max_guests: u32,
}

/// Aggregate interrupt statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AiaStats {
    pub total_interrupts: u32,
    pub msi_interrupts: u32,
    pub direct_interrupts: u32,
    pub errors: u32,
}

/// Static capability flags fixed at bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AiaCaps {
    pub msi_supported: bool,
    pub direct_supported: bool,
    pub msi_enabled: bool,
    pub max_harts: u32,
    pub max_guests: u32,
}

struct AiaState {
    stats: AiaStats,
    hart_load: heapless::Vec<u32, APLIC_MAX_HARTS>,
    debug_mode: bool,
}

/// AIA manager: discovers the engines once, never owns them
pub struct AiaManager<'a> {
    aplic: Option<&'a Aplic>,
    imsic: Option<&'a Imsic>,
    msi_supported: bool,
    direct_supported: bool,
    msi_enabled: bool,
    max_harts: u32,
    max_guests: u32,
    inner: SpinLock<AiaState>,
}

impl<'a> AiaManager<'a> {
    /// Build the management layer over the discovered engines. At
    /// least one engine must be present; engines handed in before
    /// their bring-up finished are refused. MSI mode is a policy
    /// decision made here: preferred whenever both engines exist.
    pub fn new(
        aplic: Option<&'a Aplic>,
        imsic: Option<&'a Imsic>,
        config: AiaConfig,
    ) -> Result<Self> {
        info!("aia: initializing management layer");

        if let Some(aplic) = aplic {
            if !aplic.is_ready() {
                warn!("aia: APLIC present but not ready");
                return Err(Error::NotReady);
            }
        }
        if let Some(imsic) = imsic {
            if !imsic.is_ready() {
                warn!("aia: IMSIC present but not ready");
                return Err(Error::NotReady);
            }
        }

        let (msi_supported, direct_supported, msi_enabled) = match (aplic, imsic) {
            (Some(_), Some(_)) => {
                info!("aia: MSI mode supported and enabled");
                (true, true, true)
            }
            (Some(_), None) => {
                info!("aia: Direct mode only (APLIC available)");
                (false, true, false)
            }
            (None, Some(_)) => {
                info!("aia: MSI mode only (IMSIC available)");
                (true, false, true)
            }
            (None, None) => {
                warn!("aia: no interrupt controllers found");
                return Err(Error::NoDevice);
            }
        };

        let mut hart_load = heapless::Vec::new();
        hart_load
            .resize(
                (config.max_harts as usize).min(APLIC_MAX_HARTS),
                0,
            )
            .map_err(|_| Error::InvalidArgument)?;

        Ok(Self {
            aplic,
            imsic,
            msi_supported,
            direct_supported,
            msi_enabled,
            max_harts: config.max_harts,
            max_guests: config.max_guests,
            inner: SpinLock::new(AiaState {
                stats: AiaStats::default(),
                hart_load,
                debug_mode: false,
            }),
        })
    }

    pub fn is_msi_mode_enabled(&self) -> bool {
        self.msi_enabled
    }

    fn aplic_ready(&self) -> Option<&'a Aplic> {
        self.aplic.filter(|a| a.is_ready())
    }

    fn imsic_ready(&self) -> Option<&'a Imsic> {
        self.imsic.filter(|i| i.is_ready())
    }

    /// The IMSIC target when MSI routing applies, `None` otherwise.
    fn msi_route(&self) -> Option<&'a Imsic> {
        if self.msi_enabled {
            self.imsic_ready()
        } else {
            None
        }
    }

    fn update_stats(&self) {
        let mut inner = self.inner.lock();
        inner.stats.total_interrupts += 1;
        if self.msi_enabled {
            inner.stats.msi_interrupts += 1;
        } else {
            inner.stats.direct_interrupts += 1;
        }
    }

    fn log_operation(&self, operation: &str, irq: u32) {
        if self.inner.lock().debug_mode {
            debug!("aia: {} IRQ {} - OK", operation, irq);
        }
    }

    /// Enable an interrupt through the unified interface.
    pub fn enable_irq(&self, irq: u32) -> Result<()> {
        let ret = if let Some(imsic) = self.msi_route() {
            imsic.irq_enable(irq);
            Ok(())
        } else if let Some(aplic) = self.aplic_ready() {
            aplic.irq_enable(irq);
            Ok(())
        } else if let Some(imsic) = self.imsic_ready() {
            imsic.irq_enable(irq);
            Ok(())
        } else {
            Err(Error::Unsupported)
        };

        match ret {
            Ok(()) => {
                self.update_stats();
                self.log_operation("enable", irq);
            }
            Err(_) => {
                self.inner.lock().stats.errors += 1;
                warn!("aia: failed to enable IRQ {}", irq);
            }
        }
        ret
    }

    /// Disable an interrupt through the unified interface.
    pub fn disable_irq(&self, irq: u32) -> Result<()> {
        if let Some(imsic) = self.msi_route() {
            imsic.irq_disable(irq);
            Ok(())
        } else if let Some(aplic) = self.aplic_ready() {
            aplic.irq_disable(irq);
            Ok(())
        } else if let Some(imsic) = self.imsic_ready() {
            imsic.irq_disable(irq);
            Ok(())
        } else {
            warn!("aia: failed to disable IRQ {}", irq);
            Err(Error::Unsupported)
        }
    }

    pub fn is_irq_enabled(&self, irq: u32) -> Result<bool> {
        if let Some(imsic) = self.msi_route() {
            imsic.irq_is_enabled(irq)
        } else if let Some(aplic) = self.aplic_ready() {
            Ok(aplic.irq_is_enabled(irq))
        } else if let Some(imsic) = self.imsic_ready() {
            imsic.irq_is_enabled(irq)
        } else {
            Err(Error::Unsupported)
        }
    }

    /// Priority management belongs to the APLIC, which routes sources.
    pub fn set_irq_priority(&self, irq: u32, priority: u32) -> Result<()> {
        if let Some(aplic) = self.aplic_ready() {
            aplic.set_priority(irq, priority);
            Ok(())
        } else {
            warn!("aia: no APLIC available for priority management");
            Err(Error::Unsupported)
        }
    }

    /// The APLIC has no priority read-back; callers get the default.
    pub fn get_irq_priority(&self, _irq: u32) -> Result<u32> {
        if self.aplic_ready().is_some() {
            Ok(1)
        } else {
            Err(Error::Unsupported)
        }
    }

    /// Pending state is approximated by the enabled state; neither
    /// engine exposes a per-source pending read-back.
    pub fn is_irq_pending(&self, irq: u32) -> Result<bool> {
        if let Some(imsic) = self.msi_route() {
            imsic.irq_is_enabled(irq)
        } else if let Some(aplic) = self.aplic_ready() {
            Ok(aplic.irq_is_enabled(irq))
        } else if let Some(imsic) = self.imsic_ready() {
            imsic.irq_is_enabled(irq)
        } else {
            Err(Error::Unsupported)
        }
    }

    pub fn clear_irq_pending(&self, irq: u32) -> Result<()> {
        if let Some(imsic) = self.msi_route() {
            imsic.irq_clear_pending(irq);
            Ok(())
        } else if self.aplic_ready().is_some() {
            // The APLIC clears pending through claim/complete.
            Ok(())
        } else if let Some(imsic) = self.imsic_ready() {
            imsic.irq_clear_pending(irq);
            Ok(())
        } else {
            warn!("aia: failed to clear pending for IRQ {}", irq);
            Err(Error::Unsupported)
        }
    }

    /// Locked snapshot of the aggregate counters.
    pub fn get_stats(&self) -> AiaStats {
        self.inner.lock().stats
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = AiaStats::default();
        info!("aia: statistics reset");
    }

    pub fn get_capabilities(&self) -> AiaCaps {
        AiaCaps {
            msi_supported: self.msi_supported,
            direct_supported: self.direct_supported,
            msi_enabled: self.msi_enabled,
            max_harts: self.max_harts,
            max_guests: self.max_guests,
        }
    }

    /// Toggle verbose per-operation logging. No other effect.
    pub fn set_debug_mode(&self, enable: bool) {
        self.inner.lock().debug_mode = enable;
        info!(
            "aia: debug mode {}",
            if enable { "enabled" } else { "disabled" }
        );
    }

    /// Least-loaded hart according to the load table. A hint for
    /// callers placing new sources; routing itself does not consult
    /// it.
    pub fn best_hart(&self) -> u32 {
        let inner = self.inner.lock();
        let mut best_hart = 0;
        let mut min_load = u32::MAX;
        for (hart, &load) in inner.hart_load.iter().enumerate() {
            if load < min_load {
                min_load = load;
                best_hart = hart as u32;
            }
        }
        best_hart
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aplic::AplicConfig;
    use crate::imsic::ImsicConfig;
    use crate::regs::MemAddr;

    const CONFIG: AiaConfig = AiaConfig {
        max_harts: 4,
        max_guests: 1,
    };

    fn aplic_engine(mem: &mut [u32], imsic: Option<&Imsic>) -> Aplic {
        let aplic = unsafe {
            Aplic::new(AplicConfig {
                base: mem.as_mut_ptr() as MemAddr,
                nr_irqs: 64,
                nr_harts: 4,
            })
        }
        .unwrap();
        aplic.init(imsic).unwrap();
        aplic
    }

    fn imsic_engine(mem: &mut [u32]) -> Imsic {
        let imsic = unsafe {
            Imsic::new(ImsicConfig {
                base: mem.as_mut_ptr() as MemAddr,
                hart_id: 0,
                guest_id: 0,
                max_prio: 7,
                big_endian: false,
            })
        };
        imsic.init().unwrap();
        imsic
    }

    #[test]
    fn test_no_engines_refused() {
        assert_eq!(
            AiaManager::new(None, None, CONFIG).err(),
            Some(Error::NoDevice)
        );
    }

    #[test]
    fn test_unready_engine_refused() {
        let mut mem = vec![0u32; 0x80];
        let imsic = unsafe {
            Imsic::new(ImsicConfig {
                base: mem.as_mut_ptr() as MemAddr,
                hart_id: 0,
                guest_id: 0,
                max_prio: 7,
                big_endian: false,
            })
        };
        // init never ran
        assert_eq!(
            AiaManager::new(None, Some(&imsic), CONFIG).err(),
            Some(Error::NotReady)
        );
    }

    #[test]
    fn test_both_engines_prefer_msi() {
        let mut aplic_mem = vec![0u32; 0x1100];
        let mut imsic_mem = vec![0u32; 0x80];
        let imsic = imsic_engine(&mut imsic_mem);
        let aplic = aplic_engine(&mut aplic_mem, Some(&imsic));
        let aia = AiaManager::new(Some(&aplic), Some(&imsic), CONFIG).unwrap();

        let caps = aia.get_capabilities();
        assert!(caps.msi_supported);
        assert!(caps.direct_supported);
        assert!(caps.msi_enabled);
        assert_eq!(caps.max_harts, 4);
        assert!(aia.is_msi_mode_enabled());

        // MSI routing targets the IMSIC.
        aia.enable_irq(5).unwrap();
        assert!(imsic.irq_is_enabled(5).unwrap());

        let stats = aia.get_stats();
        assert_eq!(stats.total_interrupts, 1);
        assert_eq!(stats.msi_interrupts, 1);
        assert_eq!(stats.direct_interrupts, 0);
    }

    #[test]
    fn test_direct_only() {
        let mut aplic_mem = vec![0u32; 0x1100];
        let aplic = aplic_engine(&mut aplic_mem, None);
        let aia = AiaManager::new(Some(&aplic), None, CONFIG).unwrap();

        let caps = aia.get_capabilities();
        assert!(!caps.msi_supported);
        assert!(caps.direct_supported);
        assert!(!caps.msi_enabled);

        aia.enable_irq(3).unwrap();
        assert!(aia.is_irq_enabled(3).unwrap());
        assert!(aplic.irq_is_enabled(3));

        let stats = aia.get_stats();
        assert_eq!(stats.direct_interrupts, 1);
        assert_eq!(stats.msi_interrupts, 0);

        aia.disable_irq(3).unwrap();
        assert!(!aia.is_irq_enabled(3).unwrap());
    }

    #[test]
    fn test_imsic_only_fallback() {
        let mut imsic_mem = vec![0u32; 0x80];
        let imsic = imsic_engine(&mut imsic_mem);
        let aia = AiaManager::new(None, Some(&imsic), CONFIG).unwrap();

        let caps = aia.get_capabilities();
        assert!(caps.msi_supported);
        assert!(!caps.direct_supported);
        assert!(caps.msi_enabled);

        aia.enable_irq(7).unwrap();
        assert!(imsic.irq_is_enabled(7).unwrap());
    }

    #[test]
    fn test_priority_management() {
        let mut aplic_mem = vec![0u32; 0x1100];
        let aplic = aplic_engine(&mut aplic_mem, None);
        let aia = AiaManager::new(Some(&aplic), None, CONFIG).unwrap();

        aia.set_irq_priority(3, 9).unwrap();
        assert_eq!(aplic.get_irq_stats(3).unwrap().priority, 9);
        // Read-back is a stubbed default.
        assert_eq!(aia.get_irq_priority(3).unwrap(), 1);

        let mut imsic_mem = vec![0u32; 0x80];
        let imsic = imsic_engine(&mut imsic_mem);
        let aia = AiaManager::new(None, Some(&imsic), CONFIG).unwrap();
        assert_eq!(aia.set_irq_priority(3, 9), Err(Error::Unsupported));
        assert_eq!(aia.get_irq_priority(3), Err(Error::Unsupported));
    }

    #[test]
    fn test_clear_pending_routing() {
        let mut aplic_mem = vec![0u32; 0x1100];
        let aplic = aplic_engine(&mut aplic_mem, None);
        let aia = AiaManager::new(Some(&aplic), None, CONFIG).unwrap();
        // Direct mode: claim/complete owns pending, success no-op.
        aia.clear_irq_pending(3).unwrap();

        let mut imsic_mem = vec![0u32; 0x80];
        let imsic = imsic_engine(&mut imsic_mem);
        let aia = AiaManager::new(None, Some(&imsic), CONFIG).unwrap();
        imsic.irq_set_pending(3);
        aia.clear_irq_pending(3).unwrap();
        assert_eq!(imsic.pending_words()[0] & (1 << 3), 0);
    }

    #[test]
    fn test_stats_reset() {
        let mut aplic_mem = vec![0u32; 0x1100];
        let aplic = aplic_engine(&mut aplic_mem, None);
        let aia = AiaManager::new(Some(&aplic), None, CONFIG).unwrap();

        aia.enable_irq(1).unwrap();
        aia.enable_irq(2).unwrap();
        assert_eq!(aia.get_stats().total_interrupts, 2);

        aia.reset_stats();
        assert_eq!(aia.get_stats(), AiaStats::default());
    }

    #[test]
    fn test_debug_mode_and_best_hart() {
        let mut aplic_mem = vec![0u32; 0x1100];
        let aplic = aplic_engine(&mut aplic_mem, None);
        let aia = AiaManager::new(Some(&aplic), None, CONFIG).unwrap();

        aia.set_debug_mode(true);
        aia.enable_irq(1).unwrap();
        aia.set_debug_mode(false);

        // Nothing feeds the load table yet; the argmin is hart 0.
        assert_eq!(aia.best_hart(), 0);
    }
}
