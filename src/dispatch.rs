//! Shared external-interrupt dispatcher.
//!
//! One physical interrupt line carries both controllers. The host SoC
//! layer invokes [`SharedDispatcher::on_external_interrupt`] on line
//! assertion (with the line masked, so re-entry on the same hart cannot
//! happen); the dispatcher demultiplexes the line by polling the APLIC
//! claim register and the IMSIC pending words, invoking each ready
//! source's registered handler exactly once and performing the
//! completion action the owning controller requires.

use log::{debug, warn};

use crate::aplic::Aplic;
use crate::imsic::Imsic;
use crate::isr::HandlerResolver;

/// Stateless demultiplexer over the two engines
pub struct SharedDispatcher<'a> {
    aplic: Option<&'a Aplic>,
    imsic: Option<&'a Imsic>,
    resolver: &'a dyn HandlerResolver,
    current_hart: fn() -> u32,
}

impl<'a> SharedDispatcher<'a> {
    /// A missing engine is a valid configuration; it is skipped at
    /// dispatch time. `current_hart` is the platform's hart-id query
    /// used to select the claiming IDC.
    pub fn new(
        aplic: Option<&'a Aplic>,
        imsic: Option<&'a Imsic>,
        resolver: &'a dyn HandlerResolver,
        current_hart: fn() -> u32,
    ) -> Self {
        Self {
            aplic,
            imsic,
            resolver,
            current_hart,
        }
    }

    /// Entry point for the shared external interrupt line.
    ///
    /// Claims at most one APLIC source per invocation; a storm of
    /// back-to-back wired interrupts relies on the host re-invoking
    /// promptly. An unresolved APLIC handler leaves the claim
    /// uncompleted so the source is redelivered; unresolved IMSIC EIDs
    /// are cleared regardless.
    pub fn on_external_interrupt(&self) {
        if let Some(aplic) = self.aplic.filter(|a| a.is_ready()) {
            let hart = (self.current_hart)();
            if let Some(irq) = aplic.claim_next(hart) {
                match self.resolver.resolve(irq) {
                    Some(entry) => {
                        (entry.isr)(irq, entry.arg);
                        aplic.complete(hart, irq);
                        aplic.record_direct_dispatch(hart, irq);
                        debug!("dispatch: handled APLIC IRQ {} on hart {}", irq, hart);
                    }
                    None => {
                        warn!(
                            "dispatch: no handler for APLIC IRQ {}, leaving claim outstanding",
                            irq
                        );
                    }
                }
            }
        }

        if let Some(imsic) = self.imsic.filter(|i| i.is_ready()) {
            let pending = imsic.pending_words();
            let enabled = imsic.enabled_words();
            for word in 0..2u32 {
                let mut hits = pending[word as usize] & enabled[word as usize];
                while hits != 0 {
                    let eid = word * 32 + hits.trailing_zeros();
                    hits &= hits - 1;
                    imsic.dispatch_one(eid, self.resolver);
                }
            }
        }
    }
}
