//! Interrupt discipline
//!
//! Single-CPU interrupt state: a level that code toggles around critical
//! sections, a flag marking execution inside an external handler, and the
//! yield-on-return latch the timer uses to request preemption once the
//! handler unwinds. Every executive queue is mutated only while the level
//! is `Off`, and the entry points assert it.

use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupt level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    /// Interrupts deliverable.
    On,
    /// Interrupts held off.
    Off,
}

/// Per-CPU interrupt state.
#[derive(Debug)]
pub struct IntrState {
    enabled: AtomicBool,
    external: AtomicBool,
    yield_on_return: AtomicBool,
}

impl IntrState {
    /// Boot state: interrupts off until the scheduler starts.
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            external: AtomicBool::new(false),
            yield_on_return: AtomicBool::new(false),
        }
    }

    pub fn level(&self) -> IntrLevel {
        if self.enabled.load(Ordering::Acquire) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    /// Turn interrupts off, returning the previous level.
    pub fn disable(&self) -> IntrLevel {
        if self.enabled.swap(false, Ordering::AcqRel) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    /// Turn interrupts on, returning the previous level. Not legal inside
    /// an external handler.
    pub fn enable(&self) -> IntrLevel {
        assert!(
            !self.is_external(),
            "interrupts cannot be enabled in an external handler"
        );
        if self.enabled.swap(true, Ordering::AcqRel) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    /// Restore a previously saved level.
    pub fn set_level(&self, level: IntrLevel) -> IntrLevel {
        match level {
            IntrLevel::On => self.enable(),
            IntrLevel::Off => self.disable(),
        }
    }

    /// Are we running inside an external interrupt handler?
    pub fn is_external(&self) -> bool {
        self.external.load(Ordering::Acquire)
    }

    /// Enter an external handler. The machine delivers handlers with
    /// interrupts off; callers save and restore the level around this.
    pub(crate) fn enter_external(&self) {
        assert_eq!(self.level(), IntrLevel::Off);
        let nested = self.external.swap(true, Ordering::AcqRel);
        assert!(!nested, "nested external handler");
    }

    /// Leave the handler; reports whether a yield was latched.
    pub(crate) fn leave_external(&self) -> bool {
        self.external.store(false, Ordering::Release);
        self.yield_on_return.swap(false, Ordering::AcqRel)
    }

    /// Latch a yield to run once the current handler returns. Only
    /// meaningful from handler context.
    pub fn yield_on_return(&self) {
        assert!(self.is_external(), "yield_on_return outside a handler");
        self.yield_on_return.store(true, Ordering::Release);
    }
}

impl Default for IntrState {
    fn default() -> Self {
        Self::new()
    }
}
