//! Controller lifecycle modes.
//!
//! Modes are not mutually exclusive: a controller may be `ThreadInitialized` and
//! `DevicesInitialized` at once. `ModeSet` is a small bitmask over [`ControllerMode`].

use std::fmt;

/// A single lifecycle mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerMode {
    /// Constructed; always set.
    ObjectInitialized,
    /// Queue and signals are attached.
    ThreadInitialized,
    /// Queue and signals were released.
    ThreadShutdown,
    /// Every device initialized successfully.
    DevicesInitialized,
    /// Devices were shut down.
    DevicesShutdown,
    /// Main routine running on its own thread.
    RunningAsThread,
    /// Main routine running inside `run`.
    RunningAsBlockingCall,
}

impl ControllerMode {
    /// Every mode in bit order.
    pub const ALL: [ControllerMode; 7] = [
        ControllerMode::ObjectInitialized,
        ControllerMode::ThreadInitialized,
        ControllerMode::ThreadShutdown,
        ControllerMode::DevicesInitialized,
        ControllerMode::DevicesShutdown,
        ControllerMode::RunningAsThread,
        ControllerMode::RunningAsBlockingCall,
    ];

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerMode::ObjectInitialized => "object_initialized",
            ControllerMode::ThreadInitialized => "thread_initialized",
            ControllerMode::ThreadShutdown => "thread_shutdown",
            ControllerMode::DevicesInitialized => "devices_initialized",
            ControllerMode::DevicesShutdown => "devices_shutdown",
            ControllerMode::RunningAsThread => "running_as_thread",
            ControllerMode::RunningAsBlockingCall => "running_as_blocking_call",
        }
    }
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`ControllerMode`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModeSet(u8);

impl ModeSet {
    /// No modes.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set of `modes`; usable in constants.
    pub const fn of(modes: &[ControllerMode]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < modes.len() {
            bits |= modes[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Whether `mode` is in the set.
    pub fn contains(self, mode: ControllerMode) -> bool {
        self.0 & mode.bit() != 0
    }

    /// True when every mode of `other` is present.
    pub fn contains_all(self, other: ModeSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one mode of `other` is present.
    pub fn intersects(self, other: ModeSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Add `mode`.
    pub fn insert(&mut self, mode: ControllerMode) {
        self.0 |= mode.bit();
    }

    /// Drop `mode`.
    pub fn remove(&mut self, mode: ControllerMode) {
        self.0 &= !mode.bit();
    }

    /// True when no mode is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in bit order.
    pub fn iter(self) -> impl Iterator<Item = ControllerMode> {
        ControllerMode::ALL
            .into_iter()
            .filter(move |mode| self.contains(*mode))
    }
}

impl From<ControllerMode> for ModeSet {
    fn from(mode: ControllerMode) -> Self {
        Self(mode.bit())
    }
}

impl fmt::Display for ModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, mode) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(mode.as_str())?;
        }
        f.write_str("}")
    }
}

impl fmt::Debug for ModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let mut set = ModeSet::from(ControllerMode::ObjectInitialized);
        set.insert(ControllerMode::ThreadInitialized);

        let needed = ModeSet::of(&[
            ControllerMode::ThreadInitialized,
            ControllerMode::DevicesInitialized,
        ]);
        assert!(!set.contains_all(needed));
        assert!(set.intersects(needed));

        set.insert(ControllerMode::DevicesInitialized);
        assert!(set.contains_all(needed));

        set.remove(ControllerMode::ThreadInitialized);
        assert!(!set.contains(ControllerMode::ThreadInitialized));
    }

    #[test]
    fn display_lists_modes_in_declaration_order() {
        let set = ModeSet::of(&[
            ControllerMode::RunningAsThread,
            ControllerMode::ObjectInitialized,
        ]);
        assert_eq!(set.to_string(), "{object_initialized, running_as_thread}");
        assert_eq!(ModeSet::empty().to_string(), "{}");
    }
}
