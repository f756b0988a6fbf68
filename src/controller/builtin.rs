//! Controller logic shipped with the crate.

use super::{ControlLogic, Controller, ControllerParts, RunResult};
use serde_json::json;
use std::time::Duration;

/// Does nothing and finishes immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogic;

impl ControlLogic for NullLogic {
    fn main(&self, _ctl: &Controller) -> RunResult {
        Ok(())
    }
}

/// Emits a `HEARTBEAT` event with an increasing counter every `interval` until stopped,
/// aborted, or `beats` events were sent.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    /// Pause between beats.
    pub interval: Duration,
    /// Stop after this many beats; `None` runs until stopped.
    pub beats: Option<u64>,
}

impl Heartbeat {
    /// Event type of every beat.
    pub const EVENT_TYPE: &'static str = "HEARTBEAT";
    /// Used when `interval_ms` is not configured.
    pub const DEFAULT_INTERVAL_MS: u64 = 1000;

    /// Read `interval_ms` and the optional `beats` from the configuration.
    pub fn from_parts(parts: &ControllerParts) -> anyhow::Result<Self> {
        let interval_ms = match parts.configuration.get("interval_ms") {
            Some(_) => parts.config::<u64>("interval_ms")?,
            None => Self::DEFAULT_INTERVAL_MS,
        };
        let beats = match parts.configuration.get("beats") {
            Some(value) if !value.is_null() => Some(parts.config::<u64>("beats")?),
            _ => None,
        };
        Ok(Self {
            interval: Duration::from_millis(interval_ms),
            beats,
        })
    }
}

impl ControlLogic for Heartbeat {
    fn main(&self, ctl: &Controller) -> RunResult {
        let mut count: u64 = 0;
        while !ctl.check_stop()? {
            ctl.abort_breakout_point()?;
            ctl.send_event(
                Self::EVENT_TYPE,
                json!({ "controller": ctl.handle(), "count": count }),
            )?;
            count += 1;
            if self.beats.is_some_and(|limit| count >= limit) {
                break;
            }
            ctl.sleep(self.interval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Completion;

    #[test]
    fn heartbeat_counts_until_limit() {
        let mut parts = ControllerParts::new("beat", "heartbeat");
        parts.configuration.insert("interval_ms".into(), json!(1));
        parts.configuration.insert("beats".into(), json!(3));
        let logic = Heartbeat::from_parts(&parts).unwrap();
        let ctl = Controller::new(parts, logic);

        ctl.start().unwrap();
        assert_eq!(ctl.join().unwrap(), Some(Completion::Finished));

        let queue = ctl.event_queue().unwrap();
        let counts: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.content["count"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![0, 1, 2]);
    }

    #[test]
    fn defaults_apply_without_configuration() {
        let logic = Heartbeat::from_parts(&ControllerParts::new("beat", "heartbeat")).unwrap();
        assert_eq!(logic.interval, Duration::from_millis(Heartbeat::DEFAULT_INTERVAL_MS));
        assert_eq!(logic.beats, None);
    }
}
