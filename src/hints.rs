// SPDX-License-Identifier: GPL-2.0
//
// Coarse named performance hints (perf locks).

use std::time::Duration;

use log::{debug, warn};
use rustc_hash::FxHashSet;

use crate::config::Config;

/// Sink for coarse, named performance hints.
///
/// `do_hint` with a duration engages the hint for that long; without one the
/// hint stays engaged until `end_hint`. Failures are non-fatal for callers.
pub trait HintSink: Send + Sync {
    fn is_supported(&self, name: &str) -> bool;
    fn do_hint(&self, name: &str, duration: Option<Duration>) -> bool;
    fn end_hint(&self, name: &str) -> bool;
}

/// Hint sink that forwards to the platform boost driver.
///
/// The actual node writes live in vendor glue outside this daemon; this
/// validates the name against the configured set and makes the transitions
/// observable in the log.
pub struct PlatformHintSink {
    supported: FxHashSet<String>,
}

impl PlatformHintSink {
    pub fn from_config(config: &Config) -> Self {
        Self {
            supported: config.supported_hints.iter().cloned().collect(),
        }
    }
}

impl HintSink for PlatformHintSink {
    fn is_supported(&self, name: &str) -> bool {
        self.supported.contains(name)
    }

    fn do_hint(&self, name: &str, duration: Option<Duration>) -> bool {
        if !self.is_supported(name) {
            warn!("do hint {} failed: unsupported", name);
            return false;
        }
        match duration {
            Some(d) => debug!("hint {} engaged for {:?}", name, d),
            None => debug!("hint {} engaged", name),
        }
        true
    }

    fn end_hint(&self, name: &str) -> bool {
        if !self.is_supported(name) {
            warn!("end hint {} failed: unsupported", name);
            return false;
        }
        debug!("hint {} released", name);
        true
    }
}
