//! # Driver Matcher
//!
//! Collects scored candidates for one device and picks the winner: highest
//! score, earliest candidate on ties. A [`DriverSelector`] may override the
//! pick but can only choose among the candidates it was shown.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::driver_attributes::DriverAttributes;
use crate::capability::{ServiceRef, MATCH_NONE};

/// A driver that scored above [`MATCH_NONE`] for a device.
#[derive(Clone)]
pub struct Match {
    pub score: i32,
    pub driver: Arc<DriverAttributes>,
}

impl fmt::Debug for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Match")
            .field("score", &self.score)
            .field("driver", self.driver.driver_id())
            .finish()
    }
}

/// External policy that picks one match out of several.
pub trait DriverSelector: Send + Sync {
    /// Index into `matches` of the chosen driver, or `None` to select none.
    fn select(&self, device: &ServiceRef, matches: &[Match]) -> Option<usize>;
}

#[derive(Debug, Default)]
pub struct DriverMatcher {
    matches: Vec<Match>,
}

impl DriverMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scores `driver` against `device` and records it if it matches.
    ///
    /// A driver that fails while scoring is logged and treated as a reject.
    pub fn offer(&mut self, driver: &Arc<DriverAttributes>, device: &ServiceRef) {
        match driver.match_device(device) {
            Ok(score) if score > MATCH_NONE => self.add(score, Arc::clone(driver)),
            Ok(score) => {
                debug!(driver = %driver.driver_id(), score, "driver does not match");
            }
            Err(e) => {
                error!(driver = %driver.driver_id(), error = %e, "match threw an exception");
            }
        }
    }

    /// Records a candidate. Scores at or below [`MATCH_NONE`] are ignored.
    pub fn add(&mut self, score: i32, driver: Arc<DriverAttributes>) {
        if score > MATCH_NONE {
            self.matches.push(Match { score, driver });
        }
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Highest score wins; the first one seen wins a tie.
    pub fn best_match(&self) -> Option<Match> {
        let mut best: Option<&Match> = None;
        for candidate in &self.matches {
            if best.map_or(true, |b| candidate.score > b.score) {
                best = Some(candidate);
            }
        }
        best.cloned()
    }

    /// Lets `selector` choose among the candidates.
    pub fn select_best_match(&self, device: &ServiceRef, selector: &dyn DriverSelector) -> Option<Match> {
        if self.matches.is_empty() {
            return None;
        }
        match selector.select(device, &self.matches) {
            Some(index) if index < self.matches.len() => Some(self.matches[index].clone()),
            Some(index) => {
                warn!(index, candidates = self.matches.len(), "driver selector picked outside the candidate set");
                None
            }
            None => None,
        }
    }

    /// Uses `selector` if one is installed, the default policy otherwise.
    pub fn pick(&self, device: &ServiceRef, selector: Option<&dyn DriverSelector>) -> Option<Match> {
        match selector {
            Some(selector) => self.select_best_match(device, selector),
            None => self.best_match(),
        }
    }
}
