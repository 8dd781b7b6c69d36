//! Weighted, throttled and monotonic progress for one load session.
//!
//! A session walks through phases in table order (runtime engine, then model).
//! The value handed to observers is
//! `(completed weights + local% * current weight / 100) / total weight * 100`,
//! clamped so it never moves backwards.

use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::AssetKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Runtime,
    Model,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Runtime => "runtime",
            Phase::Model => "model",
        }
    }
}

impl From<AssetKind> for Phase {
    fn from(kind: AssetKind) -> Self {
        match kind {
            AssetKind::Runtime => Phase::Runtime,
            AssetKind::Model => Phase::Model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PhaseWeight {
    pub phase: Phase,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub asset_key: String,
    pub phase: Phase,
    pub percent: f64,
    pub message: String,
}

impl ProgressUpdate {
    pub fn rounded(&self) -> u8 {
        self.percent.round().clamp(0.0, 100.0) as u8
    }
}

struct Delivered {
    at: Instant,
    value: f64,
    rounded: u8,
    message: String,
}

pub struct ProgressAggregator {
    asset_key: String,
    phases: Vec<PhaseWeight>,
    total_weight: f64,
    min_interval: Duration,
    current: usize,
    local: f64,
    max_value: f64,
    last: Option<Delivered>,
    sink: Option<broadcast::Sender<ProgressUpdate>>,
}

impl ProgressAggregator {
    pub fn new(asset_key: impl Into<String>, phases: Vec<PhaseWeight>, min_interval: Duration) -> Self {
        let total_weight = phases.iter().map(|p| p.weight as f64).sum::<f64>();
        Self {
            asset_key: asset_key.into(),
            phases,
            total_weight,
            min_interval,
            current: 0,
            local: 0.0,
            max_value: 0.0,
            last: None,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: broadcast::Sender<ProgressUpdate>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn report(&mut self, phase: Phase, local: f64, message: &str) -> Option<ProgressUpdate> {
        self.report_at(phase, local, message, Instant::now())
    }

    /// Feed one observation; returns the update if it passed the throttle.
    pub fn report_at(
        &mut self,
        phase: Phase,
        local: f64,
        message: &str,
        now: Instant,
    ) -> Option<ProgressUpdate> {
        let Some(index) = self.phases.iter().position(|p| p.phase == phase) else {
            debug!(asset = %self.asset_key, phase = phase.as_str(), "progress for unknown phase ignored");
            return None;
        };
        if index < self.current {
            return None;
        }
        if index > self.current {
            self.current = index;
            self.local = 0.0;
        }
        let local = if local.is_finite() { local.clamp(0.0, 100.0) } else { 0.0 };
        self.local = self.local.max(local);
        let value = self.global().max(self.max_value);
        self.max_value = value;
        self.deliver(phase, value, message, now, false)
    }

    /// Deliver 100% for the session regardless of the throttle.
    pub fn complete(&mut self, message: &str) -> Option<ProgressUpdate> {
        self.current = self.phases.len().saturating_sub(1);
        self.local = 100.0;
        self.max_value = 100.0;
        let phase = self
            .phases
            .last()
            .map(|p| p.phase)
            .unwrap_or(Phase::Model);
        self.deliver(phase, 100.0, message, Instant::now(), true)
    }

    pub fn last_delivered(&self) -> f64 {
        self.last.as_ref().map(|d| d.value).unwrap_or(0.0)
    }

    fn global(&self) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        let completed: f64 = self.phases[..self.current]
            .iter()
            .map(|p| p.weight as f64)
            .sum();
        let current = self.phases.get(self.current).map(|p| p.weight as f64).unwrap_or(0.0);
        ((completed + self.local * current / 100.0) / self.total_weight * 100.0).clamp(0.0, 100.0)
    }

    fn deliver(
        &mut self,
        phase: Phase,
        value: f64,
        message: &str,
        now: Instant,
        force: bool,
    ) -> Option<ProgressUpdate> {
        let rounded = value.round().clamp(0.0, 100.0) as u8;
        let due = match &self.last {
            None => true,
            Some(last) => {
                force
                    || now.saturating_duration_since(last.at) >= self.min_interval
                    || rounded != last.rounded
                    || message != last.message
                    || (value >= 100.0 && last.value < 100.0)
            }
        };
        if !due {
            return None;
        }
        self.last = Some(Delivered {
            at: now,
            value,
            rounded,
            message: message.to_string(),
        });
        let update = ProgressUpdate {
            asset_key: self.asset_key.clone(),
            phase,
            percent: value,
            message: message.to_string(),
        };
        if let Some(sink) = &self.sink {
            let _ = sink.send(update.clone());
        }
        Some(update)
    }
}
