//! Sweep axes and the lazy measurement-point iterator.
//!
//! A sweep runs over one or two named axes. Instead of nested loops with
//! duplicated break-out conditions, the plan yields a flat sequence of
//! [`SweepPoint`]s in program order (outer axis slowest); the driving loop
//! checks the abort flag once per point.

use super::vector::{parse_sweep_vector, SweepVectorError};
use crate::error::ControlError;
use serde::{Deserialize, Serialize};

/// One named parameter with its ordered settings.
///
/// The settings order is operator-significant: it defines program order
/// and is never sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepAxis {
    pub name: String,
    pub settings: Vec<i64>,
}

impl SweepAxis {
    pub fn new(name: impl Into<String>, settings: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    /// Parse the axis settings from an operator expression.
    pub fn parse(name: &str, expression: &str) -> Result<Self, SweepVectorError> {
        Ok(Self::new(name, parse_sweep_vector(expression)?))
    }

    /// The last setting, used in the per-measurement status line.
    pub fn last(&self) -> Option<i64> {
        self.settings.last().copied()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

/// One measurement point of a sweep, in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPoint {
    /// Zero-based measurement index over the whole plan.
    pub index: usize,
    /// Outer-axis setting, when a second axis is enabled.
    pub outer: Option<i64>,
    /// True on the first inner iteration for a given outer setting.
    pub outer_changed: bool,
    /// Inner-axis setting.
    pub inner: i64,
}

/// A one- or two-dimensional sweep.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    inner: SweepAxis,
    outer: Option<SweepAxis>,
}

impl SweepPlan {
    /// Build a plan, rejecting empty axes: an empty settings vector is a
    /// valid parse result but never a valid sweep bound.
    pub fn new(inner: SweepAxis, outer: Option<SweepAxis>) -> Result<Self, ControlError> {
        if inner.is_empty() {
            return Err(ControlError::Validation(format!(
                "Sweep axis '{}' has no settings",
                inner.name
            )));
        }
        if let Some(axis) = &outer {
            if axis.is_empty() {
                return Err(ControlError::Validation(format!(
                    "Sweep axis '{}' has no settings",
                    axis.name
                )));
            }
        }
        Ok(Self { inner, outer })
    }

    pub fn inner_axis(&self) -> &SweepAxis {
        &self.inner
    }

    pub fn outer_axis(&self) -> Option<&SweepAxis> {
        self.outer.as_ref()
    }

    /// Total number of measurement points.
    pub fn total(&self) -> usize {
        match &self.outer {
            Some(outer) => outer.len() * self.inner.len(),
            None => self.inner.len(),
        }
    }

    /// Lazily yield all points, outer axis slowest.
    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        let outer_settings: Vec<Option<i64>> = match &self.outer {
            Some(outer) => outer.settings.iter().copied().map(Some).collect(),
            None => vec![None],
        };
        let inner = &self.inner.settings;
        outer_settings
            .into_iter()
            .flat_map(move |outer| {
                inner
                    .iter()
                    .copied()
                    .enumerate()
                    .map(move |(i, inner)| (outer, i == 0, inner))
            })
            .enumerate()
            .map(|(index, (outer, outer_changed, inner))| SweepPoint {
                index,
                outer,
                outer_changed,
                inner,
            })
    }

    /// Directory label for one point: `<outer><v2>_<inner><v1>`, or just
    /// `<inner><v1>` for one-dimensional sweeps.
    pub fn directory_label(&self, point: &SweepPoint) -> String {
        match (&self.outer, point.outer) {
            (Some(outer), Some(value)) => {
                format!("{}{}_{}{}", outer.name, value, self.inner.name, point.inner)
            }
            _ => format!("{}{}", self.inner.name, point.inner),
        }
    }

    /// All directory labels in program order, for the sweep descriptor.
    pub fn directory_labels(&self) -> Vec<String> {
        self.points().map(|p| self.directory_label(&p)).collect()
    }
}
