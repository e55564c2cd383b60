//! Sweep Axis Resolver.
//!
//! Turns a [`SweepConfig`] into an ordered, finite enumeration of coordinates
//! that can be entered at any index. Coordinates are computed from the index
//! alone (mixed-radix decomposition for nested sweeps), so resuming after a
//! pause, an acknowledged error or a process restart yields exactly the same
//! remaining sequence.

use crate::error::{AppResult, DaqError};
use crate::experiment::sweep::{Composition, SweepConfig};

/// One value per axis, in declaration order.
pub type Coordinate = Vec<f64>;

/// Index-addressable enumeration of a sweep's coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepResolver {
    axes: Vec<Vec<f64>>,
    composition: Composition,
    /// Points covered by one step of each axis (nested only).
    strides: Vec<usize>,
    len: usize,
}

impl SweepResolver {
    /// Build the resolver, validating the sweep.
    ///
    /// # Errors
    ///
    /// Configuration error if the sweep is invalid (e.g. zipped axes of unequal
    /// length) or the nested product overflows `usize`.
    pub fn new(config: &SweepConfig) -> AppResult<Self> {
        config.validate()?;
        let axes: Vec<Vec<f64>> = config.axes().iter().map(|a| a.values.clone()).collect();

        let (strides, len) = match config.composition() {
            Composition::Zipped => (Vec::new(), axes[0].len()),
            Composition::Nested => {
                let mut strides = vec![1usize; axes.len()];
                let mut len = 1usize;
                for (k, axis) in axes.iter().enumerate().rev() {
                    strides[k] = len;
                    len = len.checked_mul(axis.len()).ok_or_else(|| {
                        DaqError::Configuration("Nested sweep has too many points".into())
                    })?;
                }
                (strides, len)
            }
        };

        Ok(Self {
            axes,
            composition: config.composition(),
            strides,
            len,
        })
    }

    /// Total number of coordinates.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the sweep has no coordinates.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Coordinate at `index`, or `None` past the end.
    pub fn coordinate_at(&self, index: usize) -> Option<Coordinate> {
        if index >= self.len {
            return None;
        }
        let coordinate = match self.composition {
            Composition::Zipped => self.axes.iter().map(|values| values[index]).collect(),
            Composition::Nested => self
                .axes
                .iter()
                .zip(&self.strides)
                .map(|(values, stride)| values[(index / stride) % values.len()])
                .collect(),
        };
        Some(coordinate)
    }

    /// Lazy iterator over `(index, coordinate)` starting at `start`.
    pub fn iter_from(&self, start: usize) -> Coordinates<'_> {
        Coordinates {
            resolver: self,
            next: start,
        }
    }

    /// Remaining coordinates after the last completed index.
    ///
    /// `None` means nothing has been completed yet.
    pub fn remaining_after(&self, last_completed: Option<usize>) -> Coordinates<'_> {
        self.iter_from(last_completed.map_or(0, |i| i.saturating_add(1)))
    }
}

/// Iterator returned by [`SweepResolver::iter_from`].
#[derive(Debug, Clone)]
pub struct Coordinates<'a> {
    resolver: &'a SweepResolver,
    next: usize,
}

impl Iterator for Coordinates<'_> {
    type Item = (usize, Coordinate);

    fn next(&mut self) -> Option<Self::Item> {
        let coordinate = self.resolver.coordinate_at(self.next)?;
        let index = self.next;
        self.next += 1;
        Some((index, coordinate))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.resolver.len.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Coordinates<'_> {}
