use crate::catalog::{Catalog, Register, Target};
use rand::Rng;
use rand_core::RngCore;
use thiserror::Error;

/// Errors raised while choosing an injection site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// Every candidate was filtered out or carries zero weight.
    #[error("No injectable {0} left to choose from")]
    NothingToChoose(&'static str),

    #[error("Target {0:?} is not in the catalog")]
    UnknownTarget(String),
}

/// A chosen target, plus the instance index when the target is replicated.
#[derive(Debug, Clone, Copy)]
pub struct TargetChoice<'a> {
    pub target: &'a Target,
    pub index: Option<u32>,
}

/// Draws one item with probability proportional to its weight.
///
/// A single draw is taken in `0..total` and walked against the cumulative
/// weight sums, so an item with weight `w` out of `total` wins with
/// probability `w / total`.
pub fn weighted_choice<'a, T>(
    candidates: &[(&'a T, u64)],
    rng: &mut dyn RngCore,
) -> Option<&'a T> {
    let total: u64 = candidates.iter().map(|(_, w)| *w).sum();
    if total == 0 {
        return None;
    }
    let draw = rng.random_range(0..total);
    let mut cumulative = 0;
    for (item, weight) in candidates {
        cumulative += weight;
        if draw < cumulative {
            return Some(*item);
        }
    }
    None
}

/// Chooses targets and registers from a catalog, optionally restricted to a
/// subset of names.
#[derive(Debug, Clone, Default)]
pub struct TargetSelector {
    allowed_targets: Option<Vec<String>>,
    allowed_registers: Option<Vec<String>>,
}

impl TargetSelector {
    pub fn new(allowed_targets: Option<Vec<String>>, allowed_registers: Option<Vec<String>>) -> Self {
        Self {
            allowed_targets,
            allowed_registers,
        }
    }

    pub fn choose_target<'a>(
        &self,
        catalog: &'a Catalog,
        rng: &mut dyn RngCore,
    ) -> Result<TargetChoice<'a>, SelectionError> {
        let candidates: Vec<(&Target, u64)> = catalog
            .targets
            .iter()
            .filter(|t| {
                self.allowed_targets
                    .as_ref()
                    .is_none_or(|allowed| allowed.contains(&t.name))
            })
            .map(|t| (t, t.total_bits))
            .collect();
        let target =
            weighted_choice(&candidates, rng).ok_or(SelectionError::NothingToChoose("target"))?;
        let index = target.count.map(|count| rng.random_range(0..count.max(1)));
        Ok(TargetChoice { target, index })
    }

    pub fn choose_register<'a>(
        &self,
        target: &'a Target,
        rng: &mut dyn RngCore,
    ) -> Result<&'a Register, SelectionError> {
        let candidates: Vec<(&Register, u64)> = target
            .registers
            .iter()
            .filter(|r| {
                self.allowed_registers
                    .as_ref()
                    .is_none_or(|allowed| allowed.contains(&r.name))
            })
            .map(|r| (r, r.total_bits))
            .collect();
        weighted_choice(&candidates, rng).ok_or(SelectionError::NothingToChoose("register"))
    }

    /// Looks `target_name` up in `catalog` before choosing a register from it.
    pub fn choose_register_in<'a>(
        &self,
        catalog: &'a Catalog,
        target_name: &str,
        rng: &mut dyn RngCore,
    ) -> Result<&'a Register, SelectionError> {
        let target = catalog
            .target(target_name)
            .ok_or_else(|| SelectionError::UnknownTarget(target_name.to_string()))?;
        self.choose_register(target, rng)
    }
}
