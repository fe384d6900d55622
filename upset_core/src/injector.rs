//! Single-bit fault injection into checkpoint state.
//!
//! An injection copies a source checkpoint, picks a site (target, register,
//! element and bit) weighted by implemented bits, flips the bit in the copy's
//! attribute store and marks the copy complete. The chosen [`InjectionSite`]
//! is returned so that it can be persisted and later replayed bit-for-bit.

use crate::catalog::{Catalog, Field, Register};
use crate::checkpoint::{self, AttributeAccess, CheckpointError};
use crate::selector::{SelectionError, TargetSelector, weighted_choice};
use crate::value::{self, Value, ValueError};
use log::debug;
use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InjectError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("Register {register} of target {target} has no field containing bit {bit}")]
    FieldNotFound {
        target: String,
        register: String,
        bit: u32,
    },

    #[error("Replayed site is missing its injected value")]
    IncompleteReplay,
}

/// Everything needed to reproduce one injection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InjectionSite {
    pub target: String,
    pub target_index: Option<u32>,
    pub config_object: String,
    pub register: String,
    pub register_index: Option<Vec<usize>>,
    pub field: Option<String>,
    pub bit: u32,
    pub num_bits: u32,
    pub gold_value: Option<String>,
    pub injected_value: Option<String>,
}

impl InjectionSite {
    /// `register` or `register:i:j` for indexed elements.
    pub fn register_path(&self) -> String {
        register_path(&self.register, self.register_index.as_deref())
    }
}

pub fn register_path(register: &str, index: Option<&[usize]>) -> String {
    match index {
        Some(index) if !index.is_empty() => {
            let parts: Vec<String> = index.iter().map(|i| i.to_string()).collect();
            format!("{}:{}", register, parts.join(":"))
        }
        _ => register.to_string(),
    }
}

/// Element, bit and width chosen inside a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitChoice {
    pub register_index: Option<Vec<usize>>,
    pub bit: u32,
    pub num_bits: u32,
    pub field: Option<String>,
}

/// Picks the element and bit to flip inside `register`.
///
/// TLB registers choose a field weighted by its width, then (for split
/// fields) the low or high half weighted by their widths; the half names
/// the entry word and bounds the bit. Other registers draw a bit uniformly
/// over the implemented bits.
pub fn choose_bit(
    target: &str,
    register: &Register,
    rng: &mut dyn RngCore,
) -> Result<BitChoice, InjectError> {
    let mut register_index = register
        .count
        .as_ref()
        .map(|dims| dims.iter().map(|d| rng.random_range(0..(*d).max(1))).collect::<Vec<_>>());

    if register.is_tlb {
        let candidates: Vec<(&Field, u64)> = register
            .fields
            .iter()
            .map(|f| (f, u64::from(f.bits())))
            .collect();
        let field = weighted_choice(&candidates, rng)
            .ok_or(SelectionError::NothingToChoose("field"))?;
        let half = match field.high {
            Some(high) => {
                let low_bits = field.low.bits();
                if rng.random_range(0..low_bits + high.bits()) < low_bits {
                    field.low
                } else {
                    high
                }
            }
            None => field.low,
        };
        if let (Some(index), Some(word)) = (register_index.as_mut(), half.index) {
            if let Some(last) = index.last_mut() {
                *last = word;
            }
        }
        let bit = rng.random_range(half.low..=half.high);
        return Ok(BitChoice {
            register_index,
            bit,
            num_bits: register.bits,
            field: Some(field.name.clone()),
        });
    }

    let mut bit = rng.random_range(0..register.bits);
    if let Some(adjust) = &register.adjust_bit {
        bit = adjust[bit as usize];
    }
    let field = if register.fields.is_empty() {
        None
    } else {
        let field = register
            .field_for_bit(bit)
            .ok_or_else(|| InjectError::FieldNotFound {
                target: target.to_string(),
                register: register.name.clone(),
                bit,
            })?;
        Some(field.name.clone())
    };
    Ok(BitChoice {
        register_index,
        bit,
        num_bits: register.flip_width(),
        field,
    })
}

/// Flips one bit of a register value in place, touching only the indexed
/// leaf.
pub fn flip_in_value(
    value: &mut Value,
    index: Option<&[usize]>,
    num_bits: u32,
    bit: u32,
) -> Result<(u64, u64), InjectError> {
    let index = index.unwrap_or(&[]);
    let gold = value.leaf(index)?;
    let injected = value::flip_scalar(gold, num_bits, bit)?;
    value.replace_leaf(index, injected)?;
    Ok((gold, injected))
}

/// What an injection should do at its site.
#[derive(Debug, Clone, Copy)]
pub enum InjectionPlan<'a> {
    /// Choose a new random site.
    Fresh,
    /// Reapply a previously recorded site and value.
    Replay(&'a InjectionSite),
}

/// A failed injection. Carries as much of the site as was chosen before the
/// failure so that it can still be recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Error injecting fault: {source}")]
pub struct InjectionFailure {
    pub site: Option<InjectionSite>,
    pub source: InjectError,
}

impl From<InjectError> for InjectionFailure {
    fn from(source: InjectError) -> Self {
        InjectionFailure { site: None, source }
    }
}
impl From<CheckpointError> for InjectionFailure {
    fn from(err: CheckpointError) -> Self {
        InjectError::from(err).into()
    }
}

pub struct CheckpointInjector<'a> {
    catalog: &'a Catalog,
    selector: &'a TargetSelector,
}

impl<'a> CheckpointInjector<'a> {
    pub fn new(catalog: &'a Catalog, selector: &'a TargetSelector) -> Self {
        Self { catalog, selector }
    }

    /// Chooses a target, register and bit without touching any checkpoint.
    pub fn choose_site(&self, rng: &mut dyn RngCore) -> Result<InjectionSite, InjectError> {
        let choice = self.selector.choose_target(self.catalog, rng)?;
        let register = self.selector.choose_register(choice.target, rng)?;
        let bits = choose_bit(&choice.target.name, register, rng)?;
        Ok(InjectionSite {
            target: choice.target.name.clone(),
            target_index: choice.index,
            config_object: self.catalog.config_object(choice.target, choice.index),
            register: register.name.clone(),
            register_index: bits.register_index,
            field: bits.field,
            bit: bits.bit,
            num_bits: bits.num_bits,
            gold_value: None,
            injected_value: None,
        })
    }

    /// Copies `source` to `destination` and injects one fault into the copy.
    /// Attributes are read and written back through `access`.
    pub fn inject<A: AttributeAccess + ?Sized>(
        &self,
        access: &A,
        source: &Path,
        destination: &Path,
        plan: InjectionPlan<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<InjectionSite, InjectionFailure> {
        checkpoint::copy_checkpoint(source, destination)?;

        let mut site = match plan {
            InjectionPlan::Fresh => self.choose_site(rng)?,
            InjectionPlan::Replay(previous) => previous.clone(),
        };

        match self.apply(access, destination, &mut site, plan) {
            Ok(()) => {
                debug!(
                    "Injected {}:{} bit {} ({} -> {})",
                    site.config_object,
                    site.register_path(),
                    site.bit,
                    site.gold_value.as_deref().unwrap_or("?"),
                    site.injected_value.as_deref().unwrap_or("?"),
                );
                Ok(site)
            }
            Err(source) => Err(InjectionFailure {
                site: Some(site),
                source,
            }),
        }
    }

    fn apply<A: AttributeAccess + ?Sized>(
        &self,
        access: &A,
        destination: &Path,
        site: &mut InjectionSite,
        plan: InjectionPlan<'_>,
    ) -> Result<(), InjectError> {
        let mut store = access.read_checkpoint(destination)?;
        let mut value = access.get_attr(&store, &site.config_object, &site.register)?.clone();
        let index = site.register_index.clone();
        let (gold, injected) = match plan {
            InjectionPlan::Fresh => flip_in_value(&mut value, index.as_deref(), site.num_bits, site.bit)?,
            InjectionPlan::Replay(previous) => {
                let injected = previous
                    .injected_value
                    .as_deref()
                    .ok_or(InjectError::IncompleteReplay)
                    .and_then(|v| value::parse_literal(v).map_err(InjectError::from))?;
                let gold = value.replace_leaf(index.as_deref().unwrap_or(&[]), injected)?;
                (gold, injected)
            }
        };
        access.set_attr(&mut store, &site.config_object, &site.register, value);
        site.gold_value = Some(value::format_hex(gold));
        site.injected_value = Some(value::format_hex(injected));
        store.write(destination)?;
        checkpoint::mark_complete(destination)?;
        Ok(())
    }
}
