//! Differences between a gold checkpoint and a monitored one.
//!
//! Registers are compared leaf by leaf across every catalog instance; memory
//! images are compared in fixed-size blocks. Differing blocks can optionally
//! be extracted next to the monitored checkpoint for later inspection.

use crate::catalog::Catalog;
use crate::checkpoint::{self, AttributeAccess, AttributeStore, CheckpointError};
use crate::injector::register_path;
use crate::value::{Value, format_hex};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MEMORY_BLOCKS_DIR: &str = "memory-blocks";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegisterDiff {
    pub checkpoint: u32,
    pub config_object: String,
    /// `register` or `register:i:j` for indexed elements.
    pub register: String,
    pub gold_value: String,
    pub monitored_value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MemoryDiff {
    pub checkpoint: u32,
    pub image_index: usize,
    pub image: String,
    /// Base address of the differing block, as a hex literal.
    pub block: String,
}

/// Running maxima of diff counts over the monitored checkpoints of one
/// iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffTally {
    pub register_diffs: usize,
    pub memory_diffs: usize,
}

impl DiffTally {
    pub fn observe(&mut self, register_diffs: usize, memory_diffs: usize) {
        self.register_diffs = self.register_diffs.max(register_diffs);
        self.memory_diffs = self.memory_diffs.max(memory_diffs);
    }

    pub fn any(&self) -> bool {
        self.register_diffs > 0 || self.memory_diffs > 0
    }
}

const MISSING: &str = "<missing>";

fn render(value: Option<&Value>) -> String {
    value.map_or_else(|| MISSING.to_string(), Value::to_string)
}

/// Appends one [`RegisterDiff`] per differing leaf of `gold` vs `monitored`.
/// Shape mismatches are reported at the deepest common index.
pub fn diff_values(
    checkpoint: u32,
    config_object: &str,
    register: &str,
    gold: &Value,
    monitored: &Value,
    index: &mut Vec<usize>,
    out: &mut Vec<RegisterDiff>,
) {
    match (gold, monitored) {
        (Value::Scalar(g), Value::Scalar(m)) => {
            if g != m {
                out.push(RegisterDiff {
                    checkpoint,
                    config_object: config_object.to_string(),
                    register: register_path(register, Some(index.as_slice())),
                    gold_value: render(Some(gold)),
                    monitored_value: render(Some(monitored)),
                });
            }
        }
        (Value::Array(gs), Value::Array(ms)) => {
            for i in 0..gs.len().max(ms.len()) {
                index.push(i);
                match (gs.get(i), ms.get(i)) {
                    (Some(g), Some(m)) => {
                        diff_values(checkpoint, config_object, register, g, m, index, out)
                    }
                    (g, m) => out.push(RegisterDiff {
                        checkpoint,
                        config_object: config_object.to_string(),
                        register: register_path(register, Some(index.as_slice())),
                        gold_value: render(g),
                        monitored_value: render(m),
                    }),
                }
                index.pop();
            }
        }
        _ => out.push(RegisterDiff {
            checkpoint,
            config_object: config_object.to_string(),
            register: register_path(register, Some(index.as_slice())),
            gold_value: render(Some(gold)),
            monitored_value: render(Some(monitored)),
        }),
    }
}

pub struct CheckpointComparator<'a> {
    catalog: &'a Catalog,
    block_size: usize,
}

impl<'a> CheckpointComparator<'a> {
    pub fn new(catalog: &'a Catalog, block_size: usize) -> Self {
        Self {
            catalog,
            block_size: block_size.max(1),
        }
    }

    /// Compares every register of every catalog instance.
    pub fn compare_registers<A: AttributeAccess + ?Sized>(
        &self,
        access: &A,
        checkpoint: u32,
        gold: &Path,
        monitored: &Path,
    ) -> Result<Vec<RegisterDiff>, CheckpointError> {
        let gold_store = access.read_checkpoint(gold)?;
        let monitored_store = access.read_checkpoint(monitored)?;
        self.compare_stores(access, checkpoint, &gold_store, &monitored_store)
    }

    pub fn compare_stores<A: AttributeAccess + ?Sized>(
        &self,
        access: &A,
        checkpoint: u32,
        gold: &AttributeStore,
        monitored: &AttributeStore,
    ) -> Result<Vec<RegisterDiff>, CheckpointError> {
        let mut diffs = Vec::new();
        for (target, object) in self.catalog.instances() {
            for register in &target.registers {
                let gold_value = access.get_attr(gold, &object, &register.name)?;
                let monitored_value = access.get_attr(monitored, &object, &register.name)?;
                diff_values(
                    checkpoint,
                    &object,
                    &register.name,
                    gold_value,
                    monitored_value,
                    &mut Vec::new(),
                    &mut diffs,
                );
            }
        }
        debug!("Checkpoint {checkpoint}: {} register diffs", diffs.len());
        Ok(diffs)
    }

    /// Compares every memory image of the gold checkpoint block by block.
    /// Bytes past the end of the shorter image compare as zero.
    pub fn compare_memory(
        &self,
        checkpoint: u32,
        gold: &Path,
        monitored: &Path,
        extract_blocks: bool,
    ) -> Result<Vec<MemoryDiff>, CheckpointError> {
        let mut diffs = Vec::new();
        for (image_index, image) in checkpoint::memory_images(gold)?.into_iter().enumerate() {
            let gold_bytes = checkpoint::read_memory_image(gold, &image)?;
            let monitored_bytes = checkpoint::read_memory_image(monitored, &image)?;
            let length = gold_bytes.len().max(monitored_bytes.len());

            let mut start = 0;
            while start < length {
                let end = (start + self.block_size).min(length);
                let gold_block = padded_block(&gold_bytes, start, end);
                let monitored_block = padded_block(&monitored_bytes, start, end);
                if gold_block != monitored_block {
                    let block = format_hex(start as u64);
                    if extract_blocks {
                        let blocks_dir = monitored.join(MEMORY_BLOCKS_DIR);
                        fs::create_dir_all(&blocks_dir)?;
                        let stem = image.trim_end_matches(".img");
                        fs::write(blocks_dir.join(format!("{stem}_{block}_gold.raw")), &gold_block)?;
                        fs::write(
                            blocks_dir.join(format!("{stem}_{block}_monitored.raw")),
                            &monitored_block,
                        )?;
                    }
                    diffs.push(MemoryDiff {
                        checkpoint,
                        image_index,
                        image: image.clone(),
                        block,
                    });
                }
                start = end;
            }
        }
        debug!("Checkpoint {checkpoint}: {} memory diffs", diffs.len());
        Ok(diffs)
    }
}

fn padded_block(bytes: &[u8], start: usize, end: usize) -> Vec<u8> {
    let mut block = vec![0u8; end - start];
    if start < bytes.len() {
        let available = &bytes[start..end.min(bytes.len())];
        block[..available.len()].copy_from_slice(available);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogDefinition, CatalogFilter};
    use crate::checkpoint::NativeAttributes;
    use tempfile::tempdir;

    fn catalog() -> Catalog {
        let definition = CatalogDefinition::from_toml(
            r#"
architecture = "cmp"
object-prefix = "DUT"

[[targets]]
name = "CPU"
object = ".cpu"
count = 2
registers = [{ name = "pc" }, { name = "gprs", count = [3] }]
"#,
        )
        .unwrap();
        Catalog::build(&definition, &CatalogFilter::default()).unwrap()
    }

    fn store(pc1: u64, gpr: u64) -> AttributeStore {
        let mut store = AttributeStore::new();
        store.set("DUT.cpu[0]", "pc", Value::Scalar(0x100));
        store.set("DUT.cpu[1]", "pc", Value::Scalar(pc1));
        for cpu in ["DUT.cpu[0]", "DUT.cpu[1]"] {
            store.set(
                cpu,
                "gprs",
                Value::Array(vec![Value::Scalar(1), Value::Scalar(gpr), Value::Scalar(3)]),
            );
        }
        store
    }

    #[test]
    fn identical_checkpoints_have_no_diffs() {
        let catalog = catalog();
        let comparator = CheckpointComparator::new(&catalog, 16);
        let diffs = comparator
            .compare_stores(&NativeAttributes, 1, &store(0x200, 2), &store(0x200, 2))
            .unwrap();
        assert!(diffs.is_empty(), "Unexpected diffs: {diffs:?}");
    }

    #[test]
    fn register_diffs_name_object_and_element() {
        let catalog = catalog();
        let comparator = CheckpointComparator::new(&catalog, 16);
        let diffs = comparator
            .compare_stores(&NativeAttributes, 4, &store(0x200, 2), &store(0x201, 6))
            .unwrap();
        assert_eq!(diffs.len(), 3);
        assert_eq!(
            diffs[0],
            RegisterDiff {
                checkpoint: 4,
                config_object: "DUT.cpu[0]".to_string(),
                register: "gprs:1".to_string(),
                gold_value: "0x2".to_string(),
                monitored_value: "0x6".to_string(),
            }
        );
        let registers: Vec<(&str, &str)> = diffs
            .iter()
            .map(|d| (d.config_object.as_str(), d.register.as_str()))
            .collect();
        assert_eq!(
            registers,
            vec![("DUT.cpu[0]", "gprs:1"), ("DUT.cpu[1]", "pc"), ("DUT.cpu[1]", "gprs:1")]
        );
    }

    #[test]
    fn shape_mismatch_reports_missing_elements() {
        let mut out = Vec::new();
        let gold = Value::Array(vec![Value::Scalar(1), Value::Scalar(2)]);
        let monitored = Value::Array(vec![Value::Scalar(1)]);
        diff_values(1, "obj", "r", &gold, &monitored, &mut Vec::new(), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].register, "r:1");
        assert_eq!(out[0].monitored_value, "<missing>");
    }

    #[test]
    fn missing_register_in_monitored_checkpoint_is_an_error() {
        let catalog = catalog();
        let comparator = CheckpointComparator::new(&catalog, 16);
        let mut monitored = store(0x200, 2);
        monitored.remove_object("DUT.cpu[1]");
        assert!(matches!(
            comparator.compare_stores(&NativeAttributes, 1, &store(0x200, 2), &monitored),
            Err(CheckpointError::MissingObject(_))
        ));
    }

    #[test]
    fn memory_diffs_report_and_extract_changed_blocks() {
        let catalog = catalog();
        let comparator = CheckpointComparator::new(&catalog, 16);
        let dir = tempdir().unwrap();
        let gold = dir.path().join("gold");
        let monitored = dir.path().join("monitored");

        let gold_ram = vec![0u8; 64];
        let mut monitored_ram = gold_ram.clone();
        monitored_ram[17] = 0xFF;
        monitored_ram[63] = 0x01;
        checkpoint::write_memory_image(&gold, "ram.img", &gold_ram).unwrap();
        checkpoint::write_memory_image(&monitored, "ram.img", &monitored_ram).unwrap();
        checkpoint::write_memory_image(&gold, "rom.img", &[7; 8]).unwrap();
        checkpoint::write_memory_image(&monitored, "rom.img", &[7; 8]).unwrap();

        let diffs = comparator.compare_memory(2, &gold, &monitored, true).unwrap();
        let blocks: Vec<&str> = diffs.iter().map(|d| d.block.as_str()).collect();
        assert_eq!(blocks, vec!["0x10", "0x30"]);
        assert!(diffs.iter().all(|d| d.image_index == 0 && d.image == "ram.img"));

        let extracted = monitored.join(MEMORY_BLOCKS_DIR);
        let gold_block = fs::read(extracted.join("ram_0x10_gold.raw")).unwrap();
        let monitored_block = fs::read(extracted.join("ram_0x10_monitored.raw")).unwrap();
        assert_eq!(gold_block, vec![0u8; 16]);
        assert_eq!(monitored_block[1], 0xFF);
    }

    #[test]
    fn memory_length_difference_counts_as_changed_block() {
        let catalog = catalog();
        let comparator = CheckpointComparator::new(&catalog, 4);
        let dir = tempdir().unwrap();
        let gold = dir.path().join("gold");
        let monitored = dir.path().join("monitored");
        checkpoint::write_memory_image(&gold, "ram.img", &[1, 1, 1, 1]).unwrap();
        checkpoint::write_memory_image(&monitored, "ram.img", &[1, 1, 1, 1, 0, 9]).unwrap();
        let diffs = comparator.compare_memory(1, &gold, &monitored, false).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].block, "0x4");
        assert!(!monitored.join(MEMORY_BLOCKS_DIR).exists());
    }

    #[test]
    fn diff_tally_keeps_running_maxima() {
        let mut tally = DiffTally::default();
        assert!(!tally.any());
        tally.observe(3, 0);
        tally.observe(1, 2);
        assert_eq!(tally, DiffTally { register_diffs: 3, memory_diffs: 2 });
        assert!(tally.any());
    }
}
