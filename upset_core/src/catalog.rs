//! The target catalog: every injectable object and register of an
//! architecture, with the bit weights used to choose injection sites.
//!
//! Catalogs are declared in TOML ([`CatalogDefinition`]) and validated into a
//! [`Catalog`] once per campaign. Built-in definitions for the supported
//! architectures ship with the crate; a campaign may also point at its own
//! definition file.

use crate::campaign::Mode;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

const BUILTIN_P2020: &str = include_str!("../catalogs/p2020.toml");
const BUILTIN_A9: &str = include_str!("../catalogs/a9.toml");

/// Register width assumed when a definition omits `bits`.
pub const DEFAULT_REGISTER_BITS: u32 = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The definition is internally inconsistent.
    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    /// No built-in catalog exists for the requested architecture.
    #[error("Unknown architecture {0:?}")]
    UnknownArchitecture(String),

    /// A selected target does not exist in the catalog.
    #[error("Invalid injection target {0:?}")]
    UnknownTarget(String),

    /// A selected register does not exist in any remaining target.
    #[error("Invalid injection register {0:?}")]
    UnknownRegister(String),

    #[error("Catalog I/O error: {0}")]
    Io(String),

    #[error("Catalog parse error: {0}")]
    Parse(String),
}

impl From<toml::de::Error> for CatalogError {
    fn from(err: toml::de::Error) -> Self {
        CatalogError::Parse(err.to_string())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CatalogDefinition {
    pub architecture: String,
    /// Prepended to each target's object path to form a configuration
    /// object name, e.g. `DUT_p2020rdb` + `.soc.cpu` + `[0]`.
    #[serde(default)]
    pub object_prefix: String,
    pub targets: Vec<TargetDefinition>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetDefinition {
    pub name: String,
    pub object: String,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub is_cache: bool,
    /// Modes this target is injectable in. Empty means every mode.
    #[serde(default)]
    pub modes: Vec<Mode>,
    pub registers: Vec<RegisterDefinition>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RegisterDefinition {
    pub name: String,
    #[serde(default)]
    pub bits: Option<u32>,
    #[serde(default)]
    pub count: Option<Vec<usize>>,
    #[serde(default)]
    pub is_tlb: bool,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub actual_bits: Option<u32>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FieldDefinition {
    pub name: String,
    /// Inclusive `[low, high]` bit range. For split TLB fields this is the
    /// low half.
    pub range: [u32; 2],
    /// TLB entry word holding this field.
    #[serde(default)]
    pub index: Option<usize>,
    /// Upper half of a TLB field that is split across two entry words.
    #[serde(default)]
    pub high: Option<FieldHalfDefinition>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FieldHalfDefinition {
    pub range: [u32; 2],
    pub index: usize,
}

impl CatalogDefinition {
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::Io(format!("Failed to read catalog at {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Built-in definition for `architecture`.
    pub fn builtin(architecture: &str) -> Result<Self, CatalogError> {
        match architecture {
            "p2020" => Self::from_toml(BUILTIN_P2020),
            "a9" => Self::from_toml(BUILTIN_A9),
            other => Err(CatalogError::UnknownArchitecture(other.to_string())),
        }
    }
}

/// Narrows a definition down to what a campaign may inject.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub mode: Option<Mode>,
    pub selected_targets: Option<Vec<String>>,
    pub selected_registers: Option<Vec<String>>,
    pub include_caches: bool,
}

/// An inclusive bit range inside one TLB entry word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHalf {
    pub index: Option<usize>,
    pub low: u32,
    pub high: u32,
}

impl FieldHalf {
    pub fn bits(&self) -> u32 {
        self.high - self.low + 1
    }

    pub fn contains(&self, bit: u32) -> bool {
        (self.low..=self.high).contains(&bit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub low: FieldHalf,
    pub high: Option<FieldHalf>,
}

impl Field {
    pub fn bits(&self) -> u32 {
        self.low.bits() + self.high.map_or(0, |h| h.bits())
    }

    pub fn is_split(&self) -> bool {
        self.high.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub bits: u32,
    pub count: Option<Vec<usize>>,
    pub is_tlb: bool,
    pub partial: bool,
    pub actual_bits: Option<u32>,
    pub fields: Vec<Field>,
    /// Maps a uniformly drawn bit onto the implemented bit positions of a
    /// partially implemented register.
    pub adjust_bit: Option<Vec<u32>>,
    pub total_bits: u64,
}

impl Register {
    /// Width used when flipping a bit of this register.
    pub fn flip_width(&self) -> u32 {
        if let Some(actual) = self.actual_bits {
            return actual;
        }
        match self.adjust_bit.as_ref().and_then(|a| a.last()) {
            Some(top) => (top + 1).max(self.bits),
            None => self.bits,
        }
    }

    /// The field containing `bit`, if any.
    pub fn field_for_bit(&self, bit: u32) -> Option<&Field> {
        self.fields.iter().find(|f| f.low.contains(bit))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub object: String,
    pub count: Option<u32>,
    pub is_cache: bool,
    pub registers: Vec<Register>,
    pub total_bits: u64,
}

impl Target {
    pub fn register(&self, name: &str) -> Option<&Register> {
        self.registers.iter().find(|r| r.name == name)
    }
}

/// A validated, filtered catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub architecture: String,
    pub object_prefix: String,
    pub targets: Vec<Target>,
}

impl Catalog {
    pub fn build(definition: &CatalogDefinition, filter: &CatalogFilter) -> Result<Self, CatalogError> {
        if let Some(selected) = &filter.selected_targets {
            for name in selected {
                if !definition.targets.iter().any(|t| &t.name == name) {
                    return Err(CatalogError::UnknownTarget(name.clone()));
                }
            }
        }

        let mut targets = Vec::new();
        for target_def in &definition.targets {
            if target_def.is_cache && !filter.include_caches {
                continue;
            }
            if let Some(mode) = filter.mode {
                if !target_def.modes.is_empty() && !target_def.modes.contains(&mode) {
                    continue;
                }
            }
            if let Some(selected) = &filter.selected_targets {
                if !selected.contains(&target_def.name) {
                    continue;
                }
            }

            let mut registers = Vec::new();
            for register_def in &target_def.registers {
                if let Some(selected) = &filter.selected_registers {
                    if !selected.contains(&register_def.name) {
                        continue;
                    }
                }
                registers.push(build_register(&target_def.name, register_def)?);
            }
            if registers.is_empty() {
                continue;
            }

            let total_bits = registers.iter().map(|r| r.total_bits).sum();
            targets.push(Target {
                name: target_def.name.clone(),
                object: target_def.object.clone(),
                count: target_def.count,
                is_cache: target_def.is_cache,
                registers,
                total_bits,
            });
        }

        if let Some(selected) = &filter.selected_registers {
            for name in selected {
                if !targets.iter().any(|t| t.register(name).is_some()) {
                    return Err(CatalogError::UnknownRegister(name.clone()));
                }
            }
        }
        if targets.is_empty() {
            return Err(CatalogError::InvalidCatalog(format!(
                "no injectable targets remain for architecture {}",
                definition.architecture
            )));
        }

        Ok(Catalog {
            architecture: definition.architecture.clone(),
            object_prefix: definition.object_prefix.clone(),
            targets,
        })
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Configuration object name for an instance of `target`.
    pub fn config_object(&self, target: &Target, index: Option<u32>) -> String {
        match index {
            Some(i) => format!("{}{}[{}]", self.object_prefix, target.object, i),
            None => format!("{}{}", self.object_prefix, target.object),
        }
    }

    /// Every configuration object with its target, expanding target counts.
    pub fn instances(&self) -> Vec<(&Target, String)> {
        let mut instances = Vec::new();
        for target in &self.targets {
            match target.count {
                Some(count) => {
                    for i in 0..count {
                        instances.push((target, self.config_object(target, Some(i))));
                    }
                }
                None => instances.push((target, self.config_object(target, None))),
            }
        }
        instances
    }

    pub fn total_bits(&self) -> u64 {
        self.targets.iter().map(|t| t.total_bits).sum()
    }
}

fn build_register(target: &str, def: &RegisterDefinition) -> Result<Register, CatalogError> {
    let invalid = |msg: String| {
        CatalogError::InvalidCatalog(format!("{msg} for register {} in target {}", def.name, target))
    };

    let bits = def.bits.unwrap_or(DEFAULT_REGISTER_BITS);
    if bits == 0 {
        return Err(invalid("zero width".to_string()));
    }

    let mut fields = Vec::with_capacity(def.fields.len());
    for field_def in &def.fields {
        let [low, high] = field_def.range;
        if low > high {
            return Err(invalid(format!("inverted range in field {}", field_def.name)));
        }
        let high_half = match &field_def.high {
            Some(h) if h.range[0] > h.range[1] => {
                return Err(invalid(format!("inverted range in field {}", field_def.name)));
            }
            Some(h) => Some(FieldHalf {
                index: Some(h.index),
                low: h.range[0],
                high: h.range[1],
            }),
            None => None,
        };
        fields.push(Field {
            name: field_def.name.clone(),
            low: FieldHalf {
                index: field_def.index,
                low,
                high,
            },
            high: high_half,
        });
    }

    // A TLB register's `bits` is the width of one entry word. Only the
    // declared fields are injectable, so an entry weighs the sum of its field
    // widths rather than `bits` times the number of entry words; the two
    // agree when the fields cover every word.
    let dimensions: &[usize] = def.count.as_deref().unwrap_or(&[]);
    let total_bits = if def.is_tlb {
        let Some((_, entry_dims)) = dimensions.split_last() else {
            return Err(invalid("TLB without a count".to_string()));
        };
        if fields.is_empty() || fields.iter().any(|f| f.low.index.is_none()) {
            return Err(invalid("TLB fields without entry word indices".to_string()));
        }
        let entries: u64 = entry_dims.iter().map(|d| *d as u64).product();
        let entry_bits: u64 = fields.iter().map(|f| u64::from(f.bits())).sum();
        entries * entry_bits
    } else {
        let count: u64 = dimensions.iter().map(|d| *d as u64).product();
        count * u64::from(bits)
    };

    let adjust_bit = if def.partial {
        let mut adjust: Vec<u32> = fields
            .iter()
            .flat_map(|f| f.low.low..=f.low.high)
            .collect();
        adjust.sort_unstable();
        if adjust.len() != bits as usize {
            return Err(invalid(format!(
                "bits mismatch ({} implemented, {} declared)",
                adjust.len(),
                bits
            )));
        }
        Some(adjust)
    } else {
        None
    };

    let register = Register {
        name: def.name.clone(),
        bits,
        count: def.count.clone(),
        is_tlb: def.is_tlb,
        partial: def.partial,
        actual_bits: def.actual_bits,
        fields,
        adjust_bit,
        total_bits,
    };
    if register.flip_width() > crate::value::MAX_REGISTER_BITS {
        return Err(invalid("register wider than 64 bits".to_string()));
    }
    Ok(register)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"
architecture = "sample"
object-prefix = "DUT_board"

[[targets]]
name = "CPU"
object = ".cpu"
count = 2

[[targets.registers]]
name = "pc"

[[targets.registers]]
name = "gprs"
bits = 64
count = [4]

[[targets.registers]]
name = "msr"
bits = 6
partial = true
fields = [
    { name = "ee", range = [15, 15] },
    { name = "pr", range = [0, 4] },
]

[[targets]]
name = "TLB"
object = ".mmu"
modes = ["simulated"]

[[targets.registers]]
name = "tlb1"
count = [16, 4]
is-tlb = true
fields = [
    { name = "v", range = [31, 31], index = 0 },
    { name = "epn", range = [12, 31], index = 2 },
    { name = "rpn", range = [12, 31], index = 3, high = { range = [0, 3], index = 1 } },
]

[[targets]]
name = "L2"
object = ".l2"
is-cache = true

[[targets.registers]]
name = "data"
count = [8]
"#;

    fn sample() -> CatalogDefinition {
        CatalogDefinition::from_toml(SAMPLE).unwrap()
    }

    #[test]
    fn build_computes_total_bits() {
        let catalog = Catalog::build(&sample(), &CatalogFilter::default()).unwrap();
        let cpu = catalog.target("CPU").unwrap();
        assert_eq!(cpu.register("pc").unwrap().total_bits, 32, "Default width is 32 bits");
        assert_eq!(cpu.register("gprs").unwrap().total_bits, 4 * 64);
        assert_eq!(cpu.register("msr").unwrap().total_bits, 6);
        assert_eq!(cpu.total_bits, 32 + 256 + 6);

        let tlb = catalog.target("TLB").unwrap().register("tlb1").unwrap();
        assert_eq!(
            tlb.total_bits,
            16 * (1 + 20 + 24),
            "TLB weight excludes the entry word dimension"
        );
        assert!(catalog.target("L2").is_none(), "Caches are excluded by default");
    }

    #[test]
    fn partial_register_gets_sorted_adjust_map() {
        let catalog = Catalog::build(&sample(), &CatalogFilter::default()).unwrap();
        let msr = catalog.target("CPU").unwrap().register("msr").unwrap();
        assert_eq!(msr.adjust_bit.as_deref(), Some(&[0, 1, 2, 3, 4, 15][..]));
        assert_eq!(msr.flip_width(), 16);
    }

    #[test]
    fn partial_register_bits_mismatch_is_invalid() {
        let mut definition = sample();
        definition.targets[0].registers[2].bits = Some(7);
        match Catalog::build(&definition, &CatalogFilter::default()) {
            Err(CatalogError::InvalidCatalog(msg)) => {
                assert!(msg.contains("msr"), "Message should name the register: {msg}");
            }
            other => panic!("Expected InvalidCatalog, got {other:?}"),
        }
    }

    #[test]
    fn filter_applies_mode_selection_and_caches() {
        let hardware = CatalogFilter {
            mode: Some(Mode::Hardware),
            include_caches: true,
            ..Default::default()
        };
        let catalog = Catalog::build(&sample(), &hardware).unwrap();
        assert!(catalog.target("TLB").is_none());
        assert!(catalog.target("L2").is_some());

        let only_pc = CatalogFilter {
            selected_registers: Some(vec!["pc".to_string()]),
            ..Default::default()
        };
        let catalog = Catalog::build(&sample(), &only_pc).unwrap();
        assert_eq!(catalog.targets.len(), 1);
        assert_eq!(catalog.targets[0].registers.len(), 1);

        let unknown = CatalogFilter {
            selected_targets: Some(vec!["GPU".to_string()]),
            ..Default::default()
        };
        assert_eq!(
            Catalog::build(&sample(), &unknown),
            Err(CatalogError::UnknownTarget("GPU".to_string()))
        );
    }

    #[test]
    fn instances_expand_target_counts() {
        let catalog = Catalog::build(&sample(), &CatalogFilter::default()).unwrap();
        let objects: Vec<String> = catalog.instances().into_iter().map(|(_, o)| o).collect();
        assert_eq!(objects, vec!["DUT_board.cpu[0]", "DUT_board.cpu[1]", "DUT_board.mmu"]);
    }

    #[test]
    fn builtin_catalogs_validate() {
        for architecture in ["p2020", "a9"] {
            let definition = CatalogDefinition::builtin(architecture).unwrap();
            for mode in [Mode::Simulated, Mode::Hardware] {
                let filter = CatalogFilter {
                    mode: Some(mode),
                    include_caches: true,
                    ..Default::default()
                };
                let catalog = Catalog::build(&definition, &filter)
                    .unwrap_or_else(|e| panic!("{architecture} {mode:?}: {e}"));
                assert!(catalog.total_bits() > 0);
            }
        }
        assert!(matches!(
            CatalogDefinition::builtin("m68k"),
            Err(CatalogError::UnknownArchitecture(_))
        ));
    }

    fn register(bits: Option<u32>) -> RegisterDefinition {
        RegisterDefinition {
            name: String::new(),
            bits,
            count: None,
            is_tlb: false,
            partial: false,
            actual_bits: None,
            fields: Vec::new(),
        }
    }

    fn plain_register() -> impl Strategy<Value = (RegisterDefinition, u64)> {
        (1u32..=64, prop::collection::vec(1usize..=8, 0..=2)).prop_map(|(bits, dims)| {
            let weight = dims.iter().product::<usize>() as u64 * u64::from(bits);
            let mut def = register(Some(bits));
            def.count = (!dims.is_empty()).then_some(dims);
            (def, weight)
        })
    }

    fn partial_register() -> impl Strategy<Value = (RegisterDefinition, u64)> {
        prop::collection::btree_set(0u32..64, 1..=16).prop_map(|implemented| {
            let mut def = register(Some(implemented.len() as u32));
            def.partial = true;
            def.fields = implemented
                .iter()
                .map(|&bit| FieldDefinition {
                    name: format!("f{bit}"),
                    range: [bit, bit],
                    index: None,
                    high: None,
                })
                .collect();
            (def, implemented.len() as u64)
        })
    }

    fn tlb_register() -> impl Strategy<Value = (RegisterDefinition, u64)> {
        (1usize..=16, 1usize..=4)
            .prop_flat_map(|(entries, words)| {
                let field = (
                    0..words,
                    0u32..32,
                    1u32..=8,
                    prop::option::of((0..words, 0u32..24, 1u32..=8)),
                );
                (Just(entries), Just(words), prop::collection::vec(field, 1..=6))
            })
            .prop_map(|(entries, words, specs)| {
                let mut def = register(None);
                def.is_tlb = true;
                def.count = Some(vec![entries, words]);
                let mut entry_bits = 0u64;
                for (i, (index, low, width, high)) in specs.into_iter().enumerate() {
                    let top = (low + width - 1).min(31);
                    entry_bits += u64::from(top - low + 1);
                    let high = high.map(|(index, low, width)| FieldHalfDefinition {
                        range: [low, low + width - 1],
                        index,
                    });
                    entry_bits += high.as_ref().map_or(0, |h| u64::from(h.range[1] - h.range[0] + 1));
                    def.fields.push(FieldDefinition {
                        name: format!("f{i}"),
                        range: [low, top],
                        index: Some(index),
                        high,
                    });
                }
                (def, entries as u64 * entry_bits)
            })
    }

    proptest! {
        #[test]
        fn total_bits_add_up_across_registers(
            registers in prop::collection::vec(
                prop_oneof![plain_register(), partial_register(), tlb_register()],
                1..=6,
            )
        ) {
            let definition = CatalogDefinition {
                architecture: "generated".to_string(),
                object_prefix: "DUT".to_string(),
                targets: vec![TargetDefinition {
                    name: "T".to_string(),
                    object: ".t".to_string(),
                    count: None,
                    is_cache: false,
                    modes: Vec::new(),
                    registers: registers
                        .iter()
                        .enumerate()
                        .map(|(i, (def, _))| RegisterDefinition { name: format!("r{i}"), ..def.clone() })
                        .collect(),
                }],
            };
            let catalog = Catalog::build(&definition, &CatalogFilter::default()).unwrap();
            let target = &catalog.targets[0];
            for (built, (def, weight)) in target.registers.iter().zip(&registers) {
                prop_assert_eq!(built.total_bits, *weight);
                if def.partial {
                    let adjust = built.adjust_bit.as_ref().unwrap();
                    prop_assert_eq!(adjust.len(), built.bits as usize);
                    prop_assert!(adjust.windows(2).all(|w| w[0] < w[1]));
                }
            }
            prop_assert_eq!(target.total_bits, target.registers.iter().map(|r| r.total_bits).sum::<u64>());
            prop_assert_eq!(catalog.total_bits(), registers.iter().map(|(_, w)| *w).sum::<u64>());
        }
    }
}
