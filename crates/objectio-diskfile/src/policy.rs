//! Storage policies
//!
//! A policy names a set of objects sharing one on-disk layout. The policy
//! index selects the directory names under each device (`objects`,
//! `objects-1`, ...) and the policy type selects the fileset layout rules.

use crate::fileset::{ErasureCodedLayout, FilesetLayout, ReplicatedLayout};
use objectio_common::{Error, PolicyConfig, PolicyType, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Name of the implicit policy at index 0
pub const LEGACY_POLICY_NAME: &str = "Policy-0";

const DATA_DIR_BASE: &str = "objects";
const TMP_DIR_BASE: &str = "tmp";
const ASYNC_DIR_BASE: &str = "async_pending";

/// Layout rules for each policy type
static REPLICATED: ReplicatedLayout = ReplicatedLayout;
static ERASURE_CODED: ErasureCodedLayout = ErasureCodedLayout;

/// Fileset layout for a policy type
#[must_use]
pub fn layout_for(policy_type: PolicyType) -> &'static dyn FilesetLayout {
    match policy_type {
        PolicyType::Replication => &REPLICATED,
        PolicyType::ErasureCoding => &ERASURE_CODED,
    }
}

fn policy_dir(base: &str, index: u32) -> String {
    if index == 0 {
        base.to_string()
    } else {
        format!("{base}-{index}")
    }
}

/// Parse a data directory name back into a policy index
#[must_use]
pub fn index_from_data_dir(dir: &str) -> Option<u32> {
    match dir.strip_prefix(DATA_DIR_BASE)? {
        "" => Some(0),
        rest => rest.strip_prefix('-')?.parse().ok(),
    }
}

fn validate_name(name: &str, index: u32) -> Result<()> {
    if name.is_empty() {
        return Err(Error::policy(format!("invalid name '' for policy {index}")));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::policy(format!(
            "names are made of letters, digits and '-': '{name}' for policy {index}"
        )));
    }
    if index != 0 && name.eq_ignore_ascii_case(LEGACY_POLICY_NAME) {
        return Err(Error::policy(format!(
            "name '{name}' is reserved for policy index 0"
        )));
    }
    Ok(())
}

/// One storage policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoragePolicy {
    index: u32,
    /// Primary name first, then aliases
    names: Vec<String>,
    policy_type: PolicyType,
    is_default: bool,
    is_deprecated: bool,
    ec_num_data_fragments: u32,
    ec_num_parity_fragments: u32,
}

impl StoragePolicy {
    /// Build and validate a policy from its configuration
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        let index = config.index;
        validate_name(&config.name, index)?;

        let mut names = vec![config.name.clone()];
        for alias in &config.aliases {
            if alias == &config.name {
                continue;
            }
            validate_name(alias, index)?;
            if names.iter().any(|n| n.eq_ignore_ascii_case(alias)) {
                return Err(Error::policy(format!(
                    "duplicate name '{alias}' in policy {index}"
                )));
            }
            names.push(alias.clone());
        }

        if config.deprecated && config.default {
            return Err(Error::policy(format!(
                "deprecated policy {index} can not be default"
            )));
        }

        if config.policy_type == PolicyType::ErasureCoding
            && (config.ec_num_data_fragments == 0 || config.ec_num_parity_fragments == 0)
        {
            return Err(Error::policy(format!(
                "erasure-coded policy {index} needs data and parity fragment counts"
            )));
        }

        Ok(Self {
            index,
            names,
            policy_type: config.policy_type,
            is_default: config.default,
            is_deprecated: config.deprecated,
            ec_num_data_fragments: config.ec_num_data_fragments,
            ec_num_parity_fragments: config.ec_num_parity_fragments,
        })
    }

    /// The implicit replicated policy at index 0
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            index: 0,
            names: vec![LEGACY_POLICY_NAME.to_string()],
            policy_type: PolicyType::Replication,
            is_default: false,
            is_deprecated: false,
            ec_num_data_fragments: 0,
            ec_num_parity_fragments: 0,
        }
    }

    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Primary name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.names[0]
    }

    /// Primary name followed by aliases
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub const fn policy_type(&self) -> PolicyType {
        self.policy_type
    }

    #[must_use]
    pub const fn is_default(&self) -> bool {
        self.is_default
    }

    #[must_use]
    pub const fn is_deprecated(&self) -> bool {
        self.is_deprecated
    }

    /// Total fragments per object for erasure-coded policies
    #[must_use]
    pub const fn ec_fragment_count(&self) -> u32 {
        self.ec_num_data_fragments + self.ec_num_parity_fragments
    }

    /// Object data directory under each device
    #[must_use]
    pub fn data_dir(&self) -> String {
        policy_dir(DATA_DIR_BASE, self.index)
    }

    /// Staging directory under each device
    #[must_use]
    pub fn tmp_dir(&self) -> String {
        policy_dir(TMP_DIR_BASE, self.index)
    }

    /// Pending container update directory under each device
    #[must_use]
    pub fn async_dir(&self) -> String {
        policy_dir(ASYNC_DIR_BASE, self.index)
    }

    /// Fileset layout rules for this policy
    #[must_use]
    pub fn layout(&self) -> &'static dyn FilesetLayout {
        layout_for(self.policy_type)
    }
}

impl fmt::Display for StoragePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoragePolicy({}, {:?}, is_default={}, is_deprecated={}, policy_type={:?})",
            self.index, self.names, self.is_default, self.is_deprecated, self.policy_type
        )
    }
}

/// Validated set of storage policies
#[derive(Debug, Clone)]
pub struct StoragePolicyCollection {
    by_index: BTreeMap<u32, Arc<StoragePolicy>>,
    /// Uppercased name or alias to index
    by_name: HashMap<String, u32>,
    default: u32,
}

impl StoragePolicyCollection {
    /// Validate policy configurations into a collection.
    ///
    /// With no policies the collection holds a single default `Policy-0`.
    /// Otherwise index 0 must be configured, indexes and names (ignoring
    /// case) must be unique, exactly one policy may be default, and at
    /// least one policy must not be deprecated. A lone policy becomes the
    /// default implicitly.
    pub fn new(configs: &[PolicyConfig]) -> Result<Self> {
        let mut by_index: BTreeMap<u32, StoragePolicy> = BTreeMap::new();
        let mut by_name = HashMap::new();
        let mut default = None;

        for config in configs {
            let policy = StoragePolicy::new(config)?;
            if let Some(existing) = by_index.get(&policy.index) {
                return Err(Error::policy(format!(
                    "duplicate index {policy} conflicts with {existing}"
                )));
            }
            for name in &policy.names {
                if let Some(other) = by_name.insert(name.to_uppercase(), policy.index) {
                    return Err(Error::policy(format!(
                        "duplicate name '{name}' in policy {} conflicts with policy {other}",
                        policy.index
                    )));
                }
            }
            if policy.is_default {
                if let Some(other) = default {
                    return Err(Error::policy(format!(
                        "duplicate default policy {} conflicts with policy {other}",
                        policy.index
                    )));
                }
                default = Some(policy.index);
            }
            by_index.insert(policy.index, policy);
        }

        if !by_index.contains_key(&0) {
            if !by_index.is_empty() {
                return Err(Error::policy(
                    "policy index 0 must be configured to define multiple policies",
                ));
            }
            by_name.insert(LEGACY_POLICY_NAME.to_uppercase(), 0);
            by_index.insert(0, StoragePolicy::legacy());
        }

        if by_index.values().all(|p| p.is_deprecated) {
            return Err(Error::policy("unable to find a policy that is not deprecated"));
        }

        let default = match default {
            Some(index) => index,
            None if by_index.len() > 1 => {
                return Err(Error::policy("unable to find default policy"));
            }
            None => {
                let (&index, policy) = by_index
                    .iter_mut()
                    .next()
                    .ok_or_else(|| Error::internal("empty policy collection"))?;
                policy.is_default = true;
                index
            }
        };

        Ok(Self {
            by_index: by_index
                .into_iter()
                .map(|(index, policy)| (index, Arc::new(policy)))
                .collect(),
            by_name,
            default,
        })
    }

    /// Policy by index
    #[must_use]
    pub fn get_by_index(&self, index: u32) -> Option<Arc<StoragePolicy>> {
        self.by_index.get(&index).cloned()
    }

    /// Policy by name or alias, ignoring case
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<StoragePolicy>> {
        self.by_name
            .get(&name.to_uppercase())
            .and_then(|index| self.get_by_index(*index))
    }

    /// Policy owning a data directory such as `objects-2`
    #[must_use]
    pub fn get_by_data_dir(&self, dir: &str) -> Option<Arc<StoragePolicy>> {
        index_from_data_dir(dir).and_then(|index| self.get_by_index(index))
    }

    /// The default policy
    pub fn default_policy(&self) -> Result<Arc<StoragePolicy>> {
        self.get_by_index(self.default)
            .ok_or_else(|| Error::internal("default policy missing from collection"))
    }

    /// All policies in index order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<StoragePolicy>> {
        self.by_index.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

impl Default for StoragePolicyCollection {
    fn default() -> Self {
        let legacy = StoragePolicy {
            is_default: true,
            ..StoragePolicy::legacy()
        };
        Self {
            by_index: BTreeMap::from([(0, Arc::new(legacy))]),
            by_name: HashMap::from([(LEGACY_POLICY_NAME.to_uppercase(), 0)]),
            default: 0,
        }
    }
}
