//! Namespaced Version Identifiers
//!
//! ```text
//! {namespace}.{Name}@{version}
//! ```
//!
//! For contract events and calls the namespace is the contract group
//! (e.g. `uniswap.v3.Pool`) and the version is the ABI item signature.

/// Parts of a namespaced version identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacedVersion {
    pub nsp: String,
    pub name: String,
    pub version: String,
}

impl NamespacedVersion {
    /// `nsp.Name` without the version suffix
    pub fn namespaced_name(&self) -> String {
        if self.nsp.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.nsp, self.name)
        }
    }
}

impl std::fmt::Display for NamespacedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.namespaced_name(), self.version)
    }
}

/// Build a namespaced version
///
/// Example: `uniswap.v3.Pool.Swap@0xc42079f9...`
pub fn namespaced_version(nsp: &str, name: &str, version: &str) -> String {
    NamespacedVersion {
        nsp: nsp.to_string(),
        name: name.to_string(),
        version: version.to_string(),
    }
    .to_string()
}

/// Namespaced version of an ABI item belonging to a contract group
pub fn contract_item_version(group: &str, item_name: &str, signature: &str) -> String {
    namespaced_version(group, item_name, signature)
}

/// Split a namespaced version back into its parts.
///
/// The version starts after the last `@`; the name is the last dotted
/// segment before it.
pub fn parse_namespaced_version(value: &str) -> Option<NamespacedVersion> {
    let (full_name, version) = value.rsplit_once('@')?;
    if full_name.is_empty() || version.is_empty() {
        return None;
    }
    let (nsp, name) = match full_name.rsplit_once('.') {
        Some((nsp, name)) => (nsp.to_string(), name.to_string()),
        None => (String::new(), full_name.to_string()),
    };
    if name.is_empty() {
        return None;
    }
    Some(NamespacedVersion {
        nsp,
        name,
        version: version.to_string(),
    })
}

/// Group name of a contract: `{namespace}.{contract_name}`
pub fn contract_group_name(namespace: &str, contract_name: &str) -> String {
    format!("{}.{}", namespace, contract_name)
}
