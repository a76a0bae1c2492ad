//! Typed relationships between protocol kinds, and the queries built on them.
//!
//! Validation is advisory: it reports what is missing or conflicting but never
//! stops a protocol from being registered. Cycles among `Required` edges are a
//! defect in the graph itself and are reported as errors.

use crate::protocol_type::ProtocolType;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    path::Path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    /// The protocol cannot operate without the other one.
    Required,
    /// The protocol works better alongside the other one.
    Optional,
    /// The other protocol is a better replacement for this one.
    Enhancement,
    /// The two protocols must not run together.
    Conflict,
}

impl Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A directed edge from `protocol` to `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDependency {
    pub protocol: ProtocolType,
    pub depends_on: ProtocolType,
    pub kind: DependencyKind,
    pub reason: String,
}

impl ProtocolDependency {
    pub fn new(
        protocol: ProtocolType,
        depends_on: ProtocolType,
        kind: DependencyKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            depends_on,
            kind,
            reason: reason.into(),
        }
    }

    pub fn required(protocol: ProtocolType, depends_on: ProtocolType, reason: impl Into<String>) -> Self {
        Self::new(protocol, depends_on, DependencyKind::Required, reason)
    }

    pub fn optional(protocol: ProtocolType, depends_on: ProtocolType, reason: impl Into<String>) -> Self {
        Self::new(protocol, depends_on, DependencyKind::Optional, reason)
    }

    pub fn enhancement(
        protocol: ProtocolType,
        depends_on: ProtocolType,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(protocol, depends_on, DependencyKind::Enhancement, reason)
    }

    pub fn conflict(protocol: ProtocolType, depends_on: ProtocolType, reason: impl Into<String>) -> Self {
        Self::new(protocol, depends_on, DependencyKind::Conflict, reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Circular dependency: {}", display_path(.path))]
    Circular { path: Vec<ProtocolType> },
    #[error("Failed to access the dependency file")]
    Io(#[from] std::io::Error),
    #[error("Malformed dependency file")]
    Json(#[from] serde_json::Error),
}

fn display_path(path: &[ProtocolType]) -> String {
    path.iter()
        .map(|protocol| protocol.name())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// The outcome of validating a set of active protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub missing_required: Vec<ProtocolType>,
    pub missing_optional: Vec<ProtocolType>,
    /// Active pairs joined by a `Conflict` edge, as `(protocol, conflicts_with)`.
    pub conflicts: Vec<(ProtocolType, ProtocolType)>,
}

impl ValidationResult {
    fn valid() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }

    fn missing_required(&mut self, dependency: &ProtocolDependency) {
        self.is_valid = false;
        self.errors.push(format!(
            "{} requires {}: {}",
            dependency.protocol, dependency.depends_on, dependency.reason
        ));
        if !self.missing_required.contains(&dependency.depends_on) {
            self.missing_required.push(dependency.depends_on);
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DependencyFile {
    dependencies: Vec<ProtocolDependency>,
}

/// The dependency graph between protocol kinds.
#[derive(Debug, Clone, Default)]
pub struct DependencyManager {
    edges: BTreeMap<ProtocolType, Vec<ProtocolDependency>>,
}

impl DependencyManager {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph seeded with the usual relationships between protocols.
    pub fn with_defaults() -> Self {
        use ProtocolType::*;
        let mut manager = Self::new();
        for dependency in [
            ProtocolDependency::required(Ospf, Arp, "OSPF needs ARP to resolve neighbor MAC addresses"),
            ProtocolDependency::required(Rip, Arp, "RIP needs ARP to resolve next-hop MAC addresses"),
            ProtocolDependency::required(Eigrp, Arp, "EIGRP needs ARP to resolve neighbor MAC addresses"),
            ProtocolDependency::optional(Ospf, Cdp, "CDP helps verify OSPF adjacencies"),
            ProtocolDependency::optional(Bgp, Ospf, "BGP next hops are usually resolved through an IGP"),
            ProtocolDependency::conflict(Hsrp, Vrrp, "HSRP and VRRP both claim the virtual gateway"),
            ProtocolDependency::conflict(Vrrp, Hsrp, "VRRP and HSRP both claim the virtual gateway"),
            ProtocolDependency::enhancement(Telnet, Ssh, "SSH is an encrypted replacement for Telnet"),
        ] {
            manager.register(dependency);
        }
        manager
    }

    /// Adds `dependency`, replacing an edge of the same kind between the same pair.
    pub fn register(&mut self, dependency: ProtocolDependency) {
        let edges = self.edges.entry(dependency.protocol).or_default();
        edges.retain(|existing| {
            !(existing.depends_on == dependency.depends_on && existing.kind == dependency.kind)
        });
        tracing::debug!(
            "Registered {} dependency {} -> {}",
            dependency.kind,
            dependency.protocol,
            dependency.depends_on
        );
        edges.push(dependency);
    }

    /// Removes every edge from `protocol` to `depends_on`. Returns whether
    /// anything was removed.
    pub fn remove_dependency(&mut self, protocol: ProtocolType, depends_on: ProtocolType) -> bool {
        let Some(edges) = self.edges.get_mut(&protocol) else {
            return false;
        };
        let before = edges.len();
        edges.retain(|existing| existing.depends_on != depends_on);
        let removed = edges.len() != before;
        if edges.is_empty() {
            self.edges.remove(&protocol);
        }
        removed
    }

    /// Every edge out of `protocol`.
    pub fn dependencies(&self, protocol: ProtocolType) -> &[ProtocolDependency] {
        self.edges.get(&protocol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every edge in the graph, grouped by dependent protocol.
    pub fn all(&self) -> impl Iterator<Item = &ProtocolDependency> {
        self.edges.values().flatten()
    }

    fn targets(&self, protocol: ProtocolType, kind: DependencyKind) -> Vec<ProtocolType> {
        self.dependencies(protocol)
            .iter()
            .filter(|dependency| dependency.kind == kind)
            .map(|dependency| dependency.depends_on)
            .collect()
    }

    pub fn required(&self, protocol: ProtocolType) -> Vec<ProtocolType> {
        self.targets(protocol, DependencyKind::Required)
    }

    pub fn optional(&self, protocol: ProtocolType) -> Vec<ProtocolType> {
        self.targets(protocol, DependencyKind::Optional)
    }

    pub fn enhancements(&self, protocol: ProtocolType) -> Vec<ProtocolType> {
        self.targets(protocol, DependencyKind::Enhancement)
    }

    pub fn conflicting(&self, protocol: ProtocolType) -> Vec<ProtocolType> {
        self.targets(protocol, DependencyKind::Conflict)
    }

    /// Whether `a` and `b` are joined by a `Conflict` edge in either direction.
    fn in_conflict(&self, a: ProtocolType, b: ProtocolType) -> bool {
        self.conflicting(a).contains(&b) || self.conflicting(b).contains(&a)
    }

    pub fn validate(&self, active: &BTreeSet<ProtocolType>) -> ValidationResult {
        let mut result = ValidationResult::valid();
        for &protocol in active {
            for dependency in self.dependencies(protocol) {
                let present = active.contains(&dependency.depends_on);
                match dependency.kind {
                    DependencyKind::Required if !present => result.missing_required(dependency),
                    DependencyKind::Optional | DependencyKind::Enhancement if !present => {
                        result.warnings.push(format!(
                            "{} would benefit from {}: {}",
                            protocol, dependency.depends_on, dependency.reason
                        ));
                        if !result.missing_optional.contains(&dependency.depends_on) {
                            result.missing_optional.push(dependency.depends_on);
                        }
                    }
                    DependencyKind::Conflict if present => {
                        result.is_valid = false;
                        result.errors.push(format!(
                            "{} conflicts with {}: {}",
                            protocol, dependency.depends_on, dependency.reason
                        ));
                        result.conflicts.push((protocol, dependency.depends_on));
                    }
                    _ => {}
                }
            }
        }
        result
    }

    /// Validates `active` with `candidate` added.
    pub fn validate_addition(
        &self,
        active: &BTreeSet<ProtocolType>,
        candidate: ProtocolType,
    ) -> ValidationResult {
        let mut proposed = active.clone();
        proposed.insert(candidate);
        self.validate(&proposed)
    }

    /// Validates `active` with `candidate` removed, naming every remaining
    /// protocol that still requires it.
    pub fn validate_removal(
        &self,
        active: &BTreeSet<ProtocolType>,
        candidate: ProtocolType,
    ) -> ValidationResult {
        let mut proposed = active.clone();
        proposed.remove(&candidate);
        let mut result = self.validate(&proposed);
        let dependents: Vec<ProtocolType> = proposed
            .iter()
            .copied()
            .filter(|&protocol| self.required(protocol).contains(&candidate))
            .collect();
        if !dependents.is_empty() {
            result.is_valid = false;
            result.errors.push(format!(
                "Cannot remove {} while {} still require it",
                candidate,
                dependents
                    .iter()
                    .map(|protocol| protocol.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        result
    }

    fn visit(
        &self,
        protocol: ProtocolType,
        visiting: &mut Vec<ProtocolType>,
        resolved: &mut BTreeSet<ProtocolType>,
    ) -> Result<(), DependencyError> {
        if let Some(start) = visiting.iter().position(|&seen| seen == protocol) {
            let mut path = visiting[start..].to_vec();
            path.push(protocol);
            return Err(DependencyError::Circular { path });
        }
        if resolved.contains(&protocol) {
            return Ok(());
        }
        visiting.push(protocol);
        for required in self.required(protocol) {
            self.visit(required, visiting, resolved)?;
        }
        visiting.pop();
        resolved.insert(protocol);
        Ok(())
    }

    /// `protocol` and everything it transitively requires.
    pub fn resolve_dependencies(
        &self,
        protocol: ProtocolType,
    ) -> Result<BTreeSet<ProtocolType>, DependencyError> {
        let mut resolved = BTreeSet::new();
        self.visit(protocol, &mut Vec::new(), &mut resolved)?;
        Ok(resolved)
    }

    /// The requested protocols and everything they transitively require.
    pub fn minimal_protocol_set(
        &self,
        requested: impl IntoIterator<Item = ProtocolType>,
    ) -> Result<BTreeSet<ProtocolType>, DependencyError> {
        let mut set = BTreeSet::new();
        for protocol in requested {
            set.extend(self.resolve_dependencies(protocol)?);
        }
        Ok(set)
    }

    /// The minimal set plus each optional or enhancing protocol (with its own
    /// requirements) that conflicts with nothing already chosen.
    pub fn optimal_protocol_set(
        &self,
        requested: impl IntoIterator<Item = ProtocolType>,
    ) -> Result<BTreeSet<ProtocolType>, DependencyError> {
        let mut set = self.minimal_protocol_set(requested)?;
        let base: Vec<ProtocolType> = set.iter().copied().collect();
        for protocol in base {
            let extras = self
                .optional(protocol)
                .into_iter()
                .chain(self.enhancements(protocol));
            for extra in extras {
                if set.contains(&extra) {
                    continue;
                }
                let candidates = self.resolve_dependencies(extra)?;
                let clashes = candidates.iter().any(|&candidate| {
                    set.iter().any(|&chosen| self.in_conflict(candidate, chosen))
                });
                if clashes {
                    tracing::debug!("Skipping {} for {}: it conflicts with the chosen set", extra, protocol);
                    continue;
                }
                set.extend(candidates);
            }
        }
        Ok(set)
    }

    /// Whether any `Required` cycle exists anywhere in the graph.
    pub fn has_circular_dependency(&self) -> bool {
        let mut resolved = BTreeSet::new();
        self.edges
            .keys()
            .any(|&protocol| self.visit(protocol, &mut Vec::new(), &mut resolved).is_err())
    }

    fn level(
        &self,
        protocol: ProtocolType,
        visiting: &mut Vec<ProtocolType>,
        levels: &mut BTreeMap<ProtocolType, usize>,
    ) -> Result<usize, DependencyError> {
        if let Some(&level) = levels.get(&protocol) {
            return Ok(level);
        }
        if let Some(start) = visiting.iter().position(|&seen| seen == protocol) {
            let mut path = visiting[start..].to_vec();
            path.push(protocol);
            return Err(DependencyError::Circular { path });
        }
        visiting.push(protocol);
        let mut level = 0;
        for required in self.required(protocol) {
            level = level.max(1 + self.level(required, visiting, levels)?);
        }
        visiting.pop();
        levels.insert(protocol, level);
        Ok(level)
    }

    /// The bring-up level of every protocol in the graph: 0 with no
    /// requirements, else one more than the deepest requirement.
    pub fn dependency_levels(&self) -> Result<BTreeMap<ProtocolType, usize>, DependencyError> {
        let mut levels = BTreeMap::new();
        let protocols: BTreeSet<ProtocolType> = self
            .all()
            .flat_map(|dependency| [dependency.protocol, dependency.depends_on])
            .collect();
        for protocol in protocols {
            self.level(protocol, &mut Vec::new(), &mut levels)?;
        }
        Ok(levels)
    }

    /// Orders `protocols` so every protocol comes after the ones it requires.
    /// Ties are broken by protocol type.
    pub fn bring_up_order(
        &self,
        protocols: impl IntoIterator<Item = ProtocolType>,
    ) -> Result<Vec<ProtocolType>, DependencyError> {
        let levels = self.dependency_levels()?;
        let mut ordered: Vec<ProtocolType> = protocols
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        ordered.sort_by_key(|protocol| (levels.get(protocol).copied().unwrap_or(0), *protocol));
        Ok(ordered)
    }

    pub fn to_json(&self) -> Result<String, DependencyError> {
        let file = DependencyFile {
            dependencies: self.all().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn from_json(json: &str) -> Result<Self, DependencyError> {
        let file: DependencyFile = serde_json::from_str(json)?;
        let mut manager = Self::new();
        for dependency in file.dependencies {
            manager.register(dependency);
        }
        Ok(manager)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DependencyError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DependencyError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
