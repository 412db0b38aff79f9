use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Payload written to and read from a backend.
///
/// Merge semantics belong to the backend: objects merge key-by-key,
/// anything else replaces.
pub type Value = serde_json::Value;

/// Opaque identifier of a remote device or a logical store partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of transactional backend. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local data store partition.
    Local,
    /// Remote device session.
    Remote,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Local, BackendKind::Remote];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

/// Logical datastore an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreScope {
    Configuration,
    Operational,
}

impl fmt::Display for DatastoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatastoreScope::Configuration => write!(f, "configuration"),
            DatastoreScope::Operational => write!(f, "operational"),
        }
    }
}

/// Hierarchical, slash-separated data path such as `/interfaces/eth0`.
///
/// Paths are normalised on construction: empty segments are dropped and the
/// root is `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPath(String);

impl DataPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let segments: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        Self(format!("/{}", segments.join("/")))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Appends one segment (or a sub-path) to this path.
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        Self::new(format!("{}/{}", self.0, segment.as_ref()))
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let idx = self.0.rfind('/')?;
        Some(Self::new(&self.0[..idx]))
    }

    /// True if `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &DataPath) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/')
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Kind of forward edit applied against a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Merge,
    Replace,
    Delete,
}

impl fmt::Display for EditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditKind::Merge => write!(f, "merge"),
            EditKind::Replace => write!(f, "replace"),
            EditKind::Delete => write!(f, "delete"),
        }
    }
}

/// One `(BackendKind, DeviceId)` pair inside a distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub kind: BackendKind,
    pub device: DeviceId,
}

impl Participant {
    pub fn new(kind: BackendKind, device: impl Into<DeviceId>) -> Self {
        Self {
            kind,
            device: device.into(),
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.device)
    }
}

/// The exact set of devices, grouped by backend kind, that a distributed
/// transaction locks. Kinds never map to an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSet {
    devices: BTreeMap<BackendKind, BTreeSet<DeviceId>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lock set covering `devices` of a single kind.
    pub fn of_kind<I, D>(kind: BackendKind, devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        let mut set = Self::new();
        for device in devices {
            set.insert(kind, device);
        }
        set
    }

    pub fn insert(&mut self, kind: BackendKind, device: impl Into<DeviceId>) -> bool {
        self.devices.entry(kind).or_default().insert(device.into())
    }

    /// Adds every device in `devices` under `kind`.
    pub fn with<I, D>(mut self, kind: BackendKind, devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        for device in devices {
            self.insert(kind, device);
        }
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.devices.keys().copied()
    }

    pub fn devices(&self, kind: BackendKind) -> Option<&BTreeSet<DeviceId>> {
        self.devices.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BackendKind, &BTreeSet<DeviceId>)> {
        self.devices.iter().map(|(kind, devices)| (*kind, devices))
    }

    pub fn participants(&self) -> impl Iterator<Item = Participant> + '_ {
        self.devices.iter().flat_map(|(kind, devices)| {
            devices
                .iter()
                .map(move |device| Participant::new(*kind, device.clone()))
        })
    }

    pub fn contains(&self, participant: &Participant) -> bool {
        self.devices
            .get(&participant.kind)
            .is_some_and(|devices| devices.contains(&participant.device))
    }

    /// Number of participants across all kinds.
    pub fn len(&self) -> usize {
        self.devices.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Participant> for LockSet {
    fn from_iter<T: IntoIterator<Item = Participant>>(iter: T) -> Self {
        let mut set = Self::new();
        for participant in iter {
            set.insert(participant.kind, participant.device);
        }
        set
    }
}
