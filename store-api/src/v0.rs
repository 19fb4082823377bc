#![allow(clippy::field_reassign_with_default)]
use super::*;
use serde::{Deserialize, Serialize};
use serde_json::value::Value;
use std::{collections::HashMap, net::Ipv4Addr};
use strum_macros::{EnumString, ToString};

/// Default root disk size in GiB when the node does not specify one
pub const DEF_ROOT_DISK_SIZE: u64 = 15;
/// Index reserved for the root volume
pub const ROOT_VOLUME_INDEX: u32 = 0;
/// Sentinel index for volumes whose slot is not known yet
pub const UNKNOWN_VOLUME_INDEX: u32 = 4096;

/// Derive a deterministic uuid from a namespace uuid and a name
pub fn uuid5(namespace: &Uuid, name: &str) -> Uuid {
    Uuid::new_v5(namespace, name.as_bytes())
}

/// Content hash of a target-field payload, used to detect drift between
/// the intended and the persisted form of a resource.
/// Maps serialise with sorted keys so the hash is canonical.
pub fn content_hash(payload: &Value) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

mod hex {
    /// Lower-case hex encoding of a digest
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes
            .as_ref()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Kinds of resources tracked by the reconciliation framework.
/// Every target resource and every actual resource carries one of these;
/// the builders map each kind to a concrete model.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    EnumString,
    ToString,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Machine pool as seen by its pool agent
    Pool,
    /// Pool-bound volume
    PoolVolume,
    /// Control-plane machine record
    Machine,
    /// Hypervisor-facing derivative of a machine
    PoolMachine,
    /// In-VM agent facing derivative of a machine
    GuestMachine,
    /// User-facing compute intent
    Node,
    /// User-facing volume intent
    Volume,
    /// Declarative replica set of nodes
    NodeSet,
    /// Load-balanced node group
    LoadBalancer,
}

/// Identifier of a tracked resource, `kind` plus stable uuid
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash)]
pub struct ResourceId {
    /// kind of the resource
    pub kind: ResourceKind,
    /// stable identity of the resource
    pub uuid: Uuid,
}

impl ResourceId {
    /// New resource identifier from `kind` and `uuid`
    pub fn new(kind: ResourceKind, uuid: Uuid) -> Self {
        Self { kind, uuid }
    }
}

/// Desired form of a tracked resource. The payload holds only the target
/// fields the owner cares about; `hash` is the canonical content hash of
/// that payload and `tracked_at` is the watermark of the newest observed
/// state already folded back into the owning instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TargetResource {
    /// stable identity, shared with the instance that owns it
    pub uuid: Uuid,
    /// resource kind
    pub kind: ResourceKind,
    /// target fields
    pub payload: Value,
    /// content hash of `payload`
    pub hash: String,
    /// agent the resource is scheduled to, if any
    pub agent: Option<Uuid>,
    /// newest observed state already actualised into the owner
    pub tracked_at: DateTime<Utc>,
    /// last modification of the target itself
    pub updated_at: DateTime<Utc>,
}

impl TargetResource {
    /// New target resource with the hash derived from the payload. The
    /// watermark starts at the epoch so the first reconciliation pass
    /// folds the already-observed state in.
    pub fn new(kind: ResourceKind, uuid: Uuid, payload: Value, agent: Option<Uuid>) -> Self {
        let hash = content_hash(&payload);
        Self {
            uuid,
            kind,
            payload,
            hash,
            agent,
            tracked_at: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            updated_at: Utc::now(),
        }
    }
}

/// Observed counterpart of a `TargetResource`, written by the agent that
/// owns the data plane. May lag the target but must converge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resource {
    /// stable identity, shared with the target resource
    pub uuid: Uuid,
    /// resource kind
    pub kind: ResourceKind,
    /// observed fields
    pub payload: Value,
    /// content hash of `payload`
    pub hash: String,
    /// time of the observation
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// New actual resource observation
    pub fn new(kind: ResourceKind, uuid: Uuid, payload: Value) -> Self {
        let hash = content_hash(&payload);
        Self {
            uuid,
            kind,
            payload,
            hash,
            updated_at: Utc::now(),
        }
    }

    /// Status carried inside the observed payload, if any
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }
}

/// State of a user-facing node
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Intent recorded, nothing placed yet
    New,
    /// A machine has been bound to the node
    Scheduled,
    /// The fleet is converging towards the intent
    InProgress,
    /// Guest started but not fully converged
    Started,
    /// Fully converged
    Active,
    /// Unrecoverable without user or operator action
    Error,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::New
    }
}

/// State of a control-plane machine
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    /// Not observed on the data plane yet
    New,
    /// Bound to a pool by the scheduler
    Scheduled,
    /// Being built by the pool agent
    InProgress,
    /// Guest started
    Started,
    /// Guest flashed the image onto its root disk
    Flashed,
    /// Pool machine and guest machine both active
    Active,
    /// Exists with no node bound to it, reusable by the scheduler
    Idle,
    /// The pool can no longer host the machine
    NeedReschedule,
    /// Fatal capacity loss or root volume failure
    Error,
}

impl Default for MachineStatus {
    fn default() -> Self {
        Self::New
    }
}

/// State of a volume, user-facing or pool-bound
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    /// Intent recorded
    New,
    /// Converging
    InProgress,
    /// Present on the data plane
    Active,
    /// Provisioning failed
    Error,
}

impl Default for VolumeStatus {
    fn default() -> Self {
        Self::New
    }
}

/// Compute flavour of a node or machine
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    /// Virtual machine placed onto a pool
    Vm,
    /// Bare-metal box matched against idle hardware
    Hw,
}

impl Default for NodeType {
    fn default() -> Self {
        Self::Vm
    }
}

/// State of a machine pool
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachinePoolStatus {
    /// Accepting placements
    Active,
    /// Not accepting placements
    Disabled,
    /// Temporarily drained by an operator
    Maintenance,
}

impl Default for MachinePoolStatus {
    fn default() -> Self {
        Self::Disabled
    }
}

/// State of a pool agent registration
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineAgentStatus {
    /// Agent is alive and may own pools
    Active,
    /// Agent must not be assigned pools
    Disabled,
}

impl Default for MachineAgentStatus {
    fn default() -> Self {
        Self::Disabled
    }
}

/// State of a builder registration
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuilderStatus {
    /// Builder is alive
    Active,
    /// Builder must not receive machines
    Disabled,
}

impl Default for BuilderStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Build progress of a machine
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineBuildStatus {
    /// Resources are still being reserved
    InBuild,
    /// All reservations acquired, the machine may launch
    Ready,
}

impl Default for MachineBuildStatus {
    fn default() -> Self {
        Self::InBuild
    }
}

/// State of a compute port
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortStatus {
    /// Requested
    New,
    /// Being wired up by the network driver
    InProgress,
    /// Address allocated and usable
    Active,
    /// Allocation failed
    Error,
}

impl Default for PortStatus {
    fn default() -> Self {
        Self::New
    }
}

/// Placement policy flavour. Only soft anti-affinity is supported: the
/// scheduler prefers distinct pools for nodes sharing a policy but may
/// co-locate them when no free pool exists.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementPolicyKind {
    /// Spread nodes across pools when possible
    SoftAntiAffinity,
}

impl Default for PlacementPolicyKind {
    fn default() -> Self {
        Self::SoftAntiAffinity
    }
}

/// Volume device flavour
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeType {
    /// Copy-on-write disk image
    Qcow2,
}

impl Default for VolumeType {
    fn default() -> Self {
        Self::Qcow2
    }
}

/// Boot source of a machine. `hdN` boots from local drive `N`, `network`
/// chain-loads the netboot script, `cdrom` is treated as network for now.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum BootAlternative {
    Hd0,
    Hd1,
    Hd2,
    Hd3,
    Hd4,
    Hd5,
    Hd6,
    Hd7,
    Cdrom,
    Network,
}
impl Default for BootAlternative {
    fn default() -> Self {
        Self::Network
    }
}

impl BootAlternative {
    /// Whether the machine boots from a local drive
    pub fn boot_from_hd(&self) -> bool {
        self.disk_number().is_some()
    }

    /// Local drive number for the `hdN` alternatives
    pub fn disk_number(&self) -> Option<u8> {
        match self {
            Self::Hd0 => Some(0),
            Self::Hd1 => Some(1),
            Self::Hd2 => Some(2),
            Self::Hd3 => Some(3),
            Self::Hd4 => Some(4),
            Self::Hd5 => Some(5),
            Self::Hd6 => Some(6),
            Self::Hd7 => Some(7),
            _ => None,
        }
    }

    /// Coarse boot type: "hd" for any local drive, otherwise the literal
    pub fn boot_type(&self) -> &'static str {
        match self {
            Self::Cdrom => "cdrom",
            Self::Network => "network",
            _ => "hd",
        }
    }
}

/// Flavour of a thin storage pool, determines the oversubscription ratio
/// applied when aggregating reported capacity
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, EnumString, ToString, Eq, PartialEq,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StoragePoolType {
    /// Flat directory of disk images
    Dir,
    /// Copy-on-write dataset
    Zfs,
}

impl Default for StoragePoolType {
    fn default() -> Self {
        Self::Dir
    }
}

impl StoragePoolType {
    /// How far the reported capacity may be oversubscribed.
    /// Copy-on-write pools compress and share blocks aggressively so they
    /// get a larger multiplier than flat directories.
    pub fn oversubscription_ratio(&self) -> f64 {
        match self {
            Self::Zfs => 10.0,
            Self::Dir => 4.0,
        }
    }
}

/// Thin storage pool attached to a machine pool. Sizes are GiB.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ThinStoragePool {
    /// stable identity of the storage pool
    pub uuid: Uuid,
    /// name on the hypervisor
    pub name: String,
    /// reported total capacity
    pub capacity_usable: u64,
    /// free capacity right now
    pub available_actual: f64,
    /// flavour, source of the oversubscription ratio
    pub pool_type: StoragePoolType,
    /// oversubscription multiplier, derived once at aggregation
    pub oversubscription_ratio: f64,
}

impl Default for ThinStoragePool {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: Default::default(),
            capacity_usable: 0,
            available_actual: 0.0,
            pool_type: Default::default(),
            oversubscription_ratio: 1.0,
        }
    }
}

impl ThinStoragePool {
    /// Whether `delta` GiB more can be allocated, oversubscription applied
    pub fn has_capacity(&self, delta: u64) -> bool {
        self.available_actual >= delta as f64 / self.oversubscription_ratio
    }

    /// Debit `delta` GiB from the pool, oversubscription applied
    pub fn allocate_capacity(&mut self, delta: u64) {
        self.available_actual -= delta as f64 / self.oversubscription_ratio;
    }
}

/// Summary of a machine's primary port, embedded into the pool-machine
/// derivative and the node's default network
#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub struct PortInfo {
    /// port uuid
    pub uuid: Uuid,
    /// owning subnet
    pub subnet: Option<Uuid>,
    /// allocated address
    pub ipv4: Option<Ipv4Addr>,
    /// network mask
    pub mask: Option<Ipv4Addr>,
    /// interface hardware address
    pub mac: Option<String>,
}

/// One entry of a node's disk spec. Exactly one entry carries
/// `index == 0` and that entry must be bootable.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct DiskSpecEntry {
    /// slot of the volume, 0 is the root
    pub index: u32,
    /// size in GiB
    pub size: u64,
    /// base image, root entries normally set it
    pub image: Option<String>,
    /// whether the firmware may boot from it
    pub boot: bool,
    /// filesystem label
    pub label: Option<String>,
    /// device flavour
    pub device_type: VolumeType,
}

/// Structured list of volumes a node wants
#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub struct DiskSpec {
    /// entries, one per volume
    pub volumes: Vec<DiskSpecEntry>,
}

impl DiskSpec {
    /// Disk spec with a single root volume
    pub fn root(size: u64, image: Option<String>) -> Self {
        Self {
            volumes: vec![DiskSpecEntry {
                index: ROOT_VOLUME_INDEX,
                size,
                image,
                boot: true,
                label: None,
                device_type: VolumeType::Qcow2,
            }],
        }
    }

    /// The root entry, if the spec is well-formed
    pub fn root_entry(&self) -> Option<&DiskSpecEntry> {
        self.volumes.iter().find(|e| e.index == ROOT_VOLUME_INDEX)
    }

    /// Materialise user volumes for `node`, uuids derived from the node
    /// uuid so repeated generation is stable
    pub fn volumes(&self, node: &Node) -> Vec<Volume> {
        self.volumes
            .iter()
            .map(|entry| {
                let name = match entry.index {
                    ROOT_VOLUME_INDEX => "root-volume".to_string(),
                    index => format!("volume-{}", index),
                };
                let mut volume = Volume::default();
                volume.uuid = uuid5(&node.uuid, &name);
                volume.name = name;
                volume.project_id = node.project_id;
                volume.node = Some(node.uuid);
                volume.size = entry.size;
                volume.image = entry.image.clone();
                volume.boot = entry.boot;
                volume.label = entry.label.clone();
                volume.device_type = entry.device_type;
                volume.index = entry.index;
                volume
            })
            .collect()
    }
}

/// User-visible compute unit
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    /// stable identity
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// display name
    pub name: String,
    /// free-form description
    pub description: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// requested cores, 1..4096
    pub cores: u32,
    /// requested ram in MiB
    pub ram: u64,
    /// image consumed by provisioning
    pub image: String,
    /// compute flavour
    pub node_type: NodeType,
    /// size of the root disk in GiB
    pub root_disk_size: u64,
    /// guest hostname, falls back to `name`
    pub hostname: Option<String>,
    /// placement policies binding this node
    pub placement_policies: Vec<Uuid>,
    /// volumes the node wants
    pub disk_spec: DiskSpec,
    /// current state
    pub status: NodeStatus,
    /// pool the node's machine landed on
    pub pool: Option<Uuid>,
    /// primary port summary once attached
    pub default_network: Option<PortInfo>,
    /// parent replica set, if any
    pub node_set: Option<Uuid>,
}

impl Default for Node {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            description: Default::default(),
            created_at: now,
            updated_at: now,
            cores: 1,
            ram: 1,
            image: Default::default(),
            node_type: Default::default(),
            root_disk_size: DEF_ROOT_DISK_SIZE,
            hostname: None,
            placement_policies: Default::default(),
            disk_spec: Default::default(),
            status: Default::default(),
            pool: None,
            default_network: None,
            node_set: None,
        }
    }
}

impl Node {
    /// Target fields tracked for the node resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "cores": self.cores,
            "ram": self.ram,
            "root_disk_size": self.root_disk_size,
            "node_type": self.node_type,
            "image": self.image,
            "hostname": self.hostname,
            "project_id": self.project_id,
            "node_set": self.node_set,
            "placement_policies": self.placement_policies,
            "disk_spec": self.disk_spec,
        })
    }
}

/// Control-plane twin of a hypervisor guest
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Machine {
    /// stable identity, shared with the domain on the hypervisor
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// display name
    pub name: String,
    /// free-form description
    pub description: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// allocated cores
    pub cores: u32,
    /// allocated ram in MiB
    pub ram: u64,
    /// current state
    pub status: MachineStatus,
    /// compute flavour
    pub machine_type: NodeType,
    /// node backed by this machine
    pub node: Option<Uuid>,
    /// pool hosting this machine
    pub pool: Option<Uuid>,
    /// boot source
    pub boot: BootAlternative,
    /// uuid reported by the machine firmware
    pub firmware_uuid: Option<Uuid>,
    /// builder reserving resources for this machine
    pub builder: Option<Uuid>,
    /// build progress
    pub build_status: MachineBuildStatus,
    /// image currently on the root disk
    pub image: Option<String>,
}

impl Default for Machine {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            description: Default::default(),
            created_at: now,
            updated_at: now,
            cores: 0,
            ram: 0,
            status: Default::default(),
            machine_type: Default::default(),
            node: None,
            pool: None,
            boot: Default::default(),
            firmware_uuid: None,
            builder: None,
            build_status: Default::default(),
            image: None,
        }
    }
}

impl Machine {
    /// Target fields tracked for the machine resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "project_id": self.project_id,
            "cores": self.cores,
            "ram": self.ram,
            "machine_type": self.machine_type,
            "node": self.node,
            "pool": self.pool,
            "boot": self.boot,
            "image": self.image,
        })
    }
}

/// User intent for a volume attached to a node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Volume {
    /// stable identity
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// display name
    pub name: String,
    /// free-form description
    pub description: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// node the volume belongs to
    pub node: Option<Uuid>,
    /// size in GiB, 1..1_000_000
    pub size: u64,
    /// base image, if any
    pub image: Option<String>,
    /// whether the firmware may boot from it
    pub boot: bool,
    /// filesystem label
    pub label: Option<String>,
    /// device flavour
    pub device_type: VolumeType,
    /// slot of the volume, 0 is the root
    pub index: u32,
    /// pool the backing volume landed on
    pub pool: Option<Uuid>,
    /// current state
    pub status: VolumeStatus,
}

impl Default for Volume {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            description: Default::default(),
            created_at: now,
            updated_at: now,
            node: None,
            size: 1,
            image: None,
            boot: true,
            label: None,
            device_type: Default::default(),
            index: UNKNOWN_VOLUME_INDEX,
            pool: None,
            status: Default::default(),
        }
    }
}

impl Volume {
    /// Target fields tracked for the volume resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "node": self.node,
            "size": self.size,
            "image": self.image,
            "boot": self.boot,
            "label": self.label,
            "device_type": self.device_type,
            "index": self.index,
            "project_id": self.project_id,
        })
    }
}

/// Pool-bound materialisation of a volume
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachineVolume {
    /// stable identity, shared with the data-plane volume
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// name on the hypervisor
    pub name: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// pool hosting the volume
    pub pool: Option<Uuid>,
    /// machine the volume is attached to
    pub machine: Option<Uuid>,
    /// user volume backed by this one
    pub node_volume: Option<Uuid>,
    /// size in GiB
    pub size: u64,
    /// base image, if any
    pub image: Option<String>,
    /// whether the firmware may boot from it
    pub boot: bool,
    /// filesystem label
    pub label: Option<String>,
    /// device flavour
    pub device_type: VolumeType,
    /// slot of the volume, 0 is the root
    pub index: u32,
    /// current state
    pub status: VolumeStatus,
}

impl Default for MachineVolume {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            created_at: now,
            updated_at: now,
            pool: None,
            machine: None,
            node_volume: None,
            size: 1,
            image: None,
            boot: true,
            label: None,
            device_type: Default::default(),
            index: UNKNOWN_VOLUME_INDEX,
            status: Default::default(),
        }
    }
}

impl MachineVolume {
    /// Whether this is the root volume of its machine
    pub fn is_root(&self) -> bool {
        self.machine.is_some() && self.index == ROOT_VOLUME_INDEX
    }

    /// Target fields tracked for the pool-volume resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "pool": self.pool,
            "index": self.index,
            "size": self.size,
            "image": self.image,
            "machine": self.machine,
            "boot": self.boot,
            "label": self.label,
            "device_type": self.device_type,
            "project_id": self.project_id,
        })
    }
}

/// One hypervisor's worth of capacity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachinePool {
    /// stable identity
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// display name
    pub name: String,
    /// free-form description
    pub description: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// free-form spec interpreted by the driver, carries `driver`
    pub driver_spec: Value,
    /// compute flavour served by the pool
    pub machine_type: NodeType,
    /// current state
    pub status: MachinePoolStatus,
    /// pool agent owning the hypervisor
    pub agent: Option<Uuid>,
    /// pool builder owning the reconciliation
    pub builder: Option<Uuid>,
    /// cores still available for placement
    pub avail_cores: i64,
    /// ram still available for placement, MiB
    pub avail_ram: i64,
    /// total cores, oversubscription applied
    pub all_cores: i64,
    /// total ram, oversubscription applied, MiB
    pub all_ram: i64,
    /// cores oversubscription multiplier
    pub cores_ratio: f64,
    /// ram oversubscription multiplier
    pub ram_ratio: f64,
    /// thin storage pools of the hypervisor
    pub storage_pools: Vec<ThinStoragePool>,
}

impl Default for MachinePool {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            description: Default::default(),
            created_at: now,
            updated_at: now,
            driver_spec: Value::Object(Default::default()),
            machine_type: Default::default(),
            status: Default::default(),
            agent: None,
            builder: None,
            avail_cores: 0,
            avail_ram: 0,
            all_cores: 0,
            all_ram: 0,
            cores_ratio: 1.0,
            ram_ratio: 1.0,
            storage_pools: Default::default(),
        }
    }
}

impl MachinePool {
    /// Whether a driver spec has been configured
    pub fn has_driver(&self) -> bool {
        self.driver_spec
            .as_object()
            .map(|spec| !spec.is_empty())
            .unwrap_or(false)
    }

    /// Name of the configured driver, if any
    pub fn driver_name(&self) -> Option<&str> {
        self.driver_spec.get("driver").and_then(Value::as_str)
    }

    /// Target fields tracked for the pool resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "driver_spec": self.driver_spec,
            "machine_type": self.machine_type,
            "cores_ratio": self.cores_ratio,
            "ram_ratio": self.ram_ratio,
        })
    }
}

/// Observed state of one node of a node set
#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub struct NodeSetMember {
    /// primary address of the node, once known
    pub ipv4: Option<Ipv4Addr>,
}

/// Declarative replica set of nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeSet {
    /// stable identity
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// display name
    pub name: String,
    /// free-form description
    pub description: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// number of child nodes
    pub replicas: u32,
    /// cores per node
    pub cores: u32,
    /// ram per node, MiB
    pub ram: u64,
    /// image per node
    pub image: String,
    /// root disk size per node, GiB
    pub root_disk_size: u64,
    /// extra volumes per node
    pub disk_spec: DiskSpec,
    /// compute flavour per node
    pub node_type: NodeType,
    /// aggregated state of the children
    pub status: NodeStatus,
    /// observed members, keyed by node uuid
    pub nodes: HashMap<Uuid, NodeSetMember>,
}

impl Default for NodeSet {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            description: Default::default(),
            created_at: now,
            updated_at: now,
            replicas: 1,
            cores: 1,
            ram: 1,
            image: Default::default(),
            root_disk_size: DEF_ROOT_DISK_SIZE,
            disk_spec: Default::default(),
            node_type: Default::default(),
            status: Default::default(),
            nodes: Default::default(),
        }
    }
}

impl NodeSet {
    /// Deterministic uuid of the `index`-th child node
    pub fn node_uuid(&self, index: u32) -> Uuid {
        uuid5(&self.uuid, &format!("node-{}", index))
    }

    /// Uuids of all child nodes the current replica count implies.
    /// Growth appends, shrink trims the tail.
    pub fn node_uuids(&self) -> Vec<Uuid> {
        (0..self.replicas).map(|i| self.node_uuid(i)).collect()
    }

    /// Deterministic uuid of the set's default placement policy
    pub fn policy_uuid(&self) -> Uuid {
        uuid5(&self.uuid, "soft-anti-affinity")
    }

    /// Materialise the child nodes implied by the replica count
    pub fn gen_nodes(&self, policies: &[Uuid]) -> Vec<Node> {
        (0..self.replicas)
            .map(|i| {
                let node_uuid = self.node_uuid(i);
                let mut node = Node::default();
                node.uuid = node_uuid;
                node.node_set = Some(self.uuid);
                node.name = format!("{}-node-{}", self.name, &node_uuid.to_string()[..4]);
                node.cores = self.cores;
                node.ram = self.ram;
                node.image = self.image.clone();
                node.root_disk_size = self.root_disk_size;
                node.project_id = self.project_id;
                node.node_type = self.node_type;
                node.placement_policies = policies.to_vec();
                node.disk_spec = DiskSpec::root(self.root_disk_size, Some(self.image.clone()));
                node.disk_spec.volumes.extend(
                    self.disk_spec
                        .volumes
                        .iter()
                        .filter(|e| e.index != ROOT_VOLUME_INDEX)
                        .cloned(),
                );
                node
            })
            .collect()
    }

    /// Target fields tracked for the node-set resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "replicas": self.replicas,
            "cores": self.cores,
            "ram": self.ram,
            "image": self.image,
            "root_disk_size": self.root_disk_size,
            "node_type": self.node_type,
            "disk_spec": self.disk_spec,
            "project_id": self.project_id,
        })
    }
}

/// Placement policy binding a group of nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlacementPolicy {
    /// stable identity
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// display name
    pub name: String,
    /// free-form description
    pub description: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// policy flavour
    pub kind: PlacementPolicyKind,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            description: Default::default(),
            created_at: now,
            updated_at: now,
            kind: Default::default(),
        }
    }
}

/// Join record binding one node to one placement policy
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct PolicyAllocation {
    /// stable identity
    pub uuid: Uuid,
    /// participating node
    pub node: Uuid,
    /// policy the node participates in
    pub policy: Uuid,
}

impl PolicyAllocation {
    /// New allocation binding `node` to `policy`, identity derived from
    /// the pair so repeated inserts collide instead of duplicating
    pub fn new(node: Uuid, policy: Uuid) -> Self {
        Self {
            uuid: uuid5(&node, &policy.to_string()),
            node,
            policy,
        }
    }
}

/// Pending capacity debit held by a builder for a machine being built
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachinePoolReservation {
    /// stable identity
    pub uuid: Uuid,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// pool the debit is held against
    pub pool: Uuid,
    /// machine the debit covers
    pub machine: Option<Uuid>,
    /// reserved cores
    pub cores: u32,
    /// reserved ram, MiB
    pub ram: u64,
}

impl Default for MachinePoolReservation {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            pool: Uuid::nil(),
            machine: None,
            cores: 0,
            ram: 0,
        }
    }
}

/// Builder registration, refreshed every iteration and dropped wholesale
/// at each rebalance point. The name carries the builder flavour, e.g.
/// `compute_pool_builder 1a2b3c4d`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Builder {
    /// stable identity
    pub uuid: Uuid,
    /// flavour-prefixed display name
    pub name: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// current state
    pub status: BuilderStatus,
}

impl Default for Builder {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            name: Default::default(),
            created_at: now,
            updated_at: now,
            status: Default::default(),
        }
    }
}

/// Pool agent registration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachineAgent {
    /// stable identity
    pub uuid: Uuid,
    /// display name
    pub name: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// current state
    pub status: MachineAgentStatus,
    /// capabilities offered, e.g. `machine_pool`
    pub capabilities: Vec<String>,
}

impl Default for MachineAgent {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            name: Default::default(),
            created_at: now,
            updated_at: now,
            status: Default::default(),
            capabilities: Default::default(),
        }
    }
}

/// Capability an agent must offer to be assigned machine pools
pub const MACHINE_POOL_CAP: &str = "machine_pool";

/// Compute port of a node or machine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Port {
    /// stable identity
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// owning subnet
    pub subnet: Option<Uuid>,
    /// node the port belongs to
    pub node: Option<Uuid>,
    /// machine the port belongs to
    pub machine: Option<Uuid>,
    /// interface name inside the guest
    pub interface: Option<String>,
    /// allocated address
    pub ipv4: Option<Ipv4Addr>,
    /// network mask
    pub mask: Option<Ipv4Addr>,
    /// hardware address
    pub mac: Option<String>,
    /// current state
    pub status: PortStatus,
}

impl Default for Port {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            created_at: now,
            updated_at: now,
            subnet: None,
            node: None,
            machine: None,
            interface: None,
            ipv4: None,
            mask: None,
            mac: None,
            status: Default::default(),
        }
    }
}

impl Port {
    /// Generate a hardware address. Virtual machines get the well-known
    /// locally administered `52:54:00` prefix.
    pub fn generate_mac(virtual_machine: bool) -> String {
        let octet = || rand_octet();
        if virtual_machine {
            format!("52:54:00:{:02x}:{:02x}:{:02x}", octet(), octet(), octet())
        } else {
            format!(
                "a9:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                octet(),
                octet(),
                octet(),
                octet(),
                octet()
            )
        }
    }

    /// Summary used for `port_info` and `default_network`
    pub fn info(&self) -> PortInfo {
        PortInfo {
            uuid: self.uuid,
            subnet: self.subnet,
            ipv4: self.ipv4,
            mask: self.mask,
            mac: self.mac.clone(),
        }
    }
}

fn rand_octet() -> u8 {
    // Low byte of a fresh v4 uuid is random enough for a mac octet
    Uuid::new_v4().as_bytes()[15]
}

/// Network interface reported by a core agent
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Interface {
    /// stable identity
    pub uuid: Uuid,
    /// machine the interface belongs to
    pub machine: Uuid,
    /// interface name
    pub name: String,
    /// hardware address
    pub mac: String,
    /// address, if configured
    pub ipv4: Option<Ipv4Addr>,
    /// network mask
    pub mask: Option<Ipv4Addr>,
    /// maximum transmission unit
    pub mtu: u32,
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            machine: Uuid::nil(),
            name: Default::default(),
            mac: Default::default(),
            ipv4: None,
            mask: None,
            mtu: 1500,
        }
    }
}

/// Registration record of an in-VM core agent
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CoreAgent {
    /// stable identity, equal to the machine uuid
    pub uuid: Uuid,
    /// machine the agent runs on
    pub machine: Option<Uuid>,
    /// watermark of the payload last served to the agent
    pub payload_updated_at: Option<DateTime<Utc>>,
}

impl Default for CoreAgent {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            machine: None,
            payload_updated_at: None,
        }
    }
}

/// Flavour of a load balancer: per-node shape plus replica count
#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub struct LbType {
    /// cores per node
    pub cpu: u32,
    /// ram per node, MiB
    pub ram: u64,
    /// root disk per node, GiB
    pub disk_size: u64,
    /// node count
    pub nodes_number: u32,
}

/// Load-balanced node group
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadBalancer {
    /// stable identity
    pub uuid: Uuid,
    /// owning tenant
    pub project_id: Uuid,
    /// display name
    pub name: String,
    /// creation time
    pub created_at: DateTime<Utc>,
    /// last modification time
    pub updated_at: DateTime<Utc>,
    /// shape of the group
    pub lb_type: LbType,
    /// image the nodes run
    pub image: String,
    /// addresses of the members, once known
    pub ipsv4: Vec<Ipv4Addr>,
    /// aggregated state
    pub status: NodeStatus,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            project_id: Uuid::nil(),
            name: Default::default(),
            created_at: now,
            updated_at: now,
            lb_type: Default::default(),
            image: Default::default(),
            ipsv4: Default::default(),
            status: Default::default(),
        }
    }
}

impl LoadBalancer {
    /// Target fields tracked for the load-balancer resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "type": self.lb_type,
            "image": self.image,
            "project_id": self.project_id,
        })
    }
}

/// Hypervisor-facing derivative of a machine. Scheduled to the pool's
/// agent; the agent turns it into a domain through the driver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PoolMachine {
    /// stable identity, shared with the machine
    pub uuid: Uuid,
    /// name on the hypervisor
    pub name: String,
    /// owning tenant
    pub project_id: Uuid,
    /// allocated cores
    pub cores: u32,
    /// allocated ram, MiB
    pub ram: u64,
    /// compute flavour
    pub machine_type: NodeType,
    /// node backed by the machine
    pub node: Option<Uuid>,
    /// pool hosting the machine
    pub pool: Uuid,
    /// boot source on the hypervisor
    pub boot: BootAlternative,
    /// image on the root disk
    pub image: Option<String>,
    /// primary port summary
    pub port_info: PortInfo,
    /// observed state
    #[serde(default)]
    pub status: MachineStatus,
}

impl PoolMachine {
    /// Derive the pool machine from a machine and its primary port
    pub fn from_machine_and_port(machine: &Machine, port: &Port) -> Self {
        Self {
            uuid: machine.uuid,
            name: machine.name.clone(),
            project_id: machine.project_id,
            cores: machine.cores,
            ram: machine.ram,
            machine_type: machine.machine_type,
            node: machine.node,
            pool: machine.pool.unwrap_or_else(Uuid::nil),
            boot: BootAlternative::Network,
            image: machine.image.clone(),
            port_info: port.info(),
            status: MachineStatus::New,
        }
    }

    /// Target fields tracked for the pool-machine resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "project_id": self.project_id,
            "cores": self.cores,
            "ram": self.ram,
            "machine_type": self.machine_type,
            "node": self.node,
            "pool": self.pool,
            "boot": self.boot,
            "image": self.image,
            "port_info": self.port_info,
        })
    }
}

/// In-VM agent facing derivative of a machine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GuestMachine {
    /// stable identity, shared with the machine
    pub uuid: Uuid,
    /// image the guest should run
    pub image: Option<String>,
    /// guest hostname
    pub hostname: Option<String>,
    /// boot source from the guest's point of view
    pub boot: BootAlternative,
    /// observed state
    #[serde(default)]
    pub status: MachineStatus,
}

impl GuestMachine {
    /// Target fields tracked for the guest-machine resource
    pub fn target_payload(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "image": self.image,
            "hostname": self.hostname,
            "boot": self.boot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_alternative_types() {
        assert_eq!(BootAlternative::Hd0.boot_type(), "hd");
        assert_eq!(BootAlternative::Hd7.disk_number(), Some(7));
        assert_eq!(BootAlternative::Network.boot_type(), "network");
        assert_eq!(BootAlternative::Cdrom.boot_type(), "cdrom");
        assert!(!BootAlternative::Network.boot_from_hd());
        assert_eq!(
            serde_json::to_string(&BootAlternative::Hd0).unwrap(),
            "\"hd0\""
        );
    }

    #[test]
    fn content_hash_is_canonical() {
        let a = serde_json::json!({ "cores": 2, "ram": 4096 });
        let b = serde_json::json!({ "ram": 4096, "cores": 2 });
        assert_eq!(content_hash(&a), content_hash(&b));
        let c = serde_json::json!({ "cores": 4, "ram": 4096 });
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn node_set_uuids_are_deterministic() {
        let mut set = NodeSet::default();
        set.replicas = 3;
        let uuids = set.node_uuids();
        assert_eq!(uuids.len(), 3);
        assert_eq!(uuids, set.node_uuids());
        set.replicas = 1;
        // shrink trims the tail
        assert_eq!(set.node_uuids(), uuids[..1].to_vec());
    }

    #[test]
    fn thin_pool_oversubscription() {
        let mut pool = ThinStoragePool {
            capacity_usable: 100,
            available_actual: 10.0,
            pool_type: StoragePoolType::Zfs,
            oversubscription_ratio: StoragePoolType::Zfs.oversubscription_ratio(),
            ..Default::default()
        };
        // 10 GiB actually free covers 100 GiB thin at ratio 10
        assert!(pool.has_capacity(100));
        assert!(!pool.has_capacity(101));
        pool.allocate_capacity(50);
        assert!((pool.available_actual - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn vm_mac_uses_kvm_prefix() {
        let mac = Port::generate_mac(true);
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }
}
