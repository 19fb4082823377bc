//! Version 0 of the orchestration api.

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use common::boot::{render_ipxe, NetbootConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use store_api::{
    v0::{content_hash, *},
    Store,
};
use uuid::Uuid;

/// Register the v0 routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_boot)
        .service(get_agent_payload)
        .service(register_agent_payload);
}

/// Machine fields an agent reports on registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineView {
    /// stable identity
    pub uuid: Uuid,
    /// display name
    #[serde(default)]
    pub name: String,
    /// cores of the box
    #[serde(default)]
    pub cores: u32,
    /// ram of the box, MiB
    #[serde(default)]
    pub ram: u64,
    /// compute flavour
    #[serde(default)]
    pub machine_type: NodeType,
    /// node backed by the machine, if known
    #[serde(default)]
    pub node: Option<Uuid>,
    /// pool hosting the machine, if known
    #[serde(default)]
    pub pool: Option<Uuid>,
    /// image on the root disk
    #[serde(default)]
    pub image: Option<String>,
    /// uuid reported by the firmware
    #[serde(default)]
    pub firmware_uuid: Option<Uuid>,
}

/// Interface fields an agent reports on registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceView {
    /// hardware address
    pub mac: String,
    /// interface name
    #[serde(default)]
    pub name: String,
    /// address, if configured
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    /// network mask
    #[serde(default)]
    pub mask: Option<Ipv4Addr>,
    /// maximum transmission unit
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

fn default_mtu() -> u32 {
    1500
}

/// Registration body posted by a core agent
#[derive(Debug, Deserialize)]
pub struct RegisterPayload {
    /// the machine the agent runs on
    pub machine: MachineView,
    /// interfaces of the machine
    #[serde(default)]
    pub interfaces: Vec<InterfaceView>,
}

/// Freshness query of a payload poll
#[derive(Debug, Deserialize)]
pub struct PayloadQuery {
    /// content hash the agent cached
    #[serde(default)]
    pub payload_hash: String,
    /// watermark the agent cached
    #[serde(default)]
    pub payload_updated_at: Option<DateTime<Utc>>,
}

/// Stable content hash of the fields the agents act on
pub fn payload_hash(payload: &Value) -> String {
    let mut data = json!({});
    if let Some(machine) = payload.get("machine") {
        data["machine"] = json!({
            "image": machine.get("image"),
            "node": machine.get("node"),
        });
    }
    if let Some(node) = payload.get("node") {
        data["node"] = json!({
            "cores": node.get("cores"),
            "ram": node.get("ram"),
            "node_type": node.get("node_type"),
            "image": node.get("image"),
        });
    }
    if let Some(interfaces) = payload.get("interfaces").and_then(Value::as_array) {
        data["interfaces"] = Value::Array(
            interfaces
                .iter()
                .map(|iface| {
                    json!({
                        "mac": iface.get("mac"),
                        "ipv4": iface.get("ipv4"),
                        "mask": iface.get("mask"),
                    })
                })
                .collect(),
        );
    }
    content_hash(&data)
}

/// Newest modification stamp behind an agent's view: its machine, the
/// node the machine backs and their ports
async fn latest_updated_at(store: &Store, machine: &Machine) -> DateTime<Utc> {
    let mut latest = machine.updated_at;
    let ports = store.list_ports().await;
    match machine.node {
        Some(node_uuid) => {
            if let Some(node) = store.find_node(&node_uuid).await {
                latest = latest.max(node.updated_at);
            }
            for port in ports {
                if port.node == Some(node_uuid) {
                    latest = latest.max(port.updated_at);
                }
            }
        }
        None => {
            for port in ports {
                if port.machine == Some(machine.uuid) {
                    latest = latest.max(port.updated_at);
                }
            }
        }
    }
    latest
}

/// Full payload served to an agent
async fn full_payload(store: &Store, machine: &Machine, latest: DateTime<Utc>) -> Value {
    let mut state = json!({
        "payload_updated_at": latest,
        "machine": machine,
    });
    if let Some(node_uuid) = machine.node {
        if let Some(node) = store.find_node(&node_uuid).await {
            state["node"] = json!(node);
        }
        let ports: Vec<Port> = store
            .list_ports()
            .await
            .into_iter()
            .filter(|p| p.node == Some(node_uuid))
            .collect();
        state["ports"] = json!(ports);
    }
    let interfaces: Vec<Interface> = store
        .list_interfaces()
        .await
        .into_iter()
        .filter(|i| i.machine == machine.uuid)
        .collect();
    state["interfaces"] = json!(interfaces);
    state["payload_hash"] = json!(payload_hash(&state));
    state
}

/// The default pool auto-discovered hardware lands in: the single
/// active hardware pool with no driver of its own
async fn default_hw_pool(store: &Store) -> Option<MachinePool> {
    store
        .list_pools()
        .await
        .into_iter()
        .find(|p| {
            p.machine_type == NodeType::Hw
                && !p.has_driver()
                && p.status == MachinePoolStatus::Active
        })
}

/// Netboot script of a machine. Machines the control plane has never
/// heard of get the default network script so autodiscovery can start.
#[get("/v1/boots/{uuid}")]
async fn get_boot(
    path: web::Path<Uuid>,
    store: web::Data<Store>,
    config: web::Data<NetbootConfig>,
) -> impl Responder {
    let boot = store
        .find_machine(&path.into_inner())
        .await
        .map(|m| m.boot)
        .unwrap_or(BootAlternative::Network);
    HttpResponse::Ok()
        .content_type("application/octet-stream")
        .body(render_ipxe(boot, &config))
}

/// Payload poll of a core agent. When the agent's watermark matches the
/// newest state only the hash and the watermark are returned.
#[get("/v1/core_agents/{uuid}/payload")]
async fn get_agent_payload(
    path: web::Path<Uuid>,
    query: web::Query<PayloadQuery>,
    store: web::Data<Store>,
) -> impl Responder {
    let uuid = path.into_inner();
    let agent = match store.find_core_agent(&uuid).await {
        Some(agent) => agent,
        None => return HttpResponse::NotFound().finish(),
    };
    let machine = match agent.machine {
        Some(machine) => store.find_machine(&machine).await,
        None => None,
    };
    let machine = match machine {
        Some(machine) => machine,
        None => return HttpResponse::NotFound().finish(),
    };

    let latest = latest_updated_at(&store, &machine).await;
    if query.payload_updated_at == Some(latest) {
        return HttpResponse::Ok().json(json!({
            "payload_updated_at": latest,
            "payload_hash": query.payload_hash,
        }));
    }

    let state = full_payload(&store, &machine, latest).await;
    let mut agent = agent;
    agent.payload_updated_at = Some(latest);
    store.save_core_agent(agent).await.ok();
    HttpResponse::Ok().json(state)
}

/// Registration of a core agent. Unknown hardware machines are
/// auto-discovered into the default hardware pool.
#[post("/v1/core_agents/{uuid}")]
async fn register_agent_payload(
    path: web::Path<Uuid>,
    body: web::Json<RegisterPayload>,
    store: web::Data<Store>,
) -> impl Responder {
    let uuid = path.into_inner();
    let view = &body.machine;

    let machine = match store.find_machine(&view.uuid).await {
        Some(machine) => machine,
        None => {
            let mut machine = Machine::default();
            machine.uuid = view.uuid;
            machine.name = view.name.clone();
            machine.cores = view.cores;
            machine.ram = view.ram;
            machine.machine_type = view.machine_type;
            machine.node = view.node;
            machine.pool = view.pool;
            machine.image = view.image.clone();
            machine.firmware_uuid = view.firmware_uuid.or(Some(view.uuid));
            machine.status = MachineStatus::Idle;

            if view.machine_type == NodeType::Hw {
                if machine.pool.is_none() {
                    match default_hw_pool(&store).await {
                        Some(pool) => machine.pool = Some(pool.uuid),
                        None => {
                            return HttpResponse::BadRequest()
                                .body("Default HW pool is not configured")
                        }
                    }
                }
                machine.build_status = MachineBuildStatus::Ready;
                if let Err(error) = store.save_machine(machine.clone()).await {
                    return HttpResponse::InternalServerError().body(error.to_string());
                }
                for view in &body.interfaces {
                    let mut iface = Interface::default();
                    iface.uuid = uuid5(&machine.uuid, &view.mac);
                    iface.machine = machine.uuid;
                    iface.name = view.name.clone();
                    iface.mac = view.mac.clone();
                    iface.ipv4 = view.ipv4;
                    iface.mask = view.mask;
                    iface.mtu = view.mtu;
                    store.save_interface(iface).await.ok();
                }
            }
            machine
        }
    };

    let mut agent = store.find_core_agent(&uuid).await.unwrap_or_default();
    agent.uuid = uuid;
    agent.machine = Some(machine.uuid);
    let latest = latest_updated_at(&store, &machine).await;
    agent.payload_updated_at = Some(latest);
    if let Err(error) = store.save_core_agent(agent).await {
        return HttpResponse::InternalServerError().body(error.to_string());
    }

    HttpResponse::Ok().json(full_payload(&store, &machine, latest).await)
}
