//! In-memory scale sets and cluster for driver and coordinator tests
//!
//! One [`FakeCloud`] plays both collaborators: scale-set VMs are the
//! cluster's nodes (hostname `<pool>-<id:06>`), each node runs one ordinary
//! pod and masters additionally report their control-plane pods. Every
//! mutating call is logged and every scale-set mutation is observed so
//! tests can check invariants over the whole history.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use fleet_common::{Error, Result};

use crate::cloud::{Operation, OperationStatus, ScaleSet, ScaleSetClient, VmInstance};
use crate::cluster::{ClusterClient, EvictionOutcome};
use crate::config::MasterPods;
use crate::spec::{ClusterSpec, TargetModel};

/// Scale-set state after one mutation
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub scale_set: String,
    pub capacity: u32,
    pub not_ready: usize,
}

struct FakeVm {
    computer_name: String,
    latest: bool,
    running: bool,
}

struct FakeScaleSet {
    pool: String,
    capacity: u32,
    model: TargetModel,
    vms: BTreeMap<u64, FakeVm>,
    next_id: u64,
}

impl FakeScaleSet {
    fn add_vm(&mut self, latest: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.vms.insert(
            id,
            FakeVm {
                computer_name: format!("{}-{:06}", self.pool, id),
                latest,
                running: true,
            },
        );
        id
    }
}

#[derive(Default)]
struct State {
    scale_sets: BTreeMap<String, FakeScaleSet>,
    deleted_nodes: BTreeSet<String>,
    evicted: BTreeSet<String>,
    cordons: Vec<(String, bool)>,
    calls: Vec<String>,
    observations: Vec<Observation>,
    broken: BTreeSet<String>,
    break_on_restart: BTreeSet<String>,
    failing_deletes: u32,
    failing_reimages: BTreeSet<String>,
}

impl State {
    fn scale_set(&mut self, name: &str) -> Result<&mut FakeScaleSet> {
        self.scale_sets
            .get_mut(name)
            .ok_or_else(|| Error::cloud_permanent(name, "scale set not found"))
    }

    fn vm(&mut self, scale_set: &str, instance_id: &str) -> Result<&mut FakeVm> {
        let id: u64 = instance_id
            .parse()
            .map_err(|_| Error::cloud_permanent(scale_set, "bad instance id"))?;
        self.scale_set(scale_set)?
            .vms
            .get_mut(&id)
            .ok_or_else(|| Error::cloud_permanent(scale_set, format!("instance {instance_id} not found")))
    }

    fn find_vm(&self, computer_name: &str) -> Option<&FakeVm> {
        self.scale_sets
            .values()
            .flat_map(|ss| ss.vms.values())
            .find(|vm| vm.computer_name == computer_name)
    }

    fn node_ready(&self, computer_name: &str) -> bool {
        self.find_vm(computer_name)
            .is_some_and(|vm| vm.running && !self.broken.contains(computer_name))
    }

    fn is_cordoned(&self, node: &str) -> bool {
        self.cordons
            .iter()
            .rev()
            .find(|(name, _)| name == node)
            .is_some_and(|(_, on)| *on)
    }

    fn restart(&mut self, scale_set: &str, instance_id: &str) -> Result<()> {
        let vm = self.vm(scale_set, instance_id)?;
        vm.running = true;
        let name = vm.computer_name.clone();
        if self.break_on_restart.contains(&name) {
            self.broken.insert(name);
        } else {
            self.broken.remove(&name);
        }
        Ok(())
    }

    fn record(&mut self, scale_set: &str, call: String) {
        self.calls.push(call);
        if let Some(ss) = self.scale_sets.get(scale_set) {
            let not_ready = ss
                .vms
                .values()
                .filter(|vm| !vm.running || self.broken.contains(&vm.computer_name))
                .count();
            self.observations.push(Observation {
                scale_set: scale_set.to_string(),
                capacity: ss.capacity,
                not_ready,
            });
        }
    }
}

/// Simulated scale sets plus the cluster running on them
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<State>,
}

impl FakeCloud {
    /// One scale set per pool, each VM running the pool's model
    pub fn from_spec(spec: &ClusterSpec) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.lock();
            for pool in &spec.pools {
                let mut ss = FakeScaleSet {
                    pool: pool.name.clone(),
                    capacity: pool.count,
                    model: pool.model.clone(),
                    vms: BTreeMap::new(),
                    next_id: 0,
                };
                for _ in 0..pool.count {
                    ss.add_vm(true);
                }
                state.scale_sets.insert(pool.scale_set_name(), ss);
            }
        }
        fake
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Node turns unready on its next restart and stays that way
    pub fn break_on_restart(&self, node: &str) {
        self.lock().break_on_restart.insert(node.to_string());
    }

    /// Node is unready until its next restart
    pub fn set_unready(&self, node: &str) {
        self.lock().broken.insert(node.to_string());
    }

    /// The next `n` VM deletions fail
    pub fn fail_deletes(&self, n: u32) {
        self.lock().failing_deletes = n;
    }

    /// The next reimage of `node` fails
    pub fn fail_reimage(&self, node: &str) {
        self.lock().failing_reimages.insert(node.to_string());
    }

    /// Node becomes healthy and stays healthy across restarts
    pub fn repair(&self, node: &str) {
        let mut state = self.lock();
        state.break_on_restart.remove(node);
        state.broken.remove(node);
    }

    /// Add a VM running the latest model without going through capacity
    pub fn add_vm(&self, scale_set: &str) -> String {
        let mut state = self.lock();
        let ss = state.scale_set(scale_set).unwrap();
        ss.capacity += 1;
        ss.add_vm(true).to_string()
    }

    pub fn capacity(&self, scale_set: &str) -> u32 {
        self.lock().scale_sets[scale_set].capacity
    }

    pub fn instances(&self, scale_set: &str) -> Vec<VmInstance> {
        let state = self.lock();
        state.scale_sets[scale_set]
            .vms
            .iter()
            .map(|(id, vm)| VmInstance {
                instance_id: id.to_string(),
                computer_name: vm.computer_name.clone(),
                latest_model_applied: vm.latest,
            })
            .collect()
    }

    /// Mutating calls, e.g. `"set_capacity ss-infra 3"`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Mutating calls starting with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn observations(&self, scale_set: &str) -> Vec<Observation> {
        self.lock()
            .observations
            .iter()
            .filter(|o| o.scale_set == scale_set)
            .cloned()
            .collect()
    }

    /// Nodes that were cordoned
    pub fn cordoned(&self) -> Vec<String> {
        self.lock()
            .cordons
            .iter()
            .filter(|(_, on)| *on)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Nodes that were marked schedulable again
    pub fn uncordoned(&self) -> Vec<String> {
        self.lock()
            .cordons
            .iter()
            .filter(|(_, on)| !*on)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Whether `node` is currently unschedulable
    pub fn is_cordoned(&self, node: &str) -> bool {
        self.lock().is_cordoned(node)
    }

    pub fn evicted(&self) -> BTreeSet<String> {
        self.lock().evicted.clone()
    }
}

fn ready_condition_status(ready: bool) -> String {
    if ready { "True" } else { "False" }.to_string()
}

fn node(name: &str, ready: bool, unschedulable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: ready_condition_status(ready),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod(namespace: &str, name: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: ready_condition_status(ready),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn app_pod_name(node: &str) -> String {
    format!("app-{node}")
}

#[async_trait]
impl ScaleSetClient for FakeCloud {
    async fn get(&self, scale_set: &str) -> Result<ScaleSet> {
        let mut state = self.lock();
        let ss = state.scale_set(scale_set)?;
        Ok(ScaleSet {
            name: scale_set.to_string(),
            capacity: ss.capacity,
            model: ss.model.clone(),
        })
    }

    async fn list_instances(&self, scale_set: &str) -> Result<Vec<VmInstance>> {
        self.lock().scale_set(scale_set)?;
        Ok(self.instances(scale_set))
    }

    async fn update_model(&self, scale_set: &str, model: &TargetModel) -> Result<Operation> {
        let mut state = self.lock();
        let ss = state.scale_set(scale_set)?;
        ss.model = model.clone();
        for vm in ss.vms.values_mut() {
            vm.latest = false;
        }
        state.record(scale_set, format!("update_model {scale_set}"));
        Ok(Operation::completed(scale_set, "update model"))
    }

    async fn set_capacity(&self, scale_set: &str, capacity: u32) -> Result<Operation> {
        let mut state = self.lock();
        let ss = state.scale_set(scale_set)?;
        while (ss.vms.len() as u32) < capacity {
            ss.add_vm(true);
        }
        while (ss.vms.len() as u32) > capacity {
            let highest = *ss.vms.keys().next_back().unwrap();
            ss.vms.remove(&highest);
        }
        ss.capacity = capacity;
        state.record(scale_set, format!("set_capacity {scale_set} {capacity}"));
        Ok(Operation::pending(
            scale_set,
            format!("set capacity to {capacity}"),
            format!("fake://{scale_set}/capacity/{capacity}"),
        ))
    }

    async fn update_instance_model(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        let mut state = self.lock();
        state.vm(scale_set, instance_id)?.latest = true;
        state.record(scale_set, format!("update_instance_model {scale_set} {instance_id}"));
        Ok(Operation::completed(scale_set, "update instance"))
    }

    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        let mut state = self.lock();
        let name = state.vm(scale_set, instance_id)?.computer_name.clone();
        if state.failing_reimages.remove(&name) {
            return Err(Error::cloud_permanent(scale_set, format!("injected reimage failure on {name}")));
        }
        state.restart(scale_set, instance_id)?;
        state.record(scale_set, format!("reimage {scale_set} {instance_id}"));
        Ok(Operation::completed(scale_set, "reimage"))
    }

    async fn deallocate(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        let mut state = self.lock();
        state.vm(scale_set, instance_id)?.running = false;
        state.record(scale_set, format!("deallocate {scale_set} {instance_id}"));
        Ok(Operation::completed(scale_set, "deallocate"))
    }

    async fn start(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        let mut state = self.lock();
        state.restart(scale_set, instance_id)?;
        state.record(scale_set, format!("start {scale_set} {instance_id}"));
        Ok(Operation::completed(scale_set, "start"))
    }

    async fn delete(&self, scale_set: &str, instance_id: &str) -> Result<Operation> {
        let mut state = self.lock();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(Error::cloud(scale_set, "injected delete failure"));
        }
        state.vm(scale_set, instance_id)?;
        let ss = state.scale_set(scale_set)?;
        if let Ok(id) = instance_id.parse::<u64>() {
            ss.vms.remove(&id);
        }
        ss.capacity -= 1;
        state.record(scale_set, format!("delete {scale_set} {instance_id}"));
        Ok(Operation::completed(scale_set, "delete"))
    }

    async fn operation_status(&self, _operation: &Operation) -> Result<OperationStatus> {
        Ok(OperationStatus::Succeeded)
    }
}

#[async_trait]
impl ClusterClient for FakeCloud {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let state = self.lock();
        if state.deleted_nodes.contains(name) || state.find_vm(name).is_none() {
            return Ok(None);
        }
        Ok(Some(node(
            name,
            state.node_ready(name),
            state.is_cordoned(name),
        )))
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        self.lock()
            .cordons
            .push((name.to_string(), unschedulable));
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let state = self.lock();
        let name = app_pod_name(node);
        if state.evicted.contains(&name) {
            return Ok(Vec::new());
        }
        Ok(vec![pod("default", &name, true)])
    }

    async fn evict_pod(&self, _namespace: &str, name: &str) -> Result<EvictionOutcome> {
        let mut state = self.lock();
        if !state.evicted.insert(name.to_string()) {
            return Ok(EvictionOutcome::NotFound);
        }
        Ok(EvictionOutcome::Evicted)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let state = self.lock();
        let master_pods = MasterPods::default();
        if namespace == master_pods.namespace {
            let host = [
                &master_pods.etcd_prefix,
                &master_pods.api_server_prefix,
                &master_pods.controller_manager_prefix,
            ]
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix.as_str()));
            return Ok(host
                .filter(|h| state.find_vm(h).is_some())
                .map(|h| pod(namespace, name, state.node_ready(h))));
        }
        if state.evicted.contains(name) {
            return Ok(None);
        }
        Ok(Some(pod(namespace, name, true)))
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.deleted_nodes.insert(name.to_string());
        state.calls.push(format!("delete_node {name}"));
        Ok(())
    }
}
