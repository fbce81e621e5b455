//! In-memory cloud provider.
//!
//! Unique responsibility: stand in for every provider service with the same
//! observable behaviour the convergers rely on, without a network:
//! - the object store answers `NoSuchTagSet` for an untagged bucket,
//! - the search service answers `ResourceNotFoundException` for unknown ARNs,
//! - load balancer tags come back as a list of descriptions,
//! - the identity lookup can be denied, with the caller ARN in the message,
//! - deleting a network with an attached gateway is a dependency violation.
//!
//! Every mutating call is recorded (even when it fails), and a failure can be
//! injected for the next call of a given operation. The world can be saved to
//! and loaded from a JSON file so the binary keeps state between runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::provider::{
    ACCESS_DENIED, AutoScalingApi, AutoScalingGroup, AutoScalingGroupUpdate, Bucket, ChangeAction,
    ComputeApi, DbInstance, DbInstanceSpec, DbModification, DnsApi, GroupTag, IdentityApi,
    IdentityUser, InstanceTenancy, InternetGateway, LoadBalancer, LoadBalancerApi,
    LoadBalancerSpec, NO_SUCH_TAG_SET, ObjectStoreApi, OptionalTag, ProviderError, ProviderResult,
    RESOURCE_NOT_FOUND, RecordChange, RecordSet, RelationalApi, SearchApi, SearchDomain,
    SearchDomainChange, SearchDomainSpec, Tag, TagDescription, Volume, VolumeChange, VolumeSpec,
    Vpc, VpcAttribute,
};
use crate::resource_store::write_json_atomic;
use crate::tag_strategy::build_arn;

/// Sandbox file format version.
const SANDBOX_FORMAT_VERSION: u32 = 1;

/// Errors loading or saving the sandbox world.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The file was written by an incompatible version.
    #[error("unsupported sandbox format version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GatewayRecord {
    attachments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HostedZone {
    domain: String,
    records: Vec<RecordSet>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct World {
    format_version: u32,
    region: String,
    account_id: String,
    counter: u64,

    vpcs: BTreeMap<String, Vpc>,
    gateways: BTreeMap<String, GatewayRecord>,
    volumes: BTreeMap<String, Volume>,
    ec2_tags: BTreeMap<String, BTreeMap<String, String>>,

    groups: BTreeMap<String, AutoScalingGroup>,
    group_tags: BTreeMap<String, BTreeMap<String, GroupTag>>,

    load_balancers: BTreeMap<String, LoadBalancer>,
    lb_tags: BTreeMap<String, BTreeMap<String, String>>,

    db_instances: BTreeMap<String, DbInstance>,
    rds_tags: BTreeMap<String, BTreeMap<String, Option<String>>>,
    final_snapshots: Vec<String>,

    domains: BTreeMap<String, SearchDomain>,
    domain_tags: BTreeMap<String, BTreeMap<String, Option<String>>>,

    buckets: BTreeMap<String, Bucket>,
    bucket_tags: BTreeMap<String, Vec<Tag>>,

    zones: BTreeMap<String, HostedZone>,

    #[serde(skip)]
    calls: Vec<String>,
    #[serde(skip)]
    faults: BTreeMap<String, String>,
    #[serde(skip)]
    denied_identity: Option<String>,
}

impl World {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{:08x}", self.counter)
    }

    fn name_of(&self, id: &str) -> Option<&str> {
        self.ec2_tags.get(id)?.get("Name").map(String::as_str)
    }

    fn ec2_tags_of(&self, id: &str) -> Vec<Tag> {
        self.ec2_tags
            .get(id)
            .map(|t| t.iter().map(|(k, v)| Tag::new(k, v)).collect())
            .unwrap_or_default()
    }

    fn ec2_resource_exists(&self, id: &str) -> bool {
        self.vpcs.contains_key(id) || self.gateways.contains_key(id) || self.volumes.contains_key(id)
    }

    fn db_arn(&self, identifier: &str) -> String {
        build_arn("aws", "rds", &self.region, &self.account_id, "db", identifier)
    }

    fn domain_arn(&self, name: &str) -> String {
        format!("arn:aws:es:{}:{}:domain/{name}", self.region, self.account_id)
    }

    fn domain_with_arn(&self, arn: &str) -> bool {
        self.domains.values().any(|d| d.arn == arn)
    }

    fn db_with_arn(&self, arn: &str) -> bool {
        self.db_instances.keys().any(|id| self.db_arn(id) == arn)
    }
}

fn fail(op: &str, code: &str, message: impl Into<String>) -> ProviderError {
    let service = op.split(':').next().unwrap_or(op);
    ProviderError::new(service, code, message)
}

/// In-memory implementation of every provider service.
#[derive(Debug)]
pub struct SandboxCloud {
    world: Mutex<World>,
}

impl SandboxCloud {
    /// Empty sandbox for the given region and account.
    #[must_use]
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            world: Mutex::new(World {
                format_version: SANDBOX_FORMAT_VERSION,
                region: region.into(),
                account_id: account_id.into(),
                ..World::default()
            }),
        }
    }

    /// Load a sandbox saved with [`SandboxCloud::save`], or start empty when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or was written
    /// by an incompatible version.
    pub fn open(
        path: &Path,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        if !path.exists() {
            return Ok(Self::new(region, account_id));
        }
        let bytes = fs::read(path)?;
        let world: World = serde_json::from_slice(&bytes)?;
        if world.format_version != SANDBOX_FORMAT_VERSION {
            return Err(SandboxError::UnsupportedVersion(world.format_version));
        }
        debug!(path = %path.display(), "sandbox loaded");
        Ok(Self {
            world: Mutex::new(world),
        })
    }

    /// Persist the world atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), SandboxError> {
        let world = self.lock();
        write_json_atomic::<_, SandboxError>(path, &*world)
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the world for one call, recording it and firing an injected failure.
    fn enter(&self, op: &'static str, mutating: bool) -> ProviderResult<MutexGuard<'_, World>> {
        let mut world = self.lock();
        if mutating {
            world.calls.push(op.to_string());
        }
        if let Some(code) = world.faults.remove(op) {
            debug!(op, code = %code, "injected failure");
            return Err(fail(op, &code, format!("injected failure for {op}")));
        }
        Ok(world)
    }

    /// Region the sandbox reports.
    #[must_use]
    pub fn region(&self) -> String {
        self.lock().region.clone()
    }

    /// Mutating calls attempted since the last reset, e.g. `ec2:CreateVpc`.
    #[must_use]
    pub fn mutating_calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the next call of `op` fail with `code`.
    pub fn fail_next(&self, op: &str, code: &str) {
        self.lock().faults.insert(op.to_string(), code.to_string());
    }

    /// Deny the identity lookup, naming `caller_arn` in the error message.
    pub fn deny_identity(&self, caller_arn: &str) {
        self.lock().denied_identity = Some(caller_arn.to_string());
    }

    /// Identifiers of database instances deleted with a final snapshot.
    #[must_use]
    pub fn final_snapshots(&self) -> Vec<String> {
        self.lock().final_snapshots.clone()
    }

    /// Create a hosted zone and return its id.
    pub fn create_hosted_zone(&self, domain: &str) -> String {
        let mut world = self.lock();
        let id = world.next_id("Z").to_uppercase();
        world.zones.insert(
            id.clone(),
            HostedZone {
                domain: domain.to_string(),
                records: Vec::new(),
            },
        );
        id
    }

    /// Id of the hosted zone serving `domain`, if any.
    #[must_use]
    pub fn hosted_zone_for(&self, domain: &str) -> Option<String> {
        self.lock()
            .zones
            .iter()
            .find(|(_, z)| z.domain.eq_ignore_ascii_case(domain))
            .map(|(id, _)| id.clone())
    }

    /// Add an untagged volume without recording a call.
    pub fn seed_volume(&self, availability_zone: &str, size: u32) -> String {
        let mut world = self.lock();
        let id = world.next_id("vol");
        world.volumes.insert(
            id.clone(),
            Volume {
                id: id.clone(),
                availability_zone: availability_zone.to_string(),
                size,
                volume_type: "gp3".to_string(),
                iops: None,
                encrypted: false,
                snapshot_id: None,
            },
        );
        id
    }

    /// Add a gateway attached to `vpc_id`, with the given tags.
    pub fn seed_gateway(&self, vpc_id: &str, tags: &[(&str, &str)]) -> String {
        let mut world = self.lock();
        let id = world.next_id("igw");
        world.gateways.insert(
            id.clone(),
            GatewayRecord {
                attachments: vec![vpc_id.to_string()],
            },
        );
        let stored = tags
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        world.ec2_tags.insert(id.clone(), stored);
        id
    }

    /// Whether the gateway still exists.
    #[must_use]
    pub fn gateway_exists(&self, gateway_id: &str) -> bool {
        self.lock().gateways.contains_key(gateway_id)
    }

    /// Number of gateways in the sandbox.
    #[must_use]
    pub fn gateway_count(&self) -> usize {
        self.lock().gateways.len()
    }

    /// Add a load balancer in one subnet.
    pub fn seed_load_balancer(&self, name: &str) {
        let mut world = self.lock();
        let dns_name = format!("{name}.{}.elb.sandbox", world.region);
        world.load_balancers.insert(
            name.to_string(),
            LoadBalancer {
                name: name.to_string(),
                scheme: "internet-facing".to_string(),
                subnets: vec!["subnet-seed".to_string()],
                security_groups: Vec::new(),
                dns_name,
            },
        );
    }

    /// Add an unversioned bucket in the sandbox region.
    pub fn seed_bucket(&self, name: &str) {
        let mut world = self.lock();
        let region = world.region.clone();
        world.buckets.insert(
            name.to_string(),
            Bucket {
                name: name.to_string(),
                region,
                versioning_enabled: false,
            },
        );
    }
}

// ============================================================================
// Compute
// ============================================================================

impl ComputeApi for SandboxCloud {
    async fn describe_vpc(&self, vpc_id: &str) -> ProviderResult<Option<Vpc>> {
        let world = self.enter("ec2:DescribeVpcs", false)?;
        Ok(world.vpcs.get(vpc_id).cloned())
    }

    async fn find_vpcs_by_name(&self, name: &str) -> ProviderResult<Vec<Vpc>> {
        let world = self.enter("ec2:DescribeVpcs", false)?;
        Ok(world
            .vpcs
            .values()
            .filter(|v| world.name_of(&v.id) == Some(name))
            .cloned()
            .collect())
    }

    async fn create_vpc(&self, cidr_block: &str, tenancy: InstanceTenancy) -> ProviderResult<Vpc> {
        const OP: &str = "ec2:CreateVpc";
        let mut world = self.enter(OP, true)?;
        if !cidr_block.contains('/') {
            return Err(fail(OP, "InvalidParameterValue", format!("invalid cidr block {cidr_block}")));
        }
        let id = world.next_id("vpc");
        let vpc = Vpc {
            id: id.clone(),
            cidr_block: cidr_block.to_string(),
            instance_tenancy: tenancy,
            enable_dns_support: true,
            enable_dns_hostnames: false,
        };
        world.vpcs.insert(id, vpc.clone());
        Ok(vpc)
    }

    async fn modify_vpc_attribute(&self, vpc_id: &str, attribute: VpcAttribute) -> ProviderResult<()> {
        const OP: &str = "ec2:ModifyVpcAttribute";
        let mut world = self.enter(OP, true)?;
        let vpc = world
            .vpcs
            .get_mut(vpc_id)
            .ok_or_else(|| fail(OP, "InvalidVpcID.NotFound", format!("The vpc ID '{vpc_id}' does not exist")))?;
        match attribute {
            VpcAttribute::EnableDnsSupport(v) => vpc.enable_dns_support = v,
            VpcAttribute::EnableDnsHostnames(v) => vpc.enable_dns_hostnames = v,
        }
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> ProviderResult<()> {
        const OP: &str = "ec2:DeleteVpc";
        let mut world = self.enter(OP, true)?;
        if !world.vpcs.contains_key(vpc_id) {
            return Err(fail(OP, "InvalidVpcID.NotFound", format!("The vpc ID '{vpc_id}' does not exist")));
        }
        if world
            .gateways
            .values()
            .any(|g| g.attachments.iter().any(|a| a == vpc_id))
        {
            return Err(fail(
                OP,
                "DependencyViolation",
                format!("The vpc '{vpc_id}' has dependencies and cannot be deleted."),
            ));
        }
        world.vpcs.remove(vpc_id);
        world.ec2_tags.remove(vpc_id);
        Ok(())
    }

    async fn describe_attached_gateways(&self, vpc_id: &str) -> ProviderResult<Vec<InternetGateway>> {
        let world = self.enter("ec2:DescribeInternetGateways", false)?;
        Ok(world
            .gateways
            .iter()
            .filter(|(_, g)| g.attachments.iter().any(|a| a == vpc_id))
            .map(|(id, g)| InternetGateway {
                id: id.clone(),
                attachments: g.attachments.clone(),
                tags: world.ec2_tags_of(id),
            })
            .collect())
    }

    async fn create_internet_gateway(&self) -> ProviderResult<InternetGateway> {
        let mut world = self.enter("ec2:CreateInternetGateway", true)?;
        let id = world.next_id("igw");
        world.gateways.insert(id.clone(), GatewayRecord::default());
        Ok(InternetGateway {
            id,
            attachments: Vec::new(),
            tags: Vec::new(),
        })
    }

    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ProviderResult<()> {
        const OP: &str = "ec2:AttachInternetGateway";
        let mut world = self.enter(OP, true)?;
        if !world.vpcs.contains_key(vpc_id) {
            return Err(fail(OP, "InvalidVpcID.NotFound", format!("The vpc ID '{vpc_id}' does not exist")));
        }
        let gateway = world.gateways.get_mut(gateway_id).ok_or_else(|| {
            fail(
                OP,
                "InvalidInternetGatewayID.NotFound",
                format!("The internetGateway ID '{gateway_id}' does not exist"),
            )
        })?;
        if !gateway.attachments.is_empty() {
            return Err(fail(
                OP,
                "Resource.AlreadyAssociated",
                format!("resource {gateway_id} is already attached"),
            ));
        }
        gateway.attachments.push(vpc_id.to_string());
        Ok(())
    }

    async fn detach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ProviderResult<()> {
        const OP: &str = "ec2:DetachInternetGateway";
        let mut world = self.enter(OP, true)?;
        let gateway = world.gateways.get_mut(gateway_id).ok_or_else(|| {
            fail(
                OP,
                "InvalidInternetGatewayID.NotFound",
                format!("The internetGateway ID '{gateway_id}' does not exist"),
            )
        })?;
        if !gateway.attachments.iter().any(|a| a == vpc_id) {
            return Err(fail(
                OP,
                "Gateway.NotAttached",
                format!("resource {gateway_id} is not attached to network {vpc_id}"),
            ));
        }
        gateway.attachments.retain(|a| a != vpc_id);
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> ProviderResult<()> {
        const OP: &str = "ec2:DeleteInternetGateway";
        let mut world = self.enter(OP, true)?;
        let Some(gateway) = world.gateways.get(gateway_id) else {
            return Err(fail(
                OP,
                "InvalidInternetGatewayID.NotFound",
                format!("The internetGateway ID '{gateway_id}' does not exist"),
            ));
        };
        if !gateway.attachments.is_empty() {
            return Err(fail(
                OP,
                "DependencyViolation",
                format!("The internetGateway '{gateway_id}' has dependencies and cannot be deleted."),
            ));
        }
        world.gateways.remove(gateway_id);
        world.ec2_tags.remove(gateway_id);
        Ok(())
    }

    async fn describe_volume(&self, volume_id: &str) -> ProviderResult<Option<Volume>> {
        let world = self.enter("ec2:DescribeVolumes", false)?;
        Ok(world.volumes.get(volume_id).cloned())
    }

    async fn find_volumes_by_name(&self, name: &str) -> ProviderResult<Vec<Volume>> {
        let world = self.enter("ec2:DescribeVolumes", false)?;
        Ok(world
            .volumes
            .values()
            .filter(|v| world.name_of(&v.id) == Some(name))
            .cloned()
            .collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> ProviderResult<Volume> {
        const OP: &str = "ec2:CreateVolume";
        let mut world = self.enter(OP, true)?;
        if spec.size == 0 {
            return Err(fail(OP, "InvalidParameterValue", "volume size must be positive"));
        }
        let id = world.next_id("vol");
        let volume = Volume {
            id: id.clone(),
            availability_zone: spec.availability_zone.clone(),
            size: spec.size,
            volume_type: spec.volume_type.clone(),
            iops: spec.iops,
            encrypted: spec.encrypted,
            snapshot_id: spec.snapshot_id.clone(),
        };
        world.volumes.insert(id, volume.clone());
        Ok(volume)
    }

    async fn modify_volume(&self, volume_id: &str, change: VolumeChange) -> ProviderResult<()> {
        const OP: &str = "ec2:ModifyVolume";
        let mut world = self.enter(OP, true)?;
        let volume = world.volumes.get_mut(volume_id).ok_or_else(|| {
            fail(OP, "InvalidVolume.NotFound", format!("The volume '{volume_id}' does not exist."))
        })?;
        match change {
            VolumeChange::Size(size) if size < volume.size => {
                return Err(fail(
                    OP,
                    "InvalidParameterValue",
                    format!("new size {size} is smaller than the current size {}", volume.size),
                ));
            }
            VolumeChange::Size(size) => volume.size = size,
            VolumeChange::VolumeType(t) => volume.volume_type = t,
            VolumeChange::Iops(iops) => volume.iops = Some(iops),
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()> {
        const OP: &str = "ec2:DeleteVolume";
        let mut world = self.enter(OP, true)?;
        if world.volumes.remove(volume_id).is_none() {
            return Err(fail(OP, "InvalidVolume.NotFound", format!("The volume '{volume_id}' does not exist.")));
        }
        world.ec2_tags.remove(volume_id);
        Ok(())
    }

    async fn describe_tags(&self, resource_id: &str) -> ProviderResult<Vec<Tag>> {
        let world = self.enter("ec2:DescribeTags", false)?;
        Ok(world.ec2_tags_of(resource_id))
    }

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> ProviderResult<()> {
        const OP: &str = "ec2:CreateTags";
        let mut world = self.enter(OP, true)?;
        if !world.ec2_resource_exists(resource_id) {
            return Err(fail(OP, "InvalidID", format!("The ID '{resource_id}' is not valid")));
        }
        let stored = world.ec2_tags.entry(resource_id.to_string()).or_default();
        for tag in tags {
            stored.insert(tag.key.clone(), tag.value.clone());
        }
        Ok(())
    }

    async fn delete_tags(&self, resource_id: &str, keys: &[String]) -> ProviderResult<()> {
        const OP: &str = "ec2:DeleteTags";
        let mut world = self.enter(OP, true)?;
        if !world.ec2_resource_exists(resource_id) {
            return Err(fail(OP, "InvalidID", format!("The ID '{resource_id}' is not valid")));
        }
        if let Some(stored) = world.ec2_tags.get_mut(resource_id) {
            for key in keys {
                stored.remove(key);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Autoscaling
// ============================================================================

impl AutoScalingApi for SandboxCloud {
    async fn describe_auto_scaling_group(&self, name: &str) -> ProviderResult<Option<AutoScalingGroup>> {
        let world = self.enter("autoscaling:DescribeAutoScalingGroups", false)?;
        Ok(world.groups.get(name).cloned())
    }

    async fn create_auto_scaling_group(&self, group: &AutoScalingGroup) -> ProviderResult<()> {
        const OP: &str = "autoscaling:CreateAutoScalingGroup";
        let mut world = self.enter(OP, true)?;
        if world.groups.contains_key(&group.name) {
            return Err(fail(OP, "AlreadyExists", format!("AutoScalingGroup by this name already exists: {}", group.name)));
        }
        if group.min_size > group.max_size {
            return Err(fail(OP, "ValidationError", "min size must not exceed max size"));
        }
        world.groups.insert(group.name.clone(), group.clone());
        Ok(())
    }

    async fn update_auto_scaling_group(&self, name: &str, update: &AutoScalingGroupUpdate) -> ProviderResult<()> {
        const OP: &str = "autoscaling:UpdateAutoScalingGroup";
        let mut world = self.enter(OP, true)?;
        let group = world
            .groups
            .get_mut(name)
            .ok_or_else(|| fail(OP, "ValidationError", format!("AutoScalingGroup name not found - {name}")))?;
        let mut next = group.clone();
        if let Some(v) = &update.launch_configuration {
            next.launch_configuration.clone_from(v);
        }
        if let Some(v) = update.min_size {
            next.min_size = v;
        }
        if let Some(v) = update.max_size {
            next.max_size = v;
        }
        if let Some(v) = update.desired_capacity {
            next.desired_capacity = Some(v);
        }
        if let Some(v) = &update.availability_zones {
            next.availability_zones.clone_from(v);
        }
        if next.min_size > next.max_size {
            return Err(fail(OP, "ValidationError", "min size must not exceed max size"));
        }
        *group = next;
        Ok(())
    }

    async fn delete_auto_scaling_group(&self, name: &str, force: bool) -> ProviderResult<()> {
        const OP: &str = "autoscaling:DeleteAutoScalingGroup";
        let mut world = self.enter(OP, true)?;
        let Some(group) = world.groups.get(name) else {
            return Err(fail(OP, "ValidationError", format!("AutoScalingGroup name not found - {name}")));
        };
        if !force && group.desired_capacity.unwrap_or(group.min_size) > 0 {
            return Err(fail(OP, "ResourceInUse", "You cannot delete an AutoScalingGroup while there are instances"));
        }
        world.groups.remove(name);
        world.group_tags.remove(name);
        Ok(())
    }

    async fn describe_group_tags(&self, name: &str) -> ProviderResult<Vec<GroupTag>> {
        let world = self.enter("autoscaling:DescribeTags", false)?;
        Ok(world
            .group_tags
            .get(name)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_or_update_group_tags(&self, name: &str, tags: &[GroupTag]) -> ProviderResult<()> {
        const OP: &str = "autoscaling:CreateOrUpdateTags";
        let mut world = self.enter(OP, true)?;
        if !world.groups.contains_key(name) {
            return Err(fail(OP, "ValidationError", format!("AutoScalingGroup name not found - {name}")));
        }
        let stored = world.group_tags.entry(name.to_string()).or_default();
        for tag in tags {
            stored.insert(tag.key.clone(), tag.clone());
        }
        Ok(())
    }

    async fn delete_group_tags(&self, name: &str, tags: &[GroupTag]) -> ProviderResult<()> {
        const OP: &str = "autoscaling:DeleteTags";
        let mut world = self.enter(OP, true)?;
        if !world.groups.contains_key(name) {
            return Err(fail(OP, "ValidationError", format!("AutoScalingGroup name not found - {name}")));
        }
        if let Some(stored) = world.group_tags.get_mut(name) {
            for tag in tags {
                stored.remove(&tag.key);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Load balancing
// ============================================================================

fn lb_not_found(op: &str, name: &str) -> ProviderError {
    fail(op, "LoadBalancerNotFound", format!("There is no ACTIVE Load Balancer named '{name}'"))
}

impl LoadBalancerApi for SandboxCloud {
    async fn describe_load_balancer(&self, name: &str) -> ProviderResult<Option<LoadBalancer>> {
        let world = self.enter("elb:DescribeLoadBalancers", false)?;
        Ok(world.load_balancers.get(name).cloned())
    }

    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> ProviderResult<LoadBalancer> {
        const OP: &str = "elb:CreateLoadBalancer";
        let mut world = self.enter(OP, true)?;
        if world.load_balancers.contains_key(&spec.name) {
            return Err(fail(OP, "DuplicateLoadBalancerName", format!("Load balancer name '{}' already exists", spec.name)));
        }
        if spec.subnets.is_empty() {
            return Err(fail(OP, "ValidationError", "at least one subnet is required"));
        }
        let balancer = LoadBalancer {
            name: spec.name.clone(),
            scheme: spec.scheme.clone(),
            subnets: spec.subnets.clone(),
            security_groups: spec.security_groups.clone(),
            dns_name: format!("{}.{}.elb.sandbox", spec.name, world.region),
        };
        world.load_balancers.insert(spec.name.clone(), balancer.clone());
        Ok(balancer)
    }

    async fn attach_to_subnets(&self, name: &str, subnets: &[String]) -> ProviderResult<()> {
        const OP: &str = "elb:AttachLoadBalancerToSubnets";
        let mut world = self.enter(OP, true)?;
        let balancer = world.load_balancers.get_mut(name).ok_or_else(|| lb_not_found(OP, name))?;
        for subnet in subnets {
            if !balancer.subnets.contains(subnet) {
                balancer.subnets.push(subnet.clone());
            }
        }
        Ok(())
    }

    async fn detach_from_subnets(&self, name: &str, subnets: &[String]) -> ProviderResult<()> {
        const OP: &str = "elb:DetachLoadBalancerFromSubnets";
        let mut world = self.enter(OP, true)?;
        let balancer = world.load_balancers.get_mut(name).ok_or_else(|| lb_not_found(OP, name))?;
        if balancer.subnets.iter().all(|s| subnets.contains(s)) {
            return Err(fail(OP, "InvalidConfigurationRequest", "a load balancer needs at least one subnet"));
        }
        balancer.subnets.retain(|s| !subnets.contains(s));
        Ok(())
    }

    async fn apply_security_groups(&self, name: &str, groups: &[String]) -> ProviderResult<()> {
        const OP: &str = "elb:ApplySecurityGroupsToLoadBalancer";
        let mut world = self.enter(OP, true)?;
        let balancer = world.load_balancers.get_mut(name).ok_or_else(|| lb_not_found(OP, name))?;
        balancer.security_groups = groups.to_vec();
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> ProviderResult<()> {
        let mut world = self.enter("elb:DeleteLoadBalancer", true)?;
        world.load_balancers.remove(name);
        world.lb_tags.remove(name);
        Ok(())
    }

    async fn describe_load_balancer_tags(&self, names: &[String]) -> ProviderResult<Vec<TagDescription>> {
        const OP: &str = "elb:DescribeTags";
        let world = self.enter(OP, false)?;
        names
            .iter()
            .map(|name| {
                if !world.load_balancers.contains_key(name) {
                    return Err(lb_not_found(OP, name));
                }
                let tags = world
                    .lb_tags
                    .get(name)
                    .map(|t| t.iter().map(|(k, v)| Tag::new(k, v)).collect())
                    .unwrap_or_default();
                Ok(TagDescription {
                    load_balancer_name: name.clone(),
                    tags,
                })
            })
            .collect()
    }

    async fn add_load_balancer_tags(&self, name: &str, tags: &[Tag]) -> ProviderResult<()> {
        const OP: &str = "elb:AddTags";
        let mut world = self.enter(OP, true)?;
        if !world.load_balancers.contains_key(name) {
            return Err(lb_not_found(OP, name));
        }
        let stored = world.lb_tags.entry(name.to_string()).or_default();
        for tag in tags {
            stored.insert(tag.key.clone(), tag.value.clone());
        }
        Ok(())
    }

    async fn remove_load_balancer_tags(&self, name: &str, keys: &[String]) -> ProviderResult<()> {
        const OP: &str = "elb:RemoveTags";
        let mut world = self.enter(OP, true)?;
        if !world.load_balancers.contains_key(name) {
            return Err(lb_not_found(OP, name));
        }
        if let Some(stored) = world.lb_tags.get_mut(name) {
            for key in keys {
                stored.remove(key);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Relational store + identity
// ============================================================================

fn db_not_found(op: &str, what: &str) -> ProviderError {
    fail(op, "DBInstanceNotFound", format!("DBInstance {what} not found."))
}

impl RelationalApi for SandboxCloud {
    async fn describe_db_instance(&self, identifier: &str) -> ProviderResult<Option<DbInstance>> {
        let world = self.enter("rds:DescribeDBInstances", false)?;
        Ok(world.db_instances.get(identifier).cloned())
    }

    async fn create_db_instance(&self, spec: &DbInstanceSpec) -> ProviderResult<DbInstance> {
        const OP: &str = "rds:CreateDBInstance";
        let mut world = self.enter(OP, true)?;
        if world.db_instances.contains_key(&spec.identifier) {
            return Err(fail(OP, "DBInstanceAlreadyExists", format!("DB instance already exists: {}", spec.identifier)));
        }
        if spec.master_password.len() < 8 {
            return Err(fail(OP, "InvalidParameterValue", "the master password must have at least 8 characters"));
        }
        let instance = DbInstance {
            identifier: spec.identifier.clone(),
            engine: spec.engine.clone(),
            engine_version: spec
                .engine_version
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            instance_class: spec.instance_class.clone(),
            allocated_storage: spec.allocated_storage,
            multi_az: spec.multi_az,
            master_username: spec.master_username.clone(),
        };
        world.db_instances.insert(spec.identifier.clone(), instance.clone());
        Ok(instance)
    }

    async fn modify_db_instance(&self, identifier: &str, modification: DbModification) -> ProviderResult<()> {
        const OP: &str = "rds:ModifyDBInstance";
        let mut world = self.enter(OP, true)?;
        let instance = world
            .db_instances
            .get_mut(identifier)
            .ok_or_else(|| db_not_found(OP, identifier))?;
        match modification {
            DbModification::AllocatedStorage(size) if size < instance.allocated_storage => {
                return Err(fail(OP, "InvalidParameterCombination", "allocated storage cannot shrink"));
            }
            DbModification::AllocatedStorage(size) => instance.allocated_storage = size,
            DbModification::EngineVersion(v) => instance.engine_version = v,
            DbModification::InstanceClass(c) => instance.instance_class = c,
            DbModification::MultiAz(m) => instance.multi_az = m,
        }
        Ok(())
    }

    async fn delete_db_instance(&self, identifier: &str, skip_final_snapshot: bool) -> ProviderResult<()> {
        const OP: &str = "rds:DeleteDBInstance";
        let mut world = self.enter(OP, true)?;
        if world.db_instances.remove(identifier).is_none() {
            return Err(db_not_found(OP, identifier));
        }
        let arn = world.db_arn(identifier);
        world.rds_tags.remove(&arn);
        if !skip_final_snapshot {
            world.final_snapshots.push(identifier.to_string());
        }
        Ok(())
    }

    async fn list_tags_for_resource(&self, arn: &str) -> ProviderResult<Vec<OptionalTag>> {
        const OP: &str = "rds:ListTagsForResource";
        let world = self.enter(OP, false)?;
        if !world.db_with_arn(arn) {
            return Err(db_not_found(OP, arn));
        }
        Ok(world
            .rds_tags
            .get(arn)
            .map(|t| {
                t.iter()
                    .map(|(k, v)| OptionalTag {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_tags_to_resource(&self, arn: &str, tags: &[OptionalTag]) -> ProviderResult<()> {
        const OP: &str = "rds:AddTagsToResource";
        let mut world = self.enter(OP, true)?;
        if !world.db_with_arn(arn) {
            return Err(db_not_found(OP, arn));
        }
        let stored = world.rds_tags.entry(arn.to_string()).or_default();
        for tag in tags {
            stored.insert(tag.key.clone(), tag.value.clone());
        }
        Ok(())
    }

    async fn remove_tags_from_resource(&self, arn: &str, keys: &[String]) -> ProviderResult<()> {
        const OP: &str = "rds:RemoveTagsFromResource";
        let mut world = self.enter(OP, true)?;
        if !world.db_with_arn(arn) {
            return Err(db_not_found(OP, arn));
        }
        if let Some(stored) = world.rds_tags.get_mut(arn) {
            for key in keys {
                stored.remove(key);
            }
        }
        Ok(())
    }
}

impl IdentityApi for SandboxCloud {
    async fn get_user(&self) -> ProviderResult<IdentityUser> {
        const OP: &str = "iam:GetUser";
        let world = self.enter(OP, false)?;
        if let Some(caller) = &world.denied_identity {
            return Err(fail(
                OP,
                ACCESS_DENIED,
                format!("User: {caller} is not authorized to perform: iam:GetUser on resource: {caller}"),
            ));
        }
        Ok(IdentityUser {
            arn: format!("arn:aws:iam::{}:user/sandbox", world.account_id),
        })
    }
}

// ============================================================================
// Search index
// ============================================================================

fn domain_not_found(op: &str, what: &str) -> ProviderError {
    fail(op, RESOURCE_NOT_FOUND, format!("Domain not found: {what}"))
}

impl SearchApi for SandboxCloud {
    async fn describe_domain(&self, name: &str) -> ProviderResult<Option<SearchDomain>> {
        let world = self.enter("es:DescribeDomain", false)?;
        Ok(world.domains.get(name).cloned())
    }

    async fn create_domain(&self, spec: &SearchDomainSpec) -> ProviderResult<SearchDomain> {
        const OP: &str = "es:CreateDomain";
        let mut world = self.enter(OP, true)?;
        if world.domains.contains_key(&spec.name) {
            return Err(fail(OP, "ResourceAlreadyExistsException", format!("domain {} already exists", spec.name)));
        }
        if spec.instance_count == 0 {
            return Err(fail(OP, "ValidationException", "instance count must be positive"));
        }
        let domain = SearchDomain {
            name: spec.name.clone(),
            arn: world.domain_arn(&spec.name),
            engine_version: spec.engine_version.clone(),
            instance_type: spec.instance_type.clone(),
            instance_count: spec.instance_count,
        };
        world.domains.insert(spec.name.clone(), domain.clone());
        Ok(domain)
    }

    async fn update_domain_config(&self, name: &str, change: SearchDomainChange) -> ProviderResult<()> {
        const OP: &str = "es:UpdateDomainConfig";
        let mut world = self.enter(OP, true)?;
        let domain = world.domains.get_mut(name).ok_or_else(|| domain_not_found(OP, name))?;
        match change {
            SearchDomainChange::InstanceType(t) => domain.instance_type = t,
            SearchDomainChange::InstanceCount(n) => domain.instance_count = n,
        }
        Ok(())
    }

    async fn delete_domain(&self, name: &str) -> ProviderResult<()> {
        const OP: &str = "es:DeleteDomain";
        let mut world = self.enter(OP, true)?;
        let domain = world.domains.remove(name).ok_or_else(|| domain_not_found(OP, name))?;
        world.domain_tags.remove(&domain.arn);
        Ok(())
    }

    async fn list_domain_tags(&self, arn: &str) -> ProviderResult<Vec<OptionalTag>> {
        const OP: &str = "es:ListTags";
        let world = self.enter(OP, false)?;
        if !world.domain_with_arn(arn) {
            return Err(domain_not_found(OP, arn));
        }
        Ok(world
            .domain_tags
            .get(arn)
            .map(|t| {
                t.iter()
                    .map(|(k, v)| OptionalTag {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_domain_tags(&self, arn: &str, tags: &[OptionalTag]) -> ProviderResult<()> {
        const OP: &str = "es:AddTags";
        let mut world = self.enter(OP, true)?;
        if !world.domain_with_arn(arn) {
            return Err(domain_not_found(OP, arn));
        }
        let stored = world.domain_tags.entry(arn.to_string()).or_default();
        for tag in tags {
            stored.insert(tag.key.clone(), tag.value.clone());
        }
        Ok(())
    }

    async fn remove_domain_tags(&self, arn: &str, keys: &[String]) -> ProviderResult<()> {
        const OP: &str = "es:RemoveTags";
        let mut world = self.enter(OP, true)?;
        if !world.domain_with_arn(arn) {
            return Err(domain_not_found(OP, arn));
        }
        if let Some(stored) = world.domain_tags.get_mut(arn) {
            for key in keys {
                stored.remove(key);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Object store
// ============================================================================

fn no_such_bucket(op: &str, name: &str) -> ProviderError {
    fail(op, "NoSuchBucket", format!("The specified bucket does not exist: {name}"))
}

impl ObjectStoreApi for SandboxCloud {
    async fn describe_bucket(&self, name: &str) -> ProviderResult<Option<Bucket>> {
        let world = self.enter("s3:HeadBucket", false)?;
        Ok(world.buckets.get(name).cloned())
    }

    async fn create_bucket(&self, name: &str, region: &str) -> ProviderResult<Bucket> {
        const OP: &str = "s3:CreateBucket";
        let mut world = self.enter(OP, true)?;
        if world.buckets.contains_key(name) {
            return Err(fail(OP, "BucketAlreadyOwnedByYou", format!("bucket {name} already exists")));
        }
        let bucket = Bucket {
            name: name.to_string(),
            region: region.to_string(),
            versioning_enabled: false,
        };
        world.buckets.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    async fn put_bucket_versioning(&self, name: &str, enabled: bool) -> ProviderResult<()> {
        const OP: &str = "s3:PutBucketVersioning";
        let mut world = self.enter(OP, true)?;
        let bucket = world.buckets.get_mut(name).ok_or_else(|| no_such_bucket(OP, name))?;
        bucket.versioning_enabled = enabled;
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> ProviderResult<()> {
        const OP: &str = "s3:DeleteBucket";
        let mut world = self.enter(OP, true)?;
        if world.buckets.remove(name).is_none() {
            return Err(no_such_bucket(OP, name));
        }
        world.bucket_tags.remove(name);
        Ok(())
    }

    async fn get_bucket_tagging(&self, name: &str) -> ProviderResult<Vec<Tag>> {
        const OP: &str = "s3:GetBucketTagging";
        let world = self.enter(OP, false)?;
        if !world.buckets.contains_key(name) {
            return Err(no_such_bucket(OP, name));
        }
        match world.bucket_tags.get(name) {
            Some(tags) if !tags.is_empty() => Ok(tags.clone()),
            _ => Err(fail(OP, NO_SUCH_TAG_SET, "The TagSet does not exist")),
        }
    }

    async fn put_bucket_tagging(&self, name: &str, tags: &[Tag]) -> ProviderResult<()> {
        const OP: &str = "s3:PutBucketTagging";
        let mut world = self.enter(OP, true)?;
        if !world.buckets.contains_key(name) {
            return Err(no_such_bucket(OP, name));
        }
        if tags.is_empty() {
            world.bucket_tags.remove(name);
        } else {
            world.bucket_tags.insert(name.to_string(), tags.to_vec());
        }
        Ok(())
    }

    async fn delete_bucket_tagging(&self, name: &str) -> ProviderResult<()> {
        const OP: &str = "s3:DeleteBucketTagging";
        let mut world = self.enter(OP, true)?;
        if !world.buckets.contains_key(name) {
            return Err(no_such_bucket(OP, name));
        }
        world.bucket_tags.remove(name);
        Ok(())
    }
}

// ============================================================================
// DNS
// ============================================================================

fn same_record(a: &RecordSet, name: &str, record_type: &str) -> bool {
    a.name == name && a.record_type == record_type
}

impl DnsApi for SandboxCloud {
    async fn list_record_sets(&self, zone_id: &str) -> ProviderResult<Vec<RecordSet>> {
        const OP: &str = "route53:ListResourceRecordSets";
        let world = self.enter(OP, false)?;
        let zone = world
            .zones
            .get(zone_id)
            .ok_or_else(|| fail(OP, "NoSuchHostedZone", format!("No hosted zone found with ID: {zone_id}")))?;
        Ok(zone.records.clone())
    }

    async fn change_record_sets(&self, zone_id: &str, changes: &[RecordChange]) -> ProviderResult<()> {
        const OP: &str = "route53:ChangeResourceRecordSets";
        let mut world = self.enter(OP, true)?;
        let zone = world
            .zones
            .get_mut(zone_id)
            .ok_or_else(|| fail(OP, "NoSuchHostedZone", format!("No hosted zone found with ID: {zone_id}")))?;

        // The batch applies to a copy and is committed only if every change succeeds.
        let mut records = zone.records.clone();
        for change in changes {
            let rs = &change.record_set;
            let existing = records
                .iter()
                .position(|r| same_record(r, &rs.name, &rs.record_type));
            match (change.action, existing) {
                (ChangeAction::Create, Some(_)) => {
                    return Err(fail(
                        OP,
                        "InvalidChangeBatch",
                        format!("Tried to create resource record set {} type {} but it already exists", rs.name, rs.record_type),
                    ));
                }
                (ChangeAction::Create | ChangeAction::Upsert, None) => records.push(rs.clone()),
                (ChangeAction::Upsert, Some(i)) => records[i] = rs.clone(),
                (ChangeAction::Delete, Some(i)) if records[i] == *rs => {
                    records.remove(i);
                }
                (ChangeAction::Delete, _) => {
                    return Err(fail(
                        OP,
                        "InvalidChangeBatch",
                        format!("Tried to delete resource record set {} type {} but the values provided do not match", rs.name, rs.record_type),
                    ));
                }
            }
        }
        zone.records = records;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_calls_are_still_recorded() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        cloud.fail_next("ec2:CreateVpc", "RequestLimitExceeded");

        let first = cloud.create_vpc("10.0.0.0/16", InstanceTenancy::Default).await;
        let second = cloud.create_vpc("10.0.0.0/16", InstanceTenancy::Default).await;

        assert_eq!(first.err().map(|e| e.code), Some("RequestLimitExceeded".to_string()));
        assert!(second.is_ok());
        assert_eq!(cloud.mutating_calls().len(), 2);
    }

    #[tokio::test]
    async fn network_with_attached_gateway_cannot_be_deleted() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let vpc = cloud
            .create_vpc("10.0.0.0/16", InstanceTenancy::Default)
            .await
            .map(|v| v.id)
            .unwrap_or_default();
        cloud.seed_gateway(&vpc, &[]);

        let err = cloud.delete_vpc(&vpc).await.err();
        assert_eq!(err.map(|e| e.code), Some("DependencyViolation".to_string()));
    }

    #[tokio::test]
    async fn untagged_bucket_reports_no_tag_set() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        cloud.seed_bucket("logs");
        let err = cloud.get_bucket_tagging("logs").await.err();
        assert_eq!(err.map(|e| e.code), Some(NO_SUCH_TAG_SET.to_string()));
    }

    #[tokio::test]
    async fn change_batch_is_all_or_nothing() {
        let cloud = SandboxCloud::new("us-east-1", "123456789012");
        let zone = cloud.create_hosted_zone("example.com.");
        let record = RecordSet {
            name: "a.example.com.".into(),
            record_type: "A".into(),
            ttl: 60,
            values: vec!["10.0.0.1".into()],
        };
        let changes = [
            RecordChange {
                action: ChangeAction::Create,
                record_set: record.clone(),
            },
            RecordChange {
                action: ChangeAction::Create,
                record_set: record,
            },
        ];

        assert!(cloud.change_record_sets(&zone, &changes).await.is_err());
        assert_eq!(cloud.list_record_sets(&zone).await.map(|r| r.len()), Ok(0));
    }

    #[tokio::test]
    async fn world_survives_a_save_and_open() {
        let dir = tempfile::tempdir().ok();
        let path = dir
            .as_ref()
            .map(|d| d.path().join("sandbox.json"))
            .unwrap_or_default();
        let cloud = SandboxCloud::new("eu-west-1", "123456789012");
        cloud.seed_bucket("logs");
        cloud.fail_next("s3:HeadBucket", "Boom");
        assert!(cloud.save(&path).is_ok());

        let reopened = SandboxCloud::open(&path, "us-east-1", "000000000000").ok();
        let bucket = match &reopened {
            Some(c) => c.describe_bucket("logs").await.ok().flatten(),
            None => None,
        };
        assert_eq!(bucket.map(|b| b.region), Some("eu-west-1".to_string()));
    }
}
