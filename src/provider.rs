//! Provider client contracts.
//!
//! Unique responsibility: describe the remote calls the convergers and tag
//! strategies consume, one trait per provider service, together with the
//! plain data the calls exchange.
//!
//! Non-goals:
//! - Authentication, connection setup, retries and timeouts. Implementers
//!   own all of that; a failed round trip comes back as a [`ProviderError`].
//! - Wire formats. The types here are the shape the core needs, not the
//!   provider's JSON or XML.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code returned by the object store when a bucket has no tags.
pub const NO_SUCH_TAG_SET: &str = "NoSuchTagSet";

/// Error code returned by the search service for an unknown ARN.
pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";

/// Error code returned by the identity service for a forbidden call.
pub const ACCESS_DENIED: &str = "AccessDenied";

/// A failed remote call, as surfaced by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{service} error {code}: {message}")]
pub struct ProviderError {
    /// Service that produced the error, e.g. `ec2`.
    pub service: String,
    /// Provider error code, e.g. `NoSuchTagSet`.
    pub code: String,
    /// Human readable message from the provider.
    pub message: String,
}

impl ProviderError {
    /// Build a provider error.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the error carries the given code.
    #[must_use]
    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }
}

/// Result alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

// ============================================================================
// Shared tag shapes
// ============================================================================

/// A tag whose value is always present (EC2, load balancer, object store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value, possibly empty.
    pub value: String,
}

impl Tag {
    /// Build a tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A tag whose value may be omitted (relational store, search index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalTag {
    /// Tag key.
    pub key: String,
    /// Tag value, omitted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// An autoscaling group tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
    /// Whether instances launched by the group inherit the tag.
    pub propagate_at_launch: bool,
}

// ============================================================================
// Compute (networks, gateways, volumes)
// ============================================================================

/// Tenancy class of a virtual network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceTenancy {
    /// Shared hardware.
    #[default]
    Default,
    /// Dedicated hardware.
    Dedicated,
}

impl InstanceTenancy {
    /// Provider spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Dedicated => "dedicated",
        }
    }
}

/// A virtual network as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpc {
    /// Network id.
    pub id: String,
    /// Primary address block.
    pub cidr_block: String,
    /// Tenancy class.
    pub instance_tenancy: InstanceTenancy,
    /// DNS resolution flag.
    pub enable_dns_support: bool,
    /// DNS hostnames flag.
    pub enable_dns_hostnames: bool,
}

/// A single-attribute network modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpcAttribute {
    /// Set the DNS resolution flag.
    EnableDnsSupport(bool),
    /// Set the DNS hostnames flag.
    EnableDnsHostnames(bool),
}

/// An internet gateway and where it is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternetGateway {
    /// Gateway id.
    pub id: String,
    /// Ids of the networks the gateway is attached to.
    pub attachments: Vec<String>,
    /// Tags on the gateway.
    pub tags: Vec<Tag>,
}

impl InternetGateway {
    /// Value of a gateway tag.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// A block volume as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume id.
    pub id: String,
    /// Availability zone.
    pub availability_zone: String,
    /// Size in GiB.
    pub size: u32,
    /// Volume type, e.g. `gp3`.
    pub volume_type: String,
    /// Provisioned IOPS, when the type supports it.
    pub iops: Option<u32>,
    /// Encryption at rest.
    pub encrypted: bool,
    /// Snapshot the volume was created from.
    pub snapshot_id: Option<String>,
}

/// Parameters of a volume creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Availability zone.
    pub availability_zone: String,
    /// Size in GiB.
    pub size: u32,
    /// Volume type.
    pub volume_type: String,
    /// Provisioned IOPS.
    pub iops: Option<u32>,
    /// Encryption at rest.
    pub encrypted: bool,
    /// Source snapshot.
    pub snapshot_id: Option<String>,
}

/// A single-attribute volume modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeChange {
    /// Resize the volume.
    Size(u32),
    /// Change the volume type.
    VolumeType(String),
    /// Change the provisioned IOPS.
    Iops(u32),
}

/// Compute service: networks, gateways, volumes and their tags.
#[allow(async_fn_in_trait)]
pub trait ComputeApi {
    /// Describe a network by id; `None` if it does not exist.
    async fn describe_vpc(&self, vpc_id: &str) -> ProviderResult<Option<Vpc>>;
    /// Networks whose `Name` tag equals `name`.
    async fn find_vpcs_by_name(&self, name: &str) -> ProviderResult<Vec<Vpc>>;
    /// Create a network.
    async fn create_vpc(&self, cidr_block: &str, tenancy: InstanceTenancy) -> ProviderResult<Vpc>;
    /// Change one network attribute.
    async fn modify_vpc_attribute(&self, vpc_id: &str, attribute: VpcAttribute)
    -> ProviderResult<()>;
    /// Delete a network.
    async fn delete_vpc(&self, vpc_id: &str) -> ProviderResult<()>;

    /// Gateways attached to the given network.
    async fn describe_attached_gateways(&self, vpc_id: &str)
    -> ProviderResult<Vec<InternetGateway>>;
    /// Create a detached gateway.
    async fn create_internet_gateway(&self) -> ProviderResult<InternetGateway>;
    /// Attach a gateway to a network.
    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ProviderResult<()>;
    /// Detach a gateway from a network.
    async fn detach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ProviderResult<()>;
    /// Delete a detached gateway.
    async fn delete_internet_gateway(&self, gateway_id: &str) -> ProviderResult<()>;

    /// Describe a volume by id; `None` if it does not exist.
    async fn describe_volume(&self, volume_id: &str) -> ProviderResult<Option<Volume>>;
    /// Volumes whose `Name` tag equals `name`.
    async fn find_volumes_by_name(&self, name: &str) -> ProviderResult<Vec<Volume>>;
    /// Create a volume.
    async fn create_volume(&self, spec: &VolumeSpec) -> ProviderResult<Volume>;
    /// Change one volume attribute.
    async fn modify_volume(&self, volume_id: &str, change: VolumeChange) -> ProviderResult<()>;
    /// Delete a volume.
    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()>;

    /// Tags filtered by resource id.
    async fn describe_tags(&self, resource_id: &str) -> ProviderResult<Vec<Tag>>;
    /// Create or overwrite tags on a resource.
    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> ProviderResult<()>;
    /// Delete tags by key.
    async fn delete_tags(&self, resource_id: &str, keys: &[String]) -> ProviderResult<()>;
}

// ============================================================================
// Autoscaling
// ============================================================================

/// An autoscaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoScalingGroup {
    /// Group name.
    pub name: String,
    /// Launch configuration name.
    pub launch_configuration: String,
    /// Minimum size.
    pub min_size: u32,
    /// Maximum size.
    pub max_size: u32,
    /// Desired capacity, when pinned.
    pub desired_capacity: Option<u32>,
    /// Zones the group spans.
    pub availability_zones: Vec<String>,
}

/// Fields of an autoscaling group update; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoScalingGroupUpdate {
    /// New launch configuration.
    pub launch_configuration: Option<String>,
    /// New minimum size.
    pub min_size: Option<u32>,
    /// New maximum size.
    pub max_size: Option<u32>,
    /// New desired capacity.
    pub desired_capacity: Option<u32>,
    /// New zone list.
    pub availability_zones: Option<Vec<String>>,
}

impl AutoScalingGroupUpdate {
    /// Whether the update changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.launch_configuration.is_none()
            && self.min_size.is_none()
            && self.max_size.is_none()
            && self.desired_capacity.is_none()
            && self.availability_zones.is_none()
    }
}

/// Autoscaling service.
#[allow(async_fn_in_trait)]
pub trait AutoScalingApi {
    /// Describe a group; `None` if it does not exist.
    async fn describe_auto_scaling_group(&self, name: &str)
    -> ProviderResult<Option<AutoScalingGroup>>;
    /// Create a group.
    async fn create_auto_scaling_group(&self, group: &AutoScalingGroup) -> ProviderResult<()>;
    /// Update a group.
    async fn update_auto_scaling_group(
        &self,
        name: &str,
        update: &AutoScalingGroupUpdate,
    ) -> ProviderResult<()>;
    /// Delete a group, terminating its instances when `force` is set.
    async fn delete_auto_scaling_group(&self, name: &str, force: bool) -> ProviderResult<()>;
    /// Tags filtered by group name.
    async fn describe_group_tags(&self, name: &str) -> ProviderResult<Vec<GroupTag>>;
    /// Create or overwrite group tags.
    async fn create_or_update_group_tags(&self, name: &str, tags: &[GroupTag])
    -> ProviderResult<()>;
    /// Delete group tags.
    async fn delete_group_tags(&self, name: &str, tags: &[GroupTag]) -> ProviderResult<()>;
}

// ============================================================================
// Load balancing
// ============================================================================

/// A classic load balancer (access point).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    /// Access point name.
    pub name: String,
    /// `internet-facing` or `internal`.
    pub scheme: String,
    /// Attached subnets.
    pub subnets: Vec<String>,
    /// Applied security groups.
    pub security_groups: Vec<String>,
    /// Public DNS name.
    pub dns_name: String,
}

/// Parameters of a load balancer creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerSpec {
    /// Access point name.
    pub name: String,
    /// Scheme.
    pub scheme: String,
    /// Subnets.
    pub subnets: Vec<String>,
    /// Security groups.
    pub security_groups: Vec<String>,
}

/// Tags of one load balancer, as returned in a tag description list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescription {
    /// Access point name.
    pub load_balancer_name: String,
    /// Its tags.
    pub tags: Vec<Tag>,
}

/// Load balancing service.
#[allow(async_fn_in_trait)]
pub trait LoadBalancerApi {
    /// Describe a load balancer; `None` if it does not exist.
    async fn describe_load_balancer(&self, name: &str) -> ProviderResult<Option<LoadBalancer>>;
    /// Create a load balancer.
    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> ProviderResult<LoadBalancer>;
    /// Attach subnets.
    async fn attach_to_subnets(&self, name: &str, subnets: &[String]) -> ProviderResult<()>;
    /// Detach subnets.
    async fn detach_from_subnets(&self, name: &str, subnets: &[String]) -> ProviderResult<()>;
    /// Replace the applied security groups.
    async fn apply_security_groups(&self, name: &str, groups: &[String]) -> ProviderResult<()>;
    /// Delete a load balancer.
    async fn delete_load_balancer(&self, name: &str) -> ProviderResult<()>;
    /// Tag descriptions for the named access points.
    async fn describe_load_balancer_tags(&self, names: &[String])
    -> ProviderResult<Vec<TagDescription>>;
    /// Add or overwrite tags.
    async fn add_load_balancer_tags(&self, name: &str, tags: &[Tag]) -> ProviderResult<()>;
    /// Remove tags by key.
    async fn remove_load_balancer_tags(&self, name: &str, keys: &[String]) -> ProviderResult<()>;
}

// ============================================================================
// Relational store + identity
// ============================================================================

/// A database instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInstance {
    /// Instance identifier.
    pub identifier: String,
    /// Engine, e.g. `postgres`.
    pub engine: String,
    /// Engine version.
    pub engine_version: String,
    /// Instance class, e.g. `db.t3.micro`.
    pub instance_class: String,
    /// Storage in GiB.
    pub allocated_storage: u32,
    /// Multi-zone deployment.
    pub multi_az: bool,
    /// Master user name.
    pub master_username: String,
}

/// Parameters of a database creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInstanceSpec {
    /// Instance identifier.
    pub identifier: String,
    /// Engine.
    pub engine: String,
    /// Engine version, provider default when `None`.
    pub engine_version: Option<String>,
    /// Instance class.
    pub instance_class: String,
    /// Storage in GiB.
    pub allocated_storage: u32,
    /// Multi-zone deployment.
    pub multi_az: bool,
    /// Master user name.
    pub master_username: String,
    /// Master password.
    pub master_password: String,
}

/// A single-attribute database modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbModification {
    /// Change the engine version.
    EngineVersion(String),
    /// Change the instance class.
    InstanceClass(String),
    /// Change the storage size.
    AllocatedStorage(u32),
    /// Toggle multi-zone deployment.
    MultiAz(bool),
}

/// Relational store service.
#[allow(async_fn_in_trait)]
pub trait RelationalApi {
    /// Describe an instance; `None` if it does not exist.
    async fn describe_db_instance(&self, identifier: &str) -> ProviderResult<Option<DbInstance>>;
    /// Create an instance.
    async fn create_db_instance(&self, spec: &DbInstanceSpec) -> ProviderResult<DbInstance>;
    /// Apply one modification.
    async fn modify_db_instance(&self, identifier: &str, modification: DbModification)
    -> ProviderResult<()>;
    /// Delete an instance.
    async fn delete_db_instance(&self, identifier: &str, skip_final_snapshot: bool)
    -> ProviderResult<()>;
    /// Tags of the resource with the given ARN.
    async fn list_tags_for_resource(&self, arn: &str) -> ProviderResult<Vec<OptionalTag>>;
    /// Add or overwrite tags.
    async fn add_tags_to_resource(&self, arn: &str, tags: &[OptionalTag]) -> ProviderResult<()>;
    /// Remove tags by key.
    async fn remove_tags_from_resource(&self, arn: &str, keys: &[String]) -> ProviderResult<()>;
}

/// The caller identity as reported by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUser {
    /// Principal ARN, e.g. `arn:aws:iam::123456789012:user/foo`.
    pub arn: String,
}

/// Identity service.
#[allow(async_fn_in_trait)]
pub trait IdentityApi {
    /// Describe the calling user.
    async fn get_user(&self) -> ProviderResult<IdentityUser>;
}

// ============================================================================
// Search index
// ============================================================================

/// A search domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDomain {
    /// Domain name.
    pub name: String,
    /// Domain ARN.
    pub arn: String,
    /// Engine version.
    pub engine_version: String,
    /// Data node instance type.
    pub instance_type: String,
    /// Data node count.
    pub instance_count: u32,
}

/// Parameters of a domain creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDomainSpec {
    /// Domain name.
    pub name: String,
    /// Engine version.
    pub engine_version: String,
    /// Data node instance type.
    pub instance_type: String,
    /// Data node count.
    pub instance_count: u32,
}

/// A single-attribute domain configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchDomainChange {
    /// Change the data node instance type.
    InstanceType(String),
    /// Change the data node count.
    InstanceCount(u32),
}

/// Search service.
#[allow(async_fn_in_trait)]
pub trait SearchApi {
    /// Describe a domain; `None` if it does not exist.
    async fn describe_domain(&self, name: &str) -> ProviderResult<Option<SearchDomain>>;
    /// Create a domain.
    async fn create_domain(&self, spec: &SearchDomainSpec) -> ProviderResult<SearchDomain>;
    /// Apply one configuration change.
    async fn update_domain_config(&self, name: &str, change: SearchDomainChange)
    -> ProviderResult<()>;
    /// Delete a domain.
    async fn delete_domain(&self, name: &str) -> ProviderResult<()>;
    /// Tags of the domain with the given ARN.
    async fn list_domain_tags(&self, arn: &str) -> ProviderResult<Vec<OptionalTag>>;
    /// Add or overwrite tags.
    async fn add_domain_tags(&self, arn: &str, tags: &[OptionalTag]) -> ProviderResult<()>;
    /// Remove tags by key.
    async fn remove_domain_tags(&self, arn: &str, keys: &[String]) -> ProviderResult<()>;
}

// ============================================================================
// Object store
// ============================================================================

/// An object-store bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket name.
    pub name: String,
    /// Region the bucket lives in.
    pub region: String,
    /// Whether object versioning is enabled.
    pub versioning_enabled: bool,
}

/// Object store service.
#[allow(async_fn_in_trait)]
pub trait ObjectStoreApi {
    /// Describe a bucket; `None` if it does not exist.
    async fn describe_bucket(&self, name: &str) -> ProviderResult<Option<Bucket>>;
    /// Create a bucket.
    async fn create_bucket(&self, name: &str, region: &str) -> ProviderResult<Bucket>;
    /// Enable or suspend versioning.
    async fn put_bucket_versioning(&self, name: &str, enabled: bool) -> ProviderResult<()>;
    /// Delete a bucket.
    async fn delete_bucket(&self, name: &str) -> ProviderResult<()>;
    /// Bucket tags; fails with [`NO_SUCH_TAG_SET`] when there are none.
    async fn get_bucket_tagging(&self, name: &str) -> ProviderResult<Vec<Tag>>;
    /// Replace the whole tag set.
    async fn put_bucket_tagging(&self, name: &str, tags: &[Tag]) -> ProviderResult<()>;
    /// Remove every tag.
    async fn delete_bucket_tagging(&self, name: &str) -> ProviderResult<()>;
}

// ============================================================================
// DNS
// ============================================================================

/// A DNS record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    /// Fully qualified name with trailing dot.
    pub name: String,
    /// Record type, e.g. `A` or `CNAME`.
    pub record_type: String,
    /// Time to live in seconds.
    pub ttl: u32,
    /// Record values.
    pub values: Vec<String>,
}

/// Kind of a record-set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    /// Create; fails if the record set exists.
    Create,
    /// Create or replace.
    Upsert,
    /// Delete; must match the existing record set exactly.
    Delete,
}

/// One record-set change in a change batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    /// What to do.
    pub action: ChangeAction,
    /// The record set the change applies to.
    pub record_set: RecordSet,
}

/// DNS service.
#[allow(async_fn_in_trait)]
pub trait DnsApi {
    /// All record sets of a hosted zone.
    async fn list_record_sets(&self, zone_id: &str) -> ProviderResult<Vec<RecordSet>>;
    /// Apply a change batch atomically.
    async fn change_record_sets(&self, zone_id: &str, changes: &[RecordChange])
    -> ProviderResult<()>;
}

/// Everything a full provider exposes, for callers that hold one client for all services.
pub trait CloudProvider:
    ComputeApi
    + AutoScalingApi
    + LoadBalancerApi
    + RelationalApi
    + IdentityApi
    + SearchApi
    + ObjectStoreApi
    + DnsApi
{
}

impl<T> CloudProvider for T where
    T: ComputeApi
        + AutoScalingApi
        + LoadBalancerApi
        + RelationalApi
        + IdentityApi
        + SearchApi
        + ObjectStoreApi
        + DnsApi
{
}
