//! Assembles one stage topology in explicit dependency order.
//!
//! The dependency graph is data, not statement order: every resource node
//! declares what it consumes, the build order is a topological sort of that
//! table, and assembly executes nodes in sorted order threading outputs
//! through typed state. Reading an output before its node ran is a
//! dependency-order bug in this module, never a runtime condition.

use crate::aws::{
    acm::{self, CertificateBinding, CertificateScope},
    cloudfront::{self, Distribution},
    dns,
    ecr::ImageRepository,
    ecs::{self, Cluster, Service, TaskDefinition},
    elb::{self, LoadBalancer, TargetGroup},
    iam,
    network::{self, Network},
    security::{self, TrustGroup},
    Clients, Config, Error, StageSpec,
};
use serde::Serialize;
use tracing::info;

/// Typed resource nodes of a stage topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Network,
    EdgeTrustGroup,
    ComputeTrustGroup,
    TargetGroup,
    EdgeCertificate,
    DistributionCertificate,
    LoadBalancer,
    Distribution,
    AliasRecord,
    ExecutionRole,
    Cluster,
    TaskDefinition,
    Service,
    AutoScaling,
}

/// What each node consumes. The compute trust group references the edge
/// group's identity; the service registers into a target group that must
/// already be bound to the load balancer.
const DEPENDENCIES: &[(Resource, &[Resource])] = &[
    (Resource::Network, &[]),
    (Resource::EdgeTrustGroup, &[Resource::Network]),
    (
        Resource::ComputeTrustGroup,
        &[Resource::Network, Resource::EdgeTrustGroup],
    ),
    (Resource::TargetGroup, &[Resource::Network]),
    (Resource::EdgeCertificate, &[]),
    (Resource::DistributionCertificate, &[]),
    (
        Resource::LoadBalancer,
        &[
            Resource::Network,
            Resource::TargetGroup,
            Resource::EdgeTrustGroup,
            Resource::EdgeCertificate,
        ],
    ),
    (
        Resource::Distribution,
        &[Resource::LoadBalancer, Resource::DistributionCertificate],
    ),
    (Resource::AliasRecord, &[Resource::Distribution]),
    (Resource::ExecutionRole, &[]),
    (Resource::Cluster, &[Resource::Network]),
    (Resource::TaskDefinition, &[Resource::ExecutionRole]),
    (
        Resource::Service,
        &[
            Resource::Cluster,
            Resource::TaskDefinition,
            Resource::TargetGroup,
            Resource::ComputeTrustGroup,
            Resource::LoadBalancer,
        ],
    ),
    (Resource::AutoScaling, &[Resource::Service]),
];

/// Topologically sorts the dependency table into the build order shared by
/// every stage. Deterministic: ties resolve in table order.
pub fn build_order() -> Vec<Resource> {
    let mut order: Vec<Resource> = Vec::with_capacity(DEPENDENCIES.len());
    while order.len() < DEPENDENCIES.len() {
        let before = order.len();
        for (resource, deps) in DEPENDENCIES {
            if order.contains(resource) {
                continue;
            }
            if deps.iter().all(|d| order.contains(d)) {
                order.push(*resource);
            }
        }
        // The table is static; a cycle is a programming error
        assert!(order.len() > before, "dependency cycle");
    }
    order
}

/// Handle the outer pipeline drives deployments against
#[derive(Clone, Debug, Serialize)]
pub struct ServiceHandle {
    pub cluster: String,
    pub service: String,
    pub arn: String,
}

/// Every operator-visible identifier produced by assembling one stage,
/// returned as a single result instead of per-resource output side effects.
#[derive(Clone, Debug)]
pub struct StageTopology {
    pub stage: String,
    pub domain: String,
    pub zone_id: String,
    pub vpc_id: String,
    pub edge_trust_group_id: String,
    pub compute_trust_group_id: String,
    pub target_group_arn: String,
    pub edge_certificate_arn: String,
    pub distribution_certificate_arn: String,
    pub load_balancer_arn: String,
    pub load_balancer_dns: String,
    pub distribution_id: String,
    pub distribution_domain: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    pub service: ServiceHandle,
}

impl StageTopology {
    /// Logs the full identifier set once.
    pub fn announce(&self) {
        info!(
            stage = self.stage.as_str(),
            domain = self.domain.as_str(),
            zone = self.zone_id.as_str(),
            vpc = self.vpc_id.as_str(),
            edge_sg = self.edge_trust_group_id.as_str(),
            compute_sg = self.compute_trust_group_id.as_str(),
            target_group = self.target_group_arn.as_str(),
            edge_certificate = self.edge_certificate_arn.as_str(),
            distribution_certificate = self.distribution_certificate_arn.as_str(),
            load_balancer = self.load_balancer_arn.as_str(),
            distribution = self.distribution_id.as_str(),
            cluster = self.cluster_arn.as_str(),
            task_definition = self.task_definition_arn.as_str(),
            service = self.service.arn.as_str(),
            "assembled stage topology"
        );
    }
}

/// Outputs threaded between nodes during assembly
#[derive(Default)]
struct State {
    network: Option<Network>,
    edge_group: Option<TrustGroup>,
    compute_group: Option<TrustGroup>,
    target_group: Option<TargetGroup>,
    edge_certificate: Option<CertificateBinding>,
    distribution_certificate: Option<CertificateBinding>,
    load_balancer: Option<LoadBalancer>,
    distribution: Option<Distribution>,
    execution_role_arn: Option<String>,
    cluster: Option<Cluster>,
    task_definition: Option<TaskDefinition>,
    service: Option<Service>,
}

impl State {
    fn network(&self) -> &Network {
        self.network.as_ref().expect("network built before dependents")
    }

    fn edge_group(&self) -> &TrustGroup {
        self.edge_group
            .as_ref()
            .expect("edge trust group built before dependents")
    }

    fn compute_group(&self) -> &TrustGroup {
        self.compute_group
            .as_ref()
            .expect("compute trust group built before dependents")
    }

    fn target_group(&self) -> &TargetGroup {
        self.target_group
            .as_ref()
            .expect("target group built before dependents")
    }

    fn edge_certificate(&self) -> &CertificateBinding {
        self.edge_certificate
            .as_ref()
            .expect("edge certificate requested before dependents")
    }

    fn distribution_certificate(&self) -> &CertificateBinding {
        self.distribution_certificate
            .as_ref()
            .expect("distribution certificate requested before dependents")
    }

    fn load_balancer(&self) -> &LoadBalancer {
        self.load_balancer
            .as_ref()
            .expect("load balancer built before dependents")
    }

    fn distribution(&self) -> &Distribution {
        self.distribution
            .as_ref()
            .expect("distribution built before dependents")
    }

    fn execution_role_arn(&self) -> &str {
        self.execution_role_arn
            .as_deref()
            .expect("execution role built before dependents")
    }

    fn cluster(&self) -> &Cluster {
        self.cluster.as_ref().expect("cluster built before dependents")
    }

    fn task_definition(&self) -> &TaskDefinition {
        self.task_definition
            .as_ref()
            .expect("task definition built before dependents")
    }

    fn service(&self) -> &Service {
        self.service.as_ref().expect("service built before dependents")
    }
}

/// Assembles the full topology for one stage and returns its identifier set.
///
/// The stage spec is validated before anything is created; any later failure aborts
/// the stage. Every create path re-adopts resources left by a previous
/// assembly, so a re-run converges instead of duplicating.
pub async fn assemble(
    clients: &Clients,
    config: &Config,
    spec: &StageSpec,
    repository: &ImageRepository,
) -> Result<StageTopology, Error> {
    spec.validate()?;
    let project = &config.project;
    let stage = &spec.name;
    info!(stage = stage.as_str(), domain = spec.domain.as_str(), "assembling stage");

    let mut state = State::default();
    for resource in build_order() {
        match resource {
            Resource::Network => {
                state.network = Some(network::create_network(clients, project, stage).await?);
            }
            Resource::EdgeTrustGroup => {
                let vpc_id = state.network().vpc_id.clone();
                state.edge_group =
                    Some(security::create_edge_group(clients, &vpc_id, project, stage).await?);
            }
            Resource::ComputeTrustGroup => {
                let vpc_id = state.network().vpc_id.clone();
                let edge = state.edge_group().clone();
                state.compute_group = Some(
                    security::create_compute_group(clients, &vpc_id, &edge, project, stage)
                        .await?,
                );
            }
            Resource::TargetGroup => {
                state.target_group = Some(
                    elb::create_target_group(clients, state.network(), project, stage).await?,
                );
            }
            Resource::EdgeCertificate => {
                state.edge_certificate = Some(
                    acm::issue_certificate(
                        clients,
                        &spec.domain,
                        &spec.zone_id,
                        CertificateScope::LoadBalancer,
                        project,
                        stage,
                    )
                    .await?,
                );
            }
            Resource::DistributionCertificate => {
                state.distribution_certificate = Some(
                    acm::issue_certificate(
                        clients,
                        &spec.domain,
                        &spec.zone_id,
                        CertificateScope::Distribution,
                        project,
                        stage,
                    )
                    .await?,
                );
            }
            Resource::LoadBalancer => {
                // The listener needs an issued certificate; a pending one is
                // awaited, not failed on
                acm::wait_until_issued(clients, state.edge_certificate()).await?;
                state.load_balancer = Some(
                    elb::create_load_balancer(
                        clients,
                        state.network(),
                        state.target_group(),
                        state.edge_group(),
                        state.edge_certificate(),
                        project,
                        stage,
                    )
                    .await?,
                );
            }
            Resource::Distribution => {
                acm::wait_until_issued(clients, state.distribution_certificate()).await?;
                state.distribution = Some(
                    cloudfront::create_distribution(
                        clients,
                        state.load_balancer(),
                        &spec.domain,
                        state.distribution_certificate(),
                        project,
                        stage,
                    )
                    .await?,
                );
            }
            Resource::AliasRecord => {
                dns::upsert_alias(
                    &clients.route53,
                    &spec.zone_id,
                    &spec.domain,
                    &state.distribution().domain_name,
                )
                .await?;
            }
            Resource::ExecutionRole => {
                state.execution_role_arn =
                    Some(iam::ensure_execution_role(clients, project, stage).await?);
            }
            Resource::Cluster => {
                state.cluster = Some(ecs::create_cluster(clients, project, stage).await?);
            }
            Resource::TaskDefinition => {
                let role = state.execution_role_arn().to_string();
                state.task_definition = Some(
                    ecs::create_task_definition(clients, repository, &role, project, stage)
                        .await?,
                );
            }
            Resource::Service => {
                state.service = Some(
                    ecs::create_service(
                        clients,
                        state.cluster(),
                        state.task_definition(),
                        state.network(),
                        state.target_group(),
                        state.compute_group(),
                        spec.desired_instances,
                        project,
                        stage,
                    )
                    .await?,
                );
            }
            Resource::AutoScaling => {
                ecs::install_auto_scaling(
                    clients,
                    state.service(),
                    spec.min_instances,
                    spec.max_instances,
                    project,
                    stage,
                )
                .await?;
            }
        }
    }

    let service = state.service().clone();
    Ok(StageTopology {
        stage: stage.clone(),
        domain: spec.domain.clone(),
        zone_id: spec.zone_id.clone(),
        vpc_id: state.network().vpc_id.clone(),
        edge_trust_group_id: state.edge_group().id.clone(),
        compute_trust_group_id: state.compute_group().id.clone(),
        target_group_arn: state.target_group().arn.clone(),
        edge_certificate_arn: state.edge_certificate().arn.clone(),
        distribution_certificate_arn: state.distribution_certificate().arn.clone(),
        load_balancer_arn: state.load_balancer().arn.clone(),
        load_balancer_dns: state.load_balancer().dns_name.clone(),
        distribution_id: state.distribution().id.clone(),
        distribution_domain: state.distribution().domain_name.clone(),
        cluster_arn: state.cluster().arn.clone(),
        task_definition_arn: state.task_definition().arn.clone(),
        service: ServiceHandle {
            cluster: service.cluster,
            service: service.name,
            arn: service.arn,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[Resource], resource: Resource) -> usize {
        order.iter().position(|r| *r == resource).unwrap()
    }

    #[test]
    fn test_build_order_is_complete() {
        let order = build_order();
        assert_eq!(order.len(), DEPENDENCIES.len());
        for (resource, _) in DEPENDENCIES {
            assert_eq!(order.iter().filter(|r| *r == resource).count(), 1);
        }
    }

    #[test]
    fn test_build_order_respects_every_edge() {
        let order = build_order();
        for (resource, deps) in DEPENDENCIES {
            for dep in *deps {
                assert!(
                    position(&order, *dep) < position(&order, *resource),
                    "{dep:?} must precede {resource:?}"
                );
            }
        }
    }

    #[test]
    fn test_build_order_is_deterministic() {
        assert_eq!(build_order(), build_order());
    }

    #[test]
    fn test_network_first_scaling_last() {
        let order = build_order();
        assert_eq!(order.first(), Some(&Resource::Network));
        assert_eq!(order.last(), Some(&Resource::AutoScaling));
    }

    #[test]
    fn test_edge_group_precedes_compute_group() {
        let order = build_order();
        assert!(
            position(&order, Resource::EdgeTrustGroup)
                < position(&order, Resource::ComputeTrustGroup)
        );
    }

    #[test]
    fn test_target_group_precedes_listeners_and_service() {
        let order = build_order();
        let target = position(&order, Resource::TargetGroup);
        assert!(target < position(&order, Resource::LoadBalancer));
        assert!(target < position(&order, Resource::Service));
    }
}
