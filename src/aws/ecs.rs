//! Auto-scaled container service: cluster, task definition, service, and the
//! scaling policy that adjusts it within the stage bounds.
//!
//! The engine declares scaling policy only; the platform's scaling controller
//! evaluates the triggers. Either trigger may drive a scale-out, and a
//! scale-in happens only when every trigger agrees the service is idle.

use crate::aws::{
    autoscaling_err, ecr::ImageRepository, ecs_err, elb::TargetGroup, network::Network, qualified,
    security::TrustGroup, Clients, Error, CONTAINER_PORT,
};
use aws_sdk_applicationautoscaling::types::{
    MetricType, PolicyType, PredefinedMetricSpecification, ScalableDimension, ServiceNamespace,
    TargetTrackingScalingPolicyConfiguration,
};
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, Compatibility, ContainerDefinition,
    DeploymentCircuitBreaker, DeploymentConfiguration, LaunchType,
    LoadBalancer as EcsLoadBalancer, LogConfiguration, LogDriver, NetworkConfiguration,
    NetworkMode, PortMapping, TransportProtocol,
};
use tracing::info;

/// Task CPU shape (units)
const TASK_CPU: &str = "256";

/// Task memory shape (MiB)
const TASK_MEMORY: &str = "512";

/// Tag the build pipeline pushes runnable images under
pub const IMAGE_TAG: &str = "latest";

/// Utilization both scaling triggers steer toward
const UTILIZATION_TARGET: f64 = 70.0;

/// Scale-in and scale-out cooldown applied to both triggers (seconds)
const SCALING_COOLDOWN: i32 = 60;

#[derive(Clone, Debug)]
pub struct Cluster {
    pub arn: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct TaskDefinition {
    pub arn: String,
    pub family: String,
    pub container_name: String,
}

#[derive(Clone, Debug)]
pub struct Service {
    pub arn: String,
    pub name: String,
    pub cluster: String,
}

/// Creates the stage cluster. Returns the existing cluster on re-run.
pub async fn create_cluster(
    clients: &Clients,
    project: &str,
    stage: &str,
) -> Result<Cluster, Error> {
    let name = qualified(project, stage, "cluster");
    let resp = clients
        .ecs
        .create_cluster()
        .cluster_name(&name)
        .send()
        .await
        .map_err(ecs_err)?;
    let arn = resp
        .cluster()
        .and_then(|c| c.cluster_arn())
        .ok_or(Error::MissingField("cluster ARN"))?
        .to_string();
    info!(cluster = arn.as_str(), stage = stage, "created cluster");
    Ok(Cluster { arn, name })
}

/// Registers the stage task definition: fixed CPU/memory shape, one container
/// pulling the shared repository's `latest` tag, logs under a stage-prefixed
/// stream. Tasks require the isolated network: every task gets its own
/// network interface.
pub async fn create_task_definition(
    clients: &Clients,
    repository: &ImageRepository,
    execution_role_arn: &str,
    project: &str,
    stage: &str,
) -> Result<TaskDefinition, Error> {
    let family = qualified(project, stage, "task");
    let container_name = qualified(project, stage, "web");
    let container = container_definition(&container_name, repository, &clients.region)?;
    let resp = clients
        .ecs
        .register_task_definition()
        .family(&family)
        .cpu(TASK_CPU)
        .memory(TASK_MEMORY)
        .network_mode(NetworkMode::Awsvpc)
        .requires_compatibilities(Compatibility::Fargate)
        .execution_role_arn(execution_role_arn)
        .container_definitions(container)
        .send()
        .await
        .map_err(ecs_err)?;
    let arn = resp
        .task_definition()
        .and_then(|t| t.task_definition_arn())
        .ok_or(Error::MissingField("task definition ARN"))?
        .to_string();
    info!(task = arn.as_str(), stage = stage, "registered task definition");
    Ok(TaskDefinition {
        arn,
        family,
        container_name,
    })
}

fn container_definition(
    name: &str,
    repository: &ImageRepository,
    region: &str,
) -> Result<ContainerDefinition, Error> {
    let log_config = LogConfiguration::builder()
        .log_driver(LogDriver::Awslogs)
        .options("awslogs-group", format!("/ecs/{name}"))
        .options("awslogs-region", region)
        .options("awslogs-stream-prefix", name)
        .options("awslogs-create-group", "true")
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    Ok(ContainerDefinition::builder()
        .name(name)
        .image(format!("{}:{}", repository.uri, IMAGE_TAG))
        .memory(512)
        .essential(true)
        .port_mappings(
            PortMapping::builder()
                .container_port(CONTAINER_PORT)
                .protocol(TransportProtocol::Tcp)
                .build(),
        )
        .log_configuration(log_config)
        .build())
}

/// Creates the scalable service: registered into the target pool, placed
/// behind the compute trust group, one public network interface per task
/// (there is no NAT gateway in this topology, so tasks reach the image
/// registry and log sink directly). Re-adopts a live service from a previous
/// assembly.
pub async fn create_service(
    clients: &Clients,
    cluster: &Cluster,
    task_definition: &TaskDefinition,
    network: &Network,
    target_group: &TargetGroup,
    trust_group: &TrustGroup,
    desired_count: i32,
    project: &str,
    stage: &str,
) -> Result<Service, Error> {
    let name = qualified(project, stage, "service");
    if let Some(service) = find_service(clients, cluster, &name).await? {
        info!(
            service = service.arn.as_str(),
            stage = stage,
            "reusing service"
        );
        return Ok(service);
    }

    let vpc_config = AwsVpcConfiguration::builder()
        .set_subnets(Some(network.public_subnet_ids()))
        .security_groups(&trust_group.id)
        .assign_public_ip(AssignPublicIp::Enabled)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let resp = clients
        .ecs
        .create_service()
        .cluster(&cluster.name)
        .service_name(&name)
        .task_definition(&task_definition.arn)
        .desired_count(desired_count)
        .launch_type(LaunchType::Fargate)
        .network_configuration(
            NetworkConfiguration::builder()
                .awsvpc_configuration(vpc_config)
                .build(),
        )
        .load_balancers(
            EcsLoadBalancer::builder()
                .target_group_arn(&target_group.arn)
                .container_name(&task_definition.container_name)
                .container_port(CONTAINER_PORT)
                .build(),
        )
        .deployment_configuration(stability_surfacing())
        .send()
        .await
        .map_err(ecs_err)?;
    let arn = resp
        .service()
        .and_then(|s| s.service_arn())
        .ok_or(Error::MissingField("service ARN"))?
        .to_string();
    info!(
        service = arn.as_str(),
        desired = desired_count,
        stage = stage,
        "created service"
    );
    Ok(Service {
        arn,
        name,
        cluster: cluster.name.clone(),
    })
}

/// A service that cannot stabilize (e.g. no `latest` image in the
/// repository) trips the platform's circuit breaker instead of being masked
/// as a healthy deploy. Rollback is off: the first deploy has nothing to
/// roll back to.
fn stability_surfacing() -> DeploymentConfiguration {
    let breaker = DeploymentCircuitBreaker::builder()
        .enable(true)
        .rollback(false)
        .build();
    DeploymentConfiguration::builder()
        .deployment_circuit_breaker(breaker)
        .build()
}

async fn find_service(
    clients: &Clients,
    cluster: &Cluster,
    name: &str,
) -> Result<Option<Service>, Error> {
    let Ok(resp) = clients
        .ecs
        .describe_services()
        .cluster(&cluster.name)
        .services(name)
        .send()
        .await
    else {
        return Ok(None);
    };
    Ok(resp
        .services()
        .iter()
        .find(|s| s.status() == Some("ACTIVE"))
        .and_then(|s| s.service_arn())
        .map(|arn| Service {
            arn: arn.to_string(),
            name: name.to_string(),
            cluster: cluster.name.clone(),
        }))
}

/// Declares the scaling policy: desired count bounded to `[min, max]`, with
/// independent CPU- and memory-utilization triggers.
pub async fn install_auto_scaling(
    clients: &Clients,
    service: &Service,
    min: i32,
    max: i32,
    project: &str,
    stage: &str,
) -> Result<(), Error> {
    let resource_id = format!("service/{}/{}", service.cluster, service.name);
    clients
        .autoscaling
        .register_scalable_target()
        .service_namespace(ServiceNamespace::Ecs)
        .resource_id(&resource_id)
        .scalable_dimension(ScalableDimension::EcsServiceDesiredCount)
        .min_capacity(min)
        .max_capacity(max)
        .send()
        .await
        .map_err(autoscaling_err)?;
    info!(
        resource = resource_id.as_str(),
        min = min,
        max = max,
        "registered scalable target"
    );

    for (suffix, metric) in [
        ("cpu-scaling", MetricType::EcsServiceAverageCpuUtilization),
        ("memory-scaling", MetricType::EcsServiceAverageMemoryUtilization),
    ] {
        clients
            .autoscaling
            .put_scaling_policy()
            .policy_name(qualified(project, stage, suffix))
            .service_namespace(ServiceNamespace::Ecs)
            .resource_id(&resource_id)
            .scalable_dimension(ScalableDimension::EcsServiceDesiredCount)
            .policy_type(PolicyType::TargetTrackingScaling)
            .target_tracking_scaling_policy_configuration(tracking_policy(metric)?)
            .send()
            .await
            .map_err(autoscaling_err)?;
        info!(
            resource = resource_id.as_str(),
            trigger = suffix,
            "installed scaling trigger"
        );
    }
    Ok(())
}

fn tracking_policy(
    metric: MetricType,
) -> Result<TargetTrackingScalingPolicyConfiguration, Error> {
    let spec = PredefinedMetricSpecification::builder()
        .predefined_metric_type(metric)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    Ok(TargetTrackingScalingPolicyConfiguration::builder()
        .target_value(UTILIZATION_TARGET)
        .predefined_metric_specification(spec)
        .scale_in_cooldown(SCALING_COOLDOWN)
        .scale_out_cooldown(SCALING_COOLDOWN)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_policy_targets_seventy_percent() {
        let policy = tracking_policy(MetricType::EcsServiceAverageCpuUtilization).unwrap();
        assert_eq!(policy.target_value(), 70.0);
        assert_eq!(policy.scale_in_cooldown(), Some(SCALING_COOLDOWN));
        assert_eq!(policy.scale_out_cooldown(), Some(SCALING_COOLDOWN));
    }

    #[test]
    fn test_both_triggers_installed_independently() {
        let cpu = tracking_policy(MetricType::EcsServiceAverageCpuUtilization).unwrap();
        let memory = tracking_policy(MetricType::EcsServiceAverageMemoryUtilization).unwrap();
        assert_ne!(
            cpu.predefined_metric_specification()
                .unwrap()
                .predefined_metric_type(),
            memory
                .predefined_metric_specification()
                .unwrap()
                .predefined_metric_type()
        );
    }

    #[test]
    fn test_container_pulls_latest_from_shared_repository() {
        let repository = ImageRepository {
            name: "web".to_string(),
            uri: "123456789012.dkr.ecr.us-west-2.amazonaws.com/web".to_string(),
        };
        let container = container_definition("web-beta-web", &repository, "us-west-2").unwrap();
        assert_eq!(
            container.image(),
            Some("123456789012.dkr.ecr.us-west-2.amazonaws.com/web:latest")
        );
        assert_eq!(container.port_mappings().len(), 1);
        assert_eq!(container.port_mappings()[0].container_port(), Some(CONTAINER_PORT));
    }

    #[test]
    fn test_stability_failures_are_surfaced() {
        let config = stability_surfacing();
        let breaker = config.deployment_circuit_breaker().unwrap();
        assert!(breaker.enable());
        assert!(!breaker.rollback());
    }
}
