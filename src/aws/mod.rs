//! Assemble stage topologies on AWS.
//!
//! A stage topology is the full runtime footprint of one deployment stage
//! (e.g. beta, production): an isolated network, a pair of trust groups, a
//! health-checked target pool, DNS-validated certificates, an internet-facing
//! load balancer, a content-delivery distribution, and an auto-scaled
//! container service. Stages are described by a YAML manifest and assembled
//! independently of each other.

use aws_config::{retry::RetryConfig, BehaviorVersion, Region};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::PathBuf, time::Duration};
use tracing::info;

pub mod acm;
pub mod assembler;
pub mod cloudfront;
pub mod dns;
pub mod ecr;
pub mod ecs;
pub mod elb;
pub mod iam;
pub mod network;
pub mod pipeline;
pub mod security;

pub use assembler::{assemble, build_order, StageTopology};

pub const CMD: &str = "aws";
pub const CREATE_CMD: &str = "create";
pub const PLAN_CMD: &str = "plan";

/// Port the edge accepts TLS traffic on
pub(crate) const TLS_PORT: i32 = 443;

/// Port the plain-HTTP redirect listener is bound to
pub(crate) const HTTP_PORT: i32 = 80;

/// Port the service container listens on
pub(crate) const CONTAINER_PORT: i32 = 80;

/// Region certificates for the content-delivery layer must be issued in
pub const EDGE_CERTIFICATE_REGION: &str = "us-east-1";

/// Longest name a load balancer or target group accepts
const MAX_RESOURCE_NAME: usize = 32;

/// Capacity and identity of one deployment stage
#[derive(Serialize, Deserialize, Clone)]
pub struct StageSpec {
    pub name: String,
    pub domain: String,
    pub zone_id: String,
    pub min_instances: i32,
    pub max_instances: i32,
    pub desired_instances: i32,
}

impl StageSpec {
    /// Rejects malformed stages before any resource is created.
    pub fn validate(&self) -> Result<(), Error> {
        if !valid_label(&self.name) {
            return Err(Error::InvalidName(self.name.clone()));
        }
        if self.min_instances < 0
            || self.max_instances < 1
            || self.desired_instances < 0
            || self.min_instances > self.desired_instances
            || self.desired_instances > self.max_instances
        {
            return Err(Error::InvalidCapacity {
                stage: self.name.clone(),
                min: self.min_instances,
                desired: self.desired_instances,
                max: self.max_instances,
            });
        }
        if !valid_domain(&self.domain) {
            return Err(Error::InvalidDomain {
                stage: self.name.clone(),
                domain: self.domain.clone(),
            });
        }
        if !valid_zone_id(&self.zone_id) {
            return Err(Error::InvalidZone {
                stage: self.name.clone(),
                zone: self.zone_id.clone(),
            });
        }
        Ok(())
    }
}

/// Deployment manifest: one project, one shared image repository, any number
/// of stages
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    pub project: String,
    pub region: String,
    pub repository: String,
    pub stages: Vec<StageSpec>,
}

impl Config {
    /// Loads and validates a manifest from a YAML file.
    pub fn load(path: &PathBuf) -> Result<Self, Error> {
        let config: Config = {
            let config_file = File::open(path)?;
            serde_yaml::from_reader(config_file)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects malformed manifests before any client is even constructed.
    pub fn validate(&self) -> Result<(), Error> {
        if !valid_label(&self.project) {
            return Err(Error::InvalidName(self.project.clone()));
        }
        if self.region.is_empty() {
            return Err(Error::InvalidName(self.region.clone()));
        }
        if self.repository.is_empty() {
            return Err(Error::InvalidName(self.repository.clone()));
        }
        let mut names = std::collections::HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !names.insert(stage.name.as_str()) {
                return Err(Error::DuplicateStage(stage.name.clone()));
            }
            // Longest suffix any component appends must still fit
            let longest = qualified(&self.project, &stage.name, "distribution");
            if longest.len() > MAX_RESOURCE_NAME {
                return Err(Error::InvalidName(longest));
            }
        }
        Ok(())
    }
}

/// Stage-qualified resource name. Identifiers of different stages can never
/// collide because every resource name embeds the stage.
pub(crate) fn qualified(project: &str, stage: &str, resource: &str) -> String {
    format!("{project}-{stage}-{resource}")
}

fn valid_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 16
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

fn valid_zone_id(zone: &str) -> bool {
    !zone.is_empty() && zone.len() <= 32 && zone.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Errors surfaced while assembling stage topologies
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    #[error("stage {stage}: invalid instance bounds (min={min}, desired={desired}, max={max})")]
    InvalidCapacity {
        stage: String,
        min: i32,
        desired: i32,
        max: i32,
    },
    #[error("stage {stage}: malformed domain name: {domain}")]
    InvalidDomain { stage: String, domain: String },
    #[error("stage {stage}: malformed hosted zone id: {zone}")]
    InvalidZone { stage: String, zone: String },
    #[error("region {region} has {available} available zones (need {required})")]
    InsufficientZones {
        region: String,
        available: usize,
        required: usize,
    },
    #[error("certificate {arn} not validated after {attempts} checks")]
    CertificateTimeout { arn: String, attempts: usize },
    #[error("certificate {arn} failed issuance: {reason}")]
    CertificateFailed { arn: String, reason: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed AWS response: missing {0}")]
    MissingField(&'static str),
    #[error("AWS EC2 error: {0}")]
    AwsEc2(Box<aws_sdk_ec2::Error>),
    #[error("AWS ELB error: {0}")]
    AwsElb(Box<aws_sdk_elasticloadbalancingv2::Error>),
    #[error("AWS ACM error: {0}")]
    AwsAcm(Box<aws_sdk_acm::Error>),
    #[error("AWS Route 53 error: {0}")]
    AwsRoute53(Box<aws_sdk_route53::Error>),
    #[error("AWS CloudFront error: {0}")]
    AwsCloudFront(Box<aws_sdk_cloudfront::Error>),
    #[error("AWS ECS error: {0}")]
    AwsEcs(Box<aws_sdk_ecs::Error>),
    #[error("AWS ECR error: {0}")]
    AwsEcr(Box<aws_sdk_ecr::Error>),
    #[error("AWS IAM error: {0}")]
    AwsIam(Box<aws_sdk_iam::Error>),
    #[error("AWS Application Auto Scaling error: {0}")]
    AwsAutoScaling(Box<aws_sdk_applicationautoscaling::Error>),
}

pub(crate) fn ec2_err<E, R>(e: aws_sdk_ec2::error::SdkError<E, R>) -> Error
where
    aws_sdk_ec2::Error: From<aws_sdk_ec2::error::SdkError<E, R>>,
{
    Error::AwsEc2(Box::new(e.into()))
}

pub(crate) fn elb_err<E, R>(e: aws_sdk_elasticloadbalancingv2::error::SdkError<E, R>) -> Error
where
    aws_sdk_elasticloadbalancingv2::Error:
        From<aws_sdk_elasticloadbalancingv2::error::SdkError<E, R>>,
{
    Error::AwsElb(Box::new(e.into()))
}

pub(crate) fn acm_err<E, R>(e: aws_sdk_acm::error::SdkError<E, R>) -> Error
where
    aws_sdk_acm::Error: From<aws_sdk_acm::error::SdkError<E, R>>,
{
    Error::AwsAcm(Box::new(e.into()))
}

pub(crate) fn route53_err<E, R>(e: aws_sdk_route53::error::SdkError<E, R>) -> Error
where
    aws_sdk_route53::Error: From<aws_sdk_route53::error::SdkError<E, R>>,
{
    Error::AwsRoute53(Box::new(e.into()))
}

pub(crate) fn cloudfront_err<E, R>(e: aws_sdk_cloudfront::error::SdkError<E, R>) -> Error
where
    aws_sdk_cloudfront::Error: From<aws_sdk_cloudfront::error::SdkError<E, R>>,
{
    Error::AwsCloudFront(Box::new(e.into()))
}

pub(crate) fn ecs_err<E, R>(e: aws_sdk_ecs::error::SdkError<E, R>) -> Error
where
    aws_sdk_ecs::Error: From<aws_sdk_ecs::error::SdkError<E, R>>,
{
    Error::AwsEcs(Box::new(e.into()))
}

pub(crate) fn ecr_err<E, R>(e: aws_sdk_ecr::error::SdkError<E, R>) -> Error
where
    aws_sdk_ecr::Error: From<aws_sdk_ecr::error::SdkError<E, R>>,
{
    Error::AwsEcr(Box::new(e.into()))
}

pub(crate) fn iam_err<E, R>(e: aws_sdk_iam::error::SdkError<E, R>) -> Error
where
    aws_sdk_iam::Error: From<aws_sdk_iam::error::SdkError<E, R>>,
{
    Error::AwsIam(Box::new(e.into()))
}

pub(crate) fn autoscaling_err<E, R>(
    e: aws_sdk_applicationautoscaling::error::SdkError<E, R>,
) -> Error
where
    aws_sdk_applicationautoscaling::Error:
        From<aws_sdk_applicationautoscaling::error::SdkError<E, R>>,
{
    Error::AwsAutoScaling(Box::new(e.into()))
}

/// Typed service clients sharing one retry-configured SDK configuration.
///
/// Certificates consumed by the content-delivery layer are issued in
/// [EDGE_CERTIFICATE_REGION] regardless of the stage region, so a second ACM
/// client is held for that context.
pub struct Clients {
    pub region: String,
    pub ec2: aws_sdk_ec2::Client,
    pub elb: aws_sdk_elasticloadbalancingv2::Client,
    pub acm: aws_sdk_acm::Client,
    pub edge_acm: aws_sdk_acm::Client,
    pub route53: aws_sdk_route53::Client,
    pub cloudfront: aws_sdk_cloudfront::Client,
    pub ecs: aws_sdk_ecs::Client,
    pub ecr: aws_sdk_ecr::Client,
    pub iam: aws_sdk_iam::Client,
    pub autoscaling: aws_sdk_applicationautoscaling::Client,
}

impl Clients {
    pub async fn new(region: &str) -> Self {
        let retry = RetryConfig::adaptive()
            .with_max_attempts(10)
            .with_initial_backoff(Duration::from_millis(500))
            .with_max_backoff(Duration::from_secs(30));
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .retry_config(retry.clone())
            .load()
            .await;
        let edge_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(EDGE_CERTIFICATE_REGION))
            .retry_config(retry)
            .load()
            .await;
        Self {
            region: region.to_string(),
            ec2: aws_sdk_ec2::Client::new(&config),
            elb: aws_sdk_elasticloadbalancingv2::Client::new(&config),
            acm: aws_sdk_acm::Client::new(&config),
            edge_acm: aws_sdk_acm::Client::new(&edge_config),
            route53: aws_sdk_route53::Client::new(&config),
            cloudfront: aws_sdk_cloudfront::Client::new(&config),
            ecs: aws_sdk_ecs::Client::new(&config),
            ecr: aws_sdk_ecr::Client::new(&config),
            iam: aws_sdk_iam::Client::new(&config),
            autoscaling: aws_sdk_applicationautoscaling::Client::new(&config),
        }
    }
}

/// Assembles every stage topology in a manifest (or a single named stage) and
/// emits the pipeline stage list that drives deployments into them.
pub async fn create(config: &PathBuf, only_stage: Option<&str>) -> Result<(), Error> {
    let config = Config::load(config)?;
    info!(project = config.project.as_str(), "loaded manifest");

    let stages: Vec<&StageSpec> = match only_stage {
        Some(name) => {
            let selected: Vec<&StageSpec> =
                config.stages.iter().filter(|s| s.name == name).collect();
            if selected.is_empty() {
                return Err(Error::UnknownStage(name.to_string()));
            }
            selected
        }
        None => config.stages.iter().collect(),
    };

    let clients = Clients::new(&config.region).await;
    let repository = ecr::ensure_repository(&clients, &config.repository).await?;

    // Stage topologies share nothing but the image repository; assemble them
    // concurrently.
    let topologies = try_join_all(
        stages
            .iter()
            .map(|spec| assembler::assemble(&clients, &config, spec, &repository)),
    )
    .await?;

    let mut deploys = Vec::new();
    for topology in &topologies {
        topology.announce();
        deploys.push(pipeline::DeployAction {
            stage: topology.stage.clone(),
            image: pipeline::Artifact::new("image"),
            service: topology.service.clone(),
        });
    }
    let pipeline = pipeline::PipelineSpec::new(&config.project, deploys);
    info!(
        pipeline = pipeline.name.as_str(),
        stages = pipeline.stages.len(),
        "pipeline stage list ready"
    );
    Ok(())
}

/// Prints the dependency-ordered build plan shared by every stage.
pub fn plan() {
    for (idx, resource) in build_order().iter().enumerate() {
        info!(step = idx + 1, resource = ?resource, "build step");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(min: i32, desired: i32, max: i32) -> StageSpec {
        StageSpec {
            name: "beta".to_string(),
            domain: "beta.example.com".to_string(),
            zone_id: "Z0123456789ABCDEFGHIJ".to_string(),
            min_instances: min,
            max_instances: max,
            desired_instances: desired,
        }
    }

    #[test]
    fn test_beta_style_bounds_accepted() {
        assert!(stage(1, 1, 1).validate().is_ok());
    }

    #[test]
    fn test_production_style_bounds_accepted() {
        assert!(stage(1, 1, 2).validate().is_ok());
    }

    #[test]
    fn test_zero_max_rejected() {
        let spec = StageSpec {
            max_instances: 0,
            min_instances: 0,
            desired_instances: 0,
            ..stage(0, 0, 1)
        };
        assert!(matches!(
            spec.validate(),
            Err(Error::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_desired_above_max_rejected() {
        assert!(matches!(
            stage(1, 3, 2).validate(),
            Err(Error::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_min_above_desired_rejected() {
        assert!(matches!(
            stage(2, 1, 3).validate(),
            Err(Error::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_negative_min_rejected() {
        assert!(matches!(
            stage(-1, 0, 1).validate(),
            Err(Error::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_malformed_domain_rejected() {
        let mut spec = stage(1, 1, 1);
        for domain in ["", "nodot", ".leading.dot", "trailing.dot.", "bad..label"] {
            spec.domain = domain.to_string();
            assert!(
                matches!(spec.validate(), Err(Error::InvalidDomain { .. })),
                "accepted {domain:?}"
            );
        }
    }

    #[test]
    fn test_malformed_zone_rejected() {
        let mut spec = stage(1, 1, 1);
        spec.zone_id = "not a zone!".to_string();
        assert!(matches!(spec.validate(), Err(Error::InvalidZone { .. })));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let config = Config {
            project: "web".to_string(),
            region: "us-west-2".to_string(),
            repository: "web".to_string(),
            stages: vec![stage(1, 1, 1), stage(1, 1, 2)],
        };
        assert!(matches!(
            config.validate(),
            Err(Error::DuplicateStage(_))
        ));
    }

    #[test]
    fn test_stage_qualified_names_disjoint() {
        let resources = ["vpc", "edge-sg", "compute-sg", "targets", "edge", "cluster"];
        let beta: Vec<String> = resources
            .iter()
            .map(|r| qualified("web", "beta", r))
            .collect();
        let prod: Vec<String> = resources
            .iter()
            .map(|r| qualified("web", "prod", r))
            .collect();
        for name in &beta {
            assert!(!prod.contains(name));
        }
    }

    #[test]
    fn test_overlong_names_rejected() {
        let config = Config {
            project: "averylongproject".to_string(),
            region: "us-west-2".to_string(),
            repository: "web".to_string(),
            stages: vec![StageSpec {
                name: "productionlike".to_string(),
                ..stage(1, 1, 1)
            }],
        };
        assert!(matches!(config.validate(), Err(Error::InvalidName(_))));
    }
}
