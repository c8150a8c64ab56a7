//! Interface glue for the outer delivery pipeline.
//!
//! Source retrieval and image builds happen elsewhere; only their opaque
//! artifact handles cross this boundary. The contract with the build stage is
//! that the image artifact has been pushed to the shared repository under the
//! `latest` tag by the time a deploy stage runs.

use crate::aws::assembler::ServiceHandle;
use serde::{Deserialize, Serialize};

/// Opaque handle to an artifact produced by an upstream pipeline stage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Binds a built image artifact to the compute service of one stage
#[derive(Clone, Debug, Serialize)]
pub struct DeployAction {
    pub stage: String,
    pub image: Artifact,
    pub service: ServiceHandle,
}

/// One stage in the delivery pipeline
#[derive(Clone, Debug, Serialize)]
pub enum PipelineStage {
    Source { output: Artifact },
    Build { input: Artifact, output: Artifact },
    Deploy(DeployAction),
}

/// Ordered stage list: source, build, then one deploy per topology
#[derive(Clone, Debug, Serialize)]
pub struct PipelineSpec {
    pub name: String,
    pub stages: Vec<PipelineStage>,
}

impl PipelineSpec {
    /// Source and build run once; every deploy stage consumes the same image
    /// artifact, in manifest order.
    pub fn new(project: &str, deploys: Vec<DeployAction>) -> Self {
        let source = Artifact::new("source");
        let image = Artifact::new("image");
        let mut stages = vec![
            PipelineStage::Source {
                output: source.clone(),
            },
            PipelineStage::Build {
                input: source,
                output: image,
            },
        ];
        stages.extend(deploys.into_iter().map(PipelineStage::Deploy));
        Self {
            name: project.to_string(),
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy(stage: &str) -> DeployAction {
        DeployAction {
            stage: stage.to_string(),
            image: Artifact::new("image"),
            service: ServiceHandle {
                cluster: format!("web-{stage}-cluster"),
                service: format!("web-{stage}-service"),
                arn: format!("arn:aws:ecs:::service/web-{stage}-service"),
            },
        }
    }

    #[test]
    fn test_source_and_build_precede_deploys() {
        let pipeline = PipelineSpec::new("web", vec![deploy("beta"), deploy("prod")]);
        assert_eq!(pipeline.stages.len(), 4);
        assert!(matches!(pipeline.stages[0], PipelineStage::Source { .. }));
        assert!(matches!(pipeline.stages[1], PipelineStage::Build { .. }));
    }

    #[test]
    fn test_build_consumes_the_source_artifact() {
        let pipeline = PipelineSpec::new("web", vec![]);
        let PipelineStage::Source { output: source } = &pipeline.stages[0] else {
            panic!("missing source stage");
        };
        let PipelineStage::Build { input, .. } = &pipeline.stages[1] else {
            panic!("missing build stage");
        };
        assert_eq!(source, input);
    }

    #[test]
    fn test_deploys_keep_manifest_order() {
        let pipeline = PipelineSpec::new("web", vec![deploy("beta"), deploy("prod")]);
        let deploys: Vec<&str> = pipeline
            .stages
            .iter()
            .filter_map(|s| match s {
                PipelineStage::Deploy(action) => Some(action.stage.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deploys, vec!["beta", "prod"]);
    }
}
