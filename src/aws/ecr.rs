//! Shared container image repository.
//!
//! One repository per project, read by every stage's compute unit. The build
//! pipeline pushes under a mutable `latest` tag; stages never write.

use crate::aws::{ecr_err, Clients, Error};
use aws_sdk_ecr::types::{ImageScanningConfiguration, ImageTagMutability};
use tracing::info;

/// Images older than this are expired by the repository lifecycle rule
const MAX_IMAGE_AGE_DAYS: u32 = 1000;

#[derive(Clone, Debug)]
pub struct ImageRepository {
    pub name: String,
    pub uri: String,
}

/// Creates the shared repository, or re-adopts it by name.
pub async fn ensure_repository(clients: &Clients, name: &str) -> Result<ImageRepository, Error> {
    if let Ok(resp) = clients
        .ecr
        .describe_repositories()
        .repository_names(name)
        .send()
        .await
    {
        if let Some(uri) = resp
            .repositories()
            .first()
            .and_then(|r| r.repository_uri())
        {
            info!(repository = name, uri = uri, "reusing image repository");
            return Ok(ImageRepository {
                name: name.to_string(),
                uri: uri.to_string(),
            });
        }
    }

    let resp = clients
        .ecr
        .create_repository()
        .repository_name(name)
        .image_tag_mutability(ImageTagMutability::Mutable)
        .image_scanning_configuration(
            ImageScanningConfiguration::builder()
                .scan_on_push(false)
                .build(),
        )
        .send()
        .await
        .map_err(ecr_err)?;
    let uri = resp
        .repository()
        .and_then(|r| r.repository_uri())
        .ok_or(Error::MissingField("repository URI"))?
        .to_string();

    let lifecycle = serde_json::json!({
        "rules": [{
            "rulePriority": 1,
            "description": "Expire stale images",
            "selection": {
                "tagStatus": "any",
                "countType": "sinceImagePushed",
                "countUnit": "days",
                "countNumber": MAX_IMAGE_AGE_DAYS
            },
            "action": { "type": "expire" }
        }]
    });
    clients
        .ecr
        .put_lifecycle_policy()
        .repository_name(name)
        .lifecycle_policy_text(lifecycle.to_string())
        .send()
        .await
        .map_err(ecr_err)?;

    info!(repository = name, uri = uri.as_str(), "created image repository");
    Ok(ImageRepository {
        name: name.to_string(),
        uri,
    })
}
