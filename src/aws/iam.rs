//! Execution role for the stage's container tasks: image pulls from the
//! shared repository and log delivery, including first-use creation of the
//! stage log group.

use crate::aws::{iam_err, qualified, Clients, Error};
use tracing::info;

const EXECUTION_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";

/// Creates the stage's task execution role, or re-adopts it by name. Returns
/// the role ARN.
pub async fn ensure_execution_role(
    clients: &Clients,
    project: &str,
    stage: &str,
) -> Result<String, Error> {
    let name = qualified(project, stage, "task-exec");
    if let Ok(resp) = clients.iam.get_role().role_name(&name).send().await {
        if let Some(role) = resp.role() {
            info!(role = name.as_str(), stage = stage, "reusing execution role");
            return Ok(role.arn().to_string());
        }
    }

    let assume = serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
            "Action": "sts:AssumeRole"
        }]
    });
    let resp = clients
        .iam
        .create_role()
        .role_name(&name)
        .assume_role_policy_document(assume.to_string())
        .send()
        .await
        .map_err(iam_err)?;
    let arn = resp
        .role()
        .ok_or(Error::MissingField("role"))?
        .arn()
        .to_string();

    clients
        .iam
        .attach_role_policy()
        .role_name(&name)
        .policy_arn(EXECUTION_POLICY_ARN)
        .send()
        .await
        .map_err(iam_err)?;

    // The log driver creates the stage log group on first use, which the
    // managed execution policy does not cover
    let logs = serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": "logs:CreateLogGroup",
            "Resource": "*"
        }]
    });
    clients
        .iam
        .put_role_policy()
        .role_name(&name)
        .policy_name("log-group-create")
        .policy_document(logs.to_string())
        .send()
        .await
        .map_err(iam_err)?;

    info!(role = name.as_str(), arn = arn.as_str(), stage = stage, "created execution role");
    Ok(arn)
}
