//! Stage trust boundaries.
//!
//! Two groups, created in order: the edge group admits the public internet on
//! the TLS port only; the compute group admits traffic solely from the edge
//! group's identity, so compute tasks are never directly reachable.

use crate::aws::{ec2_err, network::tag_spec, qualified, Clients, Error, TLS_PORT};
use aws_sdk_ec2::types::{Filter, IpPermission, IpRange, ResourceType, UserIdGroupPair};
use tracing::info;

#[derive(Clone, Debug)]
pub struct TrustGroup {
    pub id: String,
    pub name: String,
}

/// Creates the trust group the edge load balancer runs behind.
pub async fn create_edge_group(
    clients: &Clients,
    vpc_id: &str,
    project: &str,
    stage: &str,
) -> Result<TrustGroup, Error> {
    let name = qualified(project, stage, "edge-sg");
    if let Some(group) = find_group(clients, vpc_id, &name).await? {
        info!(sg = group.id.as_str(), stage = stage, "reusing edge trust group");
        return Ok(group);
    }
    let group = create_group(
        clients,
        vpc_id,
        &name,
        "Edge load balancer: TLS from anywhere",
        stage,
    )
    .await?;
    clients
        .ec2
        .authorize_security_group_ingress()
        .group_id(&group.id)
        .ip_permissions(edge_ingress())
        .send()
        .await
        .map_err(ec2_err)?;
    info!(sg = group.id.as_str(), stage = stage, "created edge trust group");
    Ok(group)
}

/// Creates the trust group compute tasks run behind. The edge group must
/// already exist: its identity is the only permitted ingress source.
pub async fn create_compute_group(
    clients: &Clients,
    vpc_id: &str,
    edge: &TrustGroup,
    project: &str,
    stage: &str,
) -> Result<TrustGroup, Error> {
    let name = qualified(project, stage, "compute-sg");
    if let Some(group) = find_group(clients, vpc_id, &name).await? {
        info!(
            sg = group.id.as_str(),
            stage = stage,
            "reusing compute trust group"
        );
        return Ok(group);
    }
    let group = create_group(
        clients,
        vpc_id,
        &name,
        "Compute tasks: ingress from the edge only",
        stage,
    )
    .await?;
    clients
        .ec2
        .authorize_security_group_ingress()
        .group_id(&group.id)
        .ip_permissions(compute_ingress(&edge.id))
        .send()
        .await
        .map_err(ec2_err)?;
    info!(
        sg = group.id.as_str(),
        edge = edge.id.as_str(),
        stage = stage,
        "created compute trust group"
    );
    Ok(group)
}

/// Ingress for the edge: the public internet, TLS port only.
fn edge_ingress() -> IpPermission {
    IpPermission::builder()
        .ip_protocol("tcp")
        .from_port(TLS_PORT)
        .to_port(TLS_PORT)
        .ip_ranges(
            IpRange::builder()
                .cidr_ip("0.0.0.0/0")
                .description("TLS from anywhere")
                .build(),
        )
        .build()
}

/// Ingress for compute tasks: any TCP port, sourced only from the edge
/// group's identity, never a CIDR range.
fn compute_ingress(edge_group_id: &str) -> IpPermission {
    IpPermission::builder()
        .ip_protocol("tcp")
        .from_port(0)
        .to_port(65535)
        .user_id_group_pairs(UserIdGroupPair::builder().group_id(edge_group_id).build())
        .build()
}

async fn find_group(
    clients: &Clients,
    vpc_id: &str,
    name: &str,
) -> Result<Option<TrustGroup>, Error> {
    let resp = clients
        .ec2
        .describe_security_groups()
        .filters(Filter::builder().name("group-name").values(name).build())
        .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
        .send()
        .await
        .map_err(ec2_err)?;
    Ok(resp
        .security_groups()
        .first()
        .and_then(|g| g.group_id())
        .map(|id| TrustGroup {
            id: id.to_string(),
            name: name.to_string(),
        }))
}

async fn create_group(
    clients: &Clients,
    vpc_id: &str,
    name: &str,
    description: &str,
    stage: &str,
) -> Result<TrustGroup, Error> {
    let resp = clients
        .ec2
        .create_security_group()
        .group_name(name)
        .description(description)
        .vpc_id(vpc_id)
        .tag_specifications(tag_spec(ResourceType::SecurityGroup, name, stage))
        .send()
        .await
        .map_err(ec2_err)?;
    let id = resp
        .group_id()
        .ok_or(Error::MissingField("security group id"))?
        .to_string();
    Ok(TrustGroup {
        id,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_ingress_is_tls_from_anywhere() {
        let rule = edge_ingress();
        assert_eq!(rule.from_port(), Some(TLS_PORT));
        assert_eq!(rule.to_port(), Some(TLS_PORT));
        assert_eq!(rule.ip_ranges().len(), 1);
        assert_eq!(rule.ip_ranges()[0].cidr_ip(), Some("0.0.0.0/0"));
        assert!(rule.user_id_group_pairs().is_empty());
    }

    #[test]
    fn test_compute_ingress_sources_only_the_edge_group() {
        let rule = compute_ingress("sg-edge");
        assert!(rule.ip_ranges().is_empty(), "compute must never admit a CIDR");
        assert_eq!(rule.user_id_group_pairs().len(), 1);
        assert_eq!(rule.user_id_group_pairs()[0].group_id(), Some("sg-edge"));
    }

    #[test]
    fn test_compute_ingress_spans_all_tcp_ports() {
        let rule = compute_ingress("sg-edge");
        assert_eq!(rule.ip_protocol(), Some("tcp"));
        assert_eq!(rule.from_port(), Some(0));
        assert_eq!(rule.to_port(), Some(65535));
    }
}
