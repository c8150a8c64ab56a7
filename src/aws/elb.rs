//! Health-checked target pool and the internet-facing TLS edge in front of it.

use crate::aws::{
    acm::CertificateBinding, elb_err, network::Network, qualified, security::TrustGroup, Clients,
    Error, CONTAINER_PORT, HTTP_PORT, TLS_PORT,
};
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, Certificate as ListenerCertificate, LoadBalancerSchemeEnum,
    LoadBalancerTypeEnum, ProtocolEnum, RedirectActionConfig, RedirectActionStatusCodeEnum,
    TargetTypeEnum,
};
use tracing::info;

/// Liveness probe path
const HEALTH_CHECK_PATH: &str = "/";

/// Liveness probe interval. Generous enough to tolerate container cold
/// starts.
const HEALTH_CHECK_INTERVAL: i32 = 120;

#[derive(Clone, Debug)]
pub struct TargetGroup {
    pub arn: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct LoadBalancer {
    pub arn: String,
    pub dns_name: String,
    pub name: String,
}

/// Creates the routable pool compute tasks register into and the edge
/// forwards into. Targets are addressed by IP: container tasks carry their
/// own network interfaces, there is no instance to register.
///
/// The create call is idempotent: an existing pool with this name and the
/// same settings is returned as-is.
pub async fn create_target_group(
    clients: &Clients,
    network: &Network,
    project: &str,
    stage: &str,
) -> Result<TargetGroup, Error> {
    let name = qualified(project, stage, "targets");
    let resp = clients
        .elb
        .create_target_group()
        .name(&name)
        .protocol(ProtocolEnum::Http)
        .port(CONTAINER_PORT)
        .vpc_id(&network.vpc_id)
        .target_type(TargetTypeEnum::Ip)
        .health_check_protocol(ProtocolEnum::Http)
        .health_check_path(HEALTH_CHECK_PATH)
        .health_check_interval_seconds(HEALTH_CHECK_INTERVAL)
        .send()
        .await
        .map_err(elb_err)?;
    let arn = resp
        .target_groups()
        .first()
        .and_then(|t| t.target_group_arn())
        .ok_or(Error::MissingField("target group ARN"))?
        .to_string();
    info!(
        target_group = arn.as_str(),
        stage = stage,
        "created target group"
    );
    Ok(TargetGroup { arn, name })
}

/// Creates the internet-facing edge in the stage's public subnets: a TLS
/// listener forwarding into the target pool and a plain-HTTP listener that
/// only redirects. The trust group is attached last, once both listeners
/// exist.
pub async fn create_load_balancer(
    clients: &Clients,
    network: &Network,
    target_group: &TargetGroup,
    trust_group: &TrustGroup,
    certificate: &CertificateBinding,
    project: &str,
    stage: &str,
) -> Result<LoadBalancer, Error> {
    let name = qualified(project, stage, "edge");
    let mut request = clients
        .elb
        .create_load_balancer()
        .name(&name)
        .scheme(LoadBalancerSchemeEnum::InternetFacing)
        .r#type(LoadBalancerTypeEnum::Application);
    for subnet in network.public_subnet_ids() {
        request = request.subnets(subnet);
    }
    let resp = request.send().await.map_err(elb_err)?;
    let lb = resp
        .load_balancers()
        .first()
        .ok_or(Error::MissingField("load balancer"))?;
    let arn = lb
        .load_balancer_arn()
        .ok_or(Error::MissingField("load balancer ARN"))?
        .to_string();
    let dns_name = lb
        .dns_name()
        .ok_or(Error::MissingField("load balancer DNS name"))?
        .to_string();
    info!(lb = arn.as_str(), stage = stage, "created load balancer");

    // On re-adoption the listeners already exist
    let resp = clients
        .elb
        .describe_listeners()
        .load_balancer_arn(&arn)
        .send()
        .await
        .map_err(elb_err)?;
    let listener_ports: Vec<i32> = resp.listeners().iter().filter_map(|l| l.port()).collect();

    if !listener_ports.contains(&TLS_PORT) {
        clients
            .elb
            .create_listener()
            .load_balancer_arn(&arn)
            .protocol(ProtocolEnum::Https)
            .port(TLS_PORT)
            .certificates(
                ListenerCertificate::builder()
                    .certificate_arn(&certificate.arn)
                    .build(),
            )
            .default_actions(forward_action(&target_group.arn)?)
            .send()
            .await
            .map_err(elb_err)?;
        info!(lb = arn.as_str(), port = TLS_PORT, "created TLS listener");
    }

    if !listener_ports.contains(&HTTP_PORT) {
        clients
            .elb
            .create_listener()
            .load_balancer_arn(&arn)
            .protocol(ProtocolEnum::Http)
            .port(HTTP_PORT)
            .default_actions(redirect_to_tls_action()?)
            .send()
            .await
            .map_err(elb_err)?;
        info!(lb = arn.as_str(), port = HTTP_PORT, "created redirect listener");
    }

    // Seal the trust boundary only after both listeners are defined
    clients
        .elb
        .set_security_groups()
        .load_balancer_arn(&arn)
        .security_groups(&trust_group.id)
        .send()
        .await
        .map_err(elb_err)?;
    info!(
        lb = arn.as_str(),
        sg = trust_group.id.as_str(),
        "attached edge trust group"
    );

    Ok(LoadBalancer {
        arn,
        dns_name,
        name,
    })
}

/// Forward into the stage target pool.
fn forward_action(target_group_arn: &str) -> Result<Action, Error> {
    Action::builder()
        .r#type(ActionTypeEnum::Forward)
        .target_group_arn(target_group_arn)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))
}

/// Permanent redirect to the TLS listener. Plain HTTP is never forwarded to
/// a target, whatever the pool's health.
fn redirect_to_tls_action() -> Result<Action, Error> {
    let config = RedirectActionConfig::builder()
        .protocol("HTTPS")
        .port(TLS_PORT.to_string())
        .status_code(RedirectActionStatusCodeEnum::Http301)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    Action::builder()
        .r#type(ActionTypeEnum::Redirect)
        .redirect_config(config)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_listener_action_is_a_redirect() {
        let action = redirect_to_tls_action().unwrap();
        assert_eq!(action.r#type(), &ActionTypeEnum::Redirect);
        assert!(action.target_group_arn().is_none(), "must never forward");
        let config = action.redirect_config().unwrap();
        assert_eq!(config.status_code(), &RedirectActionStatusCodeEnum::Http301);
        assert_eq!(config.protocol(), Some("HTTPS"));
        assert_eq!(config.port(), Some("443"));
    }

    #[test]
    fn test_tls_listener_action_forwards_to_pool() {
        let action = forward_action("arn:targets").unwrap();
        assert_eq!(action.r#type(), &ActionTypeEnum::Forward);
        assert_eq!(action.target_group_arn(), Some("arn:targets"));
    }
}
