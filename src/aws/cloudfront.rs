//! Edge distribution fronting a stage's load balancer.
//!
//! One default behavior, origin = the load balancer, served under the stage
//! domain with the distribution-scoped certificate. The distribution is the
//! canonical public entry point for the stage; the assembler aliases the
//! stage domain to it.

use crate::aws::{
    acm::CertificateBinding, cloudfront_err, elb::LoadBalancer, qualified, Clients, Error,
    HTTP_PORT, TLS_PORT,
};
use aws_sdk_cloudfront::types::{
    Aliases, CustomOriginConfig, DefaultCacheBehavior, DistributionConfig, MinimumProtocolVersion,
    Origin, OriginProtocolPolicy, Origins, PriceClass, SslSupportMethod, ViewerCertificate,
    ViewerProtocolPolicy,
};
use tracing::info;

/// Managed cache policy: CachingOptimized
const CACHING_OPTIMIZED_POLICY_ID: &str = "658327ea-f89d-4fab-a63d-7e88639e58f6";

#[derive(Clone, Debug)]
pub struct Distribution {
    pub id: String,
    pub domain_name: String,
}

/// Creates the stage distribution, or re-adopts one found by its
/// stage-qualified comment.
pub async fn create_distribution(
    clients: &Clients,
    load_balancer: &LoadBalancer,
    domain: &str,
    certificate: &CertificateBinding,
    project: &str,
    stage: &str,
) -> Result<Distribution, Error> {
    let comment = qualified(project, stage, "distribution");
    if let Some((id, domain_name)) = find_existing_distribution(clients, &comment).await? {
        info!(
            id = id.as_str(),
            domain = domain_name.as_str(),
            stage = stage,
            "reusing distribution"
        );
        return Ok(Distribution { id, domain_name });
    }

    let origin_id = format!("{}-origin", load_balancer.name);
    let origin_config = CustomOriginConfig::builder()
        .http_port(HTTP_PORT)
        .https_port(TLS_PORT)
        .origin_protocol_policy(OriginProtocolPolicy::HttpsOnly)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let origin = Origin::builder()
        .id(&origin_id)
        .domain_name(&load_balancer.dns_name)
        .custom_origin_config(origin_config)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let origins = Origins::builder()
        .quantity(1)
        .items(origin)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

    let default_cache_behavior = DefaultCacheBehavior::builder()
        .target_origin_id(&origin_id)
        .viewer_protocol_policy(ViewerProtocolPolicy::RedirectToHttps)
        .cache_policy_id(CACHING_OPTIMIZED_POLICY_ID)
        .compress(true)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

    let aliases = Aliases::builder()
        .quantity(1)
        .items(domain)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

    let viewer_certificate = ViewerCertificate::builder()
        .acm_certificate_arn(&certificate.arn)
        .ssl_support_method(SslSupportMethod::SniOnly)
        .minimum_protocol_version(MinimumProtocolVersion::TlSv122021)
        .build();

    // Deterministic caller reference: re-creation with the same reference is
    // a no-op instead of a duplicate
    let dist_config = DistributionConfig::builder()
        .origins(origins)
        .default_cache_behavior(default_cache_behavior)
        .aliases(aliases)
        .viewer_certificate(viewer_certificate)
        .comment(&comment)
        .caller_reference(&comment)
        .enabled(true)
        .price_class(PriceClass::PriceClassAll)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

    let resp = clients
        .cloudfront
        .create_distribution()
        .distribution_config(dist_config)
        .send()
        .await
        .map_err(cloudfront_err)?;
    let dist = resp
        .distribution
        .ok_or(Error::MissingField("distribution"))?;
    let id = dist.id().to_string();
    let domain_name = dist.domain_name().to_string();
    info!(
        id = id.as_str(),
        domain = domain_name.as_str(),
        origin = load_balancer.dns_name.as_str(),
        stage = stage,
        "created distribution"
    );
    Ok(Distribution { id, domain_name })
}

async fn find_existing_distribution(
    clients: &Clients,
    comment: &str,
) -> Result<Option<(String, String)>, Error> {
    let mut marker: Option<String> = None;
    loop {
        let mut req = clients.cloudfront.list_distributions();
        if let Some(m) = marker {
            req = req.marker(m);
        }
        let resp = req.send().await.map_err(cloudfront_err)?;

        let Some(list) = resp.distribution_list else {
            return Ok(None);
        };
        for dist in list.items() {
            if dist.comment() == comment {
                return Ok(Some((dist.id().to_string(), dist.domain_name().to_string())));
            }
        }
        if list.next_marker.is_some() {
            marker = list.next_marker.clone();
        } else {
            return Ok(None);
        }
    }
}
