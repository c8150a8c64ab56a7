//! DNS-validated certificate issuance.
//!
//! A returned binding is a handle: the request has been accepted and the
//! validation record published, but issuance completes asynchronously once
//! the issuing authority observes the record. Consumers that need an issued
//! certificate await one with [wait_until_issued].

use crate::aws::{acm_err, dns, qualified, Clients, Error};
use aws_sdk_acm::types::{CertificateStatus, Tag, ValidationMethod};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

/// Attempts to read the validation record off a freshly-requested certificate
const RECORD_POLL_ATTEMPTS: usize = 30;

/// Interval between validation record reads
const RECORD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts to observe issuance before giving up. DNS validation normally
/// completes within minutes of the record resolving.
const ISSUANCE_POLL_ATTEMPTS: usize = 60;

/// Interval between issuance checks
const ISSUANCE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Which consumer a binding is issued for. The two scopes validate in
/// different regional contexts and are not interchangeable: a load-balancer
/// binding lives in the stage region, a distribution binding in the edge
/// issuance region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateScope {
    LoadBalancer,
    Distribution,
}

impl CertificateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateScope::LoadBalancer => "lb-cert",
            CertificateScope::Distribution => "cdn-cert",
        }
    }

    fn client<'a>(&self, clients: &'a Clients) -> &'a aws_sdk_acm::Client {
        match self {
            CertificateScope::LoadBalancer => &clients.acm,
            CertificateScope::Distribution => &clients.edge_acm,
        }
    }
}

/// Handle to a requested certificate
#[derive(Clone, Debug)]
pub struct CertificateBinding {
    pub arn: String,
    pub domain: String,
    pub scope: CertificateScope,
}

/// Requests a DNS-validated certificate for the stage domain and publishes
/// its validation record into the owning zone. Re-adopts an existing binding
/// carrying the stage-qualified Name tag.
pub async fn issue_certificate(
    clients: &Clients,
    domain: &str,
    zone_id: &str,
    scope: CertificateScope,
    project: &str,
    stage: &str,
) -> Result<CertificateBinding, Error> {
    let client = scope.client(clients);
    let name = qualified(project, stage, scope.as_str());

    if let Some(arn) = find_certificate(client, domain, &name).await? {
        info!(
            arn = arn.as_str(),
            scope = scope.as_str(),
            stage = stage,
            "reusing certificate"
        );
        return Ok(CertificateBinding {
            arn,
            domain: domain.to_string(),
            scope,
        });
    }

    let resp = client
        .request_certificate()
        .domain_name(domain)
        .validation_method(ValidationMethod::Dns)
        .idempotency_token(idempotency_token(&name))
        .tags(
            Tag::builder()
                .key("Name")
                .value(&name)
                .build()
                .map_err(|e| Error::InvalidRequest(e.to_string()))?,
        )
        .send()
        .await
        .map_err(acm_err)?;
    let arn = resp
        .certificate_arn()
        .ok_or(Error::MissingField("certificate ARN"))?
        .to_string();
    info!(
        arn = arn.as_str(),
        domain = domain,
        scope = scope.as_str(),
        "requested certificate"
    );

    let (record_name, record_value) = validation_record(client, &arn).await?;
    dns::upsert_cname(&clients.route53, zone_id, &record_name, &record_value).await?;
    info!(
        record = record_name.as_str(),
        zone = zone_id,
        "published validation record"
    );

    Ok(CertificateBinding {
        arn,
        domain: domain.to_string(),
        scope,
    })
}

/// Blocks until the binding's certificate is issued. A pending certificate is
/// never terminal: exhausting the poll attempts is retryable by re-running
/// assembly once the zone's delegation is fixed.
pub async fn wait_until_issued(
    clients: &Clients,
    binding: &CertificateBinding,
) -> Result<(), Error> {
    let client = binding.scope.client(clients);
    for attempt in 0..ISSUANCE_POLL_ATTEMPTS {
        let resp = client
            .describe_certificate()
            .certificate_arn(&binding.arn)
            .send()
            .await
            .map_err(acm_err)?;
        match resp.certificate().and_then(|c| c.status()) {
            Some(CertificateStatus::Issued) => {
                info!(arn = binding.arn.as_str(), "certificate issued");
                return Ok(());
            }
            Some(CertificateStatus::Failed) => {
                let reason = resp
                    .certificate()
                    .and_then(|c| c.failure_reason())
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(Error::CertificateFailed {
                    arn: binding.arn.clone(),
                    reason,
                });
            }
            status => {
                debug!(
                    arn = binding.arn.as_str(),
                    attempt = attempt,
                    status = ?status,
                    "certificate validation pending"
                );
            }
        }
        sleep(ISSUANCE_POLL_INTERVAL).await;
    }
    Err(Error::CertificateTimeout {
        arn: binding.arn.clone(),
        attempts: ISSUANCE_POLL_ATTEMPTS,
    })
}

/// Finds an existing certificate for the domain carrying the stage-qualified
/// Name tag.
async fn find_certificate(
    client: &aws_sdk_acm::Client,
    domain: &str,
    name: &str,
) -> Result<Option<String>, Error> {
    let mut next_token: Option<String> = None;
    loop {
        let mut req = client.list_certificates();
        if let Some(token) = next_token {
            req = req.next_token(token);
        }
        let resp = req.send().await.map_err(acm_err)?;
        for summary in resp.certificate_summary_list() {
            if summary.domain_name() != Some(domain) {
                continue;
            }
            let Some(arn) = summary.certificate_arn() else {
                continue;
            };
            let tags = client
                .list_tags_for_certificate()
                .certificate_arn(arn)
                .send()
                .await
                .map_err(acm_err)?;
            let named = tags
                .tags()
                .iter()
                .any(|t| t.key() == "Name" && t.value() == Some(name));
            if named {
                return Ok(Some(arn.to_string()));
            }
        }
        next_token = resp.next_token().map(|t| t.to_string());
        if next_token.is_none() {
            return Ok(None);
        }
    }
}

/// Reads the CNAME validation record off a requested certificate. The record
/// appears shortly after the request is accepted.
async fn validation_record(
    client: &aws_sdk_acm::Client,
    arn: &str,
) -> Result<(String, String), Error> {
    for _ in 0..RECORD_POLL_ATTEMPTS {
        let resp = client
            .describe_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(acm_err)?;
        if let Some(record) = resp
            .certificate()
            .and_then(|c| c.domain_validation_options().first())
            .and_then(|o| o.resource_record())
        {
            return Ok((record.name().to_string(), record.value().to_string()));
        }
        sleep(RECORD_POLL_INTERVAL).await;
    }
    Err(Error::MissingField("certificate validation record"))
}

/// Deterministic issuance token, constrained to the word characters the
/// issuing API accepts.
fn idempotency_token(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_token_is_word_only() {
        let token = idempotency_token("web-beta-lb-cert");
        assert_eq!(token, "webbetalbcert");
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_idempotency_token_bounded() {
        let token = idempotency_token(&"a".repeat(64));
        assert_eq!(token.len(), 32);
    }

    #[test]
    fn test_scopes_are_distinct() {
        assert_ne!(
            CertificateScope::LoadBalancer.as_str(),
            CertificateScope::Distribution.as_str()
        );
    }
}
