//! Record publication into a stage's hosted zone: certificate validation
//! CNAMEs and the alias pointing the stage domain at its distribution.

use crate::aws::{route53_err, Error};
use aws_sdk_route53::types::{
    AliasTarget, Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use tracing::info;

/// Hosted zone every CloudFront distribution aliases into
const CLOUDFRONT_ZONE_ID: &str = "Z2FDTNDATAQYW2";

const VALIDATION_TTL: i64 = 300;

/// Publishes (or refreshes) a CNAME record, used for certificate validation.
pub async fn upsert_cname(
    client: &aws_sdk_route53::Client,
    zone_id: &str,
    name: &str,
    value: &str,
) -> Result<(), Error> {
    let record = ResourceRecordSet::builder()
        .name(name)
        .r#type(RrType::Cname)
        .ttl(VALIDATION_TTL)
        .resource_records(
            ResourceRecord::builder()
                .value(value)
                .build()
                .map_err(|e| Error::InvalidRequest(e.to_string()))?,
        )
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    change(client, zone_id, record).await
}

/// Points the stage domain at its distribution. The distribution, not the
/// load balancer, is the canonical public entry point.
pub async fn upsert_alias(
    client: &aws_sdk_route53::Client,
    zone_id: &str,
    domain: &str,
    distribution_domain: &str,
) -> Result<(), Error> {
    let alias = AliasTarget::builder()
        .hosted_zone_id(CLOUDFRONT_ZONE_ID)
        .dns_name(distribution_domain)
        .evaluate_target_health(false)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let record = ResourceRecordSet::builder()
        .name(domain)
        .r#type(RrType::A)
        .alias_target(alias)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    change(client, zone_id, record).await?;
    info!(
        domain = domain,
        target = distribution_domain,
        zone = zone_id,
        "published alias record"
    );
    Ok(())
}

async fn change(
    client: &aws_sdk_route53::Client,
    zone_id: &str,
    record: ResourceRecordSet,
) -> Result<(), Error> {
    let batch = ChangeBatch::builder()
        .changes(
            Change::builder()
                .action(ChangeAction::Upsert)
                .resource_record_set(record)
                .build()
                .map_err(|e| Error::InvalidRequest(e.to_string()))?,
        )
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    client
        .change_resource_record_sets()
        .hosted_zone_id(zone_id)
        .change_batch(batch)
        .send()
        .await
        .map_err(route53_err)?;
    Ok(())
}
