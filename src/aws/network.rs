//! Isolated stage network: a VPC spanning two availability zones, each split
//! into a public and a private subnet.
//!
//! Public subnets carry the default route to the internet gateway and host
//! the load balancer and (for now) the compute tasks. Private subnets are
//! provisioned with no internet route; moving tasks into them behind a NAT
//! gateway is an extension point, not implemented behavior.

use crate::aws::{ec2_err, qualified, Clients, Error};
use aws_sdk_ec2::types::{
    AttributeBooleanValue, Filter, ResourceType, Tag, TagSpecification,
};
use tracing::info;

/// Number of availability zones every stage network spans
pub const ZONE_COUNT: usize = 2;

const VPC_CIDR: &str = "10.0.0.0/16";

/// Role a subnet plays inside the stage network
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubnetRole {
    Public,
    Private,
}

impl SubnetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetRole::Public => "public",
            SubnetRole::Private => "private",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(SubnetRole::Public),
            "private" => Some(SubnetRole::Private),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubnetInfo {
    pub id: String,
    pub zone: String,
    pub role: SubnetRole,
}

/// Stage network handle threaded to every component that places resources
#[derive(Clone, Debug)]
pub struct Network {
    pub vpc_id: String,
    pub subnets: Vec<SubnetInfo>,
}

impl Network {
    pub fn public_subnet_ids(&self) -> Vec<String> {
        self.subnet_ids(SubnetRole::Public)
    }

    pub fn private_subnet_ids(&self) -> Vec<String> {
        self.subnet_ids(SubnetRole::Private)
    }

    fn subnet_ids(&self, role: SubnetRole) -> Vec<String> {
        self.subnets
            .iter()
            .filter(|s| s.role == role)
            .map(|s| s.id.clone())
            .collect()
    }
}

/// Tag specification applied to every EC2-scoped stage resource
pub(crate) fn tag_spec(resource_type: ResourceType, name: &str, stage: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key("Name").value(name).build())
        .tags(Tag::builder().key("stage").value(stage).build())
        .build()
}

/// Allocates the stage network, or re-adopts one a previous assembly left
/// behind. Fatal if the region cannot provide two availability zones.
pub async fn create_network(
    clients: &Clients,
    project: &str,
    stage: &str,
) -> Result<Network, Error> {
    let name = qualified(project, stage, "vpc");
    if let Some(network) = find_network(clients, &name).await? {
        // A half-wired network (e.g. an aborted assembly) is not silently
        // adopted
        if network.subnets.len() < ZONE_COUNT * 2 {
            return Err(Error::InvalidRequest(format!(
                "stage network {} is partially provisioned; tear it down before reassembly",
                network.vpc_id
            )));
        }
        info!(
            vpc = network.vpc_id.as_str(),
            stage = stage,
            "reusing stage network"
        );
        return Ok(network);
    }

    let zones = available_zones(clients).await?;
    if zones.len() < ZONE_COUNT {
        return Err(Error::InsufficientZones {
            region: clients.region.clone(),
            available: zones.len(),
            required: ZONE_COUNT,
        });
    }
    let zones = &zones[..ZONE_COUNT];

    let vpc_id = create_vpc(clients, &name, stage).await?;
    info!(vpc = vpc_id.as_str(), stage = stage, "created VPC");

    let igw_id = create_and_attach_igw(clients, &vpc_id, project, stage).await?;
    info!(
        igw = igw_id.as_str(),
        vpc = vpc_id.as_str(),
        "created and attached IGW"
    );

    let route_table_id = create_public_route_table(clients, &vpc_id, &igw_id, project, stage).await?;
    info!(
        route_table = route_table_id.as_str(),
        vpc = vpc_id.as_str(),
        "created public route table"
    );

    let mut subnets = Vec::with_capacity(zones.len() * 2);
    for (idx, zone) in zones.iter().enumerate() {
        let public_cidr = format!("10.0.{idx}.0/24");
        let public_id = create_subnet(
            clients,
            &vpc_id,
            &public_cidr,
            zone,
            SubnetRole::Public,
            project,
            stage,
        )
        .await?;
        associate_public_subnet(clients, &route_table_id, &public_id).await?;
        info!(
            subnet = public_id.as_str(),
            zone = zone.as_str(),
            "created public subnet"
        );
        subnets.push(SubnetInfo {
            id: public_id,
            zone: zone.clone(),
            role: SubnetRole::Public,
        });

        let private_cidr = format!("10.0.{}.0/24", 100 + idx);
        let private_id = create_subnet(
            clients,
            &vpc_id,
            &private_cidr,
            zone,
            SubnetRole::Private,
            project,
            stage,
        )
        .await?;
        info!(
            subnet = private_id.as_str(),
            zone = zone.as_str(),
            "created private subnet"
        );
        subnets.push(SubnetInfo {
            id: private_id,
            zone: zone.clone(),
            role: SubnetRole::Private,
        });
    }

    Ok(Network { vpc_id, subnets })
}

/// Re-adopts a stage network by its Name tag, along with its subnets.
async fn find_network(clients: &Clients, name: &str) -> Result<Option<Network>, Error> {
    let resp = clients
        .ec2
        .describe_vpcs()
        .filters(Filter::builder().name("tag:Name").values(name).build())
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .map_err(ec2_err)?;
    let Some(vpc_id) = resp
        .vpcs()
        .first()
        .and_then(|v| v.vpc_id())
        .map(|id| id.to_string())
    else {
        return Ok(None);
    };

    let resp = clients
        .ec2
        .describe_subnets()
        .filters(Filter::builder().name("vpc-id").values(&vpc_id).build())
        .send()
        .await
        .map_err(ec2_err)?;
    let mut subnets = Vec::new();
    for subnet in resp.subnets() {
        let role = subnet
            .tags()
            .iter()
            .find(|t| t.key() == Some("role"))
            .and_then(|t| t.value())
            .and_then(SubnetRole::parse);
        let (Some(role), Some(id), Some(zone)) =
            (role, subnet.subnet_id(), subnet.availability_zone())
        else {
            continue;
        };
        subnets.push(SubnetInfo {
            id: id.to_string(),
            zone: zone.to_string(),
            role,
        });
    }
    Ok(Some(Network { vpc_id, subnets }))
}

async fn available_zones(clients: &Clients) -> Result<Vec<String>, Error> {
    let resp = clients
        .ec2
        .describe_availability_zones()
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .map_err(ec2_err)?;
    let mut zones: Vec<String> = resp
        .availability_zones()
        .iter()
        .filter_map(|z| z.zone_name().map(|n| n.to_string()))
        .collect();
    zones.sort();
    Ok(zones)
}

async fn create_vpc(clients: &Clients, name: &str, stage: &str) -> Result<String, Error> {
    let resp = clients
        .ec2
        .create_vpc()
        .cidr_block(VPC_CIDR)
        .tag_specifications(tag_spec(ResourceType::Vpc, name, stage))
        .send()
        .await
        .map_err(ec2_err)?;
    let vpc_id = resp
        .vpc()
        .and_then(|v| v.vpc_id())
        .ok_or(Error::MissingField("VPC id"))?
        .to_string();

    // Load balancer and service discovery need DNS resolution inside the VPC
    clients
        .ec2
        .modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_support(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(ec2_err)?;
    clients
        .ec2
        .modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(ec2_err)?;
    Ok(vpc_id)
}

async fn create_and_attach_igw(
    clients: &Clients,
    vpc_id: &str,
    project: &str,
    stage: &str,
) -> Result<String, Error> {
    let resp = clients
        .ec2
        .create_internet_gateway()
        .tag_specifications(tag_spec(
            ResourceType::InternetGateway,
            &qualified(project, stage, "igw"),
            stage,
        ))
        .send()
        .await
        .map_err(ec2_err)?;
    let igw_id = resp
        .internet_gateway()
        .and_then(|i| i.internet_gateway_id())
        .ok_or(Error::MissingField("IGW id"))?
        .to_string();
    clients
        .ec2
        .attach_internet_gateway()
        .internet_gateway_id(&igw_id)
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(ec2_err)?;
    Ok(igw_id)
}

async fn create_public_route_table(
    clients: &Clients,
    vpc_id: &str,
    igw_id: &str,
    project: &str,
    stage: &str,
) -> Result<String, Error> {
    let resp = clients
        .ec2
        .create_route_table()
        .vpc_id(vpc_id)
        .tag_specifications(tag_spec(
            ResourceType::RouteTable,
            &qualified(project, stage, "public-rt"),
            stage,
        ))
        .send()
        .await
        .map_err(ec2_err)?;
    let route_table_id = resp
        .route_table()
        .and_then(|r| r.route_table_id())
        .ok_or(Error::MissingField("route table id"))?
        .to_string();
    clients
        .ec2
        .create_route()
        .route_table_id(&route_table_id)
        .destination_cidr_block("0.0.0.0/0")
        .gateway_id(igw_id)
        .send()
        .await
        .map_err(ec2_err)?;
    Ok(route_table_id)
}

async fn create_subnet(
    clients: &Clients,
    vpc_id: &str,
    cidr: &str,
    zone: &str,
    role: SubnetRole,
    project: &str,
    stage: &str,
) -> Result<String, Error> {
    let name = qualified(project, stage, &format!("{}-{}", role.as_str(), zone));
    let spec = TagSpecification::builder()
        .resource_type(ResourceType::Subnet)
        .tags(Tag::builder().key("Name").value(&name).build())
        .tags(Tag::builder().key("stage").value(stage).build())
        .tags(Tag::builder().key("role").value(role.as_str()).build())
        .build();
    let resp = clients
        .ec2
        .create_subnet()
        .vpc_id(vpc_id)
        .cidr_block(cidr)
        .availability_zone(zone)
        .tag_specifications(spec)
        .send()
        .await
        .map_err(ec2_err)?;
    resp.subnet()
        .and_then(|s| s.subnet_id())
        .map(|id| id.to_string())
        .ok_or(Error::MissingField("subnet id"))
}

async fn associate_public_subnet(
    clients: &Clients,
    route_table_id: &str,
    subnet_id: &str,
) -> Result<(), Error> {
    clients
        .ec2
        .associate_route_table()
        .route_table_id(route_table_id)
        .subnet_id(subnet_id)
        .send()
        .await
        .map_err(ec2_err)?;
    clients
        .ec2
        .modify_subnet_attribute()
        .subnet_id(subnet_id)
        .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(ec2_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Network {
        Network {
            vpc_id: "vpc-123".to_string(),
            subnets: vec![
                SubnetInfo {
                    id: "subnet-pub-a".to_string(),
                    zone: "us-west-2a".to_string(),
                    role: SubnetRole::Public,
                },
                SubnetInfo {
                    id: "subnet-priv-a".to_string(),
                    zone: "us-west-2a".to_string(),
                    role: SubnetRole::Private,
                },
                SubnetInfo {
                    id: "subnet-pub-b".to_string(),
                    zone: "us-west-2b".to_string(),
                    role: SubnetRole::Public,
                },
                SubnetInfo {
                    id: "subnet-priv-b".to_string(),
                    zone: "us-west-2b".to_string(),
                    role: SubnetRole::Private,
                },
            ],
        }
    }

    #[test]
    fn test_subnet_roles_partition() {
        let network = network();
        assert_eq!(
            network.public_subnet_ids(),
            vec!["subnet-pub-a", "subnet-pub-b"]
        );
        assert_eq!(
            network.private_subnet_ids(),
            vec!["subnet-priv-a", "subnet-priv-b"]
        );
    }

    #[test]
    fn test_subnets_span_both_zones() {
        let network = network();
        let zones: std::collections::HashSet<&str> = network
            .subnets
            .iter()
            .filter(|s| s.role == SubnetRole::Public)
            .map(|s| s.zone.as_str())
            .collect();
        assert_eq!(zones.len(), ZONE_COUNT);
    }

    #[test]
    fn test_role_round_trip() {
        for role in [SubnetRole::Public, SubnetRole::Private] {
            assert_eq!(SubnetRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(SubnetRole::parse("isolated"), None);
    }
}
