use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_ec2::types::{GroupIdentifier, Instance, Reservation, SecurityGroup};
use aws_types::region::Region;
use serde_json::{json, Map, Value};

use crate::creds::CredentialSet;

/// Named arguments for a remote operation.
pub type Args = Map<String, Value>;

/// Seam to the EC2 API. Operations are enumerated up front and invoked by
/// name; results come back as a JSON tree in the legacy query-API shape
/// (`reservationSet.item`, `instancesSet.item`, `groupSet.item`,
/// `tagSet.item`, `securityGroupInfo.item`).
#[async_trait]
pub trait RemoteProvider {
    fn operations(&self) -> &[&'static str];

    async fn invoke(&self, operation: &str, args: Args) -> Result<Value>;
}

#[async_trait]
impl<T> RemoteProvider for &T
where
    T: RemoteProvider + Sync,
{
    fn operations(&self) -> &[&'static str] {
        (**self).operations()
    }

    async fn invoke(&self, operation: &str, args: Args) -> Result<Value> {
        (**self).invoke(operation, args).await
    }
}

pub const OPERATIONS: [&str; 5] = [
    "describe_instances",
    "describe_security_groups",
    "associate_address",
    "get_console_output",
    "terminate_instances",
];

pub struct Ec2Provider {
    client: aws_sdk_ec2::Client,
}

impl Ec2Provider {
    /// Endpoint override comes in through the credential set and goes
    /// straight into the config loader, nothing ambient.
    pub async fn new(creds: &CredentialSet, region: String) -> Ec2Provider {
        let credentials = aws_sdk_ec2::config::Credentials::new(
            creds.access_key.clone(),
            creds.secret_key.clone(),
            None,
            None,
            "awssecret",
        );

        let mut loader = aws_config::from_env()
            .credentials_provider(credentials)
            .region(Region::new(region));
        if let Some(endpoint) = &creds.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Ec2Provider {
            client: aws_sdk_ec2::Client::new(&config),
        }
    }

    async fn describe_instances(&self, instance_id: Option<&str>) -> Result<Value> {
        let mut req = self.client.describe_instances();
        if let Some(id) = instance_id {
            req = req.instance_ids(id);
        }
        let resp = req.send().await?;

        let items: Vec<Value> = resp.reservations().iter().map(reservation_to_item).collect();
        Ok(json!({ "reservationSet": { "item": items } }))
    }

    async fn describe_security_groups(&self) -> Result<Value> {
        let resp = self.client.describe_security_groups().send().await?;

        let items: Vec<Value> = resp
            .security_groups()
            .iter()
            .map(security_group_to_item)
            .collect();
        Ok(json!({ "securityGroupInfo": { "item": items } }))
    }

    async fn associate_address(&self, public_ip: &str, instance_id: &str) -> Result<Value> {
        let resp = self
            .client
            .associate_address()
            .public_ip(public_ip)
            .instance_id(instance_id)
            .send()
            .await?;

        let mut result = Map::new();
        result.insert("return".to_string(), json!(true));
        insert_opt(&mut result, "associationId", resp.association_id());
        Ok(Value::Object(result))
    }

    async fn get_console_output(&self, instance_id: &str) -> Result<Value> {
        let resp = self
            .client
            .get_console_output()
            .instance_id(instance_id)
            .send()
            .await?;

        let mut result = Map::new();
        insert_opt(&mut result, "instanceId", resp.instance_id());
        insert_opt(&mut result, "output", resp.output());
        Ok(Value::Object(result))
    }

    async fn terminate_instances(&self, instance_id: &str) -> Result<Value> {
        let resp = self
            .client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await?;

        let items: Vec<Value> = resp
            .terminating_instances()
            .iter()
            .map(|change| {
                let mut item = Map::new();
                insert_opt(&mut item, "instanceId", change.instance_id());
                if let Some(state) = change.current_state() {
                    item.insert(
                        "currentState".to_string(),
                        json!({ "name": state.name().map(|n| n.as_str()) }),
                    );
                }
                if let Some(state) = change.previous_state() {
                    item.insert(
                        "previousState".to_string(),
                        json!({ "name": state.name().map(|n| n.as_str()) }),
                    );
                }
                Value::Object(item)
            })
            .collect();
        Ok(json!({ "instancesSet": { "item": items } }))
    }
}

#[async_trait]
impl RemoteProvider for Ec2Provider {
    fn operations(&self) -> &[&'static str] {
        &OPERATIONS
    }

    async fn invoke(&self, operation: &str, args: Args) -> Result<Value> {
        match operation {
            "describe_instances" => self.describe_instances(optional(&args, "instance_id")).await,
            "describe_security_groups" => self.describe_security_groups().await,
            "associate_address" => {
                self.associate_address(
                    required(&args, "public_ip")?,
                    required(&args, "instance_id")?,
                )
                .await
            }
            "get_console_output" => self.get_console_output(required(&args, "instance_id")?).await,
            "terminate_instances" => {
                self.terminate_instances(required(&args, "instance_id")?)
                    .await
            }
            _ => Err(anyhow!("unsupported operation {operation}")),
        }
    }
}

fn required<'a>(args: &'a Args, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or(anyhow!("missing argument {key}"))
}

fn optional<'a>(args: &'a Args, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        map.insert(key.to_string(), json!(v));
    }
}

fn reservation_to_item(reservation: &Reservation) -> Value {
    let mut item = Map::new();
    insert_opt(&mut item, "reservationId", reservation.reservation_id());
    insert_opt(&mut item, "ownerId", reservation.owner_id());

    // VPC instances report security groups on the instance, not the
    // reservation; fall back so the groupSet sibling is still populated.
    let mut groups = group_set(reservation.groups());
    if groups.is_none() {
        groups = reservation
            .instances()
            .first()
            .and_then(|inst| group_set(inst.security_groups()));
    }
    if let Some(groups) = groups {
        item.insert("groupSet".to_string(), groups);
    }

    let instances: Vec<Value> = reservation.instances().iter().map(instance_to_item).collect();
    item.insert("instancesSet".to_string(), json!({ "item": instances }));

    Value::Object(item)
}

fn group_set(groups: &[GroupIdentifier]) -> Option<Value> {
    if groups.is_empty() {
        return None;
    }
    let items: Vec<Value> = groups
        .iter()
        .map(|g| {
            let mut item = Map::new();
            insert_opt(&mut item, "groupId", g.group_id());
            insert_opt(&mut item, "groupName", g.group_name());
            Value::Object(item)
        })
        .collect();
    Some(json!({ "item": items }))
}

fn instance_to_item(inst: &Instance) -> Value {
    let mut item = Map::new();
    insert_opt(&mut item, "instanceId", inst.instance_id());
    insert_opt(&mut item, "imageId", inst.image_id());
    insert_opt(&mut item, "keyName", inst.key_name());
    insert_opt(&mut item, "dnsName", inst.public_dns_name());
    insert_opt(&mut item, "privateDnsName", inst.private_dns_name());
    insert_opt(&mut item, "ipAddress", inst.public_ip_address());
    insert_opt(&mut item, "privateIpAddress", inst.private_ip_address());
    insert_opt(
        &mut item,
        "instanceType",
        inst.instance_type().map(|t| t.as_str()),
    );
    item.insert(
        "launchType".to_string(),
        json!(inst
            .instance_lifecycle()
            .map(|l| l.as_str())
            .unwrap_or("on-demand")),
    );
    if let Some(state) = inst.state() {
        item.insert(
            "instanceState".to_string(),
            json!({
                "code": state.code(),
                "name": state.name().map(|n| n.as_str()),
            }),
        );
    }
    insert_opt(
        &mut item,
        "availabilityZone",
        inst.placement().and_then(|p| p.availability_zone()),
    );
    if !inst.tags().is_empty() {
        let tags: Vec<Value> = inst
            .tags()
            .iter()
            .map(|t| {
                let mut tag = Map::new();
                insert_opt(&mut tag, "key", t.key());
                insert_opt(&mut tag, "value", t.value());
                Value::Object(tag)
            })
            .collect();
        item.insert("tagSet".to_string(), json!({ "item": tags }));
    }

    Value::Object(item)
}

fn security_group_to_item(group: &SecurityGroup) -> Value {
    let mut item = Map::new();
    insert_opt(&mut item, "groupId", group.group_id());
    insert_opt(&mut item, "groupName", group.group_name());
    insert_opt(&mut item, "ownerId", group.owner_id());
    insert_opt(&mut item, "groupDescription", group.description());
    Value::Object(item)
}
