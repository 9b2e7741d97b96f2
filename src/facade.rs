use anyhow::{anyhow, Context, Result};
use base64::prelude::*;
use serde_json::{json, Map, Value};

use crate::provider::{Args, RemoteProvider};

/// Fields kept by `instances` when the caller does not pick their own.
pub const DEFAULT_FIELDS: [&str; 6] = [
    "instanceId",
    "ipAddress",
    "groups",
    "launchType",
    "instanceType",
    "tagSet",
];

/// Short listing, enough to tell instances apart at a glance.
pub const BRIEF_FIELDS: [&str; 4] = ["instanceId", "ipAddress", "tagSet", "instanceState"];

/// The named commands, listed when generic dispatch resolves nothing.
pub const COMMANDS: [&str; 6] = [
    "instances",
    "instance",
    "associate",
    "sgs",
    "log",
    "terminate",
];

/// Outcome of generic dispatch. `NotFound` is a discovery aid carrying the
/// named commands, not a failure.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Found(Value),
    NotFound(Vec<&'static str>),
}

pub struct Ec2Facade<P> {
    provider: P,
}

impl<P: RemoteProvider> Ec2Facade<P> {
    pub fn new(provider: P) -> Ec2Facade<P> {
        Ec2Facade { provider }
    }

    /// List instances, one record per reservation item, keeping only the
    /// fields in `keep`. `groups` is hoisted from the reservation-level
    /// `groupSet` sibling when present; `tagSet` is flattened to a plain
    /// key/value mapping.
    pub async fn instances(&self, keep: &[&str]) -> Result<Vec<Map<String, Value>>> {
        let resp = self.provider.invoke("describe_instances", Args::new()).await?;
        let items = resp
            .get("reservationSet")
            .and_then(|v| v.get("item"))
            .and_then(Value::as_array)
            .ok_or(anyhow!("could not parse reservations"))?;

        let mut records = Vec::new();
        for item in items {
            let inst = item
                .get("instancesSet")
                .and_then(|v| v.get("item"))
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_object)
                .ok_or(anyhow!("could not parse instances"))?;

            let mut record: Map<String, Value> = inst
                .iter()
                .filter(|(k, _)| keep.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            if keep.contains(&"groups") {
                if let Some(group_set) = item.get("groupSet") {
                    let ids = group_set
                        .get("item")
                        .and_then(Value::as_array)
                        .ok_or(anyhow!("could not parse group set"))?
                        .iter()
                        .map(|g| g.get("groupId").cloned().ok_or(anyhow!("could not parse group id")))
                        .collect::<Result<Vec<Value>>>()?;
                    record.insert("groups".to_string(), Value::Array(ids));
                }
            }

            if let Some(tag_set) = record.get("tagSet") {
                let flat = flatten_tags(tag_set)?;
                record.insert("tagSet".to_string(), flat);
            }

            records.push(record);
        }

        Ok(records)
    }

    /// Raw describe for one instance, no reshaping.
    pub async fn instance(&self, id: &str) -> Result<Value> {
        self.provider
            .invoke("describe_instances", arg("instance_id", id))
            .await
    }

    pub async fn associate(&self, address: &str, id: &str) -> Result<Value> {
        let mut args = arg("public_ip", address);
        args.insert("instance_id".to_string(), json!(id));
        self.provider.invoke("associate_address", args).await
    }

    /// Security groups, each filtered down to groupName and ownerId.
    pub async fn security_groups(&self) -> Result<Vec<Map<String, Value>>> {
        let resp = self
            .provider
            .invoke("describe_security_groups", Args::new())
            .await?;
        let items = resp
            .get("securityGroupInfo")
            .and_then(|v| v.get("item"))
            .and_then(Value::as_array)
            .ok_or(anyhow!("could not parse security groups"))?;

        items
            .iter()
            .map(|item| {
                let group = item
                    .as_object()
                    .ok_or(anyhow!("could not parse security group"))?;
                Ok(group
                    .iter()
                    .filter(|(k, _)| k.as_str() == "groupName" || k.as_str() == "ownerId")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect())
            })
            .collect()
    }

    /// Console log for an instance, decoded and split into lines.
    pub async fn console_log(&self, id: &str) -> Result<Vec<String>> {
        let resp = self
            .provider
            .invoke("get_console_output", arg("instance_id", id))
            .await?;
        let output = resp
            .get("output")
            .and_then(Value::as_str)
            .ok_or(anyhow!("could not parse console output"))?;

        // the API wraps the base64 payload, strict decoders reject the newlines
        let packed: String = output.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = BASE64_STANDARD
            .decode(packed)
            .context("failed to decode console output")?;
        let text = String::from_utf8_lossy(&decoded).into_owned();

        Ok(text
            .trim_end_matches("\r\n")
            .split("\r\n")
            .map(|s| s.to_string())
            .collect())
    }

    pub async fn terminate(&self, id: &str) -> Result<Value> {
        self.provider
            .invoke("terminate_instances", arg("instance_id", id))
            .await
    }

    /// Generic dispatch: the exact operation name first, then a
    /// `describe_`-prefixed variant, checked against the provider's
    /// enumerated operations. Anything else resolves to `NotFound` with
    /// the command listing.
    pub async fn call(&self, name: &str, args: Args) -> Result<Dispatch> {
        let prefixed = format!("describe_{name}");
        let operations = self.provider.operations();

        let resolved = if operations.contains(&name) {
            name.to_string()
        } else if operations.contains(&prefixed.as_str()) {
            prefixed
        } else {
            return Ok(Dispatch::NotFound(COMMANDS.to_vec()));
        };

        Ok(Dispatch::Found(self.provider.invoke(&resolved, args).await?))
    }
}

fn arg(key: &str, value: &str) -> Args {
    let mut args = Args::new();
    args.insert(key.to_string(), json!(value));
    args
}

/// `{item: [{key, value}, ...]}` down to a plain mapping. Duplicate keys
/// overwrite, last one wins.
fn flatten_tags(tag_set: &Value) -> Result<Value> {
    let items = tag_set
        .get("item")
        .and_then(Value::as_array)
        .ok_or(anyhow!("could not parse tag set"))?;

    let mut flat = Map::new();
    for tag in items {
        let key = tag
            .get("key")
            .and_then(Value::as_str)
            .ok_or(anyhow!("could not parse tag key"))?;
        flat.insert(key.to_string(), tag.get("value").cloned().unwrap_or(Value::Null));
    }
    Ok(Value::Object(flat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::OPERATIONS;
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct TestEc2 {
        instances: Value,
    }

    impl TestEc2 {
        fn empty() -> TestEc2 {
            TestEc2 {
                instances: json!({ "reservationSet": { "item": [] } }),
            }
        }
    }

    const TEST_OPERATIONS: [&str; 7] = [
        "describe_instances",
        "describe_security_groups",
        "associate_address",
        "get_console_output",
        "terminate_instances",
        "foo",
        "describe_foo",
    ];

    #[async_trait]
    impl RemoteProvider for TestEc2 {
        fn operations(&self) -> &[&'static str] {
            &TEST_OPERATIONS
        }

        async fn invoke(&self, operation: &str, args: Args) -> Result<Value> {
            match operation {
                "describe_instances" => Ok(self.instances.clone()),
                "describe_security_groups" => Ok(json!({
                    "securityGroupInfo": { "item": [
                        { "groupName": "sg1", "ownerId": "42", "extra": "x" },
                    ] }
                })),
                "associate_address" => Ok(json!({ "return": true, "args": args })),
                "get_console_output" => Ok(json!({ "output": "aGVs\nbG8=" })),
                "terminate_instances" => Ok(json!({ "instancesSet": { "item": [] } })),
                "foo" => Ok(json!("foo")),
                "describe_foo" => Ok(json!("describe_foo")),
                _ => Err(anyhow!("unsupported operation {operation}")),
            }
        }
    }

    fn one_instance() -> Value {
        json!({ "reservationSet": { "item": [{
            "groupSet": { "item": [
                { "groupId": "sg-1", "groupName": "default" },
                { "groupId": "sg-2" },
            ] },
            "instancesSet": { "item": [{
                "instanceId": "i-1",
                "ipAddress": "203.0.113.7",
                "privateIpAddress": "10.0.0.7",
                "instanceType": "t3.micro",
                "launchType": "on-demand",
                "instanceState": { "code": 16, "name": "running" },
                "tagSet": { "item": [
                    { "key": "k1", "value": "v1" },
                    { "key": "k2", "value": "v2" },
                ] },
            }] },
        }] } })
    }

    #[tokio::test]
    async fn instances_keeps_only_selected_fields() {
        let facade = Ec2Facade::new(TestEc2 { instances: one_instance() });
        let records = facade.instances(&DEFAULT_FIELDS).await.unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["instanceId"], "i-1");
        assert_eq!(record["ipAddress"], "203.0.113.7");
        assert!(record.get("privateIpAddress").is_none());
        assert!(record.get("instanceState").is_none());
        assert_eq!(record["groups"], json!(["sg-1", "sg-2"]));
        assert_eq!(record["tagSet"], json!({ "k1": "v1", "k2": "v2" }));
    }

    #[tokio::test]
    async fn tag_set_dropped_when_not_selected() {
        let facade = Ec2Facade::new(TestEc2 { instances: one_instance() });
        let records = facade.instances(&["instanceId", "ipAddress"]).await.unwrap();

        assert!(records[0].get("tagSet").is_none());
    }

    #[tokio::test]
    async fn no_group_set_means_no_groups_key() {
        let fixture = json!({ "reservationSet": { "item": [{
            "instancesSet": { "item": [{ "instanceId": "i-1" }] },
        }] } });
        let facade = Ec2Facade::new(TestEc2 { instances: fixture });
        let records = facade.instances(&["instanceId", "groups"]).await.unwrap();

        assert!(records[0].get("groups").is_none());
    }

    #[tokio::test]
    async fn duplicate_tag_keys_last_write_wins() {
        let fixture = json!({ "reservationSet": { "item": [{
            "instancesSet": { "item": [{
                "tagSet": { "item": [
                    { "key": "k", "value": "old" },
                    { "key": "k", "value": "new" },
                ] },
            }] },
        }] } });
        let facade = Ec2Facade::new(TestEc2 { instances: fixture });
        let records = facade.instances(&["tagSet"]).await.unwrap();

        assert_eq!(records[0]["tagSet"], json!({ "k": "new" }));
    }

    #[tokio::test]
    async fn malformed_reservation_fails_fast() {
        let fixture = json!({ "reservationSet": { "item": [{ "groupSet": {} }] } });
        let facade = Ec2Facade::new(TestEc2 { instances: fixture });

        assert!(facade.instances(&DEFAULT_FIELDS).await.is_err());
    }

    #[tokio::test]
    async fn instance_returns_raw_tree() {
        let facade = Ec2Facade::new(TestEc2 { instances: one_instance() });

        assert_eq!(facade.instance("i-1").await.unwrap(), one_instance());
    }

    #[tokio::test]
    async fn security_groups_filtered_to_name_and_owner() {
        let facade = Ec2Facade::new(TestEc2::empty());
        let groups = facade.security_groups().await.unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(
            Value::Object(groups[0].clone()),
            json!({ "groupName": "sg1", "ownerId": "42" })
        );
    }

    #[tokio::test]
    async fn console_log_decodes_and_splits() {
        let facade = Ec2Facade::new(TestEc2::empty());

        assert_eq!(facade.console_log("i-1").await.unwrap(), vec!["hello"]);
    }

    #[tokio::test]
    async fn console_log_splits_on_crlf() {
        struct MultiLine;

        #[async_trait]
        impl RemoteProvider for MultiLine {
            fn operations(&self) -> &[&'static str] {
                &OPERATIONS
            }

            async fn invoke(&self, _operation: &str, _args: Args) -> Result<Value> {
                // "line1\r\nline2"
                Ok(json!({ "output": "bGluZTENCmxpbmUy" }))
            }
        }

        let facade = Ec2Facade::new(MultiLine);
        assert_eq!(
            facade.console_log("i-1").await.unwrap(),
            vec!["line1", "line2"]
        );
    }

    #[tokio::test]
    async fn dispatch_prefers_exact_name() {
        let facade = Ec2Facade::new(TestEc2::empty());

        assert_eq!(
            facade.call("foo", Args::new()).await.unwrap(),
            Dispatch::Found(json!("foo"))
        );
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_describe_prefix() {
        let facade = Ec2Facade::new(TestEc2::empty());

        assert_eq!(
            facade.call("instances", Args::new()).await.unwrap(),
            Dispatch::Found(json!({ "reservationSet": { "item": [] } }))
        );
    }

    #[tokio::test]
    async fn dispatch_lists_commands_when_unresolved() {
        let facade = Ec2Facade::new(TestEc2::empty());

        assert_eq!(
            facade.call("bogus", Args::new()).await.unwrap(),
            Dispatch::NotFound(COMMANDS.to_vec())
        );
    }
}
