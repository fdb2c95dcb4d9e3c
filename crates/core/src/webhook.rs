//! Wire format of the per-group completion webhook.

use serde::{Deserialize, Serialize};

use crate::batch::GroupKey;
use crate::job::OutputDescriptor;

/// JSON body POSTed to the notification consumer once per group.
///
/// Field names are part of the external contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub request_id: String,
    pub product_oid: String,
    pub output_urls: Vec<String>,
}

impl WebhookPayload {
    /// Build the payload for `key` from the group's accumulated outputs.
    pub fn from_outputs(key: &GroupKey, outputs: &[OutputDescriptor]) -> Self {
        Self {
            request_id: key.request_id.clone(),
            product_oid: key.group_id.clone(),
            output_urls: outputs.iter().map(|o| o.output_location.clone()).collect(),
        }
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.request_id, &self.product_oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_contract_field_names() {
        let key = GroupKey::new("req-1", "prod-7");
        let outputs = vec![OutputDescriptor {
            request_id: "req-1".into(),
            group_id: "prod-7".into(),
            item_id: None,
            output_location: "/out/output-a.jpg".into(),
        }];
        let payload = WebhookPayload::from_outputs(&key, &outputs);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["product_oid"], "prod-7");
        assert_eq!(json["output_urls"][0], "/out/output-a.jpg");
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[test]
    fn group_key_round_trips_identity() {
        let key = GroupKey::new("r", "g");
        let payload = WebhookPayload::from_outputs(&key, &[]);
        assert_eq!(payload.group_key(), key);
        assert!(payload.output_urls.is_empty());
    }
}
