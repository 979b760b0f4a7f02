//! Wire types shared by the client, the event processor, and the ingress.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One page of a provider list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ListPage {
    pub data: Vec<Value>,
    pub has_more: bool,
}

/// The signed event envelope delivered by webhook or live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the provider created the event. Multiplied by
    /// 1000 this becomes the row's last-writer-wins timestamp.
    pub created: i64,
    pub data: EventData,
    /// Present on connect-routed events; otherwise the tenant is resolved
    /// from the delivery context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl EventEnvelope {
    /// True for `*.deleted` event kinds, which soft-delete instead of upsert.
    pub fn is_deletion(&self) -> bool {
        self.event_type.ends_with(".deleted")
    }
}

/// Parameters for one list-page request.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Page size; `None` uses the registry default.
    pub limit: Option<i64>,
    /// Mid-page continuation: last id of the previous page.
    pub starting_after: Option<String>,
    /// Inclusive lower created bound (unix seconds).
    pub created_gte: Option<i64>,
    /// Inclusive upper created bound (unix seconds); during backfill this is
    /// the object run's cursor, so successive pages walk toward the past.
    pub created_lte: Option<i64>,
}

impl ListParams {
    /// Render as form/query pairs in the provider's bracket syntax.
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(after) = &self.starting_after {
            pairs.push(("starting_after".to_string(), after.clone()));
        }
        if let Some(gte) = self.created_gte {
            pairs.push(("created[gte]".to_string(), gte.to_string()));
        }
        if let Some(lte) = self.created_lte {
            pairs.push(("created[lte]".to_string(), lte.to_string()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_decodes_and_flags_deletion() {
        let raw = json!({
            "id": "evt_1",
            "type": "customer.deleted",
            "created": 1_700_000_000,
            "data": { "object": { "id": "cus_1", "object": "customer" } }
        });
        let env: EventEnvelope = serde_json::from_value(raw).unwrap();
        assert!(env.is_deletion());
        assert_eq!(env.data.object["id"], "cus_1");
    }

    #[test]
    fn subscription_deleted_is_deletion() {
        let env = EventEnvelope {
            id: "evt_2".into(),
            event_type: "customer.subscription.deleted".into(),
            created: 0,
            data: EventData {
                object: json!({"id": "sub_1"}),
            },
            account: None,
        };
        assert!(env.is_deletion());
    }

    #[test]
    fn query_pairs_use_bracket_syntax() {
        let params = ListParams {
            limit: Some(100),
            starting_after: Some("ch_9".into()),
            created_gte: Some(100),
            created_lte: Some(300),
        };
        let q = params.to_query();
        assert!(q.contains(&("created[gte]".to_string(), "100".to_string())));
        assert!(q.contains(&("created[lte]".to_string(), "300".to_string())));
        assert!(q.contains(&("starting_after".to_string(), "ch_9".to_string())));
    }

    #[test]
    fn empty_params_render_no_pairs() {
        assert!(ListParams::default().to_query().is_empty());
    }
}
