//! HTTP polling fallback for feeds without push delivery.

use crate::decode::Payload;
use crate::events::EventType;
use crate::pipeline::{Inbound, Source};
use crate::transport::TransportError;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub fn spawn(
    client: reqwest::Client,
    url: String,
    event_type: EventType,
    every: Duration,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(event_type = %event_type, url = %url, "starting poller");
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_hash: Option<Vec<u8>> = None;

        loop {
            ticker.tick().await;
            match poll_once(&client, &url, &mut last_hash).await {
                Ok(None) => debug!(event_type = %event_type, "poll body unchanged"),
                Ok(Some(items)) => {
                    for item in items {
                        let msg = Inbound::new(event_type, Payload::from_value(item), Source::Poll);
                        if inbound.send(msg).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(event_type = %event_type, error = %e, "poll failed"),
            }
        }
    })
}

/// Fetch once. `None` when the body hashes the same as last time.
async fn poll_once(
    client: &reqwest::Client,
    url: &str,
    last_hash: &mut Option<Vec<u8>>,
) -> Result<Option<Vec<Value>>, TransportError> {
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    if !changed(&body, last_hash) {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(&body)?;
    Ok(Some(split_items(value)))
}

/// Compare the body's SHA-256 with the previous one and remember it.
fn changed(body: &[u8], last_hash: &mut Option<Vec<u8>>) -> bool {
    let hash = Sha256::digest(body).to_vec();
    if last_hash.as_ref() == Some(&hash) {
        return false;
    }
    *last_hash = Some(hash);
    true
}

/// Arrays and `{data: [...]}` envelopes are fed item by item.
fn split_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                obj.insert("data".to_string(), other);
                vec![Value::Object(obj)]
            }
            None => vec![Value::Object(obj)],
        },
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unchanged_body_is_skipped() {
        let mut last = None;
        let first = br#"[{"poolId":1}]"#;
        let second = br#"[{"poolId":1},{"poolId":2}]"#;

        assert!(changed(first, &mut last));
        assert!(!changed(first, &mut last));
        assert!(changed(second, &mut last));
        assert!(!changed(second, &mut last));
        // reverting to an earlier body is still a change
        assert!(changed(first, &mut last));
    }

    #[test]
    fn test_split_items() {
        assert_eq!(split_items(json!([{"a": 1}, {"a": 2}])).len(), 2);
        assert_eq!(split_items(json!({"data": [{"a": 1}]})), vec![json!({"a": 1})]);
        assert_eq!(
            split_items(json!({"data": {"a": 1}, "ok": true})),
            vec![json!({"data": {"a": 1}, "ok": true})]
        );
        assert_eq!(split_items(json!({"poolId": 3})), vec![json!({"poolId": 3})]);
    }
}
