//! DynamoDB lock table.
//!
//! One item per key: `{ key: S, comment: S }`. Acquisition is a
//! conditional put on `attribute_not_exists(key)`, which DynamoDB applies
//! atomically, so concurrent runs from different hosts cannot both win.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue, ReturnValuesOnConditionCheckFailure};
use tracing::debug;

use meshflip_lock::{LockBackend, LockError, LockRecord, LockResult};

const KEY_ATTRIBUTE: &str = "key";
const COMMENT_ATTRIBUTE: &str = "comment";

type Item = HashMap<String, AttributeValue>;

fn remote<E: std::error::Error>(e: E) -> LockError {
    LockError::Remote(DisplayErrorContext(e).to_string())
}

#[derive(Clone)]
pub struct DynamoLockStore {
    client: Client,
    table: String,
}

impl DynamoLockStore {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub fn from_config(config: &aws_config::SdkConfig, table: impl Into<String>) -> Self {
        Self::new(Client::new(config), table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl LockBackend for DynamoLockStore {
    async fn get(&self, key: &str) -> LockResult<Option<LockRecord>> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(remote)?;
        Ok(out.item().and_then(record_from_item))
    }

    async fn insert_if_absent(&self, record: &LockRecord) -> LockResult<Option<LockRecord>> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item_from_record(record)))
            .condition_expression("attribute_not_exists(#key)")
            .expression_attribute_names("#key", KEY_ATTRIBUTE)
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        let err = match result {
            Ok(_) => {
                debug!(table = %self.table, key = %record.key, "lock item written");
                return Ok(None);
            }
            Err(err) => err,
        };
        let Some(PutItemError::ConditionalCheckFailedException(failed)) = err.as_service_error()
        else {
            return Err(remote(err));
        };
        if let Some(existing) = failed.item().and_then(record_from_item) {
            return Ok(Some(existing));
        }

        // Not every endpoint echoes the item back. If it was released
        // before this read, the key still counts as taken.
        Ok(Some(self.get(&record.key).await?.unwrap_or_else(|| LockRecord {
            key: record.key.clone(),
            comment: String::new(),
        })))
    }

    async fn delete(&self, key: &str) -> LockResult<bool> {
        let out = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(remote)?;
        Ok(out.attributes().is_some_and(|old| !old.is_empty()))
    }

    async fn list(&self) -> LockResult<Vec<LockRecord>> {
        let mut records = Vec::new();
        let mut start = None;
        loop {
            let out = self
                .client
                .scan()
                .table_name(&self.table)
                .consistent_read(true)
                .set_exclusive_start_key(start)
                .send()
                .await
                .map_err(remote)?;
            records.extend(out.items().iter().filter_map(record_from_item));
            start = out.last_evaluated_key().cloned();
            if start.is_none() {
                records.sort_by(|a, b| a.key.cmp(&b.key));
                return Ok(records);
            }
        }
    }
}

pub(crate) fn item_from_record(record: &LockRecord) -> Item {
    HashMap::from([
        (KEY_ATTRIBUTE.to_string(), AttributeValue::S(record.key.clone())),
        (
            COMMENT_ATTRIBUTE.to_string(),
            AttributeValue::S(record.comment.clone()),
        ),
    ])
}

/// Items without a string `key` are not lock records and are skipped.
pub(crate) fn record_from_item(item: &Item) -> Option<LockRecord> {
    let key = item.get(KEY_ATTRIBUTE)?.as_s().ok()?;
    let comment = item
        .get(COMMENT_ATTRIBUTE)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .unwrap_or_default();
    Some(LockRecord {
        key: key.clone(),
        comment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_survives_item_conversion() {
        let record = LockRecord {
            key: "echo_server:prod".to_string(),
            comment: "Began creating at 2023-01-01T00:01:00Z".to_string(),
        };
        assert_eq!(record_from_item(&item_from_record(&record)), Some(record));
    }

    #[test]
    fn item_without_comment_reads_as_empty_comment() {
        let item = HashMap::from([(
            KEY_ATTRIBUTE.to_string(),
            AttributeValue::S("echo_server:qa1".to_string()),
        )]);
        let record = record_from_item(&item).unwrap();
        assert_eq!(record.key, "echo_server:qa1");
        assert!(record.comment.is_empty());
    }

    #[test]
    fn item_with_non_string_key_is_skipped() {
        let item = HashMap::from([(KEY_ATTRIBUTE.to_string(), AttributeValue::N("7".to_string()))]);
        assert!(record_from_item(&item).is_none());
        assert!(record_from_item(&HashMap::new()).is_none());
    }
}
