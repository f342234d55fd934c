//! Batch model and normalization of raw pipeline batches
//!
//! Pipelines hand batches over in several historical shapes. [`normalize_batch`]
//! turns any of them into a fully populated [`Batch`], resolving each field from
//! its aliases in a fixed precedence order:
//!
//! | Field | Sources, first match wins |
//! |---|---|
//! | height | `header.height`, `header.number`, `header.blockNumber`, `height`, `number`, `blockNumber` |
//! | hash | `header.hash`, `header.blockHash`, `hash`, `blockHash`, first log's `blockHash` |
//! | timestamp | `header.timestamp`, `timestamp`, otherwise `0` |
//! | logs | `logs`, otherwise empty |
//! | transactions | `transactions`, otherwise empty |
//!
//! Numbers may be JSON integers, decimal strings or `0x`-prefixed hex strings.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Block header carried by a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number
    pub height: u64,
    /// Block hash, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Block timestamp in seconds
    #[serde(default)]
    pub timestamp: u64,
}

/// An event log emitted in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Emitting contract address
    pub address: String,
    /// Non-indexed data
    pub data: String,
    /// Indexed topics
    #[serde(default)]
    pub topics: Vec<String>,
    /// Hash of the transaction that emitted the log
    pub transaction_hash: String,
    /// Block the log belongs to
    pub block_number: u64,
    /// Position of the log within the block
    pub log_index: u64,
    /// Position of the transaction within the block
    pub transaction_index: u64,
    /// Hash of the block, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
}

/// A transaction touched by a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// One processing step's worth of block data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Block header
    pub header: BlockHeader,
    /// Logs in emission order
    #[serde(default)]
    pub logs: Vec<Log>,
    /// Transactions in block order
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Batch {
    /// Block height of the batch
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.header.height
    }
}

/// Normalize a raw batch into the canonical [`Batch`] shape
pub fn normalize_batch(raw: &Value) -> Result<Batch> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::validation("batch", "expected a JSON object"))?;
    let header = obj.get("header").and_then(Value::as_object);

    let height = first_number(header, obj, &["height", "number", "blockNumber"], "height")?
        .ok_or_else(|| Error::validation("header.height", "missing block height"))?;

    let logs = match obj.get("logs") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| normalize_log(item, height, i))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::validation("logs", "expected an array")),
    };

    let hash = first_string(header, obj, &["hash", "blockHash"])
        .or_else(|| logs.first().and_then(|log| log.block_hash.clone()));

    let timestamp = first_number(header, obj, &["timestamp"], "timestamp")?.unwrap_or(0);

    let transactions = match obj.get("transactions") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| normalize_transaction(item, i))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::validation("transactions", "expected an array")),
    };

    Ok(Batch {
        header: BlockHeader {
            height,
            hash,
            timestamp,
        },
        logs,
        transactions,
    })
}

/// Normalize every raw batch, failing on the first invalid one
pub fn normalize_batches(raw: &[Value]) -> Result<Vec<Batch>> {
    raw.iter().map(normalize_batch).collect()
}

fn normalize_log(raw: &Value, batch_height: u64, position: usize) -> Result<Log> {
    let field = |name: &str| format!("logs[{position}].{name}");
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::validation(field("*"), "expected a JSON object"))?;

    let string = |keys: &[&str]| keys.iter().find_map(|k| str_field(obj, k));
    let number = |keys: &[&str], name: &str| -> Result<Option<u64>> {
        for key in keys {
            if let Some(v) = obj.get(*key) {
                if !v.is_null() {
                    return parse_number(v).map(Some).ok_or_else(|| {
                        Error::validation(field(name), format!("not a block number: {v}"))
                    });
                }
            }
        }
        Ok(None)
    };

    let topics = match obj.get("topics") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|t| {
                t.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::validation(field("topics"), "topics must be strings"))
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::validation(field("topics"), "expected an array")),
    };

    Ok(Log {
        address: string(&["address"]).unwrap_or_default(),
        data: string(&["data"]).unwrap_or_default(),
        topics,
        transaction_hash: string(&["transactionHash", "txHash"]).unwrap_or_default(),
        block_number: number(&["blockNumber"], "blockNumber")?.unwrap_or(batch_height),
        log_index: number(&["logIndex", "index"], "logIndex")?.unwrap_or(0),
        transaction_index: number(&["transactionIndex"], "transactionIndex")?.unwrap_or(0),
        block_hash: string(&["blockHash"]),
    })
}

fn normalize_transaction(raw: &Value, position: usize) -> Result<Transaction> {
    let obj = raw.as_object().ok_or_else(|| {
        Error::validation(format!("transactions[{position}]"), "expected a JSON object")
    })?;
    Ok(Transaction {
        hash: str_field(obj, "hash"),
        from: str_field(obj, "from"),
        to: str_field(obj, "to"),
    })
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Look a string up in the header first, then at the top level
fn first_string(
    header: Option<&Map<String, Value>>,
    top: &Map<String, Value>,
    keys: &[&str],
) -> Option<String> {
    header
        .into_iter()
        .chain(std::iter::once(top))
        .find_map(|scope| keys.iter().find_map(|k| str_field(scope, k)))
}

/// Look a number up in the header first, then at the top level
fn first_number(
    header: Option<&Map<String, Value>>,
    top: &Map<String, Value>,
    keys: &[&str],
    name: &str,
) -> Result<Option<u64>> {
    for (scope, prefix) in header
        .map(|h| (h, "header."))
        .into_iter()
        .chain(std::iter::once((top, "")))
    {
        for key in keys {
            match scope.get(*key) {
                None | Some(Value::Null) => {}
                Some(v) => {
                    return parse_number(v).map(Some).ok_or_else(|| {
                        Error::validation(format!("{prefix}{key}"), format!("invalid {name}: {v}"))
                    });
                }
            }
        }
    }
    Ok(None)
}

fn parse_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_shape_passes_through() {
        let raw = json!({
            "header": {"height": 42, "hash": "0xb42", "timestamp": 1_700_000_000},
            "logs": [{
                "address": "0xc0ffee",
                "data": "0x",
                "topics": ["0xt0"],
                "transactionHash": "0xtx",
                "blockNumber": 42,
                "logIndex": 3,
                "transactionIndex": 1,
                "blockHash": "0xb42"
            }],
            "transactions": [{"hash": "0xtx", "from": "0xa", "to": "0xb"}]
        });
        let batch = normalize_batch(&raw).unwrap();
        assert_eq!(batch.height(), 42);
        assert_eq!(batch.header.hash.as_deref(), Some("0xb42"));
        assert_eq!(batch.header.timestamp, 1_700_000_000);
        assert_eq!(batch.logs[0].log_index, 3);
        assert_eq!(batch.transactions[0].to.as_deref(), Some("0xb"));

        // The canonical JSON encoding parses back to the same batch
        let encoded = serde_json::to_value(&batch).unwrap();
        assert_eq!(normalize_batch(&encoded).unwrap(), batch);
    }

    #[test]
    fn height_precedence_prefers_header() {
        let raw = json!({"header": {"number": 7}, "blockNumber": 9});
        assert_eq!(normalize_batch(&raw).unwrap().height(), 7);

        let raw = json!({"header": {"height": 5, "number": 7}});
        assert_eq!(normalize_batch(&raw).unwrap().height(), 5);

        let raw = json!({"header": {"blockNumber": "0x10"}});
        assert_eq!(normalize_batch(&raw).unwrap().height(), 16);

        let raw = json!({"blockNumber": "123"});
        assert_eq!(normalize_batch(&raw).unwrap().height(), 123);
    }

    #[test]
    fn missing_height_is_a_validation_error() {
        let err = normalize_batch(&json!({"header": {"hash": "0x1"}})).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "header.height"));
    }

    #[test]
    fn malformed_height_names_the_field() {
        let err = normalize_batch(&json!({"header": {"number": "abc"}})).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "header.number"));
    }

    #[test]
    fn hash_falls_back_to_first_log() {
        let raw = json!({
            "header": {"height": 1},
            "logs": [
                {"address": "0x1", "data": "0x", "transactionHash": "0xa", "blockHash": "0xfirst"},
                {"address": "0x1", "data": "0x", "transactionHash": "0xb", "blockHash": "0xsecond"}
            ]
        });
        let batch = normalize_batch(&raw).unwrap();
        assert_eq!(batch.header.hash.as_deref(), Some("0xfirst"));
        assert_eq!(batch.logs[0].block_number, 1, "log block defaults to batch height");
    }

    #[test]
    fn explicit_hash_wins_over_log_hash() {
        let raw = json!({
            "header": {"height": 1},
            "blockHash": "0xtop",
            "logs": [{"address": "0x1", "data": "0x", "transactionHash": "0xa", "blockHash": "0xlog"}]
        });
        assert_eq!(normalize_batch(&raw).unwrap().header.hash.as_deref(), Some("0xtop"));
    }

    #[test]
    fn legacy_log_aliases() {
        let raw = json!({
            "number": 3,
            "logs": [{"address": "0x1", "data": "0x", "txHash": "0xt", "index": "0x2"}]
        });
        let batch = normalize_batch(&raw).unwrap();
        assert_eq!(batch.logs[0].transaction_hash, "0xt");
        assert_eq!(batch.logs[0].log_index, 2);
        assert_eq!(batch.header.timestamp, 0);
        assert!(batch.transactions.is_empty());
    }

    #[test]
    fn non_object_batches_are_rejected() {
        assert!(normalize_batch(&json!([1, 2])).is_err());
        assert!(normalize_batches(&[json!({"height": 1}), json!("nope")]).is_err());
    }
}
