//! Codecs for values crossing the binary-module boundary.

use anyhow::{Context, Result};
use serde_json::Value;

/// Encodes host values into guest memory and back.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
    fn name(&self) -> &'static str;
}

/// UTF-8 JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("Failed to encode JSON payload")
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).context("Failed to decode JSON payload")
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// MessagePack with named map keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).context("Failed to encode MessagePack payload")
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        rmp_serde::from_slice(bytes).context("Failed to decode MessagePack payload")
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}
