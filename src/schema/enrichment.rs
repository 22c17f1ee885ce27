/// 正規化応答のJSON Schema定義。
///
/// 単一項目・複数項目・検索テキストの 3 種類の応答形を定義する。
use std::sync::LazyLock;

use serde_json::{Value, json};

/// 推論プロバイダに要求する応答の形。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Single,
    Batch,
    SearchText,
}

impl ResponseShape {
    #[must_use]
    pub fn schema(self) -> &'static Value {
        match self {
            ResponseShape::Single => &SINGLE_RESPONSE_SCHEMA,
            ResponseShape::Batch => &BATCH_RESPONSE_SCHEMA,
            ResponseShape::SearchText => &SEARCH_TEXT_RESPONSE_SCHEMA,
        }
    }

    /// `response_format.json_schema.name` に使う識別子。
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ResponseShape::Single => "normalization_item",
            ResponseShape::Batch => "normalization_batch",
            ResponseShape::SearchText => "search_description",
        }
    }
}

fn item_properties() -> Value {
    json!({
        "value": {
            "description": "Normalized value, or null when nothing applies",
            "type": ["string", "boolean", "array", "null"],
            "items": { "type": "string" }
        },
        "secondary": {
            "description": "Optional parallel label (e.g. regional grade equivalent)",
            "type": ["string", "null"]
        },
        "confidence": {
            "type": ["number", "null"],
            "minimum": 0,
            "maximum": 1
        }
    })
}

pub(crate) static SINGLE_RESPONSE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Normalization Item Response",
        "type": "object",
        "properties": item_properties(),
        "required": ["value"]
    })
});

pub(crate) static BATCH_RESPONSE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    let mut item = item_properties();
    if let Some(properties) = item.as_object_mut() {
        properties.insert(
            "id".to_string(),
            json!({
                "description": "Correlation identifier echoed from the request",
                "type": ["integer", "string", "null"]
            }),
        );
    }
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Normalization Batch Response",
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": item,
                    "required": ["value"]
                }
            }
        },
        "required": ["items"]
    })
});

pub(crate) static SEARCH_TEXT_RESPONSE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Search Description Response",
        "type": "object",
        "properties": {
            "description": { "type": "string" }
        },
        "required": ["description"]
    })
});
