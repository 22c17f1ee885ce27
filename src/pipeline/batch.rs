//! バッチ処理と応答の相関付け。
//!
//! LLM の応答は項目の欠落・並べ替え・重複があり得るため、相関 ID で突き合わせ、
//! ID がない項目だけ位置で補う。対応する応答がない入力は `failed` にする。

use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::prompt::{build_request, item_input};
use super::vocabulary::Vocabulary;
use crate::domain::Domain;
use crate::inference::{ChainError, ProviderSession};
use crate::schema::enrichment::ResponseShape;
use crate::store::models::{
    BatchCommit, CatalogRecord, DomainOutcome, DomainTransition, NormalizationMapping,
};
use crate::util::text::cache_key;

/// プロバイダが 1 つも残っていない。バッチ内のレコードは `pending` のまま。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("all inference providers exhausted (tried: {})", attempted.join(", "))]
pub struct ProvidersExhausted {
    pub attempted: Vec<String>,
}

/// プロンプト上の 1 項目。キャッシュ対象ドメインでは同じ生値のレコードをまとめる。
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub(crate) key: Option<String>,
    pub(crate) records: Vec<CatalogRecord>,
}

impl WorkItem {
    fn representative(&self) -> Option<&CatalogRecord> {
        self.records.first()
    }
}

/// ゲートを通ったレコードを項目にまとめる。順序は最初に現れた順。
pub(crate) fn group_items(domain: Domain, records: Vec<CatalogRecord>) -> Vec<WorkItem> {
    if !domain.is_cacheable() {
        return records
            .into_iter()
            .map(|record| WorkItem {
                key: None,
                records: vec![record],
            })
            .collect();
    }
    let mut items: Vec<WorkItem> = Vec::new();
    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    for record in records {
        let Some(key) = record.raw_input(domain).map(cache_key) else {
            continue;
        };
        if let Some(&position) = index.get(&key) {
            items[position].records.push(record);
        } else {
            index.insert(key.clone(), items.len());
            items.push(WorkItem {
                key: Some(key),
                records: vec![record],
            });
        }
    }
    items
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResponseItem {
    pub(crate) value: Value,
    pub(crate) secondary: Option<String>,
    pub(crate) confidence: Option<f64>,
}

impl ResponseItem {
    fn from_value(item: &Value) -> Self {
        Self {
            value: item.get("value").cloned().unwrap_or(Value::Null),
            secondary: item
                .get("secondary")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            confidence: item.get("confidence").and_then(Value::as_f64),
        }
    }
}

fn correlation_id(item: &Value) -> Option<usize> {
    match item.get("id")? {
        Value::Number(number) => number.as_u64().and_then(|id| usize::try_from(id).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// 応答を入力の位置ごとに割り当てる。戻り値の長さは常に `count`。
pub(crate) fn correlate(
    response: &Value,
    shape: ResponseShape,
    count: usize,
) -> Vec<Option<ResponseItem>> {
    if shape == ResponseShape::Single {
        let mut slots = vec![None; count];
        if let Some(slot) = slots.first_mut() {
            *slot = Some(ResponseItem::from_value(response));
        }
        return slots;
    }

    let items = response
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut by_id: FxHashMap<usize, &Value> = FxHashMap::default();
    for item in items {
        if let Some(id) = correlation_id(item) {
            by_id.entry(id).or_insert(item);
        }
    }

    (0..count)
        .map(|position| {
            by_id
                .get(&(position + 1))
                .copied()
                .or_else(|| {
                    items
                        .get(position)
                        .filter(|item| correlation_id(item).is_none())
                })
                .map(ResponseItem::from_value)
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchProcessor<'a> {
    vocabulary: &'a Vocabulary,
}

impl<'a> BatchProcessor<'a> {
    pub(crate) fn new(vocabulary: &'a Vocabulary) -> Self {
        Self { vocabulary }
    }

    /// 1 バッチを推論し、全入力レコード分の遷移とキャッシュ登録を返す。
    ///
    /// # Errors
    /// プロバイダが全て枯渇した場合だけ [`ProvidersExhausted`]。このとき何も書き込まない。
    pub(crate) async fn process(
        &self,
        domain: Domain,
        items: &[WorkItem],
        session: &ProviderSession,
    ) -> Result<BatchCommit, ProvidersExhausted> {
        let inputs: Vec<Value> = items
            .iter()
            .filter_map(WorkItem::representative)
            .map(|record| item_input(domain, record))
            .collect();
        let request = build_request(domain, self.vocabulary, &inputs);

        let mut commit = BatchCommit::default();
        match session.invoke(&request).await {
            Ok(invocation) => {
                let responses = correlate(&invocation.value, request.shape, items.len());
                for (item, response) in items.iter().zip(responses) {
                    self.resolve(domain, item, response, &invocation.provider, &mut commit);
                }
            }
            Err(ChainError::Failed { source }) => {
                warn!(domain = %domain, items = items.len(), error = %source, "batch inference failed");
                for item in items {
                    push_outcome(
                        &mut commit,
                        domain,
                        item,
                        &DomainOutcome::Failed {
                            reason: source.to_string(),
                        },
                        source.provider(),
                    );
                }
            }
            Err(ChainError::Exhausted { attempted }) => {
                return Err(ProvidersExhausted { attempted });
            }
        }
        Ok(commit)
    }

    fn resolve(
        &self,
        domain: Domain,
        item: &WorkItem,
        response: Option<ResponseItem>,
        provider: &str,
        commit: &mut BatchCommit,
    ) {
        let Some(response) = response else {
            debug!(domain = %domain, key = ?item.key, "no matching item in provider response");
            let outcome = DomainOutcome::Failed {
                reason: "no matching item in provider response".to_string(),
            };
            push_outcome(commit, domain, item, &outcome, provider);
            return;
        };

        if response.value.is_null() {
            // 呼び出しは成功し、該当値なしと確定した
            push_outcome(commit, domain, item, &DomainOutcome::NotApplicable, provider);
            if let Some(key) = &item.key {
                commit.mappings.push(NormalizationMapping::from_provider(
                    domain,
                    key.clone(),
                    None,
                    provider,
                ));
            }
            return;
        }

        match self
            .vocabulary
            .validate(domain, &response.value, response.secondary.as_deref())
        {
            Some(accepted) => {
                if let Some(key) = &item.key {
                    commit.mappings.push(NormalizationMapping::from_provider(
                        domain,
                        key.clone(),
                        Some(accepted.value.clone()),
                        provider,
                    ));
                }
                let outcome = DomainOutcome::Normalized {
                    value: accepted.value,
                    secondary: accepted.secondary,
                    confidence: response.confidence,
                };
                push_outcome(commit, domain, item, &outcome, provider);
            }
            None => {
                debug!(
                    domain = %domain,
                    value = %response.value,
                    "value outside the controlled vocabulary"
                );
                push_outcome(commit, domain, item, &DomainOutcome::NotApplicable, provider);
            }
        }
    }
}

fn push_outcome(
    commit: &mut BatchCommit,
    domain: Domain,
    item: &WorkItem,
    outcome: &DomainOutcome,
    resolved_by: &str,
) {
    commit
        .transitions
        .extend(item.records.iter().map(|record| DomainTransition {
            record_id: record.id,
            domain,
            outcome: outcome.clone(),
            resolved_by: resolved_by.to_string(),
        }));
}
