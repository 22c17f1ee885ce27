//! 正規化ドメインごとのプロンプト組み立て。

use serde_json::{Map, Value, json};

use super::vocabulary::Vocabulary;
use crate::domain::Domain;
use crate::inference::InferenceRequest;
use crate::schema::enrichment::ResponseShape;
use crate::store::models::CatalogRecord;
use crate::util::text::non_blank;

pub(crate) const SYSTEM_PROMPT: &str = "You are a music librarian who normalizes sheet-music \
catalog metadata. Answer with a single JSON object and nothing else.";

/// プロンプトに埋め込む 1 項目分の入力。
///
/// キャッシュ対象ドメインでは生の値だけを渡す。同じ生値を持つ全レコードが
/// 同じ答えを共有するため、レコード固有の文脈は混ぜない。
#[must_use]
pub(crate) fn item_input(domain: Domain, record: &CatalogRecord) -> Value {
    let mut fields = Map::new();
    let mut put = |key: &str, value: Option<&str>| {
        if let Some(value) = non_blank(value) {
            fields.insert(key.to_string(), Value::String(value.to_string()));
        }
    };
    match domain {
        Domain::Composer | Domain::Voicing | Domain::Instruments | Domain::Genre => {
            put("raw", record.raw_input(domain));
        }
        Domain::Period => {
            put("title", Some(record.title.as_str()));
            put("composer", record.normalized_value(Domain::Composer));
            put("raw_composer", record.raw_composer.as_deref());
        }
        Domain::VocalFlag => {
            put("title", Some(record.title.as_str()));
            put("raw_voicing", record.raw_voicing.as_deref());
            put("raw_instruments", record.raw_instruments.as_deref());
            put("tags", record.raw_tags.as_deref());
        }
        Domain::PedagogicalGrade => {
            put("title", Some(record.title.as_str()));
            put("composer", record.normalized_value(Domain::Composer));
            put("period", record.normalized_value(Domain::Period));
            put("raw_instruments", record.raw_instruments.as_deref());
        }
        Domain::SearchText | Domain::IndexStatus => {}
    }
    Value::Object(fields)
}

fn instruction(domain: Domain, vocabulary: &Vocabulary) -> String {
    match domain {
        Domain::Composer => "Normalize the composer name to the form \"Surname, Given names\" \
            using the most widely recognised spelling. Use null when the input does not name \
            an identifiable composer."
            .to_string(),
        Domain::Period => format!(
            "Classify the musical style period of the piece. Choose exactly one of: {}. \
             Use null when it cannot be determined.",
            vocabulary.periods().join(", ")
        ),
        Domain::VocalFlag => "Decide whether the piece is written for voices (choir or solo \
            singer). Answer true or false."
            .to_string(),
        Domain::Voicing => format!(
            "Normalize the vocal scoring. Choose exactly one of: {}. Use null when none fits.",
            vocabulary.voicings().join(", ")
        ),
        Domain::Instruments => format!(
            "List the instruments the piece is scored for as an array, using only: {}. \
             Use null when none fits.",
            vocabulary.instruments().join(", ")
        ),
        Domain::Genre => format!(
            "Classify the genre. Choose exactly one of: {}. Use null when none fits.",
            vocabulary.genres().join(", ")
        ),
        Domain::PedagogicalGrade => "Estimate the pedagogical difficulty as \"Grade N\" or \
            \"Grade N-M\" with N and M between 1 and 9. Put a regional equivalent label, if one \
            is commonly used, in \"secondary\". Use null when it cannot be estimated."
            .to_string(),
        Domain::SearchText | Domain::IndexStatus => String::new(),
    }
}

/// 1 項目なら単一形式、複数なら相関 ID 付きのバッチ形式でリクエストを作る。
///
/// 相関 ID は 1 始まりの位置番号。
#[must_use]
pub(crate) fn build_request(
    domain: Domain,
    vocabulary: &Vocabulary,
    inputs: &[Value],
) -> InferenceRequest {
    let instruction = instruction(domain, vocabulary);
    let request = if let [single] = inputs {
        InferenceRequest::new(
            format!(
                "{instruction}\n\nRespond as {{\"value\": ..., \"secondary\": ..., \
                 \"confidence\": 0.0-1.0}}.\n\nInput:\n{single}"
            ),
            ResponseShape::Single,
        )
    } else {
        let items: Vec<Value> = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| json!({ "id": index + 1, "input": input }))
            .collect();
        InferenceRequest::new(
            format!(
                "{instruction}\n\nRespond as {{\"items\": [{{\"id\": <id>, \"value\": ..., \
                 \"secondary\": ..., \"confidence\": 0.0-1.0}}]}} with exactly one entry per \
                 input item, echoing its id.\n\nItems:\n{}",
                Value::Array(items)
            ),
            ResponseShape::Batch,
        )
    };
    request.with_system(SYSTEM_PROMPT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{NewCatalogRecord, ScoreFeatures};

    fn record() -> CatalogRecord {
        CatalogRecord::from_new(NewCatalogRecord {
            id: 3,
            title: "Missa brevis".to_string(),
            composer: Some("Palestrina".to_string()),
            instruments: None,
            voicing: Some("SATB".to_string()),
            genre: None,
            tags: Some("mass".to_string()),
            source: None,
            features: ScoreFeatures::default(),
        })
    }

    #[test]
    fn cacheable_input_carries_only_the_raw_value() {
        assert_eq!(
            item_input(Domain::Composer, &record()),
            json!({ "raw": "Palestrina" })
        );
        assert_eq!(item_input(Domain::Genre, &record()), json!({ "raw": "mass" }));
    }

    #[test]
    fn batch_request_embeds_positional_ids() {
        let vocabulary = Vocabulary::builtin().expect("vocabulary");
        let inputs = vec![json!({ "raw": "a" }), json!({ "raw": "b" })];
        let request = build_request(Domain::Genre, &vocabulary, &inputs);

        assert_eq!(request.shape, ResponseShape::Batch);
        assert!(request.prompt.contains(r#"{"id":2,"input":{"raw":"b"}}"#));
        assert!(request.prompt.contains("Motet"));
        assert_eq!(request.system.as_deref(), Some(SYSTEM_PROMPT));
    }

    #[test]
    fn single_item_uses_single_shape() {
        let vocabulary = Vocabulary::builtin().expect("vocabulary");
        let request = build_request(Domain::Composer, &vocabulary, &[json!({ "raw": "x" })]);
        assert_eq!(request.shape, ResponseShape::Single);
    }
}
