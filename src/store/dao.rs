/// EnrichmentDaoトレイト - データアクセス層の抽象化
use async_trait::async_trait;

use super::models::{
    BatchCommit, CatalogRecord, NewCatalogRecord, NormalizationMapping, SearchDocument,
    StatusSummary,
};
use crate::domain::{Domain, ResetScope};

/// インポート結果。既存 ID のレコードは上書きしない。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

#[async_trait]
pub trait EnrichmentDao: Send + Sync {
    /// 接続確認。
    async fn ping(&self) -> anyhow::Result<()>;

    /// レコードを全ドメイン `pending` で登録する。
    async fn import_records(&self, records: &[NewCatalogRecord]) -> anyhow::Result<ImportOutcome>;

    async fn get_record(&self, id: i64) -> anyhow::Result<Option<CatalogRecord>>;

    /// `domain` が `pending` のレコードを ID 昇順で `after_id` の次から返す。
    async fn pending_records(
        &self,
        domain: Domain,
        after_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<CatalogRecord>>;

    async fn load_mappings(&self, domain: Domain) -> anyhow::Result<Vec<NormalizationMapping>>;

    /// 遷移とマッピングを 1 つの作業単位で書き込む。
    ///
    /// 遷移は対象がまだ `pending` の場合だけ適用され、適用件数を返す。
    async fn apply_batch(&self, commit: &BatchCommit) -> anyhow::Result<u64>;

    /// 対象ドメインだけを `pending` に戻す。他ドメインには触れない。
    async fn reset_domain(&self, domain: Domain, scope: ResetScope) -> anyhow::Result<u64>;

    async fn status_summary(&self) -> anyhow::Result<StatusSummary>;

    async fn clear_mappings(&self, domain: Domain) -> anyhow::Result<u64>;

    /// `search_text` が `normalized` のレコードを ID 昇順で返す。
    async fn search_documents(
        &self,
        after_id: i64,
        limit: usize,
        unindexed_only: bool,
    ) -> anyhow::Result<Vec<SearchDocument>>;

    /// インデクサの確認応答。検索テキストを持つレコードだけが `normalized` になる。
    async fn mark_indexed(&self, record_ids: &[i64]) -> anyhow::Result<u64>;
}
