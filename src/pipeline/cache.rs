//! ドメイン単位のマッピングキャッシュ。
//!
//! ステージ開始時に永続ストアから読み込み、バッチのコミット後に取り込む。
//! レコードの状態が正であり、キャッシュは再導出可能なアクセラレータとして扱う。

use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use rustc_hash::FxHashMap;

use crate::domain::Domain;
use crate::store::dao::EnrichmentDao;
use crate::store::models::{MappingSource, NormalizationMapping};
use crate::util::text::cache_key;

/// キャッシュ済みの解決結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CachedResolution {
    Resolved(String),
    /// 呼び出しは成功したが該当値なし、またはパターンルールで解決不能と確定。
    Unresolved { source: MappingSource },
}

#[derive(Debug)]
pub(crate) struct MappingCache {
    domain: Domain,
    entries: RwLock<FxHashMap<String, CachedResolution>>,
}

impl MappingCache {
    pub(crate) fn empty(domain: Domain) -> Self {
        Self {
            domain,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) async fn load(domain: Domain, dao: &dyn EnrichmentDao) -> Result<Self> {
        let cache = Self::empty(domain);
        cache.absorb(&dao.load_mappings(domain).await?);
        Ok(cache)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 生の値で引く。キーは NFKC と空白の正規化を経たもの。
    pub(crate) fn get(&self, raw: &str) -> Option<CachedResolution> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key(raw))
            .cloned()
    }

    /// コミット済みのマッピングを取り込む。他ドメインの行は無視する。
    ///
    /// 同じキーへの書き込みは後勝ち。ただしパターンルール由来の確定値は上書きしない。
    pub(crate) fn absorb(&self, mappings: &[NormalizationMapping]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for mapping in mappings.iter().filter(|m| m.domain == self.domain) {
            let key = cache_key(&mapping.raw_value);
            if matches!(
                entries.get(&key),
                Some(CachedResolution::Unresolved {
                    source: MappingSource::PatternRule
                })
            ) && !mapping.verified
            {
                continue;
            }
            let resolution = match &mapping.resolved_value {
                Some(value) => CachedResolution::Resolved(value.clone()),
                None => CachedResolution::Unresolved {
                    source: mapping.source.clone(),
                },
            };
            entries.insert(key, resolution);
        }
    }
}
