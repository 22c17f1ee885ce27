//! ステージ依存表と、その位相順序。

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::domain::{Domain, DomainStatus};
use crate::store::models::CatalogRecord;
use crate::util::text::non_blank;

/// 1 ドメイン分の依存定義。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDependency {
    pub domain: Domain,
    /// ゲートが通す前に決着している必要がある上流ドメイン。
    pub requires: &'static [Domain],
}

pub const STAGE_DEPENDENCIES: &[StageDependency] = &[
    StageDependency {
        domain: Domain::Composer,
        requires: &[],
    },
    StageDependency {
        domain: Domain::Period,
        requires: &[Domain::Composer],
    },
    StageDependency {
        domain: Domain::VocalFlag,
        requires: &[],
    },
    StageDependency {
        domain: Domain::Voicing,
        requires: &[Domain::VocalFlag],
    },
    StageDependency {
        domain: Domain::Instruments,
        requires: &[Domain::VocalFlag],
    },
    StageDependency {
        domain: Domain::Genre,
        requires: &[],
    },
    StageDependency {
        domain: Domain::PedagogicalGrade,
        requires: &[Domain::Period],
    },
    StageDependency {
        domain: Domain::SearchText,
        requires: &[
            Domain::Composer,
            Domain::Period,
            Domain::VocalFlag,
            Domain::Voicing,
            Domain::Instruments,
            Domain::Genre,
            Domain::PedagogicalGrade,
        ],
    },
    StageDependency {
        domain: Domain::IndexStatus,
        requires: &[Domain::SearchText],
    },
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DependencyError {
    #[error("stage dependencies contain a cycle through {domain}")]
    Cycle { domain: Domain },
    #[error("{domain} is declared more than once")]
    Duplicate { domain: Domain },
    #[error("{domain} requires {missing}, which has no stage definition")]
    Unknown { domain: Domain, missing: Domain },
}

/// 検証済みの依存表。ステージは `order()` の順に実行する。
#[derive(Debug, Clone)]
pub struct StagePlan {
    order: Vec<Domain>,
    requires: HashMap<Domain, &'static [Domain]>,
}

impl StagePlan {
    /// 依存表を DAG として検証し、位相順序を求める。
    ///
    /// # Errors
    /// 重複定義・未定義の上流・循環があれば [`DependencyError`]。
    pub fn build(table: &[StageDependency]) -> Result<Self, DependencyError> {
        let mut graph: DiGraph<Domain, ()> = DiGraph::new();
        let mut nodes: HashMap<Domain, NodeIndex> = HashMap::new();
        for row in table {
            if nodes.insert(row.domain, graph.add_node(row.domain)).is_some() {
                return Err(DependencyError::Duplicate { domain: row.domain });
            }
        }
        for row in table {
            for upstream in row.requires {
                let Some(&from) = nodes.get(upstream) else {
                    return Err(DependencyError::Unknown {
                        domain: row.domain,
                        missing: *upstream,
                    });
                };
                graph.add_edge(from, nodes[&row.domain], ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| DependencyError::Cycle {
            domain: graph[cycle.node_id()],
        })?;

        Ok(Self {
            order: sorted.into_iter().map(|index| graph[index]).collect(),
            requires: table.iter().map(|row| (row.domain, row.requires)).collect(),
        })
    }

    /// 組み込みの依存表から構築する。
    ///
    /// # Errors
    /// 組み込み表が壊れている場合のみ。
    pub fn standard() -> Result<Self, DependencyError> {
        Self::build(STAGE_DEPENDENCIES)
    }

    #[must_use]
    pub fn order(&self) -> &[Domain] {
        &self.order
    }

    #[must_use]
    pub fn requires(&self, domain: Domain) -> &'static [Domain] {
        self.requires.get(&domain).copied().unwrap_or(&[])
    }

    /// 上流がすべて決着しているか。
    ///
    /// `pending` 以外（`failed` を含む）は決着済み。恒久的な失敗で下流を止めない。
    /// 上流の入力が空でそもそも処理対象にならない場合も決着扱いにする。
    #[must_use]
    pub fn dependencies_satisfied(&self, domain: Domain, record: &CatalogRecord) -> bool {
        self.requires(domain)
            .iter()
            .all(|upstream| match record.status(*upstream) {
                DomainStatus::Normalized | DomainStatus::NotApplicable | DomainStatus::Failed => {
                    true
                }
                DomainStatus::Pending => !applies_to(*upstream, record),
            })
    }
}

/// ドメイン固有の入力有無フィルタ。`false` のレコードはそのドメインで `pending` のまま残る。
#[must_use]
pub fn applies_to(domain: Domain, record: &CatalogRecord) -> bool {
    match domain {
        Domain::Composer | Domain::Voicing | Domain::Instruments | Domain::Genre => {
            record.raw_input(domain).is_some()
        }
        Domain::Period | Domain::VocalFlag | Domain::PedagogicalGrade | Domain::SearchText => {
            record.has_title()
        }
        Domain::IndexStatus => non_blank(record.normalized_value(Domain::SearchText)).is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{NewCatalogRecord, ScoreFeatures};

    fn record(title: &str, composer: Option<&str>) -> CatalogRecord {
        CatalogRecord::from_new(NewCatalogRecord {
            id: 1,
            title: title.to_string(),
            composer: composer.map(ToString::to_string),
            instruments: None,
            voicing: None,
            genre: None,
            tags: None,
            source: None,
            features: ScoreFeatures::default(),
        })
    }

    fn set(record: &mut CatalogRecord, domain: Domain, status: DomainStatus) {
        record.domains.entry(domain).or_default().status = status;
    }

    #[test]
    fn standard_plan_orders_upstream_first() {
        let plan = StagePlan::standard().expect("standard table is a DAG");
        let position = |domain: Domain| {
            plan.order()
                .iter()
                .position(|candidate| *candidate == domain)
                .expect("every domain is planned")
        };
        assert_eq!(plan.order().len(), Domain::ALL.len());
        for row in STAGE_DEPENDENCIES {
            for upstream in row.requires {
                assert!(position(*upstream) < position(row.domain));
            }
        }
    }

    #[test]
    fn cycle_is_a_configuration_error() {
        let table = [
            StageDependency {
                domain: Domain::Composer,
                requires: &[Domain::Period],
            },
            StageDependency {
                domain: Domain::Period,
                requires: &[Domain::Composer],
            },
        ];
        assert!(matches!(
            StagePlan::build(&table),
            Err(DependencyError::Cycle { .. })
        ));
    }

    #[test]
    fn unknown_upstream_is_rejected() {
        let table = [StageDependency {
            domain: Domain::Period,
            requires: &[Domain::Composer],
        }];
        assert_eq!(
            StagePlan::build(&table).unwrap_err(),
            DependencyError::Unknown {
                domain: Domain::Period,
                missing: Domain::Composer
            }
        );
    }

    #[test]
    fn only_pending_upstream_blocks_downstream() {
        let plan = StagePlan::standard().expect("plan");
        let mut record = record("Gloria", Some("Vivaldi"));
        assert!(!plan.dependencies_satisfied(Domain::PedagogicalGrade, &record));

        for status in [
            DomainStatus::Failed,
            DomainStatus::NotApplicable,
            DomainStatus::Normalized,
        ] {
            set(&mut record, Domain::Period, status);
            assert!(
                plan.dependencies_satisfied(Domain::PedagogicalGrade, &record),
                "{status:?} upstream should release the downstream stage"
            );
        }
    }

    #[test]
    fn blank_upstream_input_counts_as_settled() {
        let plan = StagePlan::standard().expect("plan");
        let record = record("Gloria", None);
        assert!(!applies_to(Domain::Composer, &record));
        assert!(plan.dependencies_satisfied(Domain::Period, &record));
    }
}
