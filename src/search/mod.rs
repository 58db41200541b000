//! Hybrid Search Coordinator (§4.5): validates `HybridParameters`, resolves
//! the query vector, dispatches the retrieval(s) the chosen method pair
//! actually needs, and — for `Disjunction+RRF` — fuses and reranks
//! client-side.

pub mod fusion;
pub mod params;
pub mod query;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::CoreConfig;
use crate::embedder::Vectoriser;
use crate::error::{CoreError, Result};
use crate::filter::{self, Filter};
use crate::index::definition::IndexDefinition;
use crate::store::StoreClient;

pub use params::{HybridParameters, RankingMethod, RetrievalMethod};
pub use query::{ContextTensor, MarqoQuery, QuerySource};

#[derive(Debug, Clone)]
pub struct Hit {
    pub id: String,
    pub score: f64,
    pub fields: Value,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub hits: Vec<Hit>,
}

pub struct HybridSearchCoordinator {
    store: StoreClient,
    vectoriser: Arc<dyn Vectoriser>,
    config: CoreConfig,
}

impl HybridSearchCoordinator {
    pub fn new(store: StoreClient, vectoriser: Arc<dyn Vectoriser>, config: CoreConfig) -> Self {
        HybridSearchCoordinator { store, vectoriser, config }
    }

    pub async fn search(&self, index: &IndexDefinition, query: MarqoQuery) -> Result<SearchResult> {
        if !index.supports_hybrid_search() {
            if let MarqoQuery::Hybrid { .. } = &query {
                return Err(CoreError::UnsupportedFeature(
                    "hybrid search is not available on this legacy Unstructured index".to_string(),
                ));
            }
        }

        match query {
            MarqoQuery::Lexical { text, filter, searchable_attributes, score_modifiers, limit, offset } => {
                self.run_lexical(index, &text, filter.as_ref(), searchable_attributes.as_deref(), score_modifiers.as_ref(), limit, offset).await
            }
            MarqoQuery::Tensor { source, context, filter, searchable_attributes, score_modifiers, limit, offset } => {
                let vector = query::resolve_query_vector(self.vectoriser.as_ref(), &source, &context).await?;
                self.run_tensor(index, &vector, filter.as_ref(), searchable_attributes.as_deref(), score_modifiers.as_ref(), limit, offset).await
            }
            MarqoQuery::Hybrid { text, source, context, filter, params, limit, offset } => {
                self.run_hybrid(index, &text, &source, &context, filter.as_ref(), &params, limit, offset).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_hybrid(
        &self,
        index: &IndexDefinition,
        text: &str,
        source: &QuerySource,
        context: &[ContextTensor],
        filter: Option<&Filter>,
        params: &HybridParameters,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResult> {
        let (retrieval, ranking) = params.validate(index)?;

        match (retrieval, ranking) {
            (RetrievalMethod::Disjunction, RankingMethod::Rrf) => {
                // §4.5.3: retrieve up to max(limit, rerankDepth, 2*limit) from each side.
                let depth = limit.max(params.rerank_depth.unwrap_or(0) as usize).max(2 * limit.max(1));
                let lexical = self
                    .run_lexical(index, text, filter, params.searchable_attributes_lexical.as_deref(), params.score_modifiers_lexical.as_ref(), depth, 0)
                    .await?;
                let vector = query::resolve_query_vector(self.vectoriser.as_ref(), source, context).await?;
                let tensor = self
                    .run_tensor(index, &vector, filter, params.searchable_attributes_tensor.as_deref(), params.score_modifiers_tensor.as_ref(), depth, 0)
                    .await?;

                let lexical_ranked: Vec<String> = lexical.hits.iter().map(|h| h.id.clone()).collect();
                let tensor_ranked: Vec<String> = tensor.hits.iter().map(|h| h.id.clone()).collect();
                let fused = fusion::fuse(&lexical_ranked, &tensor_ranked, params.alpha(), params.rrf_k());

                let fields_by_id: HashMap<String, Value> = lexical.hits.into_iter().chain(tensor.hits).map(|h| (h.id, h.fields)).collect();
                let global_modifiers = params.score_modifiers.clone().unwrap_or_default();
                let windowed = fusion::apply_rerank_window(fused, params.rerank_depth, limit + offset, |id| {
                    fields_by_id.get(id).map(|f| score_modifier_delta(f, &global_modifiers)).unwrap_or(0.0)
                });

                let hits = windowed
                    .into_iter()
                    .skip(offset)
                    .map(|d| Hit { fields: fields_by_id.get(&d.id).cloned().unwrap_or(Value::Null), id: d.id, score: d.score })
                    .collect();
                Ok(SearchResult { hits })
            }
            (RetrievalMethod::Lexical, RankingMethod::Lexical) => {
                self.run_lexical(index, text, filter, params.searchable_attributes_lexical.as_deref(), params.score_modifiers_lexical.as_ref(), limit, offset).await
            }
            (RetrievalMethod::Tensor, RankingMethod::Tensor) => {
                let vector = query::resolve_query_vector(self.vectoriser.as_ref(), source, context).await?;
                self.run_tensor(index, &vector, filter, params.searchable_attributes_tensor.as_deref(), params.score_modifiers_tensor.as_ref(), limit, offset).await
            }
            (RetrievalMethod::Lexical, RankingMethod::Tensor) => {
                // Candidate set = pure lexical retrieval; rescore with tensor similarity (§4.5.4).
                let candidates = self.run_lexical(index, text, filter, params.searchable_attributes_lexical.as_deref(), None, limit, 0).await?;
                let ids: Vec<String> = candidates.hits.iter().map(|h| h.id.clone()).collect();
                let vector = query::resolve_query_vector(self.vectoriser.as_ref(), source, context).await?;
                self.run_tensor_over_candidates(index, &vector, &ids, params.score_modifiers_tensor.as_ref(), limit, offset).await
            }
            (RetrievalMethod::Tensor, RankingMethod::Lexical) => {
                let vector = query::resolve_query_vector(self.vectoriser.as_ref(), source, context).await?;
                let candidates = self.run_tensor(index, &vector, filter, params.searchable_attributes_tensor.as_deref(), None, limit, 0).await?;
                let ids: Vec<String> = candidates.hits.iter().map(|h| h.id.clone()).collect();
                self.run_lexical_over_candidates(index, text, &ids, params.score_modifiers_lexical.as_ref(), limit, offset).await
            }
            _ => Err(CoreError::InvalidArgument("unsupported retrieval/ranking combination".to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_lexical(
        &self,
        index: &IndexDefinition,
        text: &str,
        filter: Option<&Filter>,
        searchable_attributes: Option<&[String]>,
        score_modifiers: Option<&HashMap<String, f64>>,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResult> {
        let filter_expr = filter.map(|f| filter::compile(f, index)).transpose()?;
        let body = query::build_hybrid_query_body(
            index,
            RetrievalMethod::Lexical,
            RankingMethod::Lexical,
            &HybridParameters {
                searchable_attributes_lexical: searchable_attributes.map(|a| a.to_vec()),
                score_modifiers_lexical: score_modifiers.cloned(),
                ..Default::default()
            },
            &[],
            &format!("text:{}{}", text, filter_expr.map(|f| format!(" AND {}", f)).unwrap_or_default()),
            "",
            limit,
            offset,
        );
        self.dispatch(body).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tensor(
        &self,
        index: &IndexDefinition,
        vector: &[f32],
        filter: Option<&Filter>,
        searchable_attributes: Option<&[String]>,
        score_modifiers: Option<&HashMap<String, f64>>,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResult> {
        let filter_expr = filter.map(|f| filter::compile(f, index)).transpose()?;
        let body = query::build_hybrid_query_body(
            index,
            RetrievalMethod::Tensor,
            RankingMethod::Tensor,
            &HybridParameters {
                searchable_attributes_tensor: searchable_attributes.map(|a| a.to_vec()),
                score_modifiers_tensor: score_modifiers.cloned(),
                ..Default::default()
            },
            vector,
            "",
            &filter_expr.unwrap_or_default(),
            limit,
            offset,
        );
        self.dispatch(body).await
    }

    async fn run_tensor_over_candidates(
        &self,
        index: &IndexDefinition,
        vector: &[f32],
        ids: &[String],
        score_modifiers: Option<&HashMap<String, f64>>,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResult> {
        let candidate_filter = Filter::InTerm { field: "_id".to_string(), values: ids.iter().map(|i| serde_json::json!(i)).collect() };
        self.run_tensor(index, vector, Some(&candidate_filter), None, score_modifiers, limit, offset).await
    }

    async fn run_lexical_over_candidates(
        &self,
        index: &IndexDefinition,
        text: &str,
        ids: &[String],
        score_modifiers: Option<&HashMap<String, f64>>,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResult> {
        let candidate_filter = Filter::InTerm { field: "_id".to_string(), values: ids.iter().map(|i| serde_json::json!(i)).collect() };
        self.run_lexical(index, text, Some(&candidate_filter), None, score_modifiers, limit, offset).await
    }

    async fn dispatch(&self, body: Value) -> Result<SearchResult> {
        let response = self.store.query(body, Duration::from_millis(self.config.query_timeout_ms)).await?;
        Ok(SearchResult { hits: parse_hits(&response) })
    }
}

fn parse_hits(response: &Value) -> Vec<Hit> {
    response
        .get("root")
        .and_then(|r| r.get("children"))
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|child| {
            let id = child.get("fields").and_then(|f| f.get("documentid")).and_then(|v| v.as_str())?.to_string();
            let score = child.get("relevance").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let fields = child.get("fields").cloned().unwrap_or(Value::Null);
            Some(Hit { id, score, fields })
        })
        .collect()
}

fn score_modifier_delta(fields: &Value, modifiers: &HashMap<String, f64>) -> f64 {
    modifiers
        .iter()
        .map(|(field, weight)| {
            let value = fields.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
            weight * value
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_modifier_delta_sums_weighted_fields() {
        let fields = serde_json::json!({"add": 2.0});
        let mut modifiers = HashMap::new();
        modifiers.insert("add".to_string(), 1.0);
        assert_eq!(score_modifier_delta(&fields, &modifiers), 2.0);
    }

    #[test]
    fn parse_hits_extracts_id_and_relevance() {
        let response = serde_json::json!({
            "root": { "children": [{ "fields": { "documentid": "doc-1" }, "relevance": 0.75 }] }
        });
        let hits = parse_hits(&response);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "doc-1");
        assert_eq!(hits[0].score, 0.75);
    }
}
