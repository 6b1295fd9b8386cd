pub mod fusion;
pub mod patterns;
pub mod planner;

pub use patterns::{DatasetPattern, PatternSet};
pub use planner::{
    DatasetSelector, QueryPlanner, Reranker, SearchFilters, SearchRequest, SearchResponse,
    SearchResult,
};
