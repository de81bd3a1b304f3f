/// Data layer: bundle types, loading, schema derivation, filtering and projection.
///
/// Architecture:
/// ```text
///  .parquet / .json
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → DatasetBundle (metadata, expression, embedding)
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  schema   │  metadata columns → FilterField list
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  predicates + grouping fields → Selection
///   └──────────┘
///        │
///        ▼
///   ┌───────────┐
///   │ projector  │  Selection + plot kind + features → ProjectedTable
///   └───────────┘
/// ```

pub mod filter;
pub mod loader;
pub mod model;
pub mod projector;
pub mod schema;
