//! SurrealDB schema definitions

use crate::{DbConnection, DbError, Result};
use tracing::info;

/// Initialize the database schema
pub async fn initialize_schema(db: &DbConnection) -> Result<()> {
    info!("Initializing database schema...");

    db.query(SCHEMA_DEFINITION)
        .await?
        .check()
        .map_err(|e| DbError::SchemaInit(e.to_string()))?;

    info!("Schema initialized successfully");
    Ok(())
}

const SCHEMA_DEFINITION: &str = r#"
-- ============================================
-- GRAPH
-- ============================================

-- Entities, keyed by the id derived from the normalized name
DEFINE TABLE IF NOT EXISTS entity SCHEMALESS;
DEFINE FIELD IF NOT EXISTS name ON entity TYPE string;
DEFINE FIELD IF NOT EXISTS canonical_name ON entity TYPE string;
DEFINE FIELD IF NOT EXISTS entity_type ON entity TYPE string DEFAULT 'concept';
DEFINE FIELD IF NOT EXISTS description ON entity TYPE string DEFAULT '';
DEFINE FIELD IF NOT EXISTS confidence ON entity TYPE number DEFAULT 0;
DEFINE FIELD IF NOT EXISTS origin ON entity TYPE string;
DEFINE FIELD IF NOT EXISTS provenance ON entity TYPE array DEFAULT [];
DEFINE FIELD IF NOT EXISTS updated_at ON entity VALUE time::now();

-- Triples, keyed by source|label|target
DEFINE TABLE IF NOT EXISTS relationship SCHEMALESS;
DEFINE FIELD IF NOT EXISTS source_id ON relationship TYPE string;
DEFINE FIELD IF NOT EXISTS label ON relationship TYPE string;
DEFINE FIELD IF NOT EXISTS target_id ON relationship TYPE string;
DEFINE FIELD IF NOT EXISTS confidence ON relationship TYPE number DEFAULT 0;
DEFINE FIELD IF NOT EXISTS provenance ON relationship TYPE array DEFAULT [];
DEFINE FIELD IF NOT EXISTS updated_at ON relationship VALUE time::now();

-- ============================================
-- RETRIEVAL
-- ============================================

-- Embedded passages and entity summaries, grouped by collection
DEFINE TABLE IF NOT EXISTS vector_record SCHEMALESS;
DEFINE FIELD IF NOT EXISTS collection ON vector_record TYPE string;
DEFINE FIELD IF NOT EXISTS record_key ON vector_record TYPE string;
DEFINE FIELD IF NOT EXISTS content ON vector_record TYPE string;
DEFINE FIELD IF NOT EXISTS embedding ON vector_record TYPE array<float>;

-- Keyword-indexed passages
DEFINE TABLE IF NOT EXISTS keyword_doc SCHEMALESS;
DEFINE FIELD IF NOT EXISTS doc_key ON keyword_doc TYPE string;
DEFINE FIELD IF NOT EXISTS content ON keyword_doc TYPE string;

-- ============================================
-- INDEXES
-- ============================================

-- Search analyzer; CJK runs stay whole tokens
DEFINE ANALYZER IF NOT EXISTS passage
    TOKENIZERS blank, class
    FILTERS lowercase;

DEFINE INDEX IF NOT EXISTS idx_keyword_content ON keyword_doc FIELDS content
    SEARCH ANALYZER passage BM25;

DEFINE INDEX IF NOT EXISTS idx_entity_canonical ON entity FIELDS canonical_name;
DEFINE INDEX IF NOT EXISTS idx_relationship_source ON relationship FIELDS source_id;
DEFINE INDEX IF NOT EXISTS idx_relationship_target ON relationship FIELDS target_id;
DEFINE INDEX IF NOT EXISTS idx_vector_collection ON vector_record FIELDS collection;
"#;
