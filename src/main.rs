use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cpic_rag::config::Settings;
use cpic_rag::ingest::fetch::{CpicDataset, CpicGuidelineFetcher};
use cpic_rag::ingest::parser::UnstructuredClient;
use cpic_rag::ingest::IngestionPipeline;
use cpic_rag::llm::OpenRouterClient;
use cpic_rag::models::{
    IngestOptions, IngestRequest, IngestResponse, PhenotypeRequest, PhenotypeResponse,
    QueryRequest, QueryResponse, StatusResponse,
};
use cpic_rag::phenotype::{CpicApiClient, PgDiplotypeCache, PhenotypeResolver};
use cpic_rag::rag::answer::AnswerEngine;
use cpic_rag::rag::embeddings::EmbeddingGenerator;
use cpic_rag::rag::vector_store::VectorStore;
use cpic_rag::rag::{ChunkIndex, SimilarityIndex};
use cpic_rag::store::{GuidelineStore, PgGuidelineStore};

struct AppState {
    settings: Settings,
    store: Arc<dyn GuidelineStore>,
    index: Arc<dyn ChunkIndex>,
    pipeline: IngestionPipeline,
    answers: AnswerEngine,
    phenotypes: PhenotypeResolver,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let settings = Settings::from_env();
    settings.ensure_dirs()?;

    tracing::info!("Connecting to database: {}", settings.database_url);
    tracing::info!("Connecting to Qdrant: {}", settings.qdrant_url);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await?;

    let guideline_store = PgGuidelineStore::new(pool.clone());
    guideline_store.init_schema().await?;
    let diplotype_cache = PgDiplotypeCache::new(pool.clone());
    diplotype_cache.init_schema().await?;

    let embeddings = Arc::new(EmbeddingGenerator::new(&settings.model_cache_dir)?);
    let vector_store = VectorStore::connect(&settings.qdrant_url, &settings.qdrant_collection)?;

    let store: Arc<dyn GuidelineStore> = Arc::new(guideline_store);
    let index: Arc<dyn ChunkIndex> = Arc::new(SimilarityIndex::new(embeddings, vector_store));

    let pipeline = IngestionPipeline::new(
        store.clone(),
        index.clone(),
        Arc::new(CpicGuidelineFetcher::new(&settings)?),
        Arc::new(UnstructuredClient::new(&settings)),
        settings.pdf_dir.clone(),
    );
    let answers = AnswerEngine::new(index.clone(), Arc::new(OpenRouterClient::new(&settings)));
    let phenotypes = PhenotypeResolver::new(
        Arc::new(diplotype_cache),
        Arc::new(CpicApiClient::new(&settings)?),
    );

    let state = Arc::new(AppState {
        settings: settings.clone(),
        store,
        index,
        pipeline,
        answers,
        phenotypes,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/api/ingest", post(post_ingest))
        .route("/api/ingest/options", get(get_ingest_options))
        .route("/api/query", post(post_query))
        .route("/api/phenotype", post(post_phenotype))
        .route("/api/genes", get(get_genes))
        .route("/api/diplotypes/:gene", get(get_diplotypes))
        .route("/api/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!("CPIC RAG server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "CPIC RAG API is running",
        "docs": "/api/status"
    }))
}

async fn post_ingest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, (StatusCode, String)> {
    let response = state
        .pipeline
        .ingest(&request.gene, &request.drug)
        .await
        .map_err(|e| {
            tracing::error!("Ingestion error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
        })?;

    Ok(Json(response))
}

async fn get_ingest_options(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IngestOptions>, (StatusCode, String)> {
    let dataset = CpicDataset::load(&state.settings.cpic_pairs_path).map_err(|e| {
        tracing::error!("Failed to load CPIC pairs: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
    })?;

    Ok(Json(IngestOptions {
        genes: dataset.genes(),
        drugs: dataset.drugs(),
        pairs: dataset.pairs(),
    }))
}

async fn post_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, String)> {
    let gene = request.gene.unwrap_or_default();
    let drug = request.drug.unwrap_or_default();

    let response = state
        .answers
        .answer(&gene, &drug, &request.question)
        .await
        .map_err(|e| {
            tracing::error!("Query error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
        })?;

    Ok(Json(response))
}

async fn post_phenotype(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PhenotypeRequest>,
) -> Result<Json<PhenotypeResponse>, (StatusCode, String)> {
    let response = state
        .phenotypes
        .lookup(&request.gene, &request.diplotype)
        .await
        .map_err(|e| {
            tracing::error!("Phenotype lookup error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
        })?;

    Ok(Json(response))
}

async fn get_genes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let genes = state.phenotypes.available_genes().await.map_err(|e| {
        tracing::error!("Gene listing error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
    })?;

    Ok(Json(serde_json::json!({ "genes": genes })))
}

async fn get_diplotypes(
    State(state): State<Arc<AppState>>,
    Path(gene): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let diplotypes = state.phenotypes.diplotypes_for_gene(&gene).await.map_err(|e| {
        tracing::error!("Diplotype listing error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
    })?;

    Ok(Json(serde_json::json!({ "diplotypes": diplotypes })))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let indexed_guidelines = state.store.count().await.map_err(|e| {
        tracing::error!("Status error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
    })?;
    let total_chunks = state.index.total_vector_count().await.map_err(|e| {
        tracing::error!("Status error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", e))
    })?;

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
        indexed_guidelines,
        total_chunks,
        embedding_model: state.settings.embedding_model.clone(),
    }))
}
