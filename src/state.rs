use crate::{
    config::AppConfig,
    services::{
        auth_service::AuthService, chunk_store::ChunkStore, metadata_index::MetadataIndex,
        streaming::StreamingRetrieval, upload_pipeline::UploadPipeline,
    },
};
use axum::extract::FromRef;
use sqlx::SqlitePool;
use std::time::Duration;

/// Shared handles passed to every handler. Each component receives the
/// same pool; opening and closing it is the caller's job.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub store: ChunkStore,
    pub index: MetadataIndex,
    pub uploads: UploadPipeline,
    pub retrieval: StreamingRetrieval,
    pub auth: AuthService,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(db: SqlitePool, cfg: &AppConfig) -> Self {
        let store = ChunkStore::new(db.clone(), cfg.chunk_size)
            .with_superseded_grace(Duration::from_secs(cfg.superseded_grace_secs));
        let index = MetadataIndex::new(db.clone());
        let uploads = UploadPipeline::new(store.clone(), index.clone())
            .with_empty_uploads(cfg.allow_empty_uploads);
        let retrieval = StreamingRetrieval::new(store.clone(), index.clone())
            .with_relay_buffer(cfg.relay_buffer_chunks);
        let auth = AuthService::new(db.clone(), &cfg.jwt_secret, cfg.token_ttl_secs)
            .with_bcrypt_cost(cfg.bcrypt_cost);

        Self {
            db,
            store,
            index,
            uploads,
            retrieval,
            auth,
            max_upload_bytes: cfg.max_upload_bytes,
        }
    }
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
