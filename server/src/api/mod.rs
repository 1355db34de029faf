pub mod binary_cache;

use axum::Router;

pub fn router() -> Router {
    binary_cache::router()
}
