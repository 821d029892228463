//! HTTP REST endpoints.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/batch` | PUT | Transactional batch; status is the aggregate |
//! | `/{resource}/batch` | PUT | Batch restricted to one resource type |
//! | `/batch_streaming` | PUT | Batch streamed as results complete; always 200 |
//! | `/{resource}` | GET | List rows |
//! | `/{resource}/{id}` | GET, PUT, PATCH, DELETE | Single operation |
//! | `/health` | GET | Liveness |
//! | `/ready` | GET | Database health |
//! | `/metrics` | GET | Prometheus exposition |

mod error;
pub mod routes;
pub mod state;
mod streaming;

pub use error::{ApiError, ApiResult, JsonBadRequest, PAYLOAD_TOO_LARGE};
pub use routes::{
    create_router, create_router_with_body_limit, create_router_with_observability,
    RouterOptions, DEFAULT_BODY_LIMIT,
};
pub use state::AppState;

#[cfg(test)]
mod tests;
