#![forbid(unsafe_code)]
#![doc = r#"
Morphgate

Serve the Messages API (`/v1/messages`) on top of the MorphLLM chat backend, spreading
traffic over a pool of rotating backend credentials.

Crate highlights
- Library: pure conversion via `to_upstream_request(&ChatRequest, &ModelPolicy)` and the
  incremental `UpstreamTranslator` that turns backend SSE bytes into Messages stream events.
- HTTP server (in `server`): chat endpoints plus an owner-scoped credential management API.
- Credential pool: selection strategies, health bookkeeping and validation probes.

Modules
- `models`: Data structures for the Messages API and the backend wire format.
- `conversion`: Messages request → backend request mapping and model policy.
- `stream`: Backend SSE decoding and the Messages event state machine.
- `pipeline`: Channel plumbing between the backend body and the client.
- `credentials`, `credential_store_memory`, `credential_store_sled`: credential records and storage.
- `rotation`, `health`, `validator`: selection, health tracking and probes.
- `server`: actix-web routes and handlers.
- `util`: Shared helpers (tracing, env, application state).
"#]

pub mod auth;
pub mod config;
pub mod conversion;
pub mod credential_store_memory;
pub mod credential_store_sled;
pub mod credentials;
pub mod debug_log;
pub mod error;
pub mod health;
pub mod models;
pub mod pipeline;
pub mod rotation;
pub mod server;
pub mod stream;
pub mod tokenizer;
pub mod upstream;
pub mod util;
pub mod validator;

pub use crate::auth::{Session, SessionVerifier, StaticTokenVerifier};
pub use crate::config::{GatewayConfig, StoreBackend};
pub use crate::conversion::{to_upstream_request, upstream_to_chat_request, ModelPolicy};
pub use crate::credentials::{
    Credential, CredentialPatch, CredentialStats, CredentialStore, NewCredential,
};
pub use crate::error::GatewayError;
pub use crate::health::HealthTracker;
pub use crate::rotation::{RotationPool, RotationStrategy};
pub use crate::stream::{StreamTransformer, UpstreamTranslator};
pub use crate::util::AppState;
pub use crate::validator::{ProbeReport, ValidationProbe};

// Re-export model namespaces for convenience (downstream users can do `use morphgate::messages`).
pub use crate::models::{messages, upstream as wire};
