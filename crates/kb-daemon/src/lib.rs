//! HTTP control-plane daemon (spec §6 surface): `AppState`,
//! `build_app(state) -> Router`, `ApiError -> IntoResponse`, a
//! `{error: {code, message}}` JSON envelope.

pub mod api;
pub mod tool_protocol;

pub use api::{build_app, AppState, ApiError};
