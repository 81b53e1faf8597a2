//! HTTP surface (§6.5's operational routes plus the REST complement to the
//! socket ingress events in §4.5). Each submodule is one resource, one
//! handler per operation, grounded on the teacher's
//! `handlers/send_message.rs` / `handlers/get_messages.rs` /
//! `handlers/get_convos.rs` shape: `State<AppState>` extraction, the
//! `AuthUser` extractor for identity, `Result<Json<T>, CoreError>` returns.

pub mod auth;
pub mod conversations;
pub mod messages;
