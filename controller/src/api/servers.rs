use std::net::Ipv4Addr;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flotilla_common::models::agent::install_command;
use flotilla_common::models::error::ErrorKind;
use flotilla_common::validation::Hostname;

use crate::error::{Error, Result};

use super::{agent::mint_token, ApiState, ServerResponse};

#[derive(Debug, Deserialize)]
pub(super) struct CreateServerRequest {
    pub name: String,
    pub wireguard_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub is_proxy: bool,
}

/// The one-shot enrolment material; shown once, never stored readable.
#[derive(Debug, Serialize)]
pub(super) struct CreateServerResponse {
    pub server: ServerResponse,
    pub registration_token: String,
    pub install_command: String,
}

pub(super) async fn list_servers(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ServerResponse>>> {
    let servers = state.persistence.servers().await?;
    Ok(Json(servers.into_iter().map(Into::into).collect()))
}

pub(super) async fn create_server(
    State(state): State<ApiState>,
    Json(request): Json<CreateServerRequest>,
) -> Result<Json<CreateServerResponse>> {
    // Server names share the hostname constraints; they become DNS labels on
    // the mesh.
    if Hostname::new(&request.name).is_err() {
        return Err(Error::custom(
            ErrorKind::Validation,
            "server name must be a lowercase DNS label",
        ));
    }

    let registration_token = mint_token();

    let server = state
        .persistence
        .insert_server(
            &request.name,
            request.wireguard_ip,
            request.is_proxy,
            &registration_token,
            Duration::hours(state.config.registration_token_ttl_hours),
        )
        .await?;

    let install_command = install_command(&state.config.public_url, &registration_token);

    Ok(Json(CreateServerResponse {
        server: server.into(),
        registration_token,
        install_command,
    }))
}

pub(super) async fn delete_server(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<()>> {
    state.persistence.delete_server(&id).await?;
    Ok(Json(()))
}
