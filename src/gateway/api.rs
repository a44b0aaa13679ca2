//! REST handlers. Each one resolves the caller, delegates to the console
//! and lets [`ApiError`](super::ApiError) pick the status code.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use super::{ApiResult, Caller, GatewayState};
use crate::auth::LoginGrant;
use crate::config::ConsoleSettings;
use crate::directory::{AgentUpdate, NewAgent, NewLabel, ProfileUpdate};
use crate::model::{
    AgentId, AgentProfile, Capability, Conversation, ConversationId, ConversationStatus,
    CredentialPayload, DeliveryStatus, Label, LabelId, Message, MessageId, Presence,
    SessionSnapshot, SessionState,
};
use crate::router::{AssignedFilter, ConversationFilter};

// ── auth ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(state): State<GatewayState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<LoginGrant>> {
    Ok(Json(state.console.auth().login(&body.email, &body.password)?))
}

pub async fn logout(State(state): State<GatewayState>, caller: Caller) -> ApiResult<StatusCode> {
    state.console.auth().logout(&caller.token)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(
    State(state): State<GatewayState>,
    caller: Caller,
) -> ApiResult<Json<AgentProfile>> {
    Ok(Json(
        state.console.directory().profile(&caller.principal.agent_id)?,
    ))
}

pub async fn update_me(
    State(state): State<GatewayState>,
    caller: Caller,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<Json<AgentProfile>> {
    Ok(Json(
        state
            .console
            .directory()
            .update_profile(&caller.principal, update)?,
    ))
}

// ── conversations ──────────────────────────────────────

/// Query string of `GET /api/conversations`. `assigned` is `any`, `me`,
/// `unassigned` or an agent id.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub assigned: Option<String>,
    pub label: Option<String>,
    pub status: Option<ConversationStatus>,
    pub search: Option<String>,
}

impl ListQuery {
    fn into_filter(self, caller: &Caller) -> ConversationFilter {
        let assigned = match self.assigned.as_deref().map(str::trim) {
            None | Some("" | "any") => AssignedFilter::Any,
            Some("me") => AssignedFilter::Agent(caller.principal.agent_id.clone()),
            Some("unassigned") => AssignedFilter::Unassigned,
            Some(id) => AssignedFilter::Agent(AgentId::from(id)),
        };
        ConversationFilter {
            assigned,
            label: self.label.filter(|l| !l.is_empty()).map(LabelId::from),
            status: self.status,
            search: self.search,
        }
    }
}

pub async fn list_conversations(
    State(state): State<GatewayState>,
    caller: Caller,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Conversation>> {
    let filter = query.into_filter(&caller);
    Json(state.console.router().list(&caller.principal, &filter).await)
}

pub async fn get_conversation(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .get(&caller.principal, &ConversationId::from(id))
        .await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub agent_id: AgentId,
}

pub async fn assign(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<AssignRequest>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .assign(&caller.principal, &ConversationId::from(id), &body.agent_id)
        .await?;
    Ok(Json(conversation))
}

pub async fn reassign(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<AssignRequest>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .reassign(&caller.principal, &ConversationId::from(id), &body.agent_id)
        .await?;
    Ok(Json(conversation))
}

pub async fn unassign(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .unassign(&caller.principal, &ConversationId::from(id))
        .await?;
    Ok(Json(conversation))
}

pub async fn close(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .close(&caller.principal, &ConversationId::from(id))
        .await?;
    Ok(Json(conversation))
}

pub async fn reopen(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .reopen(&caller.principal, &ConversationId::from(id))
        .await?;
    Ok(Json(conversation))
}

pub async fn mark_read(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .mark_read(&caller.principal, &ConversationId::from(id))
        .await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelRequest {
    pub label_id: LabelId,
}

pub async fn add_label(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<LabelRequest>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .add_label(&caller.principal, &ConversationId::from(id), &body.label_id)
        .await?;
    Ok(Json(conversation))
}

pub async fn remove_label(
    State(state): State<GatewayState>,
    caller: Caller,
    Path((id, label)): Path<(String, String)>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .console
        .router()
        .remove_label(
            &caller.principal,
            &ConversationId::from(id),
            &LabelId::from(label),
        )
        .await?;
    Ok(Json(conversation))
}

// ── messages ───────────────────────────────────────────

pub async fn list_messages(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    let messages = state
        .console
        .router()
        .messages(&caller.principal, &ConversationId::from(id))
        .await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub body: String,
}

pub async fn send_message(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state
        .console
        .send_reply(&caller.principal, &ConversationId::from(id), &request.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: DeliveryStatus,
}

pub async fn update_message_status(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> ApiResult<Json<Message>> {
    let message = state
        .console
        .update_message_status(&caller.principal, &MessageId::from(id), body.status)
        .await?;
    Ok(Json(message))
}

// ── agents ─────────────────────────────────────────────

/// Agent profile plus current workload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    #[serde(flatten)]
    pub profile: AgentProfile,
    pub open_conversations: u32,
}

fn agent_view(state: &GatewayState, profile: AgentProfile) -> AgentView {
    let open_conversations = state.console.router().open_count(&profile.id);
    AgentView {
        profile,
        open_conversations,
    }
}

pub async fn list_agents(State(state): State<GatewayState>, _caller: Caller) -> Json<Vec<AgentView>> {
    let views = state
        .console
        .directory()
        .profiles()
        .into_iter()
        .map(|p| agent_view(&state, p))
        .collect();
    Json(views)
}

pub async fn get_agent(
    State(state): State<GatewayState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentView>> {
    let profile = state.console.directory().profile(&AgentId::from(id))?;
    Ok(Json(agent_view(&state, profile)))
}

pub async fn create_agent(
    State(state): State<GatewayState>,
    caller: Caller,
    Json(new): Json<NewAgent>,
) -> ApiResult<(StatusCode, Json<AgentProfile>)> {
    let profile = state
        .console
        .directory()
        .create_agent(&caller.principal, new)?;
    Ok((StatusCode::CREATED, Json(profile)))
}

pub async fn update_agent(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(update): Json<AgentUpdate>,
) -> ApiResult<Json<AgentProfile>> {
    let profile = state
        .console
        .directory()
        .update_agent(&caller.principal, &AgentId::from(id), update)?;
    Ok(Json(profile))
}

pub async fn delete_agent(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .console
        .delete_agent(&caller.principal, &AgentId::from(id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    pub presence: Presence,
}

pub async fn set_presence(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(body): Json<PresenceRequest>,
) -> ApiResult<Json<AgentProfile>> {
    let profile = state.console.directory().set_presence(
        &caller.principal,
        &AgentId::from(id),
        body.presence,
    )?;
    Ok(Json(profile))
}

// ── labels ─────────────────────────────────────────────

pub async fn list_labels(State(state): State<GatewayState>, _caller: Caller) -> Json<Vec<Label>> {
    Json(state.console.directory().labels())
}

pub async fn create_label(
    State(state): State<GatewayState>,
    caller: Caller,
    Json(new): Json<NewLabel>,
) -> ApiResult<(StatusCode, Json<Label>)> {
    let label = state
        .console
        .directory()
        .create_label(&caller.principal, new)?;
    Ok((StatusCode::CREATED, Json(label)))
}

pub async fn delete_label(
    State(state): State<GatewayState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .console
        .delete_label(&caller.principal, &LabelId::from(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── whatsapp session ───────────────────────────────────

pub async fn session_status(
    State(state): State<GatewayState>,
    _caller: Caller,
) -> Json<SessionSnapshot> {
    Json(state.console.session().snapshot())
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub state: SessionState,
}

pub async fn connect_session(
    State(state): State<GatewayState>,
    caller: Caller,
) -> ApiResult<Json<ConnectResponse>> {
    let session_state = state.console.connect_session(&caller.principal).await?;
    Ok(Json(ConnectResponse {
        state: session_state,
    }))
}

pub async fn disconnect_session(
    State(state): State<GatewayState>,
    caller: Caller,
) -> ApiResult<StatusCode> {
    state.console.disconnect_session(&caller.principal).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn session_credential(
    State(state): State<GatewayState>,
    caller: Caller,
) -> ApiResult<Json<CredentialPayload>> {
    Ok(Json(
        state.console.session_credential(&caller.principal).await?,
    ))
}

// ── settings ───────────────────────────────────────────

pub async fn get_settings(
    State(state): State<GatewayState>,
    caller: Caller,
) -> ApiResult<Json<ConsoleSettings>> {
    caller.principal.require(Capability::ManageSettings)?;
    Ok(Json(state.console.settings()))
}

pub async fn update_settings(
    State(state): State<GatewayState>,
    caller: Caller,
    Json(settings): Json<ConsoleSettings>,
) -> ApiResult<Json<ConsoleSettings>> {
    Ok(Json(
        state
            .console
            .update_settings(&caller.principal, settings)?,
    ))
}
