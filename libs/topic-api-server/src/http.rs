use std::io;

use axum::body::{Body, Bytes};
use axum::extract::{Form, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use lens_api::{ConsumedMessage, MetadataResponse};
use topic_engine::{read_range, SearchSession};

use crate::range::{parse_offset_range, parse_partition};
use crate::{ApiError, AppState};

// ═══════════════════════════════════════════════════════════════
//  GET /topics?topic=a&topic=b
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_metadata(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<MetadataResponse>, ApiError> {
    let topics: Vec<String> = params
        .into_iter()
        .filter(|(k, _)| k == "topic")
        .map(|(_, v)| v)
        .collect();
    Ok(Json(state.metadata.response(&topics).await?))
}

// ═══════════════════════════════════════════════════════════════
//  GET /topics/{topic}/{partition}/{offsetRange}
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_range(
    State(state): State<AppState>,
    Path((topic, partition, range)): Path<(String, String, String)>,
) -> Result<Json<Vec<ConsumedMessage>>, ApiError> {
    let partition = parse_partition(&partition)?;
    let (start, count) = parse_offset_range(&range)?;

    let records = read_range(
        &*state.cluster,
        &topic,
        partition,
        start,
        count,
        state.range.fetch_timeout(),
    )
    .await?;

    Ok(Json(records.into_iter().map(ConsumedMessage::from).collect()))
}

// ═══════════════════════════════════════════════════════════════
//  GET /topics/{topic}/{keyword}
// ═══════════════════════════════════════════════════════════════

/// Streams matches as newline-delimited JSON while partitions are read.
///
/// The session lives inside the body stream; a client that disconnects
/// drops it and with it every partition task. Gateway shutdown cancels
/// the session, which ends the stream.
pub(crate) async fn handle_search(
    State(state): State<AppState>,
    Path((topic, keyword)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let session = state
        .search
        .search(&topic, &keyword, state.shutdown.child_token())
        .await?;

    let body = futures_util::stream::unfold(Some(session), next_line);
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn next_line(
    session: Option<SearchSession>,
) -> Option<(Result<Bytes, io::Error>, Option<SearchSession>)> {
    let mut session = session?;
    match session.next_match().await {
        Some(hit) => match serde_json::to_vec(&hit) {
            Ok(mut line) => {
                line.push(b'\n');
                Some((Ok(Bytes::from(line)), Some(session)))
            }
            Err(e) => {
                tracing::error!(topic = %session.topic(), error = %e, "encoding match failed");
                Some((Err(io::Error::other(e)), None))
            }
        },
        None => {
            let report = session.finish().await;
            for (partition, error) in report.failures() {
                tracing::warn!(topic = %report.topic, partition, error, "search incomplete");
            }
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  POST /topics/{topic}
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub(crate) struct PublishForm {
    data: String,
    #[serde(default)]
    key: Option<String>,
}

pub(crate) async fn handle_publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Form(form): Form<PublishForm>,
) -> Result<StatusCode, ApiError> {
    let key = form.key.filter(|k| !k.is_empty()).map(String::into_bytes);
    let delivery = state
        .cluster
        .publish(&topic, key, form.data.into_bytes())
        .await?;
    tracing::debug!(
        topic = %topic,
        partition = delivery.partition,
        offset = delivery.offset,
        "published"
    );
    Ok(StatusCode::NO_CONTENT)
}
