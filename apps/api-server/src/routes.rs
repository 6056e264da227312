use crate::error::ApiError;
use ai::{ImageCaptionModel, DEFAULT_MAX_NEW_TOKENS};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// multipart field holding the uploaded image
pub const IMAGE_FIELD: &str = "img";

#[derive(Clone)]
pub struct AppState {
    pub image_caption: ImageCaptionModel,
}

#[derive(Debug, Deserialize)]
pub struct CaptionQuery {
    pub prompt: String,
    pub max_new_tokens: Option<usize>,
}

pub fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/", get(caption_image).post(caption_image))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer({
            let cors = CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any);
            cors
        })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn caption_image(
    State(state): State<AppState>,
    Query(query): Query<CaptionQuery>,
    mut multipart: Multipart,
) -> Result<String, ApiError> {
    let max_new_tokens = query.max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
    if max_new_tokens == 0 {
        return Err(ApiError::BadRequest(
            "max_new_tokens must be a positive integer".to_string(),
        ));
    }

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let name = field.file_name().unwrap_or(IMAGE_FIELD).to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        upload = Some((name, bytes));
        break;
    }
    let Some((name, bytes)) = upload else {
        return Err(ApiError::BadRequest(format!(
            "missing multipart field `{}`",
            IMAGE_FIELD
        )));
    };
    tracing::debug!("received {} ({} bytes)", name, bytes.len());

    let image = tokio::task::spawn_blocking(move || captioning::decode_image_bytes(name, &bytes))
        .await
        .map_err(captioning::CaptionError::from)??;

    let text = captioning::caption(
        &state.image_caption,
        image,
        query.prompt,
        max_new_tokens,
    )
    .await?;

    Ok(text)
}
