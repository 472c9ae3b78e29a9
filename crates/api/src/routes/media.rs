//! Media uploads stored on local disk

use std::path::{Path as FsPath, PathBuf};

use axum::{
    extract::{Extension, Multipart, Path, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::MessageResponse;
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const FILE_FIELD: &str = "file";
const DEFAULT_MIME: &str = "application/octet-stream";
const NAME_MAX_CHARS: usize = 255;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MediaFile {
    pub id: Uuid,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(skip_serializing)]
    pub storage_path: String,
    pub uploaded_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub const MEDIA_COLUMNS: &str =
    "id, original_name, mime_type, size_bytes, storage_path, uploaded_by, created_at";

pub async fn fetch_media(pool: &sqlx::PgPool, media_id: Uuid) -> ApiResult<MediaFile> {
    sqlx::query_as::<_, MediaFile>(&format!(
        "SELECT {} FROM media_files WHERE id = $1",
        MEDIA_COLUMNS
    ))
    .bind(media_id)
    .fetch_optional(pool)
    .await?
    .ok_or(ApiError::NotFound)
}

/// Strip any client-side directory and cap the length
fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let name: String = base
        .chars()
        .filter(|c| !c.is_control())
        .take(NAME_MAX_CHARS)
        .collect();
    if name.is_empty() {
        "file".to_string()
    } else {
        name
    }
}

fn storage_path(media_dir: &str, media_id: Uuid) -> PathBuf {
    FsPath::new(media_dir).join(media_id.to_string())
}

struct Upload {
    file_name: String,
    mime_type: String,
    bytes: Vec<u8>,
}

async fn read_upload(multipart: &mut Multipart, max_bytes: usize) -> ApiResult<Upload> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = sanitize_file_name(field.file_name().unwrap_or_default());
        let mime_type = field
            .content_type()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_MIME)
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;

        if bytes.is_empty() {
            return Err(ApiError::Validation("Uploaded file is empty".into()));
        }
        if bytes.len() > max_bytes {
            return Err(ApiError::Validation(format!(
                "File exceeds the {} byte limit",
                max_bytes
            )));
        }

        return Ok(Upload {
            file_name,
            mime_type,
            bytes: bytes.to_vec(),
        });
    }

    Err(ApiError::Validation(format!(
        "Multipart field '{}' is required",
        FILE_FIELD
    )))
}

// =============================================================================
// Handlers
// =============================================================================

/// Upload a file (multipart field `file`)
pub async fn upload(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> ApiResult<Json<MediaFile>> {
    let upload = read_upload(&mut multipart, state.config.media_max_bytes).await?;

    let media_id = Uuid::new_v4();
    let path = storage_path(&state.config.media_dir, media_id);

    tokio::fs::create_dir_all(&state.config.media_dir)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, dir = %state.config.media_dir, "Failed to create media directory");
            ApiError::Internal
        })?;
    tokio::fs::write(&path, &upload.bytes).await.map_err(|e| {
        tracing::error!(error = %e, path = %path.display(), "Failed to write media file");
        ApiError::Internal
    })?;

    let stored = sqlx::query_as::<_, MediaFile>(&format!(
        r#"
        INSERT INTO media_files (id, original_name, mime_type, size_bytes, storage_path, uploaded_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        MEDIA_COLUMNS
    ))
    .bind(media_id)
    .bind(&upload.file_name)
    .bind(&upload.mime_type)
    .bind(upload.bytes.len() as i64)
    .bind(path.to_string_lossy().as_ref())
    .bind(auth_user.user_id)
    .fetch_one(&state.pool)
    .await;

    let media = match stored {
        Ok(media) => media,
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }
    };

    tracing::info!(
        media_id = %media.id,
        size = media.size_bytes,
        mime = %media.mime_type,
        "Media uploaded"
    );
    Ok(Json(media))
}

pub async fn get_media(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(media_id): Path<Uuid>,
) -> ApiResult<Json<MediaFile>> {
    Ok(Json(fetch_media(&state.pool, media_id).await?))
}

/// Stream the stored bytes back with the original content type
pub async fn download(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Path(media_id): Path<Uuid>,
) -> ApiResult<Response> {
    let media = fetch_media(&state.pool, media_id).await?;

    let bytes = tokio::fs::read(&media.storage_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            tracing::warn!(media_id = %media.id, "Media row has no file on disk");
            ApiError::NotFound
        } else {
            tracing::error!(error = %e, media_id = %media.id, "Failed to read media file");
            ApiError::Internal
        }
    })?;

    let content_type = HeaderValue::from_str(&media.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("private, max-age=3600"),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Uploader or supervisor only
pub async fn delete_media(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(media_id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    let media = fetch_media(&state.pool, media_id).await?;
    if media.uploaded_by != Some(auth_user.user_id) {
        auth_user.require_supervisor()?;
    }

    sqlx::query("DELETE FROM media_files WHERE id = $1")
        .bind(media_id)
        .execute(&state.pool)
        .await?;

    if let Err(e) = tokio::fs::remove_file(&media.storage_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, media_id = %media_id, "Failed to remove media file");
        }
    }

    Ok(Json(MessageResponse::new("Media deleted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\op\\договор.pdf"), "договор.pdf");
        assert_eq!(sanitize_file_name("dir/"), "file");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(&"a".repeat(400)).len(), NAME_MAX_CHARS);
    }

    #[test]
    fn test_storage_path_uses_media_id() {
        let id = Uuid::new_v4();
        let path = storage_path("/var/lib/linedesk/media", id);
        assert_eq!(path, PathBuf::from(format!("/var/lib/linedesk/media/{}", id)));
    }

    #[test]
    fn test_storage_path_hidden_from_json() {
        let media = MediaFile {
            id: Uuid::new_v4(),
            original_name: "price.pdf".into(),
            mime_type: "application/pdf".into(),
            size_bytes: 1024,
            storage_path: "/secret/path".into(),
            uploaded_by: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&media).unwrap();
        assert!(json.get("storage_path").is_none());
        assert_eq!(json["mime_type"], "application/pdf");
    }
}
