//! Represents an uploaded (or still pending) file and the rules that keep its
//! derived columns consistent.

use crate::formatting::{
    DOWNLOAD_ID_LEN, KEYNAME_ID_LEN, file_extension, humanize_filesize, normalize_filename,
};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, types::Json};
use uuid::Uuid;

/// Column list shared by every `SELECT` / `RETURNING` on `objects`.
pub const OBJECT_COLUMNS: &str = "id, bucket_id, added_by, source, keyname, downloadable_filename, \
     filename, file_extension, uploaded_width, uploaded_height, uploaded_size, display_size, \
     uploaded_type, is_image_file, is_video_file, is_audio_file, uploaded_metadata, \
     uploaded_duration, uploaded, uploaded_at, errors, errors_at, created_at, updated_at";

/// Who put the object into the bucket.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ObjectSource {
    User,
    Bot,
}

/// Where an object sits in its upload lifecycle.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    Pending,
    Uploaded,
    Errored,
}

/// A single file within a bucket.
///
/// The row is created when an upload is announced and updated once more when
/// the upload finishes. Derived columns are recomputed by [`Object::prepare_save`]
/// before every write.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    pub id: Uuid,

    /// Owning bucket.
    pub bucket_id: Uuid,

    /// Uploader; kept nullable so removing a user never removes their files.
    pub added_by: Option<Uuid>,

    pub source: ObjectSource,

    /// Slugified filename + short id, used as the last storage key segment.
    pub keyname: Option<String>,

    /// Slugified filename + longer id, offered to downloaders.
    pub downloadable_filename: Option<String>,

    /// Filename as supplied by the uploader.
    pub filename: Option<String>,

    /// Extension of `filename`, without the dot.
    pub file_extension: Option<String>,

    pub uploaded_width: Option<i64>,

    pub uploaded_height: Option<i64>,

    /// Size in bytes.
    pub uploaded_size: Option<i64>,

    pub display_size: Option<String>,

    /// MIME type reported at completion.
    pub uploaded_type: Option<String>,

    pub is_image_file: bool,

    pub is_video_file: bool,

    pub is_audio_file: bool,

    /// Raw metadata reported at completion.
    pub uploaded_metadata: Option<Json<Value>>,

    /// Media duration in seconds.
    pub uploaded_duration: Option<f64>,

    pub uploaded: bool,

    pub uploaded_at: Option<DateTime<Utc>>,

    pub errors: Option<Json<Value>>,

    pub errors_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// File facts reported by whoever performed the upload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FileMetadata {
    pub size: Option<i64>,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Object {
    /// A pending object as created at upload-intent time.
    pub fn pending(
        bucket_id: Uuid,
        filename: &str,
        added_by: Option<Uuid>,
        source: ObjectSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bucket_id,
            added_by,
            source,
            keyname: None,
            downloadable_filename: None,
            filename: Some(filename.to_string()),
            file_extension: None,
            uploaded_width: None,
            uploaded_height: None,
            uploaded_size: None,
            display_size: None,
            uploaded_type: None,
            is_image_file: false,
            is_video_file: false,
            is_audio_file: false,
            uploaded_metadata: None,
            uploaded_duration: None,
            uploaded: false,
            uploaded_at: None,
            errors: None,
            errors_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute derived columns ahead of a write.
    ///
    /// Names and first-time timestamps are only ever filled in, never replaced.
    /// Media flags follow the MIME type whenever one is present.
    pub fn prepare_save(&mut self, now: DateTime<Utc>) {
        if let Some(filename) = self.filename.as_deref().filter(|f| !f.is_empty()) {
            let id = self.id.to_string();
            if self.keyname.is_none() {
                self.keyname = normalize_filename(Some(filename), Some(&id), KEYNAME_ID_LEN);
            }
            if self.file_extension.is_none() {
                self.file_extension = file_extension(filename);
            }
            if self.downloadable_filename.is_none() {
                self.downloadable_filename =
                    normalize_filename(Some(filename), Some(&id), DOWNLOAD_ID_LEN);
            }
        }

        if self.uploaded && self.uploaded_at.is_none() {
            self.uploaded_at = Some(now);
        }
        if self.has_errors() && self.errors_at.is_none() {
            self.errors_at = Some(now);
        }

        if let Some(mime) = self.uploaded_type.as_deref() {
            self.is_image_file = mime.starts_with("image/");
            self.is_video_file = mime.starts_with("video/");
            self.is_audio_file = mime.starts_with("audio/");
        }
        if self.display_size.is_none() {
            self.display_size = self.uploaded_size.map(humanize_filesize);
        }
        self.updated_at = now;
    }

    /// Copy reported file facts onto the row.
    pub fn apply_file_metadata(&mut self, metadata: FileMetadata) {
        self.uploaded_size = metadata.size;
        self.uploaded_type = metadata.content_type.clone().filter(|t| !t.is_empty());
        self.uploaded_duration = metadata.duration;
        self.uploaded_width = metadata.width;
        self.uploaded_height = metadata.height;
        self.uploaded_metadata = serde_json::to_value(&metadata).ok().map(Json);
    }

    pub fn has_errors(&self) -> bool {
        self.errors
            .as_ref()
            .map(|Json(value)| !is_empty_payload(value))
            .unwrap_or(false)
    }

    pub fn state(&self) -> ObjectState {
        if self.uploaded {
            ObjectState::Uploaded
        } else if self.has_errors() {
            ObjectState::Errored
        } else {
            ObjectState::Pending
        }
    }

    /// Date-sharded folder derived from the creation time, e.g. `2025/3/4`.
    pub fn date_prefix(&self) -> String {
        format!(
            "{}/{}/{}",
            self.created_at.year(),
            self.created_at.month(),
            self.created_at.day()
        )
    }

    /// Full storage key, available once a keyname has been derived.
    pub fn storage_key(&self) -> Option<String> {
        self.keyname
            .as_ref()
            .map(|keyname| format!("{}/{}", self.date_prefix(), keyname))
    }
}

/// Whether an error payload carries nothing worth recording.
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}
