//! Source MIME types and the MIME→entity lookup.

use crate::models::Entity;

pub const GOOGLE_DOCUMENT: &str = "application/vnd.google-apps.document";
pub const GOOGLE_SPREADSHEET: &str = "application/vnd.google-apps.spreadsheet";
pub const GOOGLE_PRESENTATION: &str = "application/vnd.google-apps.presentation";
pub const GOOGLE_FOLDER: &str = "application/vnd.google-apps.folder";

/// Whether documents of this MIME type get full-text extraction.
pub fn is_text_document(mime_type: &str) -> bool {
    mime_type == GOOGLE_DOCUMENT
}

/// Map a MIME type to its record entity. Unmapped types fall back to
/// [`Entity::DriveFile`].
pub fn entity_for_mime(mime_type: &str) -> Entity {
    match mime_type {
        GOOGLE_DOCUMENT => Entity::Docs,
        GOOGLE_SPREADSHEET => Entity::Sheets,
        GOOGLE_PRESENTATION => Entity::Slides,
        GOOGLE_FOLDER => Entity::Folder,
        _ => Entity::DriveFile,
    }
}
