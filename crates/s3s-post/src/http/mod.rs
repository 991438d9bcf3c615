mod multipart;
pub use self::multipart::*;

/// Extracts the boundary of a `multipart/form-data` content type.
///
/// Returns `None` for any other media type or when the boundary is missing.
#[must_use]
pub fn form_data_boundary(content_type: &str) -> Option<String> {
    let mime: mime::Mime = content_type.parse().ok()?;
    if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
        return None;
    }
    let boundary = mime.get_param(mime::BOUNDARY)?;
    Some(boundary.as_str().to_owned())
}
