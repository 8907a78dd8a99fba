use crate::{
    error::{AppError, Result},
    models::bookmark::NewBookmark,
};
use url::Url;
use validator::Validate;

pub const MISSING_FIELDS: &str = "Both URL and title are required";
pub const INVALID_URL: &str = "Please enter a valid URL (e.g., https://example.com)";

/// 校验新书签输入，返回去除首尾空白后的值
pub fn validate_bookmark_input(url: &str, title: &str) -> Result<NewBookmark> {
    let url = url.trim();
    let title = title.trim();

    if url.is_empty() || title.is_empty() {
        return Err(AppError::Validation(MISSING_FIELDS.to_string()));
    }

    validate_absolute_url(url)?;

    let bookmark = NewBookmark {
        url: url.to_string(),
        title: title.to_string(),
    };
    bookmark.validate()?;

    Ok(bookmark)
}

/// 只接受带协议的绝对地址
pub fn validate_absolute_url(url: &str) -> Result<()> {
    match Url::parse(url) {
        Ok(parsed) if !parsed.cannot_be_a_base() => Ok(()),
        _ => Err(AppError::Validation(INVALID_URL.to_string())),
    }
}
