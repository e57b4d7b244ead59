use crate::api::upload::models::UploadTask;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use std::collections::HashSet;

/// 单个文件的格式与大小校验，通过时返回 `None`。
pub fn validate_photo(task: &UploadTask, config: &UploadConfig) -> Option<String> {
    if !config.is_mime_allowed(&task.mime_type) {
        return Some("Only image files allowed (JPG, PNG, GIF, WebP)".to_string());
    }
    if task.size > config.max_file_size_bytes {
        return Some(format!(
            "File size exceeds {}MB limit",
            config.max_file_size_bytes / (1024 * 1024)
        ));
    }
    None
}

pub fn validate_photo_count(count: usize, config: &UploadConfig) -> Option<String> {
    if count == 0 {
        return Some("No photos selected".to_string());
    }
    if count > config.max_photos_per_session {
        return Some(format!(
            "Maximum {} photos per upload",
            config.max_photos_per_session
        ));
    }
    None
}

/// 在任何网络请求之前校验整批选择，汇总所有问题一次性返回。
pub fn validate_selection(tasks: &[UploadTask], config: &UploadConfig) -> Result<()> {
    if let Some(message) = validate_photo_count(tasks.len(), config) {
        return Err(UploadError::Validation(message));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = tasks.iter().find(|task| !seen.insert(task.id.as_str())) {
        return Err(UploadError::Validation(format!(
            "duplicate task id {} in selection",
            dup.id
        )));
    }
    let problems: Vec<String> = tasks
        .iter()
        .filter_map(|task| {
            validate_photo(task, config).map(|message| format!("{}: {message}", task.file_name))
        })
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(UploadError::Validation(problems.join("; ")))
    }
}
