use crate::db::Database;

const CONCURRENCY_KEY: &str = "upload_max_concurrency";
pub const MIN_UPLOAD_CONCURRENCY: usize = 1;
pub const MAX_UPLOAD_CONCURRENCY: usize = 20;
const DEFAULT_UPLOAD_CONCURRENCY: usize = 10;

/// 从设置表读取并行上传数；缺失时返回默认值，错误时透传。
pub fn get_upload_concurrency(db: &Database) -> Result<usize, String> {
    if let Some(value) = db.get_setting(CONCURRENCY_KEY)? {
        return parse_and_clamp(&value);
    }
    Ok(DEFAULT_UPLOAD_CONCURRENCY)
}

/// 写入并行上传数，越界时收敛到 [MIN, MAX]，返回实际生效的值。
pub fn set_upload_concurrency(db: &Database, value: usize) -> Result<usize, String> {
    let clamped = clamp_upload_concurrency(value);
    db.set_setting(CONCURRENCY_KEY, &clamped.to_string())?;
    Ok(clamped)
}

pub fn default_upload_concurrency() -> usize {
    DEFAULT_UPLOAD_CONCURRENCY
}

pub fn clamp_upload_concurrency(value: usize) -> usize {
    value.clamp(MIN_UPLOAD_CONCURRENCY, MAX_UPLOAD_CONCURRENCY)
}

fn parse_and_clamp(raw: &str) -> Result<usize, String> {
    let parsed = raw
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("invalid upload concurrency value: {e}"))?;
    Ok(clamp_upload_concurrency(parsed))
}
