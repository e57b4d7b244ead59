use crate::api::upload::storage::ObjectStorage;
use crate::error::{Result, UploadError};
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::sync::Arc;

/// 文件中的一个分片：第 `index` 片覆盖 `[offset, offset + len)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

pub fn part_count(size: u64, part_size: u64) -> usize {
    if part_size == 0 {
        return 0;
    }
    size.div_ceil(part_size) as usize
}

/// 按固定分片大小切分，最后一片可以更短。
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartPlan> {
    (0..part_count(size, part_size))
        .map(|index| {
            let offset = index as u64 * part_size;
            PartPlan {
                index,
                offset,
                len: part_size.min(size - offset),
            }
        })
        .collect()
}

/// 第 `done` 片完成后的整体进度，四舍五入到整数。
pub fn part_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as f64 / total as f64) * 100.0).round() as u8
}

/// 把内容按分片 PUT 到对应的预签名地址，同时在途的分片不超过 `concurrency`。
/// 每完成一片回调一次 (已完成片数, 总片数)；任一分片失败即整体失败。
pub async fn upload_parts<F>(
    storage: Arc<dyn ObjectStorage>,
    part_urls: &[String],
    body: Bytes,
    content_type: &str,
    part_size: u64,
    concurrency: usize,
    mut on_part: F,
) -> Result<()>
where
    F: FnMut(usize, usize),
{
    let plans = plan_parts(body.len() as u64, part_size);
    if plans.len() != part_urls.len() {
        return Err(UploadError::InvalidDescriptor(format!(
            "backend issued {} part urls for {} parts",
            part_urls.len(),
            plans.len()
        )));
    }

    let total = plans.len();
    let mut uploads = stream::iter(plans.into_iter().zip(part_urls.iter().cloned()))
        .map(|(plan, url)| {
            let storage = storage.clone();
            let chunk = body.slice(plan.offset as usize..(plan.offset + plan.len) as usize);
            let content_type = content_type.to_string();
            async move {
                storage
                    .put_object(&url, &content_type, chunk, None)
                    .await
                    .map(|_| plan.index)
            }
        })
        .buffer_unordered(concurrency.max(1));

    let mut done = 0;
    while let Some(result) = uploads.next().await {
        let index = result?;
        done += 1;
        tracing::trace!(part = index + 1, done, total, "part uploaded");
        on_part(done, total);
    }
    Ok(())
}
