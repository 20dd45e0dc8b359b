//! 按服务器并发执行，收集 (身份, 结果)
//!
//! 所有任务完成 (或各自超时) 后才返回；结果顺序与输入一致。

use crate::server::ServerIdentity;
use crate::{Result, RplError};
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;

/// 对每个目标并发执行 `task`
pub async fn fan_out<I, T, F, Fut>(
    targets: impl IntoIterator<Item = (ServerIdentity, I)>,
    timeout: Option<Duration>,
    task: F,
) -> Vec<(ServerIdentity, Result<T>)>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let futures = targets.into_iter().map(|(identity, item)| {
        let fut = task(item);
        async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(RplError::TimeoutError(format!(
                        "[{}] operation timed out after {:?}",
                        identity, limit
                    ))),
                },
                None => fut.await,
            };
            (identity, result)
        }
    });
    join_all(futures).await
}

/// 拆分成功与失败，失败项记录警告
pub fn partition_results<T>(results: Vec<(ServerIdentity, Result<T>)>) -> (Vec<(ServerIdentity, T)>, Vec<(ServerIdentity, RplError)>) {
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    for (identity, result) in results {
        match result {
            Ok(value) => ok.push((identity, value)),
            Err(e) => {
                log::warn!("[{}] {}", identity, e);
                failed.push((identity, e));
            }
        }
    }
    (ok, failed)
}
