//! 通知合并
//!
//! watch 每次触发只表示"有变化，请重新读取"，因此消费方只关心最新的一条：
//! 阻塞等待第一条通知，然后非阻塞地取走队列中已有的全部通知，只返回最后一条。

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// 阻塞直到至少有一条通知，随后清空队列并返回最新值
///
/// 返回 `None` 表示队列已关闭（所有发送端都已释放）且没有剩余通知，
/// 消费循环应当退出。
pub async fn most_recent<T>(rx: &mut UnboundedReceiver<T>) -> Option<T> {
    let mut latest = rx.recv().await?;
    loop {
        match rx.try_recv() {
            Ok(value) => latest = value,
            // 关闭状态留给下一次调用报告
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    Some(latest)
}
