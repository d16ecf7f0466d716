//! 运行时错误类型
//!
//! 可恢复错误以 `Result` 形式暴露给调用方；
//! 编程错误（协程上下文之外让出、监视器析构时仍有等待者等）直接断言

use std::fmt;

/// Channel 已关闭且缓冲区已排空
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel is closed")
    }
}

impl std::error::Error for ChannelClosed {}

/// 向已关闭的 Channel 发送失败，原值随错误返回
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// 取回未能发送的值
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sending on a closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// 非阻塞发送失败
pub enum TrySendError<T> {
    /// 缓冲区已满
    Full(T),
    /// Channel 已关闭
    Closed(T),
}

impl<T> TrySendError<T> {
    /// 取回未能发送的值
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "TrySendError::Full(..)"),
            TrySendError::Closed(_) => write!(f, "TrySendError::Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel buffer is full"),
            TrySendError::Closed(_) => write!(f, "sending on a closed channel"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// 非阻塞接收失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// 缓冲区为空
    Empty,
    /// Channel 已关闭且缓冲区已排空
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "channel buffer is empty"),
            TryRecvError::Closed => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for TryRecvError {}

/// 调度器已关闭，不再接受新协程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuttingDown;

impl fmt::Display for ShuttingDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduler is shutting down")
    }
}

impl std::error::Error for ShuttingDown {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ChannelClosed.to_string(), "channel is closed");
        assert_eq!(SendError(42).to_string(), "sending on a closed channel");
        assert_eq!(ShuttingDown.to_string(), "scheduler is shutting down");
        assert_eq!(TryRecvError::Empty.to_string(), "channel buffer is empty");
    }

    #[test]
    fn test_send_error_into_inner() {
        let err = SendError("payload");
        assert_eq!(err.into_inner(), "payload");

        let err = TrySendError::Full(7);
        assert_eq!(err.into_inner(), 7);
    }
}
