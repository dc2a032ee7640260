//! Registry of running operations and their cancellation tokens.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tracks running backup operations and cancels them on request.
#[derive(Clone, Default)]
pub struct OperationTracker {
    operations: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation. Returns the token the operation should observe.
    pub async fn register(&self, operation_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        let mut operations = self.operations.write().await;
        operations.insert(operation_id, token.clone());
        token
    }

    pub async fn cancel(&self, operation_id: &Uuid) -> bool {
        let operations = self.operations.read().await;
        match operations.get(operation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked operation. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let operations = self.operations.read().await;
        for token in operations.values() {
            token.cancel();
        }
        operations.len()
    }

    /// Stop tracking an operation that has finished.
    pub async fn complete(&self, operation_id: &Uuid) {
        let mut operations = self.operations.write().await;
        operations.remove(operation_id);
    }

    pub async fn running_count(&self) -> usize {
        self.operations.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_cancel_complete() {
        let tracker = OperationTracker::new();
        let id = Uuid::new_v4();

        let token = tracker.register(id).await;
        assert_eq!(tracker.running_count().await, 1);
        assert!(!token.is_cancelled());

        assert!(tracker.cancel(&id).await);
        assert!(token.is_cancelled());

        tracker.complete(&id).await;
        assert_eq!(tracker.running_count().await, 0);
        assert!(!tracker.cancel(&id).await);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let tracker = OperationTracker::new();
        let a = tracker.register(Uuid::new_v4()).await;
        let b = tracker.register(Uuid::new_v4()).await;

        assert_eq!(tracker.cancel_all().await, 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
