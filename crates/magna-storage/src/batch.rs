//! Write batch for atomic operations.

/// Kind of batch operation.
#[derive(Debug, Clone)]
pub(crate) enum OperationKind {
    /// Put a key-value pair.
    Put { value: Vec<u8> },
    /// Delete a key.
    Delete,
}

/// A single batch operation.
#[derive(Debug, Clone)]
pub(crate) struct BatchOperation {
    pub(crate) key: Vec<u8>,
    pub(crate) kind: OperationKind,
}

/// A batch of writes and erases applied atomically.
///
/// The batch tracks a running byte estimate so callers can flush partial
/// batches once a configured size is exceeded.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) operations: Vec<BatchOperation>,
    size_estimate: usize,
}

/// Per-record overhead of a put in the backend's log format.
const PUT_OVERHEAD: usize = 12;
/// Per-record overhead of a delete.
const DELETE_OVERHEAD: usize = 8;

impl WriteBatch {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            operations: Vec::with_capacity(capacity),
            size_estimate: 0,
        }
    }

    /// Add a put operation to the batch.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        self.size_estimate += PUT_OVERHEAD + key.len() + value.len();
        self.operations.push(BatchOperation {
            key,
            kind: OperationKind::Put { value },
        });
    }

    /// Add a delete operation to the batch.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        let key = key.into();
        self.size_estimate += DELETE_OVERHEAD + key.len();
        self.operations.push(BatchOperation {
            key,
            kind: OperationKind::Delete,
        });
    }

    /// Running estimate of the batch's serialized size in bytes.
    pub fn size_estimate(&self) -> usize {
        self.size_estimate
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Drop all operations, keeping allocations.
    pub fn clear(&mut self) {
        self.operations.clear();
        self.size_estimate = 0;
    }
}
