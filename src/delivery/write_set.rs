use super::DeliveryError;
use crate::record::Record;
use crate::store::WriteOp;
use bytes::Bytes;

/// Turn a batch into the operations of one atomic transaction.
///
/// Per record at index `i`: the JSON value under
/// `L:{origin}:{timestamp:.6}:{i}`, a time reference `T:{timestamp:.6}:{i}`
/// pointing at it, and `I:{id}` when the record carries an assigned id.
/// The index keeps keys unique inside a batch even when timestamps collide.
pub fn build_write_set<T: Record>(batch: &[T]) -> Result<Vec<WriteOp>, DeliveryError> {
    let mut ops = Vec::with_capacity(batch.len() * 3);

    for (i, record) in batch.iter().enumerate() {
        let ts = record.timestamp();
        let key = Bytes::from(format!("L:{}:{:.6}:{}", record.origin(), ts, i));
        let value = serde_json::to_vec(record).map_err(|e| DeliveryError::Encode(e.to_string()))?;

        ops.push(WriteOp::Set {
            key: key.clone(),
            value: Bytes::from(value),
        });
        ops.push(WriteOp::Reference {
            key: Bytes::from(format!("T:{:.6}:{}", ts, i)),
            referenced_key: key.clone(),
        });
        if let Some(id) = record.assigned_id() {
            ops.push(WriteOp::Reference {
                key: Bytes::from(format!("I:{}", id)),
                referenced_key: key,
            });
        }
    }

    Ok(ops)
}
