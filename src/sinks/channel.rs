use tokio::sync::mpsc;

use crate::probe::ProbeData;

use super::ResultSink;

pub type ResultReceiver = mpsc::UnboundedReceiver<ProbeData>;

/// Fire-and-forget handle used by probe workers to emit results.
#[derive(Debug, Clone)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<ProbeData>,
}

#[must_use]
pub fn result_channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultSender { tx }, rx)
}

impl ResultSender {
    pub fn emit(&self, data: ProbeData) {
        if let Err(err) = self.tx.send(data) {
            tracing::warn!(
                "Result sink closed; dropping record for probe {}",
                err.0.probe_id
            );
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drains `rx` into `sink` until every sender is dropped. Delivery failures
/// are logged and the record is dropped. Returns the number delivered.
pub async fn forward_results<S>(mut rx: ResultReceiver, mut sink: S) -> u64
where
    S: ResultSink,
{
    let mut delivered: u64 = 0;
    while let Some(data) = rx.recv().await {
        match sink.deliver(&data).await {
            Ok(()) => delivered = delivered.saturating_add(1),
            Err(err) => tracing::warn!(
                "Failed to deliver result {} for probe {}: {}",
                data.id,
                data.probe_id,
                err
            ),
        }
    }
    if let Err(err) = sink.flush().await {
        tracing::warn!("Failed to flush result sink: {}", err);
    }
    tracing::debug!("Result forwarder finished after {} records", delivered);
    delivered
}
