//! Fan-in of per-client inbound channels into one stream.
//!
//! Every source gets a forwarding task. The merged output closes once all forwarders have
//! returned. Tearing a merge down hands back the sources that are still open, with any
//! unread messages left in them, so a rebuilt merge loses nothing.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use jb_core::Message;

/// A client's inbound receiver tagged with the client name.
pub struct NamedStream {
    pub name: String,
    pub rx: mpsc::Receiver<Message>,
}

impl NamedStream {
    pub fn new(name: impl Into<String>, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            name: name.into(),
            rx,
        }
    }
}

pub struct Merge {
    pub output: mpsc::Receiver<Message>,
    forwarders: Vec<JoinHandle<Option<NamedStream>>>,
    stop: CancellationToken,
}

pub fn merge_streams(sources: Vec<NamedStream>, capacity: usize) -> Merge {
    let (tx, output) = mpsc::channel(capacity.max(1));
    let stop = CancellationToken::new();
    let forwarders = sources
        .into_iter()
        .map(|source| tokio::spawn(forward(source, tx.clone(), stop.clone())))
        .collect();
    Merge {
        output,
        forwarders,
        stop,
    }
}

impl Merge {
    /// Stops the forwarders and returns the messages already merged but unread, followed by
    /// the sources that are still open.
    pub async fn teardown(mut self) -> (Vec<Message>, Vec<NamedStream>) {
        self.stop.cancel();

        let mut pending = Vec::new();
        while let Some(message) = self.output.recv().await {
            pending.push(message);
        }

        let mut recovered = Vec::with_capacity(self.forwarders.len());
        for handle in self.forwarders {
            match handle.await {
                Ok(Some(source)) => recovered.push(source),
                Ok(None) => {}
                Err(err) => error!(error = %err, "Fan-in forwarder failed"),
            }
        }
        (pending, recovered)
    }
}

async fn forward(
    mut source: NamedStream,
    out: mpsc::Sender<Message>,
    stop: CancellationToken,
) -> Option<NamedStream> {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => return Some(source),
            next = source.rx.recv() => next,
        };
        match next {
            Some(message) => {
                if out.send(message).await.is_err() {
                    return Some(source);
                }
            }
            None => {
                debug!(client = %source.name, "Inbound stream closed");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn numbered(source: usize, seq: usize) -> Message {
        Message {
            id: format!("{source}-{seq}"),
            from: format!("user{source}@example.com"),
            body: format!("{seq}"),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn merged_output_sees_every_message_once_then_closes() {
        const SOURCES: usize = 4;
        const PER_SOURCE: usize = 250;

        let mut streams = Vec::new();
        let mut producers = Vec::new();
        for source in 0..SOURCES {
            let (tx, rx) = mpsc::channel(8);
            streams.push(NamedStream::new(format!("c{source}"), rx));
            producers.push(tokio::spawn(async move {
                for seq in 0..PER_SOURCE {
                    tx.send(numbered(source, seq)).await.unwrap();
                }
            }));
        }

        let mut merge = merge_streams(streams, 4);
        let mut seen = BTreeSet::new();
        let mut last_seq = vec![None::<usize>; SOURCES];
        while let Some(message) = merge.output.recv().await {
            assert!(seen.insert(message.id.clone()), "duplicate {}", message.id);
            let (source, seq) = message.id.split_once('-').unwrap();
            let (source, seq): (usize, usize) = (source.parse().unwrap(), seq.parse().unwrap());
            if let Some(prev) = last_seq[source] {
                assert!(seq > prev, "source {source} reordered");
            }
            last_seq[source] = Some(seq);
        }
        for producer in producers {
            producer.await.unwrap();
        }
        assert_eq!(seen.len(), SOURCES * PER_SOURCE);
    }

    #[tokio::test]
    async fn empty_merge_closes_immediately() {
        let mut merge = merge_streams(Vec::new(), 4);
        assert!(merge.output.recv().await.is_none());
    }

    #[tokio::test]
    async fn teardown_recovers_open_sources_without_loss() {
        let (tx, rx) = mpsc::channel(32);
        for seq in 0..20 {
            tx.send(numbered(0, seq)).await.unwrap();
        }
        let (closed_tx, closed_rx) = mpsc::channel(4);
        closed_tx.send(numbered(1, 0)).await.unwrap();
        drop(closed_tx);

        let merge = merge_streams(
            vec![NamedStream::new("open", rx), NamedStream::new("closed", closed_rx)],
            2,
        );
        tokio::task::yield_now().await;
        let (pending, mut recovered) = merge.teardown().await;

        let mut ids: Vec<String> = pending.into_iter().map(|m| m.id).collect();
        for source in recovered.iter_mut() {
            while let Ok(message) = source.rx.try_recv() {
                ids.push(message.id);
            }
        }
        let open_ids: Vec<&String> = ids.iter().filter(|id| id.starts_with("0-")).collect();
        let expected: Vec<String> = (0..20).map(|seq| format!("0-{seq}")).collect();
        assert_eq!(open_ids, expected.iter().collect::<Vec<_>>());
        assert_eq!(ids.iter().filter(|id| *id == "1-0").count(), 1);

        // the recovered source keeps working after the teardown
        let open = recovered
            .iter_mut()
            .find(|source| source.name == "open")
            .expect("open source recovered");
        tx.send(numbered(0, 20)).await.unwrap();
        assert_eq!(open.rx.recv().await.unwrap().id, "0-20");
    }
}
