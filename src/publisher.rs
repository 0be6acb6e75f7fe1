use crate::metrics::Metrics;
use crate::payload::SysinfoMessage;
use crate::scheduler::SnapshotSink;
use crate::state::Snapshot;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Outbound channel to the broker.
///
/// While a connection is open the link holds a sender into the connection
/// task; otherwise it is empty and every publish is dropped on the spot.
/// There is no queue and no replay.
pub struct Publisher {
    link: Mutex<Option<mpsc::Sender<String>>>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            link: Mutex::new(None),
            metrics,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().map(|l| l.is_some()).unwrap_or(false)
    }

    fn set_link(&self, link: Option<mpsc::Sender<String>>) {
        if let Ok(mut guard) = self.link.lock() {
            *guard = link;
        }
        self.metrics.set_broker_connected(self.is_connected());
    }

    fn try_send(&self, text: String) -> bool {
        match self.link.lock() {
            Ok(guard) => guard
                .as_ref()
                .is_some_and(|tx| tx.try_send(text).is_ok()),
            Err(_) => false,
        }
    }

    /// Keeps one connection to `url` alive until shutdown. After a close or
    /// a failed attempt exactly one new attempt is made `reconnect_delay`
    /// later, without growth and without a cap.
    pub async fn run(
        self: Arc<Self>,
        url: Url,
        reconnect_delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!(url = %url, "соединение с брокером установлено");
                    let (mut write, mut read) = ws_stream.split();
                    let (tx, mut outbox) = mpsc::channel::<String>(1);
                    self.set_link(Some(tx));

                    let stopping = loop {
                        tokio::select! {
                            _ = shutdown.changed() => break true,
                            outgoing = outbox.recv() => {
                                let Some(text) = outgoing else { break false };
                                if let Err(err) = write.send(Message::Text(text.into())).await {
                                    warn!(error = %err, "ошибка отправки брокеру");
                                    break false;
                                }
                            }
                            incoming = read.next() => match incoming {
                                Some(Ok(Message::Close(_))) | None => {
                                    info!("брокер закрыл соединение");
                                    break false;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!(error = %err, "ошибка соединения с брокером");
                                    break false;
                                }
                            },
                        }
                    };

                    self.set_link(None);
                    if stopping {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, url = %url, "не удалось подключиться к брокеру");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = time::sleep(reconnect_delay) => {}
            }
            self.metrics.broker_reconnects_total.inc();
            debug!(url = %url, "повторное подключение к брокеру");
        }
        info!("публикация остановлена");
    }
}

#[async_trait]
impl SnapshotSink for Publisher {
    async fn publish(&self, snapshot: &Snapshot) {
        let text = match SysinfoMessage::from_snapshot(snapshot).to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "не удалось сериализовать снимок");
                return;
            }
        };

        if self.try_send(text) {
            self.metrics.publishes_total.inc();
        } else {
            self.metrics.publishes_dropped_total.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn publish_without_connection_is_dropped() {
        let metrics = Metrics::new().unwrap();
        let publisher = Publisher::new(metrics.clone());
        publisher.publish(&Snapshot::default()).await;
        assert!(!publisher.is_connected());
        assert_eq!(metrics.publishes_dropped_total.get(), 1.0);
        assert_eq!(metrics.publishes_total.get(), 0.0);
    }

    #[tokio::test]
    async fn reconnects_once_after_fixed_delay() {
        let reconnect_delay = Duration::from_millis(300);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(u32, String)>();
        let (gap_tx, mut gap_rx) = mpsc::unbounded_channel::<Instant>();

        // accepts two connections, reads one message on each, then closes;
        // reports when the first close starts and when the second accept lands
        tokio::spawn(async move {
            for conn in 0..2_u32 {
                let (stream, _) = listener.accept().await.unwrap();
                if conn == 1 {
                    gap_tx.send(Instant::now()).unwrap();
                }
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        seen_tx.send((conn, text.as_str().to_string())).unwrap();
                        break;
                    }
                }
                if conn == 0 {
                    gap_tx.send(Instant::now()).unwrap();
                }
                let _ = ws.close(None).await;
            }
        });

        let metrics = Metrics::new().unwrap();
        let publisher = Publisher::new(metrics.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let url = Url::parse(&format!("ws://{addr}/data_plugins")).unwrap();
        let task = tokio::spawn(publisher.clone().run(url, reconnect_delay, shutdown_rx));

        let snapshot = Snapshot::default();
        let (seen, dropped_before_close) = time::timeout(Duration::from_secs(10), async {
            let mut seen = Vec::new();
            let mut dropped_before_close = 0.0;
            while seen.len() < 2 {
                publisher.publish(&snapshot).await;
                tokio::select! {
                    Some(item) = seen_rx.recv() => {
                        if seen.is_empty() {
                            dropped_before_close = metrics.publishes_dropped_total.get();
                        }
                        seen.push(item);
                    }
                    _ = time::sleep(Duration::from_millis(20)) => {}
                }
            }
            (seen, dropped_before_close)
        })
        .await
        .expect("broker never saw two connections");

        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[1].0, 1);
        let value: serde_json::Value = serde_json::from_str(&seen[1].1).unwrap();
        assert_eq!(value["type"], "SYSINFO");

        let closed_at = gap_rx.recv().await.unwrap();
        let reaccepted_at = gap_rx.recv().await.unwrap();
        assert!(
            reaccepted_at.duration_since(closed_at) >= reconnect_delay,
            "reconnected after {:?}",
            reaccepted_at.duration_since(closed_at)
        );
        // snapshots published while the link was down went nowhere
        assert!(metrics.publishes_dropped_total.get() > dropped_before_close);
        assert!(metrics.broker_reconnects_total.get() >= 1.0);
        assert!(metrics.publishes_total.get() >= 2.0);

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!publisher.is_connected());
    }
}
