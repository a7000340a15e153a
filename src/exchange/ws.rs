//! WebSocket session machinery shared by all adapters.
//!
//! One reconnect loop per subscription: connect, send subscribe frames,
//! pump messages into a parse callback, and on any error reconnect with
//! exponential backoff (0.5 s doubling to a 30 s cap, ±10% jitter).
//! Server pings are answered; a client-side heartbeat keeps idle
//! connections alive through NAT timeouts.

use std::str::FromStr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A connection that survived this long resets the backoff ladder.
const STABLE_AFTER: Duration = Duration::from_secs(10);
/// Idle read timeout before the connection is considered dead.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Session parameters for one subscription.
pub struct WsSession {
    /// Label used in logs (`binance-public`, `upbit-private`, …).
    pub name: String,
    pub url: String,
    /// Extra request headers (Upbit private WS authenticates via header).
    pub headers: Vec<(String, String)>,
    /// Frames sent immediately after connecting (subscribe / auth).
    pub subscribe_frames: Vec<String>,
    /// Client heartbeat period.
    pub ping_interval: Duration,
}

impl WsSession {
    /// Run forever: each text frame goes through `parse`, and every event
    /// it yields is pushed into `tx`. Returns only when `tx` is closed.
    pub async fn run<T, F>(self, parse: F, tx: mpsc::Sender<T>)
    where
        T: Send + 'static,
        F: Fn(&str) -> Vec<T> + Send + Sync,
    {
        let mut backoff = BACKOFF_BASE;

        loop {
            if tx.is_closed() {
                info!(name = %self.name, "ws consumer dropped, stopping session");
                return;
            }

            let started = tokio::time::Instant::now();
            match self.connect_and_pump(&parse, &tx).await {
                Ok(()) => {
                    info!(name = %self.name, "ws connection closed");
                }
                Err(e) => {
                    warn!(name = %self.name, error = %e, "ws connection error");
                }
            }

            if started.elapsed() >= STABLE_AFTER {
                backoff = BACKOFF_BASE;
            }
            let wait = jitter(backoff);
            debug!(name = %self.name, wait_ms = wait.as_millis() as u64, "ws reconnecting");
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn connect_and_pump<T, F>(
        &self,
        parse: &F,
        tx: &mpsc::Sender<T>,
    ) -> anyhow::Result<()>
    where
        T: Send + 'static,
        F: Fn(&str) -> Vec<T> + Send + Sync,
    {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            request
                .headers_mut()
                .insert(HeaderName::from_str(name)?, HeaderValue::from_str(value)?);
        }
        let (stream, _resp) = connect_async(request).await?;
        let (mut write, mut read) = stream.split();
        info!(name = %self.name, url = %self.url, "ws connected");

        for frame in &self.subscribe_frames {
            write.send(Message::Text(frame.clone())).await?;
        }

        let mut heartbeat = interval(self.ping_interval);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                msg = timeout(READ_TIMEOUT, read.next()) => {
                    let msg = msg.map_err(|_| anyhow::anyhow!("read timeout"))?;
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse(&text) {
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Binary(raw))) => {
                            // Upbit and Bithumb deliver JSON as binary frames.
                            let text = String::from_utf8_lossy(&raw);
                            for event in parse(&text) {
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(name = %self.name, ?frame, "ws close frame");
                            return Ok(());
                        }
                        Some(Ok(_)) => {} // pong / frame types we don't use
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_within_ten_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= Duration::from_secs(9));
            assert!(j <= Duration::from_millis(11_000));
        }
    }

    #[test]
    fn test_backoff_ladder_caps() {
        let mut backoff = BACKOFF_BASE;
        let mut steps = Vec::new();
        for _ in 0..10 {
            steps.push(backoff);
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
        assert_eq!(steps[0], Duration::from_millis(500));
        assert_eq!(steps[1], Duration::from_secs(1));
        assert_eq!(*steps.last().unwrap(), BACKOFF_CAP);
    }
}
